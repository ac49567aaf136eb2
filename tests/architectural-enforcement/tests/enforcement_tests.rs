//! Policy tests over the conduit sources.
//!
//! These run against the workspace checkout itself, so a violation names
//! the exact file and line to fix.

use std::fs;
use std::path::{Path, PathBuf};

use architectural_enforcement::{find_violations, render, source_files};

fn workspace_root() -> PathBuf {
    // tests/architectural-enforcement sits two levels below the root.
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap()
}

fn core_src() -> PathBuf {
    workspace_root().join("conduit").join("core").join("src")
}

fn daemon_src() -> PathBuf {
    workspace_root().join("conduit").join("daemon").join("src")
}

#[test]
fn test_scanner_sees_the_conduit_sources() {
    for root in [core_src(), daemon_src()] {
        assert!(
            !source_files(&root).is_empty(),
            "no sources found under {}",
            root.display()
        );
    }
}

#[test]
fn test_no_blocking_sleep_in_async_code() {
    for root in [core_src(), daemon_src()] {
        let violations = find_violations(&root, "std::thread::sleep");
        assert!(
            violations.is_empty(),
            "blocking sleep in async code, use tokio::time::sleep:\n{}",
            render(&violations)
        );
    }
}

#[test]
fn test_no_print_output_in_sources() {
    for root in [core_src(), daemon_src()] {
        for pattern in ["println!", "eprintln!", "dbg!"] {
            let violations = find_violations(&root, pattern);
            assert!(
                violations.is_empty(),
                "stray {pattern} output, log through tracing instead:\n{}",
                render(&violations)
            );
        }
    }
}

#[test]
fn test_core_library_propagates_errors() {
    for pattern in [".unwrap()", ".expect("] {
        let violations = find_violations(&core_src(), pattern);
        assert!(
            violations.is_empty(),
            "{pattern} outside tests in the core library:\n{}",
            render(&violations)
        );
    }
}

#[test]
fn test_core_library_never_exits_the_process() {
    let violations = find_violations(&core_src(), "process::exit");
    assert!(
        violations.is_empty(),
        "the core library must leave process lifetime to the host:\n{}",
        render(&violations)
    );
}

#[test]
fn test_core_library_never_blocks_on_a_runtime() {
    let violations = find_violations(&core_src(), "block_on");
    assert!(
        violations.is_empty(),
        "the core library runs inside the caller's runtime:\n{}",
        render(&violations)
    );
}

#[test]
fn test_core_stays_independent_of_the_daemon() {
    let manifest = workspace_root()
        .join("conduit")
        .join("core")
        .join("Cargo.toml");
    let content = fs::read_to_string(&manifest).unwrap();
    assert!(
        !content.contains("conduit-daemon"),
        "conduit-core must not depend on the daemon binary"
    );
}
