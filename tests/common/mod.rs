//! Runs scenarios that kill the process in a re-executed copy of the test
//! binary, selected through an environment variable.

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;

const SCENARIO: &str = "CALLCC_TEST_SCENARIO";

/// Whether this process is the child running `test`.
pub fn in_child(test: &str) -> bool {
    env::var(SCENARIO).map_or(false, |scenario| scenario == test)
}

/// Re-runs `test` alone in a child process and checks that it was killed by
/// one of `signals`.
pub fn run_in_child(test: &str, signals: &[libc::c_int]) {
    let status = Command::new(env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(SCENARIO, test)
        .status()
        .unwrap();
    let signal = status.signal();
    assert!(
        signal.map_or(false, |signal| signals.contains(&signal)),
        "child was expected to die from one of {:?}, exited with {:?}",
        signals,
        status
    );
}
