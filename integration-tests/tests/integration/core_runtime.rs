// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::{CORE_SELFTEST, testdata_binary};
use igt_metadata::{IgtExitCode, SENTINEL_ON_STDERR_ENV, comms::RUNNER_SOCKET_FD_ENV};
use pretty_assertions::assert_eq;
use std::{os::unix::process::ExitStatusExt, process::Output};
use test_case::test_case;

/// Runs `binary` with `args` outside of the runner.
fn run_binary(binary: &str, args: &[&str]) -> Output {
    duct::cmd(binary, args)
        .env_remove(RUNNER_SOCKET_FD_ENV)
        .env_remove(SENTINEL_ON_STDERR_ENV)
        .env_remove("IGT_LOG_LEVEL")
        .env("IGT_PLAIN_OUTPUT", "1")
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .expect("ran test binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn list_subtests() {
    let output = run_binary(CORE_SELFTEST, &["--list-subtests"]);
    assert_eq!(output.status.code(), Some(IgtExitCode::SUCCESS));
    assert_eq!(
        stdout(&output).lines().collect::<Vec<_>>(),
        [
            "fork-pass",
            "fork-fail",
            "fork-timeout",
            "helper",
            "helper-exits-early",
            "exit-handlers",
            "crash",
            "empty-container",
            "interactive-debug",
        ]
    );
}

#[test]
fn describe_and_help_description() {
    let output = run_binary(CORE_SELFTEST, &["--describe=fork-*"]);
    assert_eq!(output.status.code(), Some(IgtExitCode::SUCCESS));
    let text = stdout(&output);
    assert!(
        text.contains("SUB fork-pass:\n  Forks three workers that all pass.\n"),
        "{text}"
    );
    assert!(text.contains("SUB fork-timeout:\n  NO DOCUMENTATION!\n"), "{text}");
    assert!(!text.contains("SUB helper:"), "{text}");

    let output = run_binary(CORE_SELFTEST, &["--help-description"]);
    assert_eq!(output.status.code(), Some(IgtExitCode::SUCCESS));
    assert_eq!(stdout(&output), "Checks the subtest runtime from the outside.\n");
}

#[test_case("fork-pass", IgtExitCode::SUCCESS, "SUCCESS"; "forked workers pass")]
#[test_case("fork-fail", IgtExitCode::FAILURE, "FAIL"; "forked worker fails")]
#[test_case("fork-timeout", IgtExitCode::FAILURE, "FAIL"; "forked worker times out")]
#[test_case("helper", IgtExitCode::SUCCESS, "SUCCESS"; "helper process")]
#[test_case("helper-exits-early", IgtExitCode::SUCCESS, "SUCCESS"; "helper exit is not a worker result")]
#[test_case("empty-container", IgtExitCode::SKIP, "SKIP"; "container without dynamic subtests")]
fn subtest_results(subtest: &str, code: i32, word: &str) {
    let output = run_binary(CORE_SELFTEST, &["--run-subtest", subtest]);
    let text = stdout(&output);
    assert_eq!(output.status.code(), Some(code), "{text}");
    assert!(text.contains(&format!("Starting subtest: {subtest}\n")), "{text}");
    assert!(text.contains(&format!("Subtest {subtest}: {word} (")), "{text}");
    assert!(text.starts_with("IGT-Version: "), "{text}");
}

#[test]
fn exit_handlers_run_in_reverse() {
    let output = run_binary(CORE_SELFTEST, &["--run-subtest", "exit-handlers"]);
    assert_eq!(output.status.code(), Some(IgtExitCode::SUCCESS));
    let text = stdout(&output);
    let result = text.find("Subtest exit-handlers: SUCCESS").expect("result printed");
    let second = text.find("second exit handler").expect("second handler ran");
    let first = text.find("first exit handler").expect("first handler ran");
    assert!(result < second && second < first, "{text}");
}

#[test]
fn crash_is_reported() {
    let output = run_binary(CORE_SELFTEST, &["--run-subtest", "crash"]);
    let text = stdout(&output);
    assert!(
        output.status.signal() == Some(libc::SIGSEGV)
            || output.status.code() == Some(128 + libc::SIGSEGV),
        "{:?}",
        output.status
    );
    assert!(text.contains("Subtest crash: CRASH ("), "{text}");
    assert!(text.contains("first exit handler"), "{text}");
    assert!(stderr(&output).contains("Received signal SIGSEGV"));
}

#[test]
fn interactive_debug_survives_unreadable_stdin() {
    let output = duct::cmd(
        CORE_SELFTEST,
        [
            "--run-subtest",
            "interactive-debug",
            "--interactive-debug",
            "--debug",
        ],
    )
    .env_remove(RUNNER_SOCKET_FD_ENV)
    .env_remove(SENTINEL_ON_STDERR_ENV)
    .env("IGT_PLAIN_OUTPUT", "1")
    .stdin_bytes(vec![0xff, 0xfe, b'\n'])
    .stdout_capture()
    .stderr_capture()
    .unchecked()
    .run()
    .expect("ran test binary");
    let text = stdout(&output);
    assert_eq!(output.status.code(), Some(IgtExitCode::SUCCESS), "{text}");
    assert!(text.contains("[Press enter to continue]"), "{text}");
    assert!(text.contains("continued after the debug point"), "{text}");
    assert!(text.contains("Subtest interactive-debug: SUCCESS ("), "{text}");
    let err = stderr(&output);
    assert!(err.contains("reading from stdin failed"), "{err}");
}

#[test]
fn unknown_subtest() {
    let output = run_binary(CORE_SELFTEST, &["--run-subtest", "no-such-subtest"]);
    assert_eq!(output.status.code(), Some(IgtExitCode::INVALID));
    assert!(stderr(&output).contains("Unknown subtest: no-such-subtest"));
}

#[test]
fn invalid_subtest_name() {
    let output = duct::cmd(CORE_SELFTEST, ["--run-subtest", "fork-pass"])
        .env("CORE_SELFTEST_INVALID_NAME", "1")
        .env_remove(RUNNER_SOCKET_FD_ENV)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .expect("ran test binary");
    assert!(!output.status.success());
    assert!(!stdout(&output).contains("body ran"));
    assert!(!stdout(&output).contains("Starting subtest: fork-pass"));
    assert!(stderr(&output).contains("invalid subtest name"));
}

#[test]
fn sentinel_on_stderr() {
    let output = duct::cmd(testdata_binary("successtest"), ["--run-subtest", "first-subtest"])
        .env(SENTINEL_ON_STDERR_ENV, "1")
        .env_remove(RUNNER_SOCKET_FD_ENV)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .expect("ran test binary");
    assert_eq!(output.status.code(), Some(IgtExitCode::SUCCESS));
    let err = stderr(&output);
    assert!(err.contains("Starting subtest: first-subtest\n"), "{err}");
    assert!(err.contains("Subtest first-subtest: SUCCESS ("), "{err}");
    assert!(!err.contains("second-subtest"), "{err}");
}

#[test_case("no-subtests", &[], IgtExitCode::SUCCESS; "plain pass")]
#[test_case("abort-simple", &[], IgtExitCode::ABORT; "plain abort")]
#[test_case("no-subtests", &["--list-subtests"], IgtExitCode::INVALID; "listing a plain binary")]
#[test_case("skippers", &[], IgtExitCode::SKIP; "all subtests skip")]
#[test_case("dynamic", &[], IgtExitCode::FAILURE; "one dynamic subtest fails")]
#[test_case("abort", &[], IgtExitCode::ABORT; "abort in subtest")]
fn exit_codes(binary: &str, args: &[&str], code: i32) {
    let output = run_binary(testdata_binary(binary), args);
    assert_eq!(output.status.code(), Some(code), "{}", stdout(&output));
}
