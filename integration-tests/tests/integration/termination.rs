// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use igt_runner::{
    executor::{self, ABORTED_FILE_NAME, ExecuteOutcome, job_dir},
    job_list::JobList,
    monitor::KernelMonitor,
    replay::ERR_FILE_NAME,
    resultgen::TestResult,
    settings::{AbortMask, Settings},
    signal::SignalHandlerKind,
};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::time::Duration;
use test_case::test_case;

const TAINT_FILE_ENV: &str = "RUNNER_SELFTEST_TAINT_FILE";

fn selftest_root() -> TestRoot {
    TestRoot::with_binaries(&[RUNNER_SELFTEST])
}

/// Settings that run `subtests` of runner-selftest, one job each.
fn selftest_settings(root: &TestRoot, subtests: &str, use_socket: bool) -> Settings {
    let mut settings = root.settings(use_socket);
    settings
        .include
        .push(&format!("^igt@runner-selftest@({subtests})$"))
        .expect("valid regex");
    settings
}

fn start(settings: &Settings) -> (JobList, executor::ExecuteState) {
    let job_list = JobList::create(settings).expect("created job list");
    let state =
        executor::initialize_execute_state(settings, &job_list).expect("initialized results");
    (job_list, state)
}

fn job_err(settings: &Settings, index: usize) -> String {
    let path = job_dir(&settings.results_path, index).join(ERR_FILE_NAME);
    std::fs::read_to_string(&path).unwrap_or_else(|error| panic!("reading {path}: {error}"))
}

#[test_case(Some(1), None, false; "per-test timeout")]
#[test_case(Some(1), None, true; "per-test timeout with comms")]
#[test_case(None, Some(1), false; "inactivity timeout")]
fn hanging_test_is_killed(per_test: Option<u64>, inactivity: Option<u64>, use_socket: bool) {
    let root = selftest_root();
    let mut settings = selftest_settings(&root, "hang|pass", use_socket);
    settings.per_test_timeout = per_test.map(Duration::from_secs);
    settings.inactivity_timeout = inactivity.map(Duration::from_secs);

    let (job_list, mut state) = start(&settings);
    assert_eq!(job_list.len(), 2);
    let outcome = execute(&mut state, &settings, &job_list);
    assert_eq!(outcome, ExecuteOutcome::Completed);

    let document = written_results(&settings.results_path);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@runner-selftest@hang" => TestResult::Timeout,
            "igt@runner-selftest@pass" => TestResult::Pass,
        }
    );
    assert_eq!(document.aborted, None);
    let err = job_err(&settings, 0);
    assert!(err.contains("killing the test after a timeout"), "{err}");
}

#[test]
fn overall_timeout_aborts_then_resumes() {
    let root = selftest_root();
    let mut settings = selftest_settings(&root, "hang|pass", false);
    settings.overall_timeout = Some(Duration::from_secs(1));

    let (job_list, mut state) = start(&settings);
    let outcome = execute(&mut state, &settings, &job_list);
    let reason = "overall timeout of 1s exceeded";
    assert_eq!(outcome, ExecuteOutcome::Aborted(reason.to_owned()));
    assert!(settings.results_path.join(ABORTED_FILE_NAME).is_file());
    assert!(!job_dir(&settings.results_path, 1).exists());

    let document = written_results(&settings.results_path);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@runner-selftest@hang" => TestResult::Timeout,
            "igt@runner-selftest@pass" => TestResult::NotRun,
        }
    );
    assert_eq!(document.aborted.as_deref(), Some(reason));
    let err = job_err(&settings, 0);
    assert!(err.contains("killing the test after the overall timeout"), "{err}");

    // The timed out job finished, so resuming starts at the next one.
    let (settings, job_list, mut state) =
        executor::initialize_execute_state_from_resume(&settings.results_path)
            .expect("resumed run");
    assert_eq!(state.next(), 1);
    assert!(!settings.results_path.join(ABORTED_FILE_NAME).exists());
    let outcome = execute(&mut state, &settings, &job_list);
    assert_eq!(outcome, ExecuteOutcome::Completed);

    let document = written_results(&settings.results_path);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@runner-selftest@hang" => TestResult::Timeout,
            "igt@runner-selftest@pass" => TestResult::Pass,
        }
    );
    assert_eq!(document.aborted, None);
}

#[test_case(true; "comms")]
#[test_case(false; "journal")]
fn disk_usage_limit_kills_test(use_socket: bool) {
    let root = selftest_root();
    let mut settings = selftest_settings(&root, "chatty|pass", use_socket);
    settings.disk_usage_limit = Some(64 * 1024);

    let (job_list, mut state) = start(&settings);
    let outcome = execute(&mut state, &settings, &job_list);
    assert_eq!(outcome, ExecuteOutcome::Completed);

    let document = written_results(&settings.results_path);
    // Job order follows the listing order: pass comes before chatty.
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@runner-selftest@chatty" => TestResult::Incomplete,
            "igt@runner-selftest@pass" => TestResult::Pass,
        }
    );
    let err = job_err(&settings, 1);
    assert!(err.contains("disk usage limit of 65536 bytes exceeded"), "{err}");
}

#[test]
fn monitored_taint_aborts_run() {
    let root = selftest_root();
    let taint_file = root.path("tainted");
    std::fs::write(&taint_file, "0\n").expect("wrote taint file");
    let monitor = KernelMonitor::with_paths(taint_file.clone(), root.path("lockdep_stats"));

    let mut settings = selftest_settings(&root, "taint-kernel|pass", false);
    settings.abort_mask = AbortMask::TAINT;
    settings
        .env_vars
        .insert(TAINT_FILE_ENV.to_owned(), taint_file.to_string());

    let (job_list, mut state) = start(&settings);
    let outcome = execute_with(
        &mut state,
        &settings,
        &job_list,
        SignalHandlerKind::Noop,
        &monitor,
    );
    let ExecuteOutcome::Aborted(reason) = outcome else {
        panic!("run should abort after the kernel is tainted, got {outcome:?}");
    };
    assert!(reason.starts_with("Kernel badly tainted (0x200)"), "{reason}");

    let document = written_results(&settings.results_path);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@runner-selftest@taint-kernel" => TestResult::Pass,
            "igt@runner-selftest@pass" => TestResult::NotRun,
        }
    );
    assert_eq!(document.aborted.as_deref(), Some(reason.trim_end()));
}

#[test]
fn signal_interrupts_run() {
    let root = selftest_root();
    let settings = selftest_settings(&root, "hang|pass", false);
    let (job_list, mut state) = start(&settings);

    let first_job = job_dir(&settings.results_path, 0);
    let killer = std::thread::spawn(move || {
        while !first_job.is_dir() {
            std::thread::sleep(Duration::from_millis(20));
        }
        std::thread::sleep(Duration::from_millis(200));
        // SAFETY: kill(2) has no memory safety requirements.
        unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
    });
    let outcome = execute_with(
        &mut state,
        &settings,
        &job_list,
        SignalHandlerKind::Standard,
        &KernelMonitor::default(),
    );
    killer.join().expect("signal thread finished");
    let reason = "interrupted by signal SIGTERM";
    assert_eq!(outcome, ExecuteOutcome::Aborted(reason.to_owned()));

    let document = written_results(&settings.results_path);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@runner-selftest@hang" => TestResult::Abort,
            "igt@runner-selftest@pass" => TestResult::NotRun,
        }
    );
    assert_eq!(document.aborted.as_deref(), Some(reason));

    // The interrupted job's only subtest had started, so resuming moves on to the next job.
    let (_, _, state) = executor::initialize_execute_state_from_resume(&settings.results_path)
        .expect("resumed run");
    assert_eq!(state.next(), 1);
    assert!(!settings.results_path.join(ABORTED_FILE_NAME).exists());
}
