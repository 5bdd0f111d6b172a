// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use igt_metadata::comms::PacketBody;
use igt_runner::{
    executor::{self, ExecuteOutcome, job_dir},
    job_list::{self, JobList, JobListEntry},
    replay::{COMMS_FILE_NAME, JOURNAL_FILE_NAME, OUT_FILE_NAME},
    resultgen::{self, RESULTS_FILE_NAME, TestResult},
};
use indoc::indoc;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use test_case::test_case;

#[test]
fn job_list_counts() {
    let root = TestRoot::new();

    let mut settings = root.settings(true);
    let job_list = JobList::create(&settings).expect("created job list");
    // One job per subtest, plus the two binaries without subtests.
    assert_eq!(job_list.len(), NUM_TESTDATA_SUBTESTS + 2);

    settings.multiple_mode = true;
    let job_list = JobList::create(&settings).expect("created job list");
    assert_eq!(job_list.len(), NUM_TESTDATA_BINARIES);
    assert!(job_list.entries().iter().all(JobListEntry::is_whole_binary));
}

#[test_case(false, 2; "one job per subtest")]
#[test_case(true, 1; "multiple mode")]
fn include_successtest(multiple_mode: bool, expected: usize) {
    let root = TestRoot::new();
    let mut settings = root.settings(true);
    settings.include.push("successtest").expect("valid regex");
    settings.multiple_mode = multiple_mode;

    let job_list = JobList::create(&settings).expect("created job list");
    assert_eq!(job_list.len(), expected);
    assert!(job_list.entries().iter().all(|entry| entry.binary == "successtest"));
}

#[test]
fn list_all_names() {
    let root = TestRoot::new();
    let mut settings = root.settings(true);
    let job_list = JobList::create(&settings).expect("created job list");
    let names = job_list::list_all(&settings, &job_list).expect("listed tests");
    assert_eq!(names.len(), NUM_TESTDATA_SUBTESTS + 2);
    assert!(names.iter().any(|name| name == "igt@successtest@first-subtest"));
    assert!(names.iter().any(|name| name == "igt@abort-simple"));

    settings.multiple_mode = true;
    settings.exclude.push("^igt@abort").expect("valid regex");
    let job_list = JobList::create(&settings).expect("created job list");
    let names = job_list::list_all(&settings, &job_list).expect("listed tests");
    assert_eq!(
        names,
        [
            "igt@dynamic@first-subtest",
            "igt@dynamic@dynamic",
            "igt@dynamic@last-subtest",
            "igt@no-subtests",
            "igt@skippers@skip-one",
            "igt@skippers@skip-two",
            "igt@successtest@first-subtest",
            "igt@successtest@second-subtest",
        ]
    );
}

#[test_case(true; "comms")]
#[test_case(false; "journal")]
fn dynamic_failure_is_contained(use_socket: bool) {
    let root = TestRoot::new();
    let mut settings = root.settings(use_socket);
    settings.include.push("^igt@dynamic@").expect("valid regex");
    settings.multiple_mode = true;

    let (outcome, document) = run(&settings);
    assert_eq!(outcome, ExecuteOutcome::Completed);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@dynamic@first-subtest" => TestResult::Pass,
            "igt@dynamic@dynamic" => TestResult::Fail,
            "igt@dynamic@dynamic@passing" => TestResult::Pass,
            "igt@dynamic@dynamic@failing" => TestResult::Fail,
            "igt@dynamic@last-subtest" => TestResult::Pass,
        }
    );
    assert_eq!(document.aborted, None);

    // The failing dynamic subtest dumps its log buffer, and only its own lines.
    let failing = &document.tests["igt@dynamic@dynamic@failing"];
    assert!(failing.err.contains("about to fail"), "{}", failing.err);
    assert!(!failing.err.contains("only shows up"), "{}", failing.err);
}

#[test_case(true; "comms")]
#[test_case(false; "journal")]
fn abort_in_fixture_whole_binary(use_socket: bool) {
    let root = TestRoot::new();
    let mut settings = root.settings(use_socket);
    settings.include.push("abort-fixture").expect("valid regex");
    settings.multiple_mode = true;

    let (outcome, document) = run(&settings);
    assert!(matches!(outcome, ExecuteOutcome::Aborted(_)), "{outcome:?}");
    assert_eq!(
        results_of(&document),
        btreemap! { "igt@abort-fixture" => TestResult::Abort }
    );
    assert_eq!(document.tests["igt@abort-fixture"].exit_code, Some(112));
    assert!(document.aborted.is_some());
}

#[test_case(true; "comms")]
#[test_case(false; "journal")]
fn abort_in_fixture_per_subtest(use_socket: bool) {
    let root = TestRoot::new();
    let mut settings = root.settings(use_socket);
    settings.include.push("abort-fixture").expect("valid regex");

    let (outcome, document) = run(&settings);
    assert!(matches!(outcome, ExecuteOutcome::Aborted(_)), "{outcome:?}");
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@abort-fixture@a-subtest" => TestResult::Abort,
            "igt@abort-fixture@b-subtest" => TestResult::NotRun,
        }
    );
}

#[test]
fn abort_in_subtest_stops_the_run() {
    let root = TestRoot::new();
    let mut settings = root.settings(true);
    settings.include.push("^igt@abort@").expect("valid regex");

    let (outcome, document) = run(&settings);
    assert!(matches!(outcome, ExecuteOutcome::Aborted(_)), "{outcome:?}");
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@abort@a-subtest" => TestResult::Pass,
            "igt@abort@b-subtest" => TestResult::Abort,
            "igt@abort@c-subtest" => TestResult::NotRun,
        }
    );
    assert!(
        settings.results_path.join(executor::ABORTED_FILE_NAME).is_file(),
        "abort reason is recorded"
    );
}

#[test]
fn abort_in_dynamic_subtest() {
    let root = TestRoot::new();
    let mut settings = root.settings(true);
    settings.include.push("abort-dynamic").expect("valid regex");
    settings.multiple_mode = true;

    let (outcome, document) = run(&settings);
    assert!(matches!(outcome, ExecuteOutcome::Aborted(_)), "{outcome:?}");
    let results = results_of(&document);
    assert_eq!(results["igt@abort-dynamic@a-subtest"], TestResult::Pass);
    assert_eq!(results["igt@abort-dynamic@a-subtest@a-dynamic"], TestResult::Pass);
    assert_eq!(results["igt@abort-dynamic@b-subtest@b-passing"], TestResult::Pass);
    assert_eq!(results["igt@abort-dynamic@b-subtest@b-aborting"], TestResult::Abort);
    assert!(!results.contains_key("igt@abort-dynamic@c-subtest"));
}

#[test]
fn skips_and_plain_binaries() {
    let root = TestRoot::new();
    let mut settings = root.settings(false);
    settings.include.push("skippers|no-subtests").expect("valid regex");

    let (outcome, document) = run(&settings);
    assert_eq!(outcome, ExecuteOutcome::Completed);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@no-subtests" => TestResult::Pass,
            "igt@skippers@skip-one" => TestResult::Skip,
            "igt@skippers@skip-two" => TestResult::Skip,
        }
    );
    assert_eq!(document.tests["igt@no-subtests"].exit_code, Some(0));
    assert_eq!(document.totals[&TestResult::Skip], 2);
    assert_eq!(document.totals[&TestResult::Pass], 1);
}

#[test]
fn test_list_requests() {
    let root = TestRoot::new();
    let test_list = root.root().with_file_name("test-list.txt");
    std::fs::write(
        &test_list,
        indoc! {"
            # Comments and blank lines are ignored.

            igt@successtest@second-subtest
            dynamic@dynamic@passing
        "},
    )
    .expect("wrote test list");

    let mut settings = root.settings(true);
    settings.test_list = Some(test_list);
    let (outcome, document) = run(&settings);
    assert_eq!(outcome, ExecuteOutcome::Completed);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@dynamic@dynamic" => TestResult::Pass,
            "igt@dynamic@dynamic@passing" => TestResult::Pass,
            "igt@successtest@second-subtest" => TestResult::Pass,
        }
    );
}

#[test]
fn dry_run_then_resume() {
    let root = TestRoot::new();
    let mut settings = root.settings(true);
    settings.include.push("successtest").expect("valid regex");
    settings.dry_run = true;

    let job_list = JobList::create(&settings).expect("created job list");
    let mut state =
        executor::initialize_execute_state(&settings, &job_list).expect("initialized results");
    assert_eq!(execute(&mut state, &settings, &job_list), ExecuteOutcome::Completed);
    assert!(!job_dir(&settings.results_path, 0).exists(), "nothing ran");
    assert!(!settings.results_path.join(executor::UNAME_FILE_NAME).exists());

    // Resuming a dry run executes it.
    let (settings, job_list, mut state) =
        executor::initialize_execute_state_from_resume(&settings.results_path)
            .expect("resumed");
    assert!(!state.is_dry());
    assert_eq!(execute(&mut state, &settings, &job_list), ExecuteOutcome::Completed);
    assert_eq!(
        results_of(&generate(&settings.results_path)),
        btreemap! {
            "igt@successtest@first-subtest" => TestResult::Pass,
            "igt@successtest@second-subtest" => TestResult::Pass,
        }
    );
}

#[test]
fn results_are_idempotent() {
    let root = TestRoot::new();
    let mut settings = root.settings(true);
    settings.include.push("successtest|skippers").expect("valid regex");

    let (_, first) = run(&settings);
    let second = generate(&settings.results_path);
    assert_eq!(first, second);

    let path = resultgen::write_results(&settings.results_path, &first).expect("wrote results");
    assert_eq!(path, settings.results_path.join(RESULTS_FILE_NAME));
    let written = std::fs::read_to_string(&path).expect("read results");
    let json: serde_json::Value = serde_json::from_str(&written).expect("results are JSON");
    assert_eq!(json["tests"]["igt@successtest@first-subtest"]["result"], "pass");
    assert_eq!(json["tests"]["igt@skippers@skip-two"]["result"], "skip");
    resultgen::write_results(&settings.results_path, &second).expect("wrote results");
    assert_eq!(
        std::fs::read_to_string(&path).expect("read results"),
        written
    );

    // Resuming a finished run has nothing left to do.
    let (settings, job_list, mut state) =
        executor::initialize_execute_state_from_resume(&settings.results_path)
            .expect("resumed");
    assert_eq!(state.next(), job_list.len());
    assert_eq!(execute(&mut state, &settings, &job_list), ExecuteOutcome::Completed);
    assert_eq!(generate(&settings.results_path), first);
}

/// How a partially run job is recorded before resuming.
#[derive(Clone, Copy, Debug)]
enum PartialRecord {
    Journal,
    Comms,
}

#[test_case(PartialRecord::Journal; "journal")]
#[test_case(PartialRecord::Comms; "comms")]
fn resume_partial_job(record: PartialRecord) {
    let root = TestRoot::new();
    let mut settings = root.settings(matches!(record, PartialRecord::Comms));
    settings.include.push("successtest").expect("valid regex");
    settings.multiple_mode = true;

    let job_list = JobList::create(&settings).expect("created job list");
    assert_eq!(job_list.entries(), [JobListEntry::whole_binary("successtest")]);
    executor::initialize_execute_state(&settings, &job_list).expect("initialized results");

    // The machine went down after first-subtest finished.
    let dir = job_dir(&settings.results_path, 0);
    std::fs::create_dir(&dir).expect("created job dir");
    match record {
        PartialRecord::Journal => {
            std::fs::write(dir.join(JOURNAL_FILE_NAME), "first-subtest\n").expect("wrote journal");
            std::fs::write(
                dir.join(OUT_FILE_NAME),
                indoc! {"
                    Starting subtest: first-subtest
                    Subtest first-subtest: SUCCESS (0.500s)
                "},
            )
            .expect("wrote output");
        }
        PartialRecord::Comms => {
            let mut data = PacketBody::SubtestStart {
                name: "first-subtest".into(),
            }
            .encode(1234);
            data.extend(
                PacketBody::SubtestResult {
                    name: "first-subtest".into(),
                    result: "SUCCESS".into(),
                    timeused: "0.500".into(),
                    reason: "".into(),
                }
                .encode(1234),
            );
            std::fs::write(dir.join(COMMS_FILE_NAME), data).expect("wrote comms");
        }
    }

    let (settings, job_list, mut state) =
        executor::initialize_execute_state_from_resume(&settings.results_path)
            .expect("resumed");
    assert_eq!(state.next(), 0);
    assert_eq!(
        state.resumed_entry(),
        Some(&JobListEntry::with_subtests(
            "successtest",
            ["*", "!first-subtest"]
        ))
    );

    assert_eq!(execute(&mut state, &settings, &job_list), ExecuteOutcome::Completed);
    let document = generate(&settings.results_path);
    assert_eq!(
        results_of(&document),
        btreemap! {
            "igt@successtest@first-subtest" => TestResult::Pass,
            "igt@successtest@second-subtest" => TestResult::Pass,
        }
    );
    assert_eq!(document.tests["igt@successtest@first-subtest"].time, 0.5);
}
