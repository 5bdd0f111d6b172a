// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns a results directory into a single result document.
//!
//! Generation only reads on-disk state, so generating twice from the same directory gives the
//! same document. Each job directory is replayed (see [`replay_job`]) and its captured output
//! and kernel log are split into per-subtest windows, which decide whether a passing subtest is
//! downgraded to `warn` or `dmesg-warn`.

use crate::{
    errors::ResultsError,
    executor::{ABORTED_FILE_NAME, UNAME_FILE_NAME, job_dir, last_job_index},
    helpers::{read_optional, write_atomic},
    job_list::{JobList, JobListEntry},
    monitor::KmsgRecord,
    replay::{
        DMESG_FILE_NAME, ERR_FILE_NAME, JobTermination, OUT_FILE_NAME, SubtestRecord,
        TerminationKind, replay_job,
    },
    settings::{METADATA_FILE_NAME, PruneMode, Settings},
};
use camino::{Utf8Path, Utf8PathBuf};
use igt_metadata::{IgtExitCode, KmsgMarker, MarkerLine, SubtestOutcome, TestName};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::LazyLock,
    time::Duration,
};
use swrite::{SWrite, swrite};
use tracing::debug;

/// The name of the generated result document.
pub const RESULTS_FILE_NAME: &str = "results.json";

/// Kernel messages that count under `--piglit-style-dmesg`.
static PIGLIT_DMESG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[drm:|drm_|intel_|i915_|\[drm\]").expect("piglit dmesg regex is valid")
});

/// The result of one test in the result document.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestResult {
    /// Succeeded.
    Pass,
    /// Succeeded, but wrote to stderr.
    Warn,
    /// Succeeded, but the kernel logged a warning.
    DmesgWarn,
    /// Failed.
    Fail,
    /// Failed, and the kernel logged a warning.
    DmesgFail,
    /// Killed by a signal.
    Crash,
    /// Skipped.
    Skip,
    /// Killed by the runner after a timeout.
    Timeout,
    /// The run was aborted while this test was running.
    Abort,
    /// Started but never finished, for no known reason.
    Incomplete,
    /// Never started.
    #[serde(rename = "notrun")]
    NotRun,
}

impl TestResult {
    /// Every result, in document order.
    pub const ALL: [Self; 11] = [
        Self::Pass,
        Self::Warn,
        Self::DmesgWarn,
        Self::Fail,
        Self::DmesgFail,
        Self::Crash,
        Self::Skip,
        Self::Timeout,
        Self::Abort,
        Self::Incomplete,
        Self::NotRun,
    ];

    /// Returns the name used in the result document.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::DmesgWarn => "dmesg-warn",
            Self::Fail => "fail",
            Self::DmesgFail => "dmesg-fail",
            Self::Crash => "crash",
            Self::Skip => "skip",
            Self::Timeout => "timeout",
            Self::Abort => "abort",
            Self::Incomplete => "incomplete",
            Self::NotRun => "notrun",
        }
    }

    fn from_outcome(outcome: SubtestOutcome) -> Self {
        match outcome {
            SubtestOutcome::Success => Self::Pass,
            SubtestOutcome::Skip => Self::Skip,
            SubtestOutcome::Fail => Self::Fail,
            SubtestOutcome::Crash => Self::Crash,
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One test in the result document.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TestEntry {
    /// The result.
    pub result: TestResult,

    /// Time taken, in seconds.
    pub time: f64,

    /// Standard output captured while the test ran.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub out: String,

    /// Standard error captured while the test ran.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,

    /// Kernel log records from while the test ran.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dmesg: String,

    /// The binary's exit code, for tests that are a whole binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TestEntry {
    fn not_run() -> Self {
        Self {
            result: TestResult::NotRun,
            time: 0.0,
            out: String::new(),
            err: String::new(),
            dmesg: String::new(),
            exit_code: None,
        }
    }
}

/// The result document, written as `results.json`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ResultDocument {
    /// The run's name.
    pub name: String,

    /// The kernel the run executed on, if execution started.
    pub uname: Option<String>,

    /// Why the run was aborted, if it was.
    pub aborted: Option<String>,

    /// Total time per binary, in seconds.
    pub runtimes: BTreeMap<String, f64>,

    /// Every test, keyed by its `igt@`-prefixed name.
    pub tests: BTreeMap<String, TestEntry>,

    /// The number of tests with each result.
    pub totals: BTreeMap<TestResult, usize>,
}

/// Generates the result document for the run in `results_path`.
pub fn generate_results(results_path: &Utf8Path) -> Result<ResultDocument, ResultsError> {
    if !results_path.join(METADATA_FILE_NAME).is_file() {
        return Err(ResultsError::NoRun {
            path: results_path.to_owned(),
        });
    }
    let settings = Settings::read_from_dir(results_path)?;
    let job_list = JobList::read_from_dir(results_path)?;
    let aborted = read_trimmed(&results_path.join(ABORTED_FILE_NAME))?;
    let uname = read_trimmed(&results_path.join(UNAME_FILE_NAME))?;
    let last = last_job_index(results_path)?;

    let mut builder = ResultsBuilder {
        settings: &settings,
        tests: BTreeMap::new(),
        runtimes: BTreeMap::new(),
    };
    for (index, entry) in job_list.entries().iter().enumerate() {
        let dir = job_dir(results_path, index);
        if !dir.is_dir() {
            builder.add_not_run(entry);
            continue;
        }
        let aborted_here = aborted.is_some() && last == Some(index);
        builder.add_job(&dir, entry, aborted_here)?;
    }

    let ResultsBuilder {
        mut tests,
        runtimes,
        ..
    } = builder;
    prune(&mut tests, settings.prune_mode, &job_list);

    let mut totals: BTreeMap<TestResult, usize> =
        TestResult::ALL.iter().map(|&result| (result, 0)).collect();
    for entry in tests.values() {
        *totals.entry(entry.result).or_default() += 1;
    }

    Ok(ResultDocument {
        name: settings.name.clone(),
        uname,
        aborted,
        runtimes: runtimes
            .into_iter()
            .map(|(binary, time)| (binary, time.as_secs_f64()))
            .collect(),
        tests: tests
            .into_iter()
            .map(|(name, entry)| (name.to_prefixed(), entry))
            .collect(),
        totals,
    })
}

/// Writes `document` to `results.json` in `results_path`, returning the file's path.
pub fn write_results(
    results_path: &Utf8Path,
    document: &ResultDocument,
) -> Result<Utf8PathBuf, ResultsError> {
    let mut json = serde_json::to_string_pretty(document).map_err(ResultsError::Serialize)?;
    json.push('\n');
    let path = results_path.join(RESULTS_FILE_NAME);
    write_atomic(&path, json.as_bytes())?;
    Ok(path)
}

fn read_trimmed(path: &Utf8Path) -> Result<Option<String>, ResultsError> {
    Ok(read_optional(path)?
        .map(|contents| contents.trim_end().to_owned())
        .filter(|contents| !contents.is_empty()))
}

struct ResultsBuilder<'a> {
    settings: &'a Settings,
    tests: BTreeMap<TestName, TestEntry>,
    runtimes: BTreeMap<String, Duration>,
}

impl ResultsBuilder<'_> {
    fn add_not_run(&mut self, entry: &JobListEntry) {
        for name in entry.requested_names() {
            self.tests.entry(name).or_insert_with(TestEntry::not_run);
        }
    }

    fn add_job(
        &mut self,
        dir: &Utf8Path,
        entry: &JobListEntry,
        aborted_here: bool,
    ) -> Result<(), ResultsError> {
        let replay = replay_job(dir, self.settings.log_source)?;
        let out = read_optional(&dir.join(OUT_FILE_NAME))?.unwrap_or_default();
        let err = read_optional(&dir.join(ERR_FILE_NAME))?.unwrap_or_default();
        let dmesg = read_optional(&dir.join(DMESG_FILE_NAME))?.unwrap_or_default();
        let windows = JobWindows {
            out: text_windows(&out, |_| false),
            err: text_windows(&err, is_warning_line),
            dmesg: dmesg_windows(&dmesg, &entry.binary, self.settings),
        };
        // A job that ended by itself before the run stopped keeps its own results.
        let end = JobEnd {
            termination: replay.termination,
            aborted_here: aborted_here && replay.termination.is_none(),
        };
        debug!(
            "{dir}: {} subtests, termination {:?}",
            replay.subtests.len(),
            replay.termination
        );

        let binary = &entry.binary;
        for record in &replay.subtests {
            self.add_subtest(binary, record, &end, &windows);
        }

        let explicit: Vec<&str> = entry.explicit_subtests().collect();
        if let ([only], true) = (&explicit[..], replay.subtests.is_empty()) {
            // The job ran exactly one subtest and stopped before it started.
            self.tests.insert(
                TestName::subtest(binary, *only),
                windows.whole(end.abnormal().unwrap_or(TestResult::NotRun), Duration::ZERO),
            );
        } else {
            if replay.subtests.is_empty() {
                let (result, time) = match replay.plain_result {
                    Some((outcome, time)) => (end.override_outcome(outcome), time),
                    None => (
                        end.exit_result(),
                        end.termination.map_or(Duration::ZERO, |t| t.time),
                    ),
                };
                let mut test = windows.whole(result, time);
                test.result = windows.upgrade(test.result, None, None);
                test.exit_code = end.termination.map(|t| t.code);
                self.tests.insert(TestName::binary(binary), test);
            }
            if !end.requested_abort() {
                for subtest in explicit {
                    if replay.subtest(subtest).is_none() {
                        self.tests
                            .insert(TestName::subtest(binary, subtest), TestEntry::not_run());
                    }
                }
            }
        }

        let runtime = match end.termination {
            Some(termination) => termination.time,
            None => replay
                .subtests
                .iter()
                .filter_map(|s| s.result.map(|(_, time)| time))
                .sum(),
        };
        *self.runtimes.entry(binary.clone()).or_default() += runtime;
        Ok(())
    }

    fn add_subtest(
        &mut self,
        binary: &str,
        record: &SubtestRecord,
        end: &JobEnd,
        windows: &JobWindows,
    ) {
        let subtest = Some(record.name.as_str());
        let (result, time) = match record.result {
            Some((outcome, time)) => (end.override_outcome(outcome), time),
            None => (end.started_without_result(), Duration::ZERO),
        };
        self.tests.insert(
            TestName::subtest(binary, &record.name),
            windows.entry(result, time, subtest, None),
        );

        for dynamic in &record.dynamic {
            let (result, time) = match dynamic.result {
                Some((outcome, time)) => (end.override_outcome(outcome), time),
                None => (end.started_without_result(), Duration::ZERO),
            };
            self.tests.insert(
                TestName::dynamic(binary, &record.name, &dynamic.name),
                windows.entry(result, time, subtest, Some(&dynamic.name)),
            );
        }
    }
}

/// How a job ended, as far as results are concerned.
struct JobEnd {
    termination: Option<JobTermination>,
    aborted_here: bool,
}

impl JobEnd {
    /// The result for anything cut short by an abnormal end, or `None` if the binary exited by
    /// itself.
    fn abnormal(&self) -> Option<TestResult> {
        let Some(termination) = self.termination else {
            return Some(if self.aborted_here {
                TestResult::Abort
            } else {
                TestResult::Incomplete
            });
        };
        match termination.kind {
            TerminationKind::TimedOut => Some(TestResult::Timeout),
            _ if self.requested_abort() => Some(TestResult::Abort),
            TerminationKind::DiskLimit => Some(TestResult::Incomplete),
            TerminationKind::Exited if IgtExitCode::signal_of(termination.code).is_some() => {
                Some(TestResult::Crash)
            }
            TerminationKind::Exited => None,
        }
    }

    fn started_without_result(&self) -> TestResult {
        self.abnormal().unwrap_or(TestResult::Incomplete)
    }

    /// The result of a whole binary that reported nothing but its exit code.
    fn exit_result(&self) -> TestResult {
        self.abnormal().unwrap_or_else(|| {
            match self.termination.map(|t| t.code) {
                Some(IgtExitCode::SUCCESS) => TestResult::Pass,
                Some(IgtExitCode::SKIP) => TestResult::Skip,
                _ => TestResult::Fail,
            }
        })
    }

    /// A reported outcome, except that the crash a timeout kill causes counts as the timeout.
    fn override_outcome(&self, outcome: SubtestOutcome) -> TestResult {
        let timed_out = self
            .termination
            .is_some_and(|t| t.kind == TerminationKind::TimedOut);
        if timed_out && outcome == SubtestOutcome::Crash {
            TestResult::Timeout
        } else {
            TestResult::from_outcome(outcome)
        }
    }

    fn requested_abort(&self) -> bool {
        self.aborted_here
            || self
                .termination
                .is_some_and(|t| t.kind == TerminationKind::Exited && t.code == IgtExitCode::ABORT)
    }
}

/// Text attributed to a subtest or dynamic subtest.
#[derive(Debug, Default)]
struct Window {
    text: String,
    /// Set if any line in the window counts against the result.
    flagged: bool,
}

impl Window {
    fn push(&mut self, line: &str, flagged: bool) {
        self.text.push_str(line);
        self.flagged |= flagged;
    }
}

#[derive(Debug, Default)]
struct SubtestWindows {
    window: Window,
    dynamic: BTreeMap<String, Window>,
}

/// A file split by subtest.
#[derive(Debug, Default)]
struct Windows {
    all: Window,
    subtests: BTreeMap<String, SubtestWindows>,
}

impl Windows {
    fn push(&mut self, subtest: Option<&str>, dynamic: Option<&str>, line: &str, flagged: bool) {
        self.all.push(line, flagged);
        let Some(subtest) = subtest else { return };
        let windows = self.subtests.entry(subtest.to_owned()).or_default();
        windows.window.push(line, flagged);
        if let Some(dynamic) = dynamic {
            windows
                .dynamic
                .entry(dynamic.to_owned())
                .or_default()
                .push(line, flagged);
        }
    }

    /// Returns the window for a subtest, a dynamic subtest, or the whole file.
    fn get(&self, subtest: Option<&str>, dynamic: Option<&str>) -> Option<&Window> {
        let Some(subtest) = subtest else {
            return Some(&self.all);
        };
        let windows = self.subtests.get(subtest)?;
        match dynamic {
            Some(dynamic) => windows.dynamic.get(dynamic),
            None => Some(&windows.window),
        }
    }

    fn text(&self, subtest: Option<&str>, dynamic: Option<&str>) -> String {
        self.get(subtest, dynamic)
            .map(|window| window.text.clone())
            .unwrap_or_default()
    }

    fn flagged(&self, subtest: Option<&str>, dynamic: Option<&str>) -> bool {
        self.get(subtest, dynamic).is_some_and(|window| window.flagged)
    }
}

struct JobWindows {
    out: Windows,
    err: Windows,
    dmesg: Windows,
}

impl JobWindows {
    fn entry(
        &self,
        result: TestResult,
        time: Duration,
        subtest: Option<&str>,
        dynamic: Option<&str>,
    ) -> TestEntry {
        TestEntry {
            result: self.upgrade(result, subtest, dynamic),
            time: time.as_secs_f64(),
            out: self.out.text(subtest, dynamic),
            err: self.err.text(subtest, dynamic),
            dmesg: self.dmesg.text(subtest, dynamic),
            exit_code: None,
        }
    }

    /// An entry carrying the job's whole output.
    fn whole(&self, result: TestResult, time: Duration) -> TestEntry {
        TestEntry {
            result,
            time: time.as_secs_f64(),
            out: self.out.text(None, None),
            err: self.err.text(None, None),
            dmesg: self.dmesg.text(None, None),
            exit_code: None,
        }
    }

    fn upgrade(
        &self,
        result: TestResult,
        subtest: Option<&str>,
        dynamic: Option<&str>,
    ) -> TestResult {
        let dmesg_warned = self.dmesg.flagged(subtest, dynamic);
        match result {
            TestResult::Pass if dmesg_warned => TestResult::DmesgWarn,
            TestResult::Pass if self.err.flagged(subtest, dynamic) => TestResult::Warn,
            TestResult::Fail if dmesg_warned => TestResult::DmesgFail,
            other => other,
        }
    }
}

/// Returns true if a stderr line is something the test wrote, rather than a duplicated marker.
fn is_warning_line(line: &str) -> bool {
    !line.trim().is_empty() && !MarkerLine::is_marker(line)
}

/// Splits captured output into windows delimited by the subtest markers. The markers belong
/// to the window they open or close.
fn text_windows(contents: &str, flag: impl Fn(&str) -> bool) -> Windows {
    let mut windows = Windows::default();
    let mut subtest: Option<String> = None;
    let mut dynamic: Option<String> = None;
    for line in contents.split_inclusive('\n') {
        let marker = MarkerLine::parse(line);
        match &marker {
            Some(MarkerLine::SubtestStart { name }) => {
                subtest = Some(name.clone());
                dynamic = None;
            }
            Some(MarkerLine::DynamicSubtestStart { name }) if subtest.is_some() => {
                dynamic = Some(name.clone());
            }
            _ => {}
        }
        windows.push(subtest.as_deref(), dynamic.as_deref(), line, flag(line));
        match marker {
            Some(MarkerLine::DynamicSubtestResult { .. }) => dynamic = None,
            Some(MarkerLine::SubtestResult { .. }) => {
                subtest = None;
                dynamic = None;
            }
            _ => {}
        }
    }
    windows
}

/// Splits a job's kernel log into windows delimited by the kmsg markers test binaries write
/// at each subtest start. A window lasts until the next marker.
fn dmesg_windows(contents: &str, binary: &str, settings: &Settings) -> Windows {
    let mut windows = Windows::default();
    let mut subtest: Option<String> = None;
    let mut dynamic: Option<String> = None;
    for line in contents.lines() {
        let Some(record) = KmsgRecord::parse(line) else {
            continue;
        };
        let marker = KmsgMarker::parse(record.message);
        match marker {
            Some(KmsgMarker::Subtest { binary: b, name }) if b == binary => {
                subtest = Some(name.to_owned());
                dynamic = None;
            }
            Some(KmsgMarker::Dynamic { binary: b, name }) if b == binary && subtest.is_some() => {
                dynamic = Some(name.to_owned());
            }
            _ => {}
        }

        let flagged = marker.is_none()
            && i32::from(record.level) <= settings.dmesg_warn_level
            && (!settings.piglit_style_dmesg || PIGLIT_DMESG_RE.is_match(record.message));
        let mut text = String::new();
        swrite!(
            text,
            "<{}> [{:.6}] {}\n",
            record.level,
            record.timestamp.as_secs_f64(),
            record.message
        );
        windows.push(subtest.as_deref(), dynamic.as_deref(), &text, flagged);
    }
    windows
}

fn prune(tests: &mut BTreeMap<TestName, TestEntry>, mode: PruneMode, job_list: &JobList) {
    match mode {
        PruneMode::KeepAll => {}
        PruneMode::KeepSubtests => tests.retain(|name, _| !name.is_dynamic()),
        PruneMode::KeepDynamic => {
            let parents: BTreeSet<TestName> = tests.keys().filter_map(TestName::parent).collect();
            tests.retain(|name, _| !parents.contains(name));
        }
        PruneMode::KeepRequested => {
            let requested: BTreeSet<TestName> = job_list.requested_names().collect();
            // Whole-binary entries request everything the binary runs.
            let whole: BTreeSet<&str> = job_list
                .entries()
                .iter()
                .filter(|entry| entry.is_whole_binary())
                .map(|entry| entry.binary.as_str())
                .collect();
            tests.retain(|name, _| {
                requested.contains(name) || whole.contains(name.binary.as_str())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    struct Run {
        dir: Utf8TempDir,
    }

    impl Run {
        fn new(settings: impl FnOnce(&mut Settings), entries: Vec<JobListEntry>) -> Self {
            let dir = Utf8TempDir::new().expect("created temp dir");
            let mut s = Settings::new("/nonexistent", dir.path());
            settings(&mut s);
            s.write_to_dir(dir.path()).expect("wrote settings");
            JobList::new(entries)
                .write_to_dir(dir.path())
                .expect("wrote job list");
            Self { dir }
        }

        fn job(&self, index: usize, files: &[(&str, &str)]) -> &Self {
            let dir = job_dir(self.dir.path(), index);
            std::fs::create_dir_all(&dir).expect("created job dir");
            for (name, contents) in files {
                std::fs::write(dir.join(name), contents).expect("wrote job file");
            }
            self
        }

        fn aborted(&self, reason: &str) -> &Self {
            std::fs::write(self.dir.path().join(ABORTED_FILE_NAME), reason).expect("wrote");
            self
        }

        fn results(&self) -> BTreeMap<String, TestResult> {
            generate_results(self.dir.path())
                .expect("generated results")
                .tests
                .into_iter()
                .map(|(name, entry)| (name, entry.result))
                .collect()
        }
    }

    const DYNAMIC_OUT: &str = indoc! {"
        IGT-Version: 1.0.0 (x86_64) (Linux: 6.1.0 x86_64)
        Starting subtest: dynamic
        Starting dynamic subtest: dynamic-pass
        Dynamic subtest dynamic-pass: SUCCESS (0.001s)
        Starting dynamic subtest: dynamic-fail
        Dynamic subtest dynamic-fail: FAIL (0.002s)
        Subtest dynamic: FAIL (0.004s)
        Starting subtest: normal
        Subtest normal: SUCCESS (0.001s)
        Starting subtest: noisy
        Subtest noisy: SUCCESS (0.001s)
    "};

    const DYNAMIC_ERR: &str = indoc! {"
        Starting subtest: dynamic
        Starting dynamic subtest: dynamic-pass
        Dynamic subtest dynamic-pass: SUCCESS (0.001s)
        Starting dynamic subtest: dynamic-fail
        (dynamic:42) CRITICAL: Test assertion failure
        **** DEBUG ****
        (dynamic:42) DEBUG: leftover context
        ****  END  ****
        Dynamic subtest dynamic-fail: FAIL (0.002s)
        Subtest dynamic: FAIL (0.004s)
        Starting subtest: normal
        Subtest normal: SUCCESS (0.001s)
        Starting subtest: noisy
        (dynamic:42) WARNING: something odd
        Subtest noisy: SUCCESS (0.001s)
    "};

    #[test]
    fn dynamic_failure_stays_contained() {
        let run = Run::new(|_| {}, vec![JobListEntry::whole_binary("dynamic")]);
        run.job(
            0,
            &[
                ("journal.txt", "dynamic\ndynamic@dynamic-pass\ndynamic@dynamic-fail\nnormal\nnoisy\nexit:98 (0.010s)\n"),
                ("out.txt", DYNAMIC_OUT),
                ("err.txt", DYNAMIC_ERR),
            ],
        );

        assert_eq!(
            run.results(),
            btreemap! {
                "igt@dynamic@dynamic".to_owned() => TestResult::Fail,
                "igt@dynamic@dynamic@dynamic-pass".to_owned() => TestResult::Pass,
                "igt@dynamic@dynamic@dynamic-fail".to_owned() => TestResult::Fail,
                "igt@dynamic@normal".to_owned() => TestResult::Pass,
                "igt@dynamic@noisy".to_owned() => TestResult::Warn,
            }
        );

        let document = generate_results(run.dir.path()).expect("generated");
        let failed = &document.tests["igt@dynamic@dynamic@dynamic-fail"];
        assert!(failed.err.contains("Test assertion failure"), "{}", failed.err);
        assert!(!document.tests["igt@dynamic@normal"].err.contains("DEBUG"));
        assert_eq!(document.totals[&TestResult::Fail], 2);
        assert_eq!(document.totals[&TestResult::NotRun], 0);
        assert_eq!(document.runtimes, btreemap! { "dynamic".to_owned() => 0.01 });
    }

    #[test]
    fn abort_in_fixture_per_subtest() {
        let run = Run::new(
            |_| {},
            vec![
                JobListEntry::with_subtests("abort-fixture", ["a-subtest"]),
                JobListEntry::with_subtests("abort-fixture", ["b-subtest"]),
            ],
        );
        run.job(0, &[("journal.txt", "exit:112 (0.001s)\n")])
            .aborted("test binary abort-fixture requested abort\n");

        assert_eq!(
            run.results(),
            btreemap! {
                "igt@abort-fixture@a-subtest".to_owned() => TestResult::Abort,
                "igt@abort-fixture@b-subtest".to_owned() => TestResult::NotRun,
            }
        );
        let document = generate_results(run.dir.path()).expect("generated");
        assert_eq!(
            document.aborted.as_deref(),
            Some("test binary abort-fixture requested abort")
        );
    }

    #[test]
    fn abort_in_fixture_whole_binary() {
        let run = Run::new(
            |s| s.multiple_mode = true,
            vec![JobListEntry::whole_binary("abort-fixture")],
        );
        run.job(0, &[("journal.txt", "exit:112 (0.001s)\n")])
            .aborted("test binary abort-fixture requested abort\n");

        assert_eq!(
            run.results(),
            btreemap! { "igt@abort-fixture".to_owned() => TestResult::Abort }
        );
        let document = generate_results(run.dir.path()).expect("generated");
        assert_eq!(document.tests["igt@abort-fixture"].exit_code, Some(112));
    }

    #[test]
    fn abort_between_jobs() {
        let run = Run::new(
            |_| {},
            vec![
                JobListEntry::whole_binary("no-subtests"),
                JobListEntry::with_subtests("successtest", ["first-subtest", "second-subtest"]),
                JobListEntry::whole_binary("skippers"),
            ],
        );
        run.job(0, &[("journal.txt", "exit:0 (0.001s)\n")])
            .job(
                1,
                &[
                    ("journal.txt", "first-subtest\nexit:0 (0.002s)\n"),
                    ("out.txt", "Starting subtest: first-subtest\nSubtest first-subtest: SUCCESS (0.001s)\n"),
                ],
            )
            .aborted("overall timeout of 1s exceeded\n");

        assert_eq!(
            run.results(),
            btreemap! {
                "igt@no-subtests".to_owned() => TestResult::Pass,
                "igt@successtest@first-subtest".to_owned() => TestResult::Pass,
                "igt@successtest@second-subtest".to_owned() => TestResult::NotRun,
                "igt@skippers".to_owned() => TestResult::NotRun,
            }
        );

        // Killed by the runner mid-job, with nothing written after the last subtest.
        let run = Run::new(|_| {}, vec![JobListEntry::whole_binary("no-subtests")]);
        run.job(0, &[("journal.txt", "")])
            .aborted("interrupted by signal SIGTERM\n");
        assert_eq!(
            run.results(),
            btreemap! { "igt@no-subtests".to_owned() => TestResult::Abort }
        );
    }

    #[test]
    fn interrupted_jobs() {
        let run = Run::new(
            |_| {},
            vec![
                JobListEntry::with_subtests("successtest", ["first-subtest", "second-subtest"]),
                JobListEntry::with_subtests("crash", ["a"]),
                JobListEntry::with_subtests("hang", ["a"]),
                JobListEntry::whole_binary("no-subtests"),
            ],
        );
        run.job(
            0,
            &[
                ("journal.txt", "first-subtest\nexit:0 (0.002s)\n"),
                ("out.txt", "Starting subtest: first-subtest\nSubtest first-subtest: SUCCESS (0.001s)\n"),
            ],
        )
        .job(1, &[("journal.txt", "a\nexit:139 (0.001s)\n")])
        .job(
            2,
            &[
                ("journal.txt", "a\ntimeout:131 (30.000s)\n"),
                ("out.txt", "Starting subtest: a\nSubtest a: CRASH (30.000s)\n"),
            ],
        )
        .job(
            3,
            &[
                ("journal.txt", "exit:77 (0.001s)\n"),
                ("out.txt", "SKIP (0.001s)\n"),
            ],
        );

        assert_eq!(
            run.results(),
            btreemap! {
                "igt@successtest@first-subtest".to_owned() => TestResult::Pass,
                "igt@successtest@second-subtest".to_owned() => TestResult::NotRun,
                "igt@crash@a".to_owned() => TestResult::Crash,
                "igt@hang@a".to_owned() => TestResult::Timeout,
                "igt@no-subtests".to_owned() => TestResult::Skip,
            }
        );
    }

    #[test]
    fn dmesg_windows_upgrade_results() {
        let run = Run::new(|_| {}, vec![JobListEntry::whole_binary("kms")]);
        run.job(
            0,
            &[
                ("journal.txt", "quiet\nloud\nexit:98 (0.003s)\n"),
                (
                    "out.txt",
                    indoc! {"
                        Starting subtest: quiet
                        Subtest quiet: SUCCESS (0.001s)
                        Starting subtest: loud
                        Subtest loud: FAIL (0.001s)
                    "},
                ),
                (
                    "dmesg.txt",
                    indoc! {"
                        6,100,1000000,-;[IGT] kms: starting subtest quiet
                        6,101,1000100,-;i915 0000:00:02.0: [drm] info only
                        6,102,2000000,-;[IGT] kms: starting subtest loud
                        4,103,2000100,-;i915 0000:00:02.0: [drm] *ERROR* flip timed out
                         SUBSYSTEM=pci
                    "},
                ),
            ],
        );

        assert_eq!(
            run.results(),
            btreemap! {
                "igt@kms@quiet".to_owned() => TestResult::Pass,
                "igt@kms@loud".to_owned() => TestResult::DmesgFail,
            }
        );
        let document = generate_results(run.dir.path()).expect("generated");
        assert_eq!(
            document.tests["igt@kms@loud"].dmesg,
            "<6> [2.000000] [IGT] kms: starting subtest loud\n\
             <4> [2.000100] i915 0000:00:02.0: [drm] *ERROR* flip timed out\n"
        );
    }

    #[test_case(PruneMode::KeepAll, &["igt@dyn@container", "igt@dyn@container@one", "igt@dyn@plain"] ; "keep all")]
    #[test_case(PruneMode::KeepSubtests, &["igt@dyn@container", "igt@dyn@plain"] ; "keep subtests")]
    #[test_case(PruneMode::KeepDynamic, &["igt@dyn@container@one", "igt@dyn@plain"] ; "keep dynamic")]
    #[test_case(PruneMode::KeepRequested, &["igt@dyn@container", "igt@dyn@plain"] ; "keep requested")]
    fn prune_modes(mode: PruneMode, expected: &[&str]) {
        let run = Run::new(
            |s| s.prune_mode = mode,
            vec![
                JobListEntry::with_subtests("dyn", ["container"]),
                JobListEntry::with_subtests("dyn", ["plain"]),
            ],
        );
        run.job(
            0,
            &[(
                "out.txt",
                indoc! {"
                    Starting subtest: container
                    Starting dynamic subtest: one
                    Dynamic subtest one: SUCCESS (0.001s)
                    Subtest container: SUCCESS (0.001s)
                "},
            )],
        )
        .job(
            1,
            &[(
                "out.txt",
                "Starting subtest: plain\nSubtest plain: SUCCESS (0.001s)\n",
            )],
        );

        let names: Vec<String> = run.results().into_keys().collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn generation_is_idempotent() {
        let run = Run::new(|_| {}, vec![JobListEntry::whole_binary("dynamic")]);
        run.job(
            0,
            &[
                ("journal.txt", "dynamic\nexit:98 (0.010s)\n"),
                ("out.txt", DYNAMIC_OUT),
                ("err.txt", DYNAMIC_ERR),
            ],
        );

        let first = generate_results(run.dir.path()).expect("generated");
        let path = write_results(run.dir.path(), &first).expect("wrote");
        let written = std::fs::read_to_string(&path).expect("read results");
        let second = generate_results(run.dir.path()).expect("generated");
        write_results(run.dir.path(), &second).expect("wrote");
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&path).expect("read results"), written);

        let parsed: ResultDocument = serde_json::from_str(&written).expect("valid JSON");
        assert_eq!(parsed.tests.len(), first.tests.len());
        assert!(written.contains("\"result\": \"warn\""));
    }

    #[test]
    fn missing_run() {
        let dir = Utf8TempDir::new().expect("created temp dir");
        let err = generate_results(dir.path()).expect_err("no run");
        assert!(matches!(err, ResultsError::NoRun { .. }), "{err}");
    }
}
