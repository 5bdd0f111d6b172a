// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use igt_runner::{
    executor::{self, ExecuteOutcome},
    job_list::JobList,
    monitor::KernelMonitor,
    reporter::{ReporterOutput, TestReporterBuilder},
    resultgen::{self, ResultDocument, TestResult},
    settings::{LogLevel, Settings},
    signal::SignalHandlerKind,
};
use std::collections::BTreeMap;

pub const NUM_TESTDATA_BINARIES: usize = 8;
pub const NUM_TESTDATA_SUBTESTS: usize = 15;

/// The testdata binaries, by name.
pub static TESTDATA_BINARIES: [(&str, &str); NUM_TESTDATA_BINARIES] = [
    ("abort", env!("CARGO_BIN_EXE_abort")),
    ("abort-dynamic", env!("CARGO_BIN_EXE_abort-dynamic")),
    ("abort-fixture", env!("CARGO_BIN_EXE_abort-fixture")),
    ("abort-simple", env!("CARGO_BIN_EXE_abort-simple")),
    ("dynamic", env!("CARGO_BIN_EXE_dynamic")),
    ("no-subtests", env!("CARGO_BIN_EXE_no-subtests")),
    ("skippers", env!("CARGO_BIN_EXE_skippers")),
    ("successtest", env!("CARGO_BIN_EXE_successtest")),
];

pub static CORE_SELFTEST: &str = env!("CARGO_BIN_EXE_core-selftest");

pub static RUNNER_SELFTEST: (&str, &str) =
    ("runner-selftest", env!("CARGO_BIN_EXE_runner-selftest"));

pub fn testdata_binary(name: &str) -> &'static str {
    TESTDATA_BINARIES
        .iter()
        .find(|(binary, _)| *binary == name)
        .map(|(_, path)| *path)
        .unwrap_or_else(|| panic!("unknown testdata binary `{name}`"))
}

/// A temporary directory holding a test root with links to test binaries, and room for a
/// results directory.
pub struct TestRoot {
    dir: Utf8TempDir,
}

impl TestRoot {
    /// A test root with exactly the testdata binaries.
    pub fn new() -> Self {
        Self::with_binaries(&TESTDATA_BINARIES)
    }

    pub fn with_binaries(binaries: &[(&str, &str)]) -> Self {
        let dir = Utf8TempDir::with_prefix("igt-runner-").expect("created temp dir");
        let root = dir.path().join("testdata");
        std::fs::create_dir(&root).expect("created test root");
        for (name, path) in binaries {
            std::os::unix::fs::symlink(path, root.join(name)).expect("linked test binary");
        }
        Self { dir }
    }

    /// A scratch path next to the test root and results.
    pub fn path(&self, name: &str) -> Utf8PathBuf {
        self.dir.path().join(name)
    }

    pub fn root(&self) -> Utf8PathBuf {
        self.dir.path().join("testdata")
    }

    pub fn results(&self) -> Utf8PathBuf {
        self.dir.path().join("results")
    }

    /// Settings that run quietly as any user, with socket communication as requested.
    pub fn settings(&self, use_socket: bool) -> Settings {
        let mut settings = Settings::new(self.root(), self.results());
        settings.allow_non_root = true;
        settings.log_level = LogLevel::Quiet;
        settings.use_socket = use_socket;
        settings
    }
}

/// Runs a fresh job list built from `settings` and generates its results.
pub fn run(settings: &Settings) -> (ExecuteOutcome, ResultDocument) {
    let job_list = JobList::create(settings).expect("created job list");
    let mut state =
        executor::initialize_execute_state(settings, &job_list).expect("initialized results");
    let outcome = execute(&mut state, settings, &job_list);
    (outcome, generate(&settings.results_path))
}

pub fn execute(
    state: &mut executor::ExecuteState,
    settings: &Settings,
    job_list: &JobList,
) -> ExecuteOutcome {
    execute_with(
        state,
        settings,
        job_list,
        SignalHandlerKind::Noop,
        &KernelMonitor::default(),
    )
}

pub fn execute_with(
    state: &mut executor::ExecuteState,
    settings: &Settings,
    job_list: &JobList,
    signal_handler: SignalHandlerKind,
    monitor: &KernelMonitor,
) -> ExecuteOutcome {
    let mut buf = Vec::new();
    let mut reporter = TestReporterBuilder::default()
        .set_log_level(settings.log_level)
        .build(ReporterOutput::Buffer(&mut buf));
    executor::execute_with_monitor(
        state,
        settings,
        job_list,
        &mut reporter,
        signal_handler,
        monitor,
    )
    .expect("executed job list")
}

pub fn generate(results: &Utf8Path) -> ResultDocument {
    resultgen::generate_results(results).expect("generated results")
}

/// Generates and writes `results.json`, then reads it back.
pub fn written_results(results: &Utf8Path) -> ResultDocument {
    let path = resultgen::write_results(results, &generate(results)).expect("wrote results");
    let written = std::fs::read_to_string(&path).expect("read results.json");
    serde_json::from_str(&written).expect("results.json is a result document")
}

/// The result of every test in the document.
pub fn results_of(document: &ResultDocument) -> BTreeMap<&str, TestResult> {
    document
        .tests
        .iter()
        .map(|(name, test)| (name.as_str(), test.result))
        .collect()
}
