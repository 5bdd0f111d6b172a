// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    errors::Result,
    output::{OutputContext, OutputOpts},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser};
use igt_metadata::RunnerExitCode;
use igt_runner::{
    errors::SettingsError,
    executor::{self, ExecuteOutcome, ExecuteState},
    job_list::{self, JobList},
    reporter::{ReporterOutput, TestReporterBuilder},
    resultgen,
    settings::{
        AbortMask, LogLevel, LogSource, PruneMode, Settings, TEST_ROOT_ENV,
        default_dmesg_warn_level, parse_disk_usage_limit, parse_env_assignment,
    },
    signal::SignalHandlerKind,
};
use std::{io::Write, time::Duration};
use tracing::info;

/// Runs igt test binaries and collects their results.
#[derive(Debug, Parser)]
#[command(name = "igt_runner", version, max_term_width = 100)]
pub struct IgtRunnerApp {
    /// `[TEST_ROOT] RESULTS_DIR`; the test root defaults to $IGT_TEST_ROOT
    #[arg(required = true, num_args = 1..=2, value_name = "PATHS")]
    paths: Vec<Utf8PathBuf>,

    #[command(flatten)]
    run: RunOpts,

    /// Print the name of every test that would run, and exit
    #[arg(long)]
    list_all: bool,

    #[command(flatten)]
    output: OutputOpts,
}

#[derive(Debug, Args)]
struct RunOpts {
    /// Name of the run, recorded in the results [default: results directory name]
    #[arg(short, long)]
    name: Option<String>,

    /// Abort on a monitored kernel condition: taint, lockdep, all, or a comma-separated list
    #[arg(
        long,
        value_name = "CONDITIONS",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "all"
    )]
    abort_on_monitored_error: Option<AbortMask>,

    /// Kill a test once its output exceeds this size (suffixes: k, M, G)
    #[arg(long, value_name = "SIZE", value_parser = parse_disk_usage_limit)]
    disk_usage_limit: Option<u64>,

    /// Run the tests listed in this file instead of every test in the test root
    #[arg(long, value_name = "FILE")]
    test_list: Option<Utf8PathBuf>,

    /// Skip tests in the test list whose binary doesn't exist
    #[arg(long)]
    ignore_missing: bool,

    /// Set up the results directory without running anything
    #[arg(long)]
    dry_run: bool,

    /// Only run tests whose name matches this regex (may be repeated)
    #[arg(short = 't', long = "include", value_name = "REGEX")]
    include: Vec<String>,

    /// Don't run tests whose name matches this regex (may be repeated)
    #[arg(short = 'x', long = "exclude", value_name = "REGEX")]
    exclude: Vec<String>,

    /// Set an environment variable for each test: KEY=VALUE, or KEY to pass through
    #[arg(short = 'e', long = "environment", value_name = "KEY[=VALUE]")]
    environment: Vec<String>,

    /// Exclude the regexes listed in this file, one per line (may be repeated)
    #[arg(short = 'b', long = "blacklist", value_name = "FILE")]
    blacklist: Vec<Utf8PathBuf>,

    /// Sync results to disk after every write
    #[arg(short, long)]
    sync: bool,

    /// Run all selected subtests of a binary in a single execution
    #[arg(short, long)]
    multiple_mode: bool,

    /// How much to print: quiet, normal, verbose
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Replace the contents of a non-empty results directory
    #[arg(long)]
    overwrite: bool,

    /// Kill a test that prints nothing for this long (seconds, or a duration like "2m")
    #[arg(long, value_name = "TIMEOUT", value_parser = parse_timeout)]
    inactivity_timeout: Option<Duration>,

    /// Kill a test that runs longer than this
    #[arg(long, value_name = "TIMEOUT", value_parser = parse_timeout)]
    per_test_timeout: Option<Duration>,

    /// Stop starting new tests once the run has taken this long
    #[arg(long, value_name = "TIMEOUT", value_parser = parse_timeout)]
    overall_timeout: Option<Duration>,

    /// Ping /dev/watchdog while tests run
    #[arg(long)]
    use_watchdog: bool,

    /// Only count driver messages as dmesg warnings
    #[arg(long)]
    piglit_style_dmesg: bool,

    /// Kernel log level at or below which messages count as warnings [default: 4, or 5 with
    /// --piglit-style-dmesg]
    #[arg(long, value_name = "LEVEL")]
    dmesg_warn_level: Option<i32>,

    /// Which parts of the subtest hierarchy to keep in the results
    #[arg(long, value_name = "MODE", default_value = "keep-all")]
    prune_mode: PruneMode,

    /// Which record of test progress to trust: auto, journal, comms
    #[arg(long, value_name = "SOURCE", default_value = "auto")]
    log_source: LogSource,

    /// Allow running as a non-root user
    #[arg(long)]
    allow_non_root: bool,
}

/// Parses a timeout as plain seconds or a humantime duration. Zero disables the timeout.
fn parse_timeout(input: &str) -> Result<Duration, humantime::DurationError> {
    match input.parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(input),
    }
}

fn nonzero(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

impl IgtRunnerApp {
    /// Initializes logging.
    pub fn init_output(&self) -> OutputContext {
        self.output.init(self.run.log_level.unwrap_or_default())
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        let env_root = std::env::var(TEST_ROOT_ENV).ok().map(Utf8PathBuf::from);
        let settings = self.to_settings(env_root)?;
        let job_list = JobList::create(&settings)?;

        if self.list_all {
            let names = job_list::list_all(&settings, &job_list)?;
            let mut stdout = std::io::stdout().lock();
            for name in names {
                writeln!(stdout, "{name}").map_err(|err| ExpectedError::WriteOutput { err })?;
            }
            return Ok(RunnerExitCode::OK);
        }

        let mut state = executor::initialize_execute_state(&settings, &job_list)?;
        run_and_generate(&mut state, &settings, &job_list, output)
    }

    fn to_settings(&self, env_root: Option<Utf8PathBuf>) -> Result<Settings> {
        let (test_root, results_path) = match self.paths.as_slice() {
            [test_root, results_path] => (test_root.clone(), results_path.clone()),
            [results_path] => (
                env_root.ok_or(SettingsError::NoTestRoot)?,
                results_path.clone(),
            ),
            _ => return Err(SettingsError::NoTestRoot.into()),
        };
        if !test_root.is_dir() {
            return Err(SettingsError::TestRootNotDirectory { path: test_root }.into());
        }

        let run = &self.run;
        let mut settings = Settings::new(test_root, results_path);
        if let Some(name) = &run.name {
            settings.name.clone_from(name);
        }
        settings.abort_mask = run.abort_on_monitored_error.unwrap_or_default();
        settings.disk_usage_limit = run.disk_usage_limit.filter(|&limit| limit > 0);
        settings.test_list.clone_from(&run.test_list);
        settings.ignore_missing = run.ignore_missing;
        settings.dry_run = run.dry_run;
        for pattern in &run.include {
            settings.include.push(pattern)?;
        }
        for pattern in &run.exclude {
            settings.exclude.push(pattern)?;
        }
        for path in &run.blacklist {
            settings.exclude.push_blacklist(path)?;
        }
        for assignment in &run.environment {
            let (key, value) = parse_env_assignment(assignment)?;
            settings.env_vars.insert(key, value);
        }
        settings.sync = run.sync;
        settings.multiple_mode = run.multiple_mode;
        settings.log_level = run.log_level.unwrap_or_default();
        settings.overwrite = run.overwrite;
        settings.inactivity_timeout = nonzero(run.inactivity_timeout);
        settings.per_test_timeout = nonzero(run.per_test_timeout);
        settings.overall_timeout = nonzero(run.overall_timeout);
        settings.use_watchdog = run.use_watchdog;
        settings.piglit_style_dmesg = run.piglit_style_dmesg;
        settings.dmesg_warn_level = run
            .dmesg_warn_level
            .unwrap_or_else(|| default_dmesg_warn_level(run.piglit_style_dmesg));
        settings.prune_mode = run.prune_mode;
        settings.log_source = run.log_source;
        settings.allow_non_root = run.allow_non_root;
        Ok(settings)
    }
}

/// Resumes an interrupted igt_runner run.
#[derive(Debug, Parser)]
#[command(name = "igt_resume", version, max_term_width = 100)]
pub struct IgtResumeApp {
    /// The results directory of the run to resume
    results: Utf8PathBuf,

    #[command(flatten)]
    output: OutputOpts,
}

impl IgtResumeApp {
    /// Initializes logging.
    pub fn init_output(&self) -> OutputContext {
        // The persisted log level isn't known until the results directory is read.
        self.output.init(LogLevel::Normal)
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        let (settings, job_list, mut state) =
            executor::initialize_execute_state_from_resume(&self.results)?;
        run_and_generate(&mut state, &settings, &job_list, output)
    }
}

/// Generates results.json from an igt_runner results directory.
#[derive(Debug, Parser)]
#[command(name = "igt_results", version, max_term_width = 100)]
pub struct IgtResultsApp {
    /// The results directory
    results: Utf8PathBuf,

    #[command(flatten)]
    output: OutputOpts,
}

impl IgtResultsApp {
    /// Initializes logging.
    pub fn init_output(&self) -> OutputContext {
        self.output.init(LogLevel::Normal)
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, _output: OutputContext) -> Result<i32> {
        generate(&self.results)?;
        Ok(RunnerExitCode::OK)
    }
}

fn run_and_generate(
    state: &mut ExecuteState,
    settings: &Settings,
    job_list: &JobList,
    output: OutputContext,
) -> Result<i32> {
    let mut reporter = TestReporterBuilder::default()
        .set_colorize(output.colorize_stderr())
        .set_log_level(settings.log_level)
        .build(ReporterOutput::Terminal);
    let outcome = executor::execute(
        state,
        settings,
        job_list,
        &mut reporter,
        SignalHandlerKind::Standard,
    )?;

    if state.is_dry() {
        return Ok(RunnerExitCode::OK);
    }
    generate(&settings.results_path)?;

    match outcome {
        ExecuteOutcome::Completed => Ok(RunnerExitCode::OK),
        ExecuteOutcome::Aborted(reason) => {
            info!("run aborted: {reason}");
            Ok(RunnerExitCode::ABORTED)
        }
    }
}

fn generate(results_path: &Utf8Path) -> Result<()> {
    let document = resultgen::generate_results(results_path)
        .map_err(|err| ExpectedError::results(err, results_path))?;
    let written = resultgen::write_results(results_path, &document)
        .map_err(|err| ExpectedError::write_results(err, results_path))?;
    info!("results written to {written}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn settings_from(args: &[&str], env_root: Option<&Utf8Path>) -> Result<Settings> {
        let app =
            IgtRunnerApp::try_parse_from(std::iter::once("igt_runner").chain(args.iter().copied()))
                .expect("arguments parse");
        app.to_settings(env_root.map(ToOwned::to_owned))
    }

    #[test]
    fn verify_app() {
        use clap::CommandFactory;
        IgtRunnerApp::command().debug_assert();
        IgtResumeApp::command().debug_assert();
        IgtResultsApp::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let root = Utf8TempDir::new().expect("created temp dir");
        let settings =
            settings_from(&[root.path().as_str(), "/tmp/results"], None).expect("valid settings");
        assert_eq!(settings, Settings::new(root.path(), "/tmp/results"));
        assert_eq!(settings.name, "results");
    }

    #[test]
    fn every_flag() {
        let root = Utf8TempDir::new().expect("created temp dir");
        let blacklist = root.path().join("blacklist.txt");
        std::fs::write(&blacklist, "# comment\nabort-.*\n\n").expect("wrote blacklist");
        let settings = settings_from(
            &[
                "-n",
                "nightly",
                "--abort-on-monitored-error=taint",
                "--disk-usage-limit=4k",
                "--ignore-missing",
                "--dry-run",
                "-t",
                "^igt@successtest",
                "--include",
                "dynamic",
                "-x",
                "second",
                "-b",
                blacklist.as_str(),
                "-e",
                "FOO=bar",
                "--sync",
                "--multiple-mode",
                "--log-level",
                "verbose",
                "--overwrite",
                "--inactivity-timeout",
                "30",
                "--per-test-timeout",
                "2m",
                "--overall-timeout",
                "0",
                "--use-watchdog",
                "--prune-mode=keep-dynamic-subtests",
                "--log-source=journal",
                "--allow-non-root",
                root.path().as_str(),
                "/tmp/results",
            ],
            None,
        )
        .expect("valid settings");

        assert_eq!(settings.name, "nightly");
        assert_eq!(settings.abort_mask, AbortMask::TAINT);
        assert_eq!(settings.disk_usage_limit, Some(4096));
        assert!(settings.ignore_missing && settings.dry_run && settings.sync);
        assert!(settings.multiple_mode && settings.overwrite && settings.use_watchdog);
        assert!(settings.allow_non_root);
        assert_eq!(
            settings.include.patterns().collect::<Vec<_>>(),
            ["^igt@successtest", "dynamic"]
        );
        assert_eq!(
            settings.exclude.patterns().collect::<Vec<_>>(),
            ["second", "abort-.*"]
        );
        assert_eq!(settings.env_vars.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(settings.log_level, LogLevel::Verbose);
        assert_eq!(settings.inactivity_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.per_test_timeout, Some(Duration::from_secs(120)));
        assert_eq!(settings.overall_timeout, None);
        assert_eq!(settings.prune_mode, PruneMode::KeepDynamic);
        assert_eq!(settings.log_source, LogSource::Journal);
    }

    #[test_case(&[], AbortMask::empty(); "absent")]
    #[test_case(&["--abort-on-monitored-error"], AbortMask::all(); "bare flag")]
    #[test_case(&["--abort-on-monitored-error="], AbortMask::all(); "empty list")]
    #[test_case(&["--abort-on-monitored-error=lockdep"], AbortMask::LOCKDEP; "lockdep")]
    #[test_case(&["--abort-on-monitored-error=taint,lockdep"], AbortMask::all(); "list")]
    fn abort_masks(args: &[&str], expected: AbortMask) {
        let root = Utf8TempDir::new().expect("created temp dir");
        let mut all: Vec<&str> = args.to_vec();
        all.extend([root.path().as_str(), "/tmp/results"]);
        let settings = settings_from(&all, None).expect("valid settings");
        assert_eq!(settings.abort_mask, expected);
    }

    #[test]
    fn disk_usage_limit_parsing() {
        let root = Utf8TempDir::new().expect("created temp dir");
        let limit = |value: &str| {
            let arg = format!("--disk-usage-limit={value}");
            settings_from(&[&arg, root.path().as_str(), "/tmp/results"], None)
                .expect("valid settings")
                .disk_usage_limit
        };
        assert_eq!(limit("4096"), Some(4096));
        assert_eq!(limit("4k"), Some(4096));
        assert_eq!(limit("1M"), Some(1024 * 1024));
        assert_eq!(limit("1G"), Some(1024 * 1024 * 1024));

        for invalid in ["1x", "k", "-1", "1.5M"] {
            let arg = format!("--disk-usage-limit={invalid}");
            let result = IgtRunnerApp::try_parse_from([
                "igt_runner",
                &arg,
                root.path().as_str(),
                "/tmp/results",
            ]);
            assert!(result.is_err(), "`{invalid}` is rejected");
        }
    }

    #[test_case(&[], 4, false; "absent flags")]
    #[test_case(&["--piglit-style-dmesg"], 5, true; "piglit infers 5")]
    #[test_case(&["--piglit-style-dmesg", "--dmesg-warn-level=3"], 3, true; "explicit wins")]
    #[test_case(&["--dmesg-warn-level=6"], 6, false; "explicit without piglit")]
    fn dmesg_warn_levels(args: &[&str], level: i32, piglit: bool) {
        let root = Utf8TempDir::new().expect("created temp dir");
        let mut all: Vec<&str> = args.to_vec();
        all.extend([root.path().as_str(), "/tmp/results"]);
        let settings = settings_from(&all, None).expect("valid settings");
        assert_eq!(settings.dmesg_warn_level, level);
        assert_eq!(settings.piglit_style_dmesg, piglit);
    }

    #[test]
    fn test_root_from_environment() {
        let root = Utf8TempDir::new().expect("created temp dir");
        let settings =
            settings_from(&["/tmp/results"], Some(root.path())).expect("valid settings");
        assert_eq!(settings.test_root, root.path());
        assert_eq!(settings.results_path, "/tmp/results");

        let error = settings_from(&["/tmp/results"], None).expect_err("no test root");
        assert_eq!(error.process_exit_code(), RunnerExitCode::SETUP_ERROR);

        let file = root.path().join("file");
        std::fs::write(&file, "").expect("wrote file");
        let error = settings_from(&[file.as_str(), "/tmp/results"], None)
            .expect_err("test root is a file");
        assert!(matches!(
            error,
            ExpectedError::Settings {
                err: SettingsError::TestRootNotDirectory { .. },
            }
        ));
    }

    #[test]
    fn invalid_settings() {
        let root = Utf8TempDir::new().expect("created temp dir");
        let error = settings_from(&["-t", "(", root.path().as_str(), "/tmp/results"], None)
            .expect_err("invalid regex");
        assert_eq!(error.process_exit_code(), RunnerExitCode::SETUP_ERROR);

        let error = settings_from(&["-e", "=x", root.path().as_str(), "/tmp/results"], None)
            .expect_err("invalid environment");
        assert_eq!(error.process_exit_code(), RunnerExitCode::SETUP_ERROR);
    }
}
