// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runner settings and their persisted form, `metadata.txt`.
//!
//! Settings are built once from the command line and are immutable afterwards. They are written
//! to the results directory before anything runs so that `igt_resume` and `igt_results` see
//! exactly what the original run was configured with.

use crate::errors::{
    AbortMaskParseError, DiskLimitParseError, EnumParseError, SettingsError, StateReadError,
    StateWriteError,
};
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};
use swrite::{SWrite, swrite, swriteln};

/// The name of the settings file in a results directory.
pub const METADATA_FILE_NAME: &str = "metadata.txt";

/// The name of the environment overrides file in a results directory.
pub const ENVIRONMENT_FILE_NAME: &str = "environment.txt";

/// Environment variable naming the test root when it isn't passed on the command line.
pub const TEST_ROOT_ENV: &str = "IGT_TEST_ROOT";

/// Environment variable that disables socket communication with test binaries when non-empty.
pub const DISABLE_SOCKET_ENV: &str = "IGT_RUNNER_DISABLE_SOCKET_COMMUNICATION";

bitflags! {
    /// Monitored kernel conditions that abort the run.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct AbortMask: u32 {
        /// The kernel was tainted with a bad taint.
        const TAINT = 1 << 0;
        /// Lockdep was turned off by a locking problem.
        const LOCKDEP = 1 << 1;
    }
}

impl FromStr for AbortMask {
    type Err = AbortMaskParseError;

    /// Parses `taint`, `lockdep`, `all` or a comma-separated list of them. An empty string means
    /// all conditions, as does the bare `--abort-on-monitored-error` flag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::all());
        }
        s.split(',').try_fold(Self::empty(), |mask, part| {
            let flag = match part.trim() {
                "taint" => Self::TAINT,
                "lockdep" => Self::LOCKDEP,
                "all" => Self::all(),
                _ => return Err(AbortMaskParseError::new(s)),
            };
            Ok(mask | flag)
        })
    }
}

/// How much of the subtest hierarchy is kept in the generated results.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum PruneMode {
    /// Keep subtests and dynamic subtests.
    #[default]
    KeepAll,
    /// Drop dynamic subtests, keeping their containers.
    KeepSubtests,
    /// Drop containers that have dynamic subtests, keeping the dynamic subtests.
    KeepDynamic,
    /// Keep only names explicitly named in the job list.
    KeepRequested,
}

impl PruneMode {
    const VALUES: &'static [&'static str] = &[
        "keep-all",
        "keep-subtests",
        "keep-dynamic-subtests",
        "keep-dynamic",
        "keep-requested",
    ];

    /// Returns the canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepAll => "keep-all",
            Self::KeepSubtests => "keep-subtests",
            Self::KeepDynamic => "keep-dynamic",
            Self::KeepRequested => "keep-requested",
        }
    }
}

impl FromStr for PruneMode {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-all" => Ok(Self::KeepAll),
            "keep-subtests" => Ok(Self::KeepSubtests),
            "keep-dynamic-subtests" | "keep-dynamic" => Ok(Self::KeepDynamic),
            "keep-requested" => Ok(Self::KeepRequested),
            _ => Err(EnumParseError::new("prune mode", s, Self::VALUES)),
        }
    }
}

impl fmt::Display for PruneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much the runner prints while running.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LogLevel {
    /// Only warnings and errors.
    Quiet,
    /// One line per job.
    #[default]
    Normal,
    /// Also echo test output.
    Verbose,
}

impl LogLevel {
    const VALUES: &'static [&'static str] = &["quiet", "normal", "verbose"];

    /// Returns the canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quiet => "quiet",
            Self::Normal => "normal",
            Self::Verbose => "verbose",
        }
    }
}

impl FromStr for LogLevel {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quiet" => Ok(Self::Quiet),
            "normal" => Ok(Self::Normal),
            "verbose" => Ok(Self::Verbose),
            _ => Err(EnumParseError::new("log level", s, Self::VALUES)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which record of a job's progress is trusted when resuming and generating results.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum LogSource {
    /// Replay both and keep the one with more recorded progress.
    #[default]
    Auto,
    /// The text journal plus output markers.
    Journal,
    /// The binary comms log.
    Comms,
}

impl LogSource {
    const VALUES: &'static [&'static str] = &["auto", "journal", "comms"];

    /// Returns the canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Journal => "journal",
            Self::Comms => "comms",
        }
    }
}

impl FromStr for LogSource {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "journal" => Ok(Self::Journal),
            "comms" => Ok(Self::Comms),
            _ => Err(EnumParseError::new("log source", s, Self::VALUES)),
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a disk usage limit: a byte count with an optional `k`, `M` or `G` suffix (powers of
/// 1024).
pub fn parse_disk_usage_limit(input: &str) -> Result<u64, DiskLimitParseError> {
    let (digits, multiplier) = match input.char_indices().last() {
        Some((i, 'k' | 'K')) => (&input[..i], 1 << 10),
        Some((i, 'm' | 'M')) => (&input[..i], 1 << 20),
        Some((i, 'g' | 'G')) => (&input[..i], 1 << 30),
        _ => (input, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DiskLimitParseError::new(input));
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| DiskLimitParseError::new(input))
}

/// The default `--dmesg-warn-level`: kernel warnings, or notices under piglit-style dmesg
/// handling.
pub fn default_dmesg_warn_level(piglit_style_dmesg: bool) -> i32 {
    if piglit_style_dmesg { 5 } else { 4 }
}

/// An ordered list of regexes, remembering their source text.
#[derive(Clone, Debug, Default)]
pub struct RegexList {
    patterns: Vec<(String, Regex)>,
}

impl RegexList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `pattern` and appends it.
    pub fn push(&mut self, pattern: &str) -> Result<(), SettingsError> {
        let regex = Regex::new(pattern).map_err(|error| SettingsError::InvalidRegex {
            pattern: pattern.to_owned(),
            error: Box::new(error),
        })?;
        self.patterns.push((pattern.to_owned(), regex));
        Ok(())
    }

    /// Appends the patterns of a blacklist file: one regex per line, with `#` comments and
    /// blank lines ignored.
    pub fn push_blacklist(&mut self, path: &Utf8Path) -> Result<(), SettingsError> {
        let contents =
            std::fs::read_to_string(path).map_err(|error| SettingsError::ReadBlacklist {
                path: path.to_owned(),
                error,
            })?;
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if !line.is_empty() {
                self.push(line)?;
            }
        }
        Ok(())
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns true if any regex matches `haystack`.
    pub fn is_match(&self, haystack: &str) -> bool {
        self.patterns.iter().any(|(_, regex)| regex.is_match(haystack))
    }

    /// Iterates over the source patterns.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(pattern, _)| pattern.as_str())
    }
}

impl PartialEq for RegexList {
    fn eq(&self, other: &Self) -> bool {
        self.patterns().eq(other.patterns())
    }
}

impl Eq for RegexList {}

/// The runner's configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Settings {
    /// Conditions that abort the run.
    pub abort_mask: AbortMask,
    /// Kill a test whose output exceeds this many bytes.
    pub disk_usage_limit: Option<u64>,
    /// A file listing the tests to run.
    pub test_list: Option<Utf8PathBuf>,
    /// The run's name, recorded in the results.
    pub name: String,
    /// Set everything up but don't run anything.
    pub dry_run: bool,
    /// Allow running as a non-root user.
    pub allow_non_root: bool,
    /// Tests whose full name matches none of these are skipped, unless the list is empty.
    pub include: RegexList,
    /// Tests whose full name matches any of these are skipped.
    pub exclude: RegexList,
    /// Environment variables set for each test binary.
    pub env_vars: BTreeMap<String, String>,
    /// Sync results to disk after each line.
    pub sync: bool,
    /// Progress output verbosity.
    pub log_level: LogLevel,
    /// Replace an existing results directory.
    pub overwrite: bool,
    /// Run all selected subtests of a binary in one process.
    pub multiple_mode: bool,
    /// Kill a test that prints nothing for this long.
    pub inactivity_timeout: Option<Duration>,
    /// Kill a test that runs for longer than this.
    pub per_test_timeout: Option<Duration>,
    /// Stop the run once it has taken this long.
    pub overall_timeout: Option<Duration>,
    /// Ping `/dev/watchdog` while tests run.
    pub use_watchdog: bool,
    /// Only driver messages count towards dmesg warnings.
    pub piglit_style_dmesg: bool,
    /// Kernel log records at this level or more severe taint a result.
    pub dmesg_warn_level: i32,
    /// How much of the subtest hierarchy the results keep.
    pub prune_mode: PruneMode,
    /// Which progress record wins on resume and result generation.
    pub log_source: LogSource,
    /// Talk to test binaries over a socket.
    pub use_socket: bool,
    /// Skip test list entries whose binary is missing instead of failing.
    pub ignore_missing: bool,
    /// The directory test binaries are found in.
    pub test_root: Utf8PathBuf,
    /// The directory results are written to.
    pub results_path: Utf8PathBuf,
}

impl Settings {
    /// Creates settings with defaults for everything but the two directories.
    pub fn new(test_root: impl Into<Utf8PathBuf>, results_path: impl Into<Utf8PathBuf>) -> Self {
        let results_path = results_path.into();
        Self {
            abort_mask: AbortMask::empty(),
            disk_usage_limit: None,
            test_list: None,
            name: results_path.file_name().unwrap_or("results").to_owned(),
            dry_run: false,
            allow_non_root: false,
            include: RegexList::new(),
            exclude: RegexList::new(),
            env_vars: BTreeMap::new(),
            sync: false,
            log_level: LogLevel::Normal,
            overwrite: false,
            multiple_mode: false,
            inactivity_timeout: None,
            per_test_timeout: None,
            overall_timeout: None,
            use_watchdog: false,
            piglit_style_dmesg: false,
            dmesg_warn_level: default_dmesg_warn_level(false),
            prune_mode: PruneMode::KeepAll,
            log_source: LogSource::Auto,
            use_socket: std::env::var_os(DISABLE_SOCKET_ENV).is_none_or(|v| v.is_empty()),
            ignore_missing: false,
            test_root: test_root.into(),
            results_path,
        }
    }

    /// Serializes the settings in the `metadata.txt` format.
    pub fn to_metadata(&self) -> String {
        let mut out = String::new();
        let mut kv = |key: &str, value: &dyn fmt::Display| {
            swriteln!(out, "{key} : {value}");
        };
        kv("abort_mask", &self.abort_mask.bits());
        kv("disk_usage_limit", &self.disk_usage_limit.unwrap_or(0));
        if let Some(test_list) = &self.test_list {
            kv("test_list", test_list);
        }
        kv("name", &self.name);
        kv("dry_run", &u8::from(self.dry_run));
        kv("allow_non_root", &u8::from(self.allow_non_root));
        kv("sync", &u8::from(self.sync));
        kv("log_level", &self.log_level);
        kv("overwrite", &u8::from(self.overwrite));
        kv("multiple_mode", &u8::from(self.multiple_mode));
        kv("inactivity_timeout", &secs(self.inactivity_timeout));
        kv("per_test_timeout", &secs(self.per_test_timeout));
        kv("overall_timeout", &secs(self.overall_timeout));
        kv("use_watchdog", &u8::from(self.use_watchdog));
        kv("piglit_style_dmesg", &u8::from(self.piglit_style_dmesg));
        kv("dmesg_warn_level", &self.dmesg_warn_level);
        kv("prune_mode", &self.prune_mode);
        kv("log_source", &self.log_source);
        kv("use_socket", &u8::from(self.use_socket));
        kv("ignore_missing", &u8::from(self.ignore_missing));
        kv("test_root", &self.test_root);
        kv("results_path", &self.results_path);
        for pattern in self.include.patterns() {
            kv("include", &pattern);
        }
        for pattern in self.exclude.patterns() {
            kv("exclude", &pattern);
        }
        for (key, value) in &self.env_vars {
            swriteln!(out, "env.{key} : {value}");
        }
        out
    }

    /// Parses settings from the `metadata.txt` format. `path` is used for error messages.
    ///
    /// Unknown keys are skipped with a warning.
    pub fn from_metadata(path: &Utf8Path, contents: &str) -> Result<Self, StateReadError> {
        let mut settings = Self::new("", "");
        settings.use_socket = false;

        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(" : ") else {
                return Err(StateReadError::MalformedLine {
                    path: path.to_owned(),
                    line: index + 1,
                    text: line.to_owned(),
                });
            };
            let invalid = || StateReadError::InvalidValue {
                path: path.to_owned(),
                key: key.to_owned(),
                value: value.to_owned(),
            };
            let flag = || match value {
                "0" => Ok(false),
                "1" => Ok(true),
                _ => Err(invalid()),
            };
            let number = || value.parse::<u64>().map_err(|_| invalid());
            let timeout = || number().map(|n| (n > 0).then(|| Duration::from_secs(n)));

            match key {
                "abort_mask" => {
                    settings.abort_mask = AbortMask::from_bits(
                        value.parse().map_err(|_| invalid())?,
                    )
                    .ok_or_else(invalid)?;
                }
                "disk_usage_limit" => {
                    settings.disk_usage_limit = Some(number()?).filter(|&n| n > 0);
                }
                "test_list" => settings.test_list = Some(value.into()),
                "name" => settings.name = value.to_owned(),
                "dry_run" => settings.dry_run = flag()?,
                "allow_non_root" => settings.allow_non_root = flag()?,
                "sync" => settings.sync = flag()?,
                "log_level" => settings.log_level = value.parse().map_err(|_| invalid())?,
                "overwrite" => settings.overwrite = flag()?,
                "multiple_mode" => settings.multiple_mode = flag()?,
                "inactivity_timeout" => settings.inactivity_timeout = timeout()?,
                "per_test_timeout" => settings.per_test_timeout = timeout()?,
                "overall_timeout" => settings.overall_timeout = timeout()?,
                "use_watchdog" => settings.use_watchdog = flag()?,
                "piglit_style_dmesg" => settings.piglit_style_dmesg = flag()?,
                "dmesg_warn_level" => {
                    settings.dmesg_warn_level = value.parse().map_err(|_| invalid())?;
                }
                "prune_mode" => settings.prune_mode = value.parse().map_err(|_| invalid())?,
                "log_source" => settings.log_source = value.parse().map_err(|_| invalid())?,
                "use_socket" => settings.use_socket = flag()?,
                "ignore_missing" => settings.ignore_missing = flag()?,
                "test_root" => settings.test_root = value.into(),
                "results_path" => settings.results_path = value.into(),
                "include" => settings.include.push(value).map_err(|_| invalid())?,
                "exclude" => settings.exclude.push(value).map_err(|_| invalid())?,
                _ => match key.strip_prefix("env.") {
                    Some(var) => {
                        settings.env_vars.insert(var.to_owned(), value.to_owned());
                    }
                    None => {
                        tracing::warn!("{path}: ignoring unknown setting `{key}`");
                    }
                },
            }
        }
        Ok(settings)
    }

    /// Reads `metadata.txt` from `results_dir`.
    pub fn read_from_dir(results_dir: &Utf8Path) -> Result<Self, StateReadError> {
        let path = results_dir.join(METADATA_FILE_NAME);
        let contents = std::fs::read_to_string(&path).map_err(|error| StateReadError::Read {
            path: path.clone(),
            error,
        })?;
        Self::from_metadata(&path, &contents)
    }

    /// Writes `metadata.txt` and `environment.txt` into `results_dir`.
    pub fn write_to_dir(&self, results_dir: &Utf8Path) -> Result<(), StateWriteError> {
        let path = results_dir.join(METADATA_FILE_NAME);
        crate::helpers::write_atomic(&path, self.to_metadata().as_bytes())?;

        let mut environment = String::new();
        for (key, value) in &self.env_vars {
            swriteln!(environment, "{key}={value}");
        }
        let path = results_dir.join(ENVIRONMENT_FILE_NAME);
        crate::helpers::write_atomic(&path, environment.as_bytes())
    }

    /// Returns a one-line description of the timeouts, for logging.
    pub fn describe_timeouts(&self) -> String {
        let mut out = String::new();
        for (label, timeout) in [
            ("per-test", self.per_test_timeout),
            ("inactivity", self.inactivity_timeout),
            ("overall", self.overall_timeout),
        ] {
            if let Some(timeout) = timeout {
                if !out.is_empty() {
                    out.push_str(", ");
                }
                swrite!(out, "{label} {}s", timeout.as_secs());
            }
        }
        if out.is_empty() {
            out.push_str("none");
        }
        out
    }
}

fn secs(timeout: Option<Duration>) -> u64 {
    timeout.map_or(0, |t| t.as_secs())
}

/// Parses an `--environment` value: `KEY=VALUE`, or `KEY` to copy the variable from the runner's
/// own environment.
pub fn parse_env_assignment(input: &str) -> Result<(String, String), SettingsError> {
    let invalid = || SettingsError::InvalidEnvironment {
        input: input.to_owned(),
    };
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        Some(_) => Err(invalid()),
        None if !input.is_empty() => std::env::var(input)
            .map(|value| (input.to_owned(), value))
            .map_err(|_| invalid()),
        None => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("4096", 4096; "plain")]
    #[test_case("4k", 4096; "kilo")]
    #[test_case("1M", 1_048_576; "mega")]
    #[test_case("1G", 1_073_741_824; "giga")]
    #[test_case("0", 0; "zero")]
    fn disk_limits(input: &str, expected: u64) {
        assert_eq!(parse_disk_usage_limit(input), Ok(expected));
    }

    #[test_case(""; "empty")]
    #[test_case("k"; "suffix only")]
    #[test_case("4T"; "unknown suffix")]
    #[test_case("-4k"; "negative")]
    #[test_case("99999999999999G"; "overflow")]
    fn invalid_disk_limits(input: &str) {
        parse_disk_usage_limit(input).expect_err("invalid limit");
    }

    #[test_case("", AbortMask::all(); "empty means all")]
    #[test_case("all", AbortMask::all(); "all")]
    #[test_case("taint", AbortMask::TAINT; "taint")]
    #[test_case("lockdep,taint", AbortMask::all(); "list")]
    fn abort_masks(input: &str, expected: AbortMask) {
        assert_eq!(input.parse::<AbortMask>(), Ok(expected));
    }

    #[test]
    fn invalid_abort_mask() {
        "taint,bogus".parse::<AbortMask>().expect_err("bogus is unknown");
    }

    #[test]
    fn prune_mode_aliases() {
        assert_eq!("keep-dynamic-subtests".parse::<PruneMode>(), Ok(PruneMode::KeepDynamic));
        assert_eq!("keep-dynamic".parse::<PruneMode>(), Ok(PruneMode::KeepDynamic));
        "keep-nothing".parse::<PruneMode>().expect_err("unknown mode");
    }

    #[test]
    fn dmesg_warn_level_defaults() {
        assert_eq!(default_dmesg_warn_level(false), 4);
        assert_eq!(default_dmesg_warn_level(true), 5);
    }

    #[test]
    fn metadata_round_trip() {
        let mut settings = Settings::new("/usr/libexec/igt", "/tmp/results");
        settings.abort_mask = AbortMask::TAINT;
        settings.disk_usage_limit = Some(4096);
        settings.name = "nightly".to_owned();
        settings.include.push("successtest").unwrap();
        settings.include.push("^igt@dynamic@.* : odd$").unwrap();
        settings.exclude.push("abort").unwrap();
        settings
            .env_vars
            .insert("IGT_DEVICE".to_owned(), "sys:/sys/devices/pci0".to_owned());
        settings.multiple_mode = true;
        settings.per_test_timeout = Some(Duration::from_secs(30));
        settings.piglit_style_dmesg = true;
        settings.dmesg_warn_level = 3;
        settings.prune_mode = PruneMode::KeepRequested;
        settings.log_source = LogSource::Journal;
        settings.use_socket = true;

        let text = settings.to_metadata();
        let parsed = Settings::from_metadata(Utf8Path::new("metadata.txt"), &text).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn metadata_errors() {
        let path = Utf8Path::new("metadata.txt");
        let error = Settings::from_metadata(path, "dry_run : 1\nnonsense\n").unwrap_err();
        assert!(
            matches!(error, StateReadError::MalformedLine { line: 2, .. }),
            "{error:?}"
        );
        let error = Settings::from_metadata(path, "dry_run : maybe\n").unwrap_err();
        assert!(matches!(error, StateReadError::InvalidValue { .. }), "{error:?}");

        // Unknown keys are ignored.
        let settings = Settings::from_metadata(path, "future_key : 1\nsync : 1\n").unwrap();
        assert!(settings.sync);
    }

    #[test]
    fn env_assignments() {
        assert_eq!(
            parse_env_assignment("IGT_FORCE_DRIVER=i915").unwrap(),
            ("IGT_FORCE_DRIVER".to_owned(), "i915".to_owned())
        );
        assert_eq!(
            parse_env_assignment("EMPTY=").unwrap(),
            ("EMPTY".to_owned(), String::new())
        );
        parse_env_assignment("=value").expect_err("empty key");
        parse_env_assignment("").expect_err("empty input");
    }
}
