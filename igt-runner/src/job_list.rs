// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Building the list of jobs to run.
//!
//! A job is one invocation of a test binary: either the whole binary, or a selection of its
//! subtests passed with `--run-subtest`. Jobs are discovered by running every binary in the test
//! root with `--list-subtests`, or read from a test list file, and then filtered by the
//! include/exclude regexes applied to full test names (`binary@subtest[@dynamic]`).

use crate::{
    errors::{JobListError, StateReadError, StateWriteError},
    helpers::write_atomic,
    settings::Settings,
};
use camino::{Utf8Path, Utf8PathBuf};
use igt_metadata::{IgtExitCode, TestName, comms::RUNNER_SOCKET_FD_ENV, is_valid_subtest_name};
use itertools::Itertools;
use std::{collections::BTreeMap, fmt, os::unix::fs::PermissionsExt};
use swrite::{SWrite, swriteln};
use tracing::{debug, warn};

/// The name of the job list file in a results directory.
pub const JOB_LIST_FILE_NAME: &str = "joblist.txt";

/// One invocation of a test binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobListEntry {
    /// The binary's file name in the test root.
    pub binary: String,

    /// Subtest patterns passed with `--run-subtest`. Empty means the whole binary.
    pub subtests: Vec<String>,

    /// Dynamic subtest patterns passed with `--dynamic-subtest`.
    pub dynamic_subtests: Vec<String>,
}

impl JobListEntry {
    /// Creates an entry that runs the whole binary.
    pub fn whole_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            subtests: Vec::new(),
            dynamic_subtests: Vec::new(),
        }
    }

    /// Creates an entry that runs the given subtests.
    pub fn with_subtests<I, S>(binary: impl Into<String>, subtests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            binary: binary.into(),
            subtests: subtests.into_iter().map(Into::into).collect(),
            dynamic_subtests: Vec::new(),
        }
    }

    /// Returns true if this entry runs the whole binary.
    pub fn is_whole_binary(&self) -> bool {
        self.subtests.is_empty()
    }

    /// Returns the command-line arguments selecting this entry's subtests.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.subtests.is_empty() {
            args.push("--run-subtest".to_owned());
            args.push(self.subtests.join(","));
        }
        if !self.dynamic_subtests.is_empty() {
            args.push("--dynamic-subtest".to_owned());
            args.push(self.dynamic_subtests.join(","));
        }
        args
    }

    /// Returns the subtest names this entry asks for explicitly, ignoring wildcard and negated
    /// patterns.
    pub fn explicit_subtests(&self) -> impl Iterator<Item = &str> {
        self.subtests
            .iter()
            .map(String::as_str)
            .filter(|s| is_valid_subtest_name(s))
    }

    /// Returns the full names this entry asks for explicitly: the binary for whole-binary
    /// entries, otherwise each named subtest or dynamic subtest.
    pub fn requested_names(&self) -> Vec<TestName> {
        if self.is_whole_binary() {
            return vec![TestName::binary(&self.binary)];
        }
        let subtests: Vec<&str> = self.explicit_subtests().collect();
        match (&subtests[..], &self.dynamic_subtests[..]) {
            ([subtest], dynamics) if !dynamics.is_empty() => dynamics
                .iter()
                .filter(|d| is_valid_subtest_name(d))
                .map(|d| TestName::dynamic(&self.binary, *subtest, d))
                .collect(),
            _ => subtests
                .into_iter()
                .map(|s| TestName::subtest(&self.binary, s))
                .collect(),
        }
    }
}

impl fmt::Display for JobListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.binary)?;
        if !self.subtests.is_empty() {
            write!(f, " {}", self.subtests.join(","))?;
        }
        if !self.dynamic_subtests.is_empty() {
            write!(f, " {}", self.dynamic_subtests.join(","))?;
        }
        Ok(())
    }
}

/// The ordered list of jobs for a run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobList {
    entries: Vec<JobListEntry>,
}

impl JobList {
    /// Creates a job list from entries.
    pub fn new(entries: Vec<JobListEntry>) -> Self {
        Self { entries }
    }

    /// Builds the job list for `settings`, from its test list if it has one, otherwise by
    /// discovering every binary in the test root.
    pub fn create(settings: &Settings) -> Result<Self, JobListError> {
        let entries = match &settings.test_list {
            Some(test_list) => entries_from_test_list(settings, test_list)?,
            None => entries_from_discovery(settings)?,
        };
        if entries.is_empty() {
            return Err(JobListError::Empty);
        }
        Ok(Self { entries })
    }

    /// Returns the entries.
    pub fn entries(&self) -> &[JobListEntry] {
        &self.entries
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the full names of everything this job list runs explicitly.
    pub fn requested_names(&self) -> impl Iterator<Item = TestName> + '_ {
        self.entries.iter().flat_map(JobListEntry::requested_names)
    }

    /// Serializes the job list in the `joblist.txt` format: one entry per line, the binary
    /// followed by comma-separated subtest patterns and dynamic subtest patterns.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            swriteln!(out, "{entry}");
        }
        out
    }

    /// Parses the `joblist.txt` format. `path` is used for error messages.
    pub fn from_text(path: &Utf8Path, contents: &str) -> Result<Self, StateReadError> {
        let entries = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                let mut parts = line.split(' ');
                let binary = parts.next().unwrap_or_default();
                let split = |list: Option<&str>| -> Vec<String> {
                    list.map(|l| l.split(',').map(str::to_owned).collect())
                        .unwrap_or_default()
                };
                let subtests = split(parts.next());
                let dynamic_subtests = split(parts.next());
                if binary.is_empty() || parts.next().is_some() {
                    return Err(StateReadError::MalformedLine {
                        path: path.to_owned(),
                        line: index + 1,
                        text: line.to_owned(),
                    });
                }
                Ok(JobListEntry {
                    binary: binary.to_owned(),
                    subtests,
                    dynamic_subtests,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { entries })
    }

    /// Reads `joblist.txt` from `results_dir`.
    pub fn read_from_dir(results_dir: &Utf8Path) -> Result<Self, StateReadError> {
        let path = results_dir.join(JOB_LIST_FILE_NAME);
        let contents = std::fs::read_to_string(&path).map_err(|error| StateReadError::Read {
            path: path.clone(),
            error,
        })?;
        Self::from_text(&path, &contents)
    }

    /// Writes `joblist.txt` into `results_dir`.
    pub fn write_to_dir(&self, results_dir: &Utf8Path) -> Result<(), StateWriteError> {
        write_atomic(
            &results_dir.join(JOB_LIST_FILE_NAME),
            self.to_text().as_bytes(),
        )
    }
}

/// Returns true if `name` passes the include and exclude regexes. Regexes are matched against
/// the `igt@`-prefixed name.
fn filter_matches(settings: &Settings, name: &TestName) -> bool {
    let name = name.to_prefixed();
    (settings.include.is_empty() || settings.include.is_match(&name))
        && !settings.exclude.is_match(&name)
}

/// Lists the executable files in the test root, sorted by name.
fn find_binaries(test_root: &Utf8Path) -> Result<Vec<String>, JobListError> {
    let read_error = |error| JobListError::ReadTestRoot {
        path: test_root.to_owned(),
        error,
    };
    let mut binaries = Vec::new();
    for entry in test_root.read_dir_utf8().map_err(read_error)? {
        let entry = entry.map_err(read_error)?;
        // Follow symlinks: test roots are often trees of links to build outputs.
        let Ok(metadata) = std::fs::metadata(entry.path()) else {
            continue;
        };
        if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
            binaries.push(entry.file_name().to_owned());
        }
    }
    binaries.sort_unstable();
    Ok(binaries)
}

/// The subtests a binary reports with `--list-subtests`, or `None` if it has none.
fn list_subtests(
    settings: &Settings,
    binary_path: &Utf8Path,
) -> Result<Option<Vec<String>>, JobListError> {
    let mut expression = duct::cmd(binary_path.as_str(), ["--list-subtests"])
        .stdout_capture()
        .stderr_capture()
        .env_remove(RUNNER_SOCKET_FD_ENV)
        .unchecked();
    for (key, value) in &settings.env_vars {
        expression = expression.env(key, value);
    }
    debug!("listing subtests: {expression:?}");
    let output = expression
        .run()
        .map_err(|error| JobListError::ListSubtests {
            binary: binary_path.to_owned(),
            error,
        })?;

    match output.status.code() {
        Some(IgtExitCode::SUCCESS) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(Some(
                stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| is_valid_subtest_name(line))
                    .map(str::to_owned)
                    .collect(),
            ))
        }
        Some(IgtExitCode::INVALID) => Ok(None),
        code => Err(JobListError::ListSubtestsFailed {
            binary: binary_path.to_owned(),
            code,
        }),
    }
}

fn entries_from_discovery(settings: &Settings) -> Result<Vec<JobListEntry>, JobListError> {
    let mut entries = Vec::new();
    for binary in find_binaries(&settings.test_root)? {
        let path = settings.test_root.join(&binary);
        let Some(subtests) = list_subtests(settings, &path)? else {
            if filter_matches(settings, &TestName::binary(&binary)) {
                entries.push(JobListEntry::whole_binary(binary));
            }
            continue;
        };

        let matched: Vec<&String> = subtests
            .iter()
            .filter(|subtest| filter_matches(settings, &TestName::subtest(&binary, *subtest)))
            .collect();
        if matched.is_empty() {
            continue;
        }
        if !settings.multiple_mode {
            entries.extend(
                matched
                    .into_iter()
                    .map(|subtest| JobListEntry::with_subtests(&binary, [subtest.as_str()])),
            );
        } else if matched.len() == subtests.len() {
            entries.push(JobListEntry::whole_binary(binary));
        } else {
            entries.push(JobListEntry::with_subtests(
                &binary,
                matched.into_iter().map(String::as_str),
            ));
        }
    }
    Ok(entries)
}

/// A parsed test list line.
#[derive(Clone, Debug, Eq, PartialEq)]
struct TestListRequest {
    name: TestName,
}

fn parse_test_list(path: &Utf8Path, contents: &str) -> Result<Vec<TestListRequest>, JobListError> {
    let mut requests = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let name: TestName = line
            .parse()
            .map_err(|_| JobListError::InvalidTestListEntry {
                path: path.to_owned(),
                line: index + 1,
                text: line.to_owned(),
            })?;
        requests.push(TestListRequest { name });
    }
    Ok(requests)
}

fn entries_from_test_list(
    settings: &Settings,
    test_list: &Utf8Path,
) -> Result<Vec<JobListEntry>, JobListError> {
    let contents =
        std::fs::read_to_string(test_list).map_err(|error| JobListError::ReadTestList {
            path: test_list.to_owned(),
            error,
        })?;
    let requests = parse_test_list(test_list, &contents)?;

    let mut entries = Vec::new();
    // Multiple mode batches plain subtest requests per binary, keyed by the index of the
    // binary's entry.
    let mut batched: BTreeMap<String, usize> = BTreeMap::new();

    for TestListRequest { name } in requests {
        let binary = name.binary.as_str();
        let binary_path = settings.test_root.join(binary);
        if !binary_path.is_file() {
            if settings.ignore_missing {
                warn!("test list names missing binary `{binary}`, skipping");
                continue;
            }
            return Err(JobListError::BinaryNotFound {
                binary: binary.to_owned(),
                test_root: settings.test_root.clone(),
            });
        }
        if !filter_matches(settings, &name) {
            continue;
        }

        let entry = match (name.subtest.as_deref(), name.dynamic.as_deref()) {
            (None, _) => {
                if settings.multiple_mode {
                    if let Some(&index) = batched.get(binary) {
                        // The whole binary covers every subtest requested so far.
                        entries[index] = JobListEntry::whole_binary(binary);
                        continue;
                    }
                    batched.insert(binary.to_owned(), entries.len());
                }
                JobListEntry::whole_binary(binary)
            }
            (Some(subtest), Some(dynamic)) => JobListEntry {
                binary: binary.to_owned(),
                subtests: vec![subtest.to_owned()],
                dynamic_subtests: vec![dynamic.to_owned()],
            },
            (Some(subtest), None) => {
                if settings.multiple_mode {
                    if let Some(&index) = batched.get(binary) {
                        let existing: &mut JobListEntry = &mut entries[index];
                        if !existing.is_whole_binary()
                            && !existing.subtests.iter().any(|s| s == subtest)
                        {
                            existing.subtests.push(subtest.to_owned());
                        }
                        continue;
                    }
                    batched.insert(binary.to_owned(), entries.len());
                }
                JobListEntry::with_subtests(binary, [subtest])
            }
        };
        entries.push(entry);
    }
    Ok(entries)
}

/// Returns every `igt@`-prefixed test name the job list would run, for `--list-all`.
///
/// Whole-binary entries are expanded by listing the binary's subtests.
pub fn list_all(settings: &Settings, job_list: &JobList) -> Result<Vec<String>, JobListError> {
    let mut names = Vec::new();
    for entry in job_list.entries() {
        if entry.is_whole_binary() {
            let path = settings.test_root.join(&entry.binary);
            match list_subtests(settings, &path)? {
                Some(subtests) => names.extend(
                    subtests
                        .iter()
                        .map(|s| TestName::subtest(&entry.binary, s))
                        .filter(|name| filter_matches(settings, name))
                        .map(|name| name.to_prefixed()),
                ),
                None => names.push(TestName::binary(&entry.binary).to_prefixed()),
            }
        } else {
            names.extend(entry.requested_names().iter().map(TestName::to_prefixed));
        }
    }
    Ok(names.into_iter().unique().collect())
}

/// Returns the path to an entry's binary.
pub fn binary_path(settings: &Settings, entry: &JobListEntry) -> Utf8PathBuf {
    settings.test_root.join(&entry.binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn job_list_text_round_trip() {
        let job_list = JobList::new(vec![
            JobListEntry::whole_binary("no-subtests"),
            JobListEntry::with_subtests("successtest", ["first-subtest", "second-subtest"]),
            JobListEntry::with_subtests("abort", ["*", "!a-subtest"]),
            JobListEntry {
                binary: "dynamic".to_owned(),
                subtests: vec!["dynamic".to_owned()],
                dynamic_subtests: vec!["dynamic-pass".to_owned()],
            },
        ]);
        let text = job_list.to_text();
        assert_eq!(
            text,
            indoc! {"
                no-subtests
                successtest first-subtest,second-subtest
                abort *,!a-subtest
                dynamic dynamic dynamic-pass
            "}
        );
        let parsed = JobList::from_text(Utf8Path::new("joblist.txt"), &text).unwrap();
        assert_eq!(parsed, job_list);
    }

    #[test]
    fn malformed_job_list() {
        let error =
            JobList::from_text(Utf8Path::new("joblist.txt"), "a b c d\n").expect_err("too many");
        assert!(matches!(error, StateReadError::MalformedLine { line: 1, .. }));
    }

    #[test]
    fn entry_args_and_names() {
        let entry = JobListEntry::with_subtests("abort", ["*", "!a-subtest", "c-subtest"]);
        assert_eq!(entry.args(), ["--run-subtest", "*,!a-subtest,c-subtest"]);
        assert_eq!(
            entry.requested_names(),
            [TestName::subtest("abort", "c-subtest")]
        );

        let entry = JobListEntry {
            binary: "dynamic".to_owned(),
            subtests: vec!["dynamic".to_owned()],
            dynamic_subtests: vec!["dynamic-fail".to_owned()],
        };
        assert_eq!(
            entry.args(),
            [
                "--run-subtest",
                "dynamic",
                "--dynamic-subtest",
                "dynamic-fail"
            ]
        );
        assert_eq!(
            entry.requested_names(),
            [TestName::dynamic("dynamic", "dynamic", "dynamic-fail")]
        );

        assert!(JobListEntry::whole_binary("x").args().is_empty());
    }

    #[test]
    fn test_list_parsing() {
        let requests = parse_test_list(
            Utf8Path::new("list.txt"),
            indoc! {"
                # comment
                igt@successtest@first-subtest
                no-subtests

                dynamic@dynamic@dynamic-pass  # trailing comment
            "},
        )
        .unwrap();
        let names: Vec<String> = requests.iter().map(|r| r.name.to_string()).collect();
        assert_eq!(
            names,
            [
                "successtest@first-subtest",
                "no-subtests",
                "dynamic@dynamic@dynamic-pass",
            ]
        );

        let error = parse_test_list(Utf8Path::new("list.txt"), "foo@bad name\n").unwrap_err();
        assert!(
            matches!(error, JobListError::InvalidTestListEntry { line: 1, .. }),
            "{error:?}"
        );
    }

    fn touch_executable(dir: &Utf8Path, name: &str) {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 79\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_list_batching() {
        let root = Utf8TempDir::new().unwrap();
        for binary in ["successtest", "dynamic", "no-subtests"] {
            touch_executable(root.path(), binary);
        }
        let list = root.path().join("list.txt");
        std::fs::write(
            &list,
            indoc! {"
                successtest@first-subtest
                dynamic@dynamic@dynamic-pass
                dynamic@normal-pass
                successtest@second-subtest
                no-subtests
                missing@whatever
            "},
        )
        .unwrap();

        let mut settings = Settings::new(root.path(), root.path().join("results"));
        settings.test_list = Some(list);
        settings.ignore_missing = true;

        let normal = JobList::create(&settings).unwrap();
        assert_eq!(normal.len(), 5);

        settings.multiple_mode = true;
        let multiple = JobList::create(&settings).unwrap();
        assert_eq!(
            multiple.entries(),
            [
                JobListEntry::with_subtests("successtest", ["first-subtest", "second-subtest"]),
                JobListEntry {
                    binary: "dynamic".to_owned(),
                    subtests: vec!["dynamic".to_owned()],
                    dynamic_subtests: vec!["dynamic-pass".to_owned()],
                },
                JobListEntry::with_subtests("dynamic", ["normal-pass"]),
                JobListEntry::whole_binary("no-subtests"),
            ]
        );

        settings.ignore_missing = false;
        let error = JobList::create(&settings).unwrap_err();
        assert!(
            matches!(error, JobListError::BinaryNotFound { ref binary, .. } if binary == "missing"),
            "{error:?}"
        );
    }

    #[test]
    fn test_list_whole_binary_in_multiple_mode() {
        let root = Utf8TempDir::new().unwrap();
        for binary in ["successtest", "skippers"] {
            touch_executable(root.path(), binary);
        }
        let list = root.path().join("list.txt");
        std::fs::write(
            &list,
            indoc! {"
                successtest
                successtest@first-subtest
                skippers@skip-one
                skippers
                skippers@skip-two
            "},
        )
        .unwrap();

        let mut settings = Settings::new(root.path(), root.path().join("results"));
        settings.test_list = Some(list);
        settings.multiple_mode = true;

        let job_list = JobList::create(&settings).unwrap();
        assert_eq!(
            job_list.entries(),
            [
                JobListEntry::whole_binary("successtest"),
                JobListEntry::whole_binary("skippers"),
            ]
        );
    }

    #[test]
    fn discovery_of_plain_binaries() {
        let root = Utf8TempDir::new().unwrap();
        touch_executable(root.path(), "plain-one");
        touch_executable(root.path(), "plain-two");
        std::fs::write(root.path().join("README"), "not a test").unwrap();

        let mut settings = Settings::new(root.path(), root.path().join("results"));
        let job_list = JobList::create(&settings).unwrap();
        assert_eq!(
            job_list.entries(),
            [
                JobListEntry::whole_binary("plain-one"),
                JobListEntry::whole_binary("plain-two"),
            ]
        );

        settings.exclude.push("two").unwrap();
        let job_list = JobList::create(&settings).unwrap();
        assert_eq!(job_list.len(), 1);

        settings.include.push("nothing-matches-this").unwrap();
        let error = JobList::create(&settings).unwrap_err();
        assert!(matches!(error, JobListError::Empty), "{error:?}");
    }
}
