// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replaying what happened inside a job.
//!
//! A job's progress is recorded twice: as text (the runner's `journal.txt` plus the marker
//! lines in `out.txt`) and, in socket mode, as the binary `comms` log. Both are decoded into the
//! same stream of [`JobEvent`]s and folded by [`JobReplay::apply`], so resume and result
//! generation only ever look at a [`JobReplay`].

use crate::{
    errors::StateReadError,
    helpers::{read_optional, read_optional_bytes},
    job_list::JobListEntry,
    settings::LogSource,
};
use camino::Utf8Path;
use igt_metadata::{
    DisplayTime, MarkerLine, SubtestOutcome,
    comms::{LogStream, PacketBody, decode_all},
    is_valid_subtest_name, parse_time,
};
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    time::Duration,
};
use tracing::debug;

/// The runner's journal of subtest starts and job termination.
pub const JOURNAL_FILE_NAME: &str = "journal.txt";

/// The child's standard output.
pub const OUT_FILE_NAME: &str = "out.txt";

/// The child's standard error.
pub const ERR_FILE_NAME: &str = "err.txt";

/// Kernel log records captured while the job ran.
pub const DMESG_FILE_NAME: &str = "dmesg.txt";

/// The raw packets received on the runner socket.
pub const COMMS_FILE_NAME: &str = "comms";

/// How a job ended, as seen by the runner.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TerminationKind {
    /// The process exited or was killed by a signal on its own.
    Exited,

    /// The runner killed the process after a timeout.
    TimedOut,

    /// The runner killed the process for exceeding the disk usage limit.
    DiskLimit,
}

impl TerminationKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Exited => "exit",
            Self::TimedOut => "timeout",
            Self::DiskLimit => "disk-limit",
        }
    }
}

/// The terminal record of a job.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct JobTermination {
    /// How the job ended.
    pub kind: TerminationKind,

    /// The exit code, with signals encoded as 128 + signal.
    pub code: i32,

    /// Wall-clock time the job ran for.
    pub time: Duration,
}

/// One line of `journal.txt`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JournalLine {
    /// A subtest started.
    Subtest(String),

    /// A dynamic subtest started inside `subtest`.
    Dynamic {
        /// The enclosing subtest.
        subtest: String,
        /// The dynamic subtest.
        name: String,
    },

    /// The job ended.
    End(JobTermination),
}

impl JournalLine {
    /// Parses a journal line, returning `None` if it is malformed.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end();
        for kind in [
            TerminationKind::Exited,
            TerminationKind::TimedOut,
            TerminationKind::DiskLimit,
        ] {
            let Some(rest) = line
                .strip_prefix(kind.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
            else {
                continue;
            };
            let (code, time) = rest.split_once(' ')?;
            let time = time.strip_prefix('(')?.strip_suffix(')')?;
            return Some(Self::End(JobTermination {
                kind,
                code: code.parse().ok()?,
                time: parse_time(time)?,
            }));
        }

        match line.split_once('@') {
            Some((subtest, name))
                if is_valid_subtest_name(subtest) && is_valid_subtest_name(name) =>
            {
                Some(Self::Dynamic {
                    subtest: subtest.to_owned(),
                    name: name.to_owned(),
                })
            }
            None if is_valid_subtest_name(line) => Some(Self::Subtest(line.to_owned())),
            _ => None,
        }
    }
}

impl fmt::Display for JournalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subtest(name) => f.write_str(name),
            Self::Dynamic { subtest, name } => write!(f, "{subtest}@{name}"),
            Self::End(termination) => write!(
                f,
                "{}:{} ({})",
                termination.kind.as_str(),
                termination.code,
                DisplayTime(termination.time)
            ),
        }
    }
}

/// Appends lines to a job's journal.
#[derive(Debug)]
pub struct JournalWriter {
    file: File,
    sync: bool,
}

impl JournalWriter {
    /// Opens the journal in `job_dir` for appending, creating it if needed.
    pub fn open(job_dir: &Utf8Path, sync: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(job_dir.join(JOURNAL_FILE_NAME))?;
        Ok(Self { file, sync })
    }

    /// Appends a line.
    pub fn write_line(&mut self, line: &JournalLine) -> io::Result<()> {
        writeln!(self.file, "{line}")?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Something that happened inside a job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// A subtest started.
    SubtestStart {
        /// The subtest name.
        name: String,
    },

    /// A subtest finished.
    SubtestResult {
        /// The subtest name.
        name: String,
        /// The reported outcome.
        outcome: SubtestOutcome,
        /// Time spent in the subtest.
        time: Duration,
    },

    /// A dynamic subtest started.
    DynamicStart {
        /// The enclosing subtest.
        subtest: String,
        /// The dynamic subtest name.
        name: String,
    },

    /// A dynamic subtest finished.
    DynamicResult {
        /// The enclosing subtest.
        subtest: String,
        /// The dynamic subtest name.
        name: String,
        /// The reported outcome.
        outcome: SubtestOutcome,
        /// Time spent in the dynamic subtest.
        time: Duration,
    },

    /// A binary without subtests reported its result.
    PlainResult {
        /// The reported outcome.
        outcome: SubtestOutcome,
        /// Time since the binary started.
        time: Duration,
    },

    /// The job ended.
    End(JobTermination),
}

/// A dynamic subtest as replayed.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicRecord {
    /// The dynamic subtest name.
    pub name: String,

    /// The outcome and time, if the dynamic subtest finished.
    pub result: Option<(SubtestOutcome, Duration)>,
}

/// A subtest as replayed.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtestRecord {
    /// The subtest name.
    pub name: String,

    /// The outcome and time, if the subtest finished.
    pub result: Option<(SubtestOutcome, Duration)>,

    /// Dynamic subtests, in start order.
    pub dynamic: Vec<DynamicRecord>,
}

impl SubtestRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            result: None,
            dynamic: Vec::new(),
        }
    }
}

/// The folded progress of one job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobReplay {
    /// Subtests, in start order.
    pub subtests: Vec<SubtestRecord>,

    /// The result printed by a binary without subtests.
    pub plain_result: Option<(SubtestOutcome, Duration)>,

    /// How the job ended, if it did.
    pub termination: Option<JobTermination>,
}

impl JobReplay {
    /// Folds a sequence of events.
    pub fn fold(events: impl IntoIterator<Item = JobEvent>) -> Self {
        let mut replay = Self::default();
        for event in events {
            replay.apply(event);
        }
        replay
    }

    /// Applies one event. Applying the same start or result twice has no further effect.
    pub fn apply(&mut self, event: JobEvent) {
        match event {
            JobEvent::SubtestStart { name } => {
                self.subtest_mut(&name);
            }
            JobEvent::SubtestResult {
                name,
                outcome,
                time,
            } => {
                self.subtest_mut(&name).result = Some((outcome, time));
            }
            JobEvent::DynamicStart { subtest, name } => {
                self.dynamic_mut(&subtest, &name);
            }
            JobEvent::DynamicResult {
                subtest,
                name,
                outcome,
                time,
            } => {
                self.dynamic_mut(&subtest, &name).result = Some((outcome, time));
            }
            JobEvent::PlainResult { outcome, time } => {
                self.plain_result = Some((outcome, time));
            }
            JobEvent::End(termination) => {
                self.termination = Some(termination);
            }
        }
    }

    fn subtest_mut(&mut self, name: &str) -> &mut SubtestRecord {
        let index = match self.subtests.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.subtests.push(SubtestRecord::new(name));
                self.subtests.len() - 1
            }
        };
        &mut self.subtests[index]
    }

    fn dynamic_mut(&mut self, subtest: &str, name: &str) -> &mut DynamicRecord {
        let record = self.subtest_mut(subtest);
        let index = match record.dynamic.iter().position(|d| d.name == name) {
            Some(index) => index,
            None => {
                record.dynamic.push(DynamicRecord {
                    name: name.to_owned(),
                    result: None,
                });
                record.dynamic.len() - 1
            }
        };
        &mut record.dynamic[index]
    }

    /// Returns true if nothing at all was recorded.
    pub fn is_empty(&self) -> bool {
        self.subtests.is_empty() && self.plain_result.is_none() && self.termination.is_none()
    }

    /// Returns the record for `name`.
    pub fn subtest(&self, name: &str) -> Option<&SubtestRecord> {
        self.subtests.iter().find(|s| s.name == name)
    }

    /// Returns the subtest that started but never reported a result, if any.
    pub fn in_progress(&self) -> Option<&SubtestRecord> {
        self.subtests.iter().rev().find(|s| s.result.is_none())
    }

    /// A measure of how much progress was recorded, used to pick between encodings.
    fn progress(&self) -> (bool, usize) {
        let events: usize = self
            .subtests
            .iter()
            .map(|s| {
                1 + usize::from(s.result.is_some())
                    + s.dynamic
                        .iter()
                        .map(|d| 1 + usize::from(d.result.is_some()))
                        .sum::<usize>()
            })
            .sum();
        (
            self.termination.is_some(),
            events + usize::from(self.plain_result.is_some()),
        )
    }
}

/// Decodes `journal.txt`. Malformed lines are skipped, since a crash can leave a torn line.
pub fn journal_events(contents: &str) -> Vec<JobEvent> {
    contents
        .lines()
        .filter_map(|line| {
            let parsed = JournalLine::parse(line);
            if parsed.is_none() && !line.trim().is_empty() {
                debug!("ignoring malformed journal line `{line}`");
            }
            parsed
        })
        .map(|line| match line {
            JournalLine::Subtest(name) => JobEvent::SubtestStart { name },
            JournalLine::Dynamic { subtest, name } => JobEvent::DynamicStart { subtest, name },
            JournalLine::End(termination) => JobEvent::End(termination),
        })
        .collect()
}

/// Tracks the enclosing subtest while decoding markers, which don't name it for dynamic
/// subtests.
#[derive(Debug, Default)]
struct MarkerDecoder {
    current_subtest: Option<String>,
}

impl MarkerDecoder {
    fn decode(&mut self, marker: MarkerLine) -> Option<JobEvent> {
        let event = match marker {
            MarkerLine::SubtestStart { name } => {
                self.current_subtest = Some(name.clone());
                JobEvent::SubtestStart { name }
            }
            MarkerLine::SubtestResult {
                name,
                outcome,
                time,
            } => {
                self.current_subtest = None;
                JobEvent::SubtestResult {
                    name,
                    outcome,
                    time,
                }
            }
            MarkerLine::DynamicSubtestStart { name } => JobEvent::DynamicStart {
                subtest: self.current_subtest.clone()?,
                name,
            },
            MarkerLine::DynamicSubtestResult {
                name,
                outcome,
                time,
            } => JobEvent::DynamicResult {
                subtest: self.current_subtest.clone()?,
                name,
                outcome,
                time,
            },
            MarkerLine::PlainResult { outcome, time } => JobEvent::PlainResult { outcome, time },
        };
        Some(event)
    }
}

/// Decodes the marker lines in a job's standard output.
pub fn output_events(contents: &str) -> Vec<JobEvent> {
    let mut decoder = MarkerDecoder::default();
    contents
        .lines()
        .filter_map(MarkerLine::parse)
        .filter_map(|marker| decoder.decode(marker))
        .collect()
}

/// Decodes a comms log.
pub fn comms_events(data: &[u8]) -> Vec<JobEvent> {
    let stream = decode_all(data);
    for error in &stream.errors {
        debug!("skipping damaged comms packet: {error}");
    }

    let mut decoder = MarkerDecoder::default();
    let mut events = Vec::new();
    for packet in stream.packets {
        let marker = match packet.body {
            PacketBody::SubtestStart { name } => MarkerLine::SubtestStart {
                name: name.into_owned(),
            },
            PacketBody::DynamicSubtestStart { name } => MarkerLine::DynamicSubtestStart {
                name: name.into_owned(),
            },
            PacketBody::SubtestResult {
                name,
                result,
                timeused,
                ..
            } => {
                let Some((outcome, time)) = parse_packet_result(&result, &timeused) else {
                    continue;
                };
                MarkerLine::SubtestResult {
                    name: name.into_owned(),
                    outcome,
                    time,
                }
            }
            PacketBody::DynamicSubtestResult {
                name,
                result,
                timeused,
                ..
            } => {
                let Some((outcome, time)) = parse_packet_result(&result, &timeused) else {
                    continue;
                };
                MarkerLine::DynamicSubtestResult {
                    name: name.into_owned(),
                    outcome,
                    time,
                }
            }
            PacketBody::Log {
                stream: LogStream::Stdout,
                text,
            } => {
                // Plain binaries print their result as ordinary output.
                for line in text.lines() {
                    if let Some(marker @ MarkerLine::PlainResult { .. }) = MarkerLine::parse(line)
                    {
                        events.extend(decoder.decode(marker));
                    }
                }
                continue;
            }
            PacketBody::Exit { code, timeused } => {
                events.push(JobEvent::End(JobTermination {
                    kind: TerminationKind::Exited,
                    code,
                    time: parse_time(&timeused).unwrap_or_default(),
                }));
                continue;
            }
            PacketBody::Log { .. } | PacketBody::Exec { .. } | PacketBody::VersionString { .. } => {
                continue;
            }
        };
        events.extend(decoder.decode(marker));
    }
    events
}

fn parse_packet_result(result: &str, timeused: &str) -> Option<(SubtestOutcome, Duration)> {
    Some((result.parse().ok()?, parse_time(timeused)?))
}

/// Replays the job recorded in `job_dir`.
///
/// The text encoding is the journal plus the output markers. The comms encoding is the comms
/// log, with the journal's termination line appended since only the runner knows about
/// timeouts. With [`LogSource::Auto`] the encoding with more recorded progress wins, and comms
/// wins ties.
pub fn replay_job(job_dir: &Utf8Path, source: LogSource) -> Result<JobReplay, StateReadError> {
    let journal = read_optional(&job_dir.join(JOURNAL_FILE_NAME))?.unwrap_or_default();
    let journal_events = journal_events(&journal);

    let text = || -> Result<JobReplay, StateReadError> {
        let out = read_optional(&job_dir.join(OUT_FILE_NAME))?.unwrap_or_default();
        Ok(JobReplay::fold(
            journal_events.iter().cloned().chain(output_events(&out)),
        ))
    };
    let comms = || -> Result<Option<JobReplay>, StateReadError> {
        let Some(data) = read_optional_bytes(&job_dir.join(COMMS_FILE_NAME))? else {
            return Ok(None);
        };
        let ends = journal_events
            .iter()
            .filter(|event| matches!(event, JobEvent::End(_)))
            .cloned();
        Ok(Some(JobReplay::fold(comms_events(&data).into_iter().chain(ends))))
    };

    match source {
        LogSource::Journal => text(),
        LogSource::Comms => match comms()? {
            Some(replay) => Ok(replay),
            None => text(),
        },
        LogSource::Auto => {
            let text = text()?;
            match comms()? {
                Some(comms) if comms.progress() >= text.progress() => Ok(comms),
                _ => Ok(text),
            }
        }
    }
}

/// What resuming should do with the last job that has a directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResumeDecision {
    /// The job never started; run it as is.
    NotStarted,

    /// The job finished; move on to the next one.
    Completed,

    /// The job stopped part way; run the given entry instead, which skips what already ran.
    Partial(JobListEntry),
}

/// Decides how to resume `entry`, given what its directory recorded.
pub fn resume_decision(entry: &JobListEntry, replay: &JobReplay) -> ResumeDecision {
    if replay.is_empty() {
        return ResumeDecision::NotStarted;
    }
    if replay.termination.is_some() || (replay.subtests.is_empty() && entry.is_whole_binary()) {
        return ResumeDecision::Completed;
    }

    let mut resumed = entry.clone();
    if !entry.dynamic_subtests.is_empty() {
        // A single subtest with selected dynamic subtests: skip the dynamic ones already seen.
        let seen: Vec<&str> = entry
            .subtests
            .iter()
            .filter_map(|s| replay.subtest(s))
            .flat_map(|s| s.dynamic.iter().map(|d| d.name.as_str()))
            .collect();
        if all_requested_seen(&entry.dynamic_subtests, &seen) {
            return ResumeDecision::Completed;
        }
        resumed
            .dynamic_subtests
            .extend(seen.iter().map(|name| format!("!{name}")));
        return ResumeDecision::Partial(resumed);
    }

    let seen: Vec<&str> = replay.subtests.iter().map(|s| s.name.as_str()).collect();
    if !entry.is_whole_binary() && all_requested_seen(&entry.subtests, &seen) {
        return ResumeDecision::Completed;
    }
    if entry.is_whole_binary() {
        resumed.subtests.push("*".to_owned());
    }
    resumed
        .subtests
        .extend(seen.iter().map(|name| format!("!{name}")));
    ResumeDecision::Partial(resumed)
}

/// Returns true if every pattern is a literal name and all of them were seen.
fn all_requested_seen(patterns: &[String], seen: &[&str]) -> bool {
    patterns
        .iter()
        .all(|p| is_valid_subtest_name(p) && seen.contains(&p.as_str()))
}
