// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints progress while jobs run.
//!
//! The main structure in this module is [`TestReporter`].

use crate::{
    errors::WriteEventError,
    job_list::JobListEntry,
    replay::{JobTermination, TerminationKind},
    settings::LogLevel,
};
use debug_ignore::DebugIgnore;
use igt_metadata::{DisplayTime, IgtExitCode, comms::LogStream};
use owo_colors::{OwoColorize, Style};
use std::{
    io::{self, Write},
    time::Duration,
};

/// Something that happened during a run, worth telling the user about.
#[derive(Clone, Debug)]
pub enum ReporterEvent<'a> {
    /// The run is starting at `first`.
    RunStarted {
        /// The number of jobs in the job list.
        total: usize,
        /// The index of the first job to run. Nonzero when resuming.
        first: usize,
    },

    /// A job is starting.
    JobStarted {
        /// The job's index.
        index: usize,
        /// The number of jobs in the job list.
        total: usize,
        /// The job being run.
        entry: &'a JobListEntry,
    },

    /// A test binary wrote a line of output.
    JobOutput {
        /// The stream it was written to.
        stream: LogStream,
        /// The text, including any trailing newline.
        text: &'a str,
    },

    /// A job ended.
    JobFinished {
        /// The job's index.
        index: usize,
        /// The number of jobs in the job list.
        total: usize,
        /// The job that ran.
        entry: &'a JobListEntry,
        /// How it ended, or `None` if the runner was interrupted.
        termination: Option<JobTermination>,
    },

    /// The run ended.
    RunFinished {
        /// The abort reason, if the run was aborted.
        aborted: Option<&'a str>,
        /// Total time spent.
        elapsed: Duration,
    },
}

/// Where the reporter writes to.
pub enum ReporterOutput<'a> {
    /// Standard error.
    Terminal,

    /// An in-memory buffer, used for testing.
    Buffer(&'a mut Vec<u8>),
}

/// Test reporter builder.
#[derive(Debug, Default)]
pub struct TestReporterBuilder {
    colorize: bool,
    log_level: Option<LogLevel>,
}

impl TestReporterBuilder {
    /// Colorizes output.
    pub fn set_colorize(&mut self, colorize: bool) -> &mut Self {
        self.colorize = colorize;
        self
    }

    /// Sets how much to print.
    pub fn set_log_level(&mut self, log_level: LogLevel) -> &mut Self {
        self.log_level = Some(log_level);
        self
    }

    /// Creates a new test reporter.
    pub fn build<'a>(&self, output: ReporterOutput<'a>) -> TestReporter<'a> {
        let mut styles = Styles::default();
        if self.colorize {
            styles.colorize();
        }
        TestReporter {
            styles,
            log_level: self.log_level.unwrap_or(LogLevel::Normal),
            output: DebugIgnore(output),
        }
    }
}

/// Functionality to report job progress to the terminal.
#[derive(Debug)]
pub struct TestReporter<'a> {
    styles: Styles,
    log_level: LogLevel,
    output: DebugIgnore<ReporterOutput<'a>>,
}

impl TestReporter<'_> {
    /// Reports an event.
    pub fn report_event(&mut self, event: &ReporterEvent<'_>) -> Result<(), WriteEventError> {
        if self.log_level == LogLevel::Quiet {
            return Ok(());
        }
        let mut buf = Vec::new();
        self.write_event(event, &mut buf)?;
        match &mut *self.output {
            ReporterOutput::Terminal => {
                let mut stderr = io::stderr().lock();
                stderr.write_all(&buf)?;
                stderr.flush()?;
            }
            ReporterOutput::Buffer(out) => out.extend_from_slice(&buf),
        }
        Ok(())
    }

    fn write_event(&self, event: &ReporterEvent<'_>, writer: &mut dyn Write) -> io::Result<()> {
        match event {
            ReporterEvent::RunStarted { total, first } => {
                if *first > 0 {
                    writeln!(
                        writer,
                        "{:>12} at job {} of {}",
                        "Resuming".style(self.styles.pass),
                        (first + 1).style(self.styles.count),
                        total.style(self.styles.count),
                    )?;
                } else {
                    writeln!(
                        writer,
                        "{:>12} {} {}",
                        "Starting".style(self.styles.pass),
                        total.style(self.styles.count),
                        if *total == 1 { "job" } else { "jobs" },
                    )?;
                }
            }
            ReporterEvent::JobStarted {
                index,
                total,
                entry,
            } => {
                self.write_counter(*index, *total, writer)?;
                self.write_entry(entry, writer)?;
                writeln!(writer)?;
            }
            ReporterEvent::JobOutput { text, .. } => {
                if self.log_level == LogLevel::Verbose {
                    writer.write_all(text.as_bytes())?;
                    if !text.ends_with('\n') {
                        writeln!(writer)?;
                    }
                }
            }
            ReporterEvent::JobFinished {
                index,
                total,
                entry,
                termination,
            } => {
                self.write_counter(*index, *total, writer)?;
                self.write_entry(entry, writer)?;
                match termination {
                    Some(termination) => {
                        let (word, style) = self.status(termination);
                        writeln!(
                            writer,
                            ": {} ({}, exit {})",
                            word.style(style),
                            DisplayTime(termination.time),
                            termination.code,
                        )?;
                    }
                    None => writeln!(writer, ": {}", "interrupted".style(self.styles.fail))?,
                }
            }
            ReporterEvent::RunFinished { aborted, elapsed } => match aborted {
                Some(reason) => {
                    writeln!(
                        writer,
                        "{:>12} after {}: {reason}",
                        "Aborted".style(self.styles.fail),
                        DisplayTime(*elapsed),
                    )?;
                }
                None => {
                    writeln!(
                        writer,
                        "{:>12} in {}",
                        "Done".style(self.styles.pass),
                        DisplayTime(*elapsed),
                    )?;
                }
            },
        }
        Ok(())
    }

    fn write_counter(&self, index: usize, total: usize, writer: &mut dyn Write) -> io::Result<()> {
        let width = total.to_string().len().max(3);
        write!(
            writer,
            "[{:0width$}/{:0width$}] ",
            (index + 1).style(self.styles.count),
            total.style(self.styles.count),
        )
    }

    fn write_entry(&self, entry: &JobListEntry, writer: &mut dyn Write) -> io::Result<()> {
        write!(writer, "{}", entry.binary.style(self.styles.binary))?;
        if !entry.subtests.is_empty() {
            write!(writer, " ({}", entry.subtests.join(","))?;
            if !entry.dynamic_subtests.is_empty() {
                write!(writer, " / {}", entry.dynamic_subtests.join(","))?;
            }
            write!(writer, ")")?;
        }
        Ok(())
    }

    fn status(&self, termination: &JobTermination) -> (&'static str, Style) {
        match termination.kind {
            TerminationKind::TimedOut => ("timeout", self.styles.fail),
            TerminationKind::DiskLimit => ("disk limit", self.styles.fail),
            TerminationKind::Exited => match termination.code {
                IgtExitCode::SUCCESS => ("pass", self.styles.pass),
                IgtExitCode::SKIP => ("skip", self.styles.skip),
                IgtExitCode::ABORT => ("abort", self.styles.fail),
                code if IgtExitCode::signal_of(code).is_some() => ("crash", self.styles.fail),
                _ => ("fail", self.styles.fail),
            },
        }
    }
}

#[derive(Debug, Default)]
struct Styles {
    count: Style,
    binary: Style,
    pass: Style,
    skip: Style,
    fail: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.binary = Style::new().blue().bold();
        self.pass = Style::new().green().bold();
        self.skip = Style::new().yellow().bold();
        self.fail = Style::new().red().bold();
    }
}
