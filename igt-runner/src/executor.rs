// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running the job list.
//!
//! A run is set up with [`initialize_execute_state`] (a fresh results directory) or
//! [`initialize_execute_state_from_resume`] (an existing one), and then driven by [`execute`],
//! which runs the remaining jobs one at a time. Each job gets a numbered directory holding its
//! journal, captured output, kernel log and, in socket mode, the raw comms stream.

use crate::{
    errors::{ExecuteError, StateReadError, StateWriteError},
    helpers::write_atomic,
    job_list::{JobList, JobListEntry, binary_path},
    monitor::{KernelMonitor, KmsgReader, Watchdog},
    replay::{
        COMMS_FILE_NAME, DMESG_FILE_NAME, ERR_FILE_NAME, JobTermination, JournalLine,
        JournalWriter, OUT_FILE_NAME, ResumeDecision, TerminationKind, replay_job,
        resume_decision,
    },
    reporter::{ReporterEvent, TestReporter},
    settings::{AbortMask, Settings},
    signal::{ShutdownEvent, SignalHandler, SignalHandlerKind},
};
use bytes::BytesMut;
use camino::{Utf8Path, Utf8PathBuf};
use igt_metadata::{
    IgtExitCode, MarkerLine, SENTINEL_ON_STDERR_ENV,
    comms::{LogStream, PacketBody, PacketDecoder, RUNNER_SOCKET_FD_ENV},
    parse_time,
};
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream as StdUnixStream,
        process::ExitStatusExt,
    },
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    net::UnixStream,
    process::Command,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// The kernel and machine description written when real execution starts.
pub const UNAME_FILE_NAME: &str = "uname.txt";

/// The abort reason, written when a run stops early.
pub const ABORTED_FILE_NAME: &str = "aborted.txt";

/// Time between the polite SIGQUIT and the SIGKILL when killing a test.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

const WATCHDOG_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Returns the directory of the job at `index`.
pub fn job_dir(results_path: &Utf8Path, index: usize) -> Utf8PathBuf {
    results_path.join(index.to_string())
}

/// Where a run stands: the next job to execute, and how to run it.
#[derive(Clone, Debug)]
pub struct ExecuteState {
    next: usize,
    dry: bool,
    resumed_entry: Option<JobListEntry>,
}

impl ExecuteState {
    /// The index of the next job to run.
    pub fn next(&self) -> usize {
        self.next
    }

    /// Returns true if this is a dry run.
    pub fn is_dry(&self) -> bool {
        self.dry
    }

    /// The rewritten entry for a partially completed job, if resuming one.
    pub fn resumed_entry(&self) -> Option<&JobListEntry> {
        self.resumed_entry.as_ref()
    }
}

/// How [`execute`] ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecuteOutcome {
    /// Every job ran.
    Completed,

    /// The run stopped early for the given reason.
    Aborted(String),
}

/// Sets up a fresh results directory and writes the settings and job list into it.
pub fn initialize_execute_state(
    settings: &Settings,
    job_list: &JobList,
) -> Result<ExecuteState, ExecuteError> {
    prepare_results_dir(&settings.results_path, settings.overwrite)?;
    settings.write_to_dir(&settings.results_path)?;
    job_list.write_to_dir(&settings.results_path)?;
    info!(
        "initialized {} with {} jobs (timeouts: {})",
        settings.results_path,
        job_list.len(),
        settings.describe_timeouts(),
    );
    Ok(ExecuteState {
        next: 0,
        dry: settings.dry_run,
        resumed_entry: None,
    })
}

fn prepare_results_dir(path: &Utf8Path, overwrite: bool) -> Result<(), ExecuteError> {
    let prepare_err = |error| ExecuteError::PrepareResultsDir {
        path: path.to_owned(),
        error,
    };
    let entries = match path.read_dir_utf8() {
        Ok(entries) => entries.collect::<Result<Vec<_>, _>>().map_err(prepare_err)?,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return std::fs::create_dir_all(path).map_err(prepare_err);
        }
        Err(error) => return Err(prepare_err(error)),
    };
    if entries.is_empty() {
        return Ok(());
    }
    if !overwrite {
        return Err(ExecuteError::ResultsDirNotEmpty {
            path: path.to_owned(),
        });
    }

    debug!("clearing {path}");
    for entry in entries {
        let file_type = entry.file_type().map_err(prepare_err)?;
        let result = if file_type.is_dir() {
            std::fs::remove_dir_all(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        result.map_err(prepare_err)?;
    }
    Ok(())
}

/// Reopens the run in `results_path`, working out where it stopped.
///
/// The highest numbered job directory is replayed. A job that never started is run again, a
/// finished one is skipped, and a partially run one is rewritten to skip the subtests it
/// already got to. Resuming a dry run executes it.
pub fn initialize_execute_state_from_resume(
    results_path: &Utf8Path,
) -> Result<(Settings, JobList, ExecuteState), ExecuteError> {
    let mut settings = Settings::read_from_dir(results_path)?;
    let job_list = JobList::read_from_dir(results_path)?;
    settings.results_path = results_path.to_owned();
    settings.dry_run = false;

    let aborted = results_path.join(ABORTED_FILE_NAME);
    match std::fs::remove_file(&aborted) {
        Ok(()) => debug!("removed {aborted}"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(StateWriteError::new(aborted, error).into()),
    }

    let mut state = ExecuteState {
        next: 0,
        dry: false,
        resumed_entry: None,
    };
    let Some(last) = last_job_index(results_path)? else {
        info!("resuming {results_path} from the start");
        return Ok((settings, job_list, state));
    };
    let Some(entry) = job_list.entries().get(last) else {
        return Err(ExecuteError::NothingToResume {
            path: results_path.to_owned(),
        });
    };

    let replay = replay_job(&job_dir(results_path, last), settings.log_source)?;
    match resume_decision(entry, &replay) {
        ResumeDecision::NotStarted => state.next = last,
        ResumeDecision::Completed => state.next = last + 1,
        ResumeDecision::Partial(resumed) => {
            info!("job {last} stopped part way, resuming it as `{resumed}`");
            state.next = last;
            state.resumed_entry = Some(resumed);
        }
    }
    info!(
        "resuming {results_path} at job {} of {}",
        state.next + 1,
        job_list.len()
    );
    Ok((settings, job_list, state))
}

/// Returns the highest numbered job directory in `results_path`.
pub(crate) fn last_job_index(results_path: &Utf8Path) -> Result<Option<usize>, StateReadError> {
    let read_err = |error| StateReadError::Read {
        path: results_path.to_owned(),
        error,
    };
    let mut last = None;
    for entry in results_path.read_dir_utf8().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let Ok(index) = entry.file_name().parse::<usize>() else {
            continue;
        };
        if entry.file_type().map_err(read_err)?.is_dir() {
            last = last.max(Some(index));
        }
    }
    Ok(last)
}

/// Runs the remaining jobs.
///
/// Returns [`ExecuteOutcome::Aborted`] if the run stopped early: a test asked for it, a
/// monitored kernel condition tripped, the overall timeout expired or the runner was signalled.
/// The reason is also written to `aborted.txt`.
pub fn execute(
    state: &mut ExecuteState,
    settings: &Settings,
    job_list: &JobList,
    reporter: &mut TestReporter<'_>,
    signal_handler: SignalHandlerKind,
) -> Result<ExecuteOutcome, ExecuteError> {
    execute_with_monitor(
        state,
        settings,
        job_list,
        reporter,
        signal_handler,
        &KernelMonitor::default(),
    )
}

/// Like [`execute`], but reads the monitored kernel conditions through `monitor`.
pub fn execute_with_monitor(
    state: &mut ExecuteState,
    settings: &Settings,
    job_list: &JobList,
    reporter: &mut TestReporter<'_>,
    signal_handler: SignalHandlerKind,
    monitor: &KernelMonitor,
) -> Result<ExecuteOutcome, ExecuteError> {
    if state.dry {
        info!("dry run, not executing any tests");
        return Ok(ExecuteOutcome::Completed);
    }
    if !settings.allow_non_root && !nix::unistd::geteuid().is_root() {
        return Err(ExecuteError::NotRoot);
    }
    write_uname(&settings.results_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ExecuteError::Runtime)?;
    runtime.block_on(execute_jobs(
        state,
        settings,
        job_list,
        reporter,
        signal_handler,
        monitor,
    ))
}

async fn execute_jobs(
    state: &mut ExecuteState,
    settings: &Settings,
    job_list: &JobList,
    reporter: &mut TestReporter<'_>,
    signal_handler: SignalHandlerKind,
    monitor: &KernelMonitor,
) -> Result<ExecuteOutcome, ExecuteError> {
    // Signal streams have to be registered from within the runtime.
    let signals = signal_handler.build()?;
    let watchdog = if settings.use_watchdog {
        Watchdog::open()
            .inspect_err(|error| warn!("failed to open watchdog: {error}"))
            .ok()
    } else {
        None
    };
    let mut runner = JobRunner {
        settings,
        job_list,
        reporter,
        signals,
        monitor,
        watchdog,
        overall_deadline: settings.overall_timeout.map(|t| Instant::now() + t),
    };
    runner.run_all(state).await
}

fn write_uname(results_path: &Utf8Path) -> Result<(), ExecuteError> {
    let path = results_path.join(UNAME_FILE_NAME);
    let uname = nix::sys::utsname::uname()
        .map_err(|errno| StateWriteError::new(&path, io::Error::from(errno)))?;
    let text = format!(
        "{} {} {} {}\n",
        uname.sysname().to_string_lossy(),
        uname.release().to_string_lossy(),
        uname.version().to_string_lossy(),
        uname.machine().to_string_lossy(),
    );
    write_atomic(&path, text.as_bytes())?;
    Ok(())
}

struct JobRunner<'a, 'r> {
    settings: &'a Settings,
    job_list: &'a JobList,
    reporter: &'a mut TestReporter<'r>,
    signals: SignalHandler,
    monitor: &'a KernelMonitor,
    watchdog: Option<Watchdog>,
    overall_deadline: Option<Instant>,
}

/// How a single job went.
struct JobResult {
    termination: Option<JobTermination>,
    interrupted: Option<ShutdownEvent>,
    overall_timed_out: bool,
}

impl JobRunner<'_, '_> {
    async fn run_all(&mut self, state: &mut ExecuteState) -> Result<ExecuteOutcome, ExecuteError> {
        let start = Instant::now();
        self.reporter.report_event(&ReporterEvent::RunStarted {
            total: self.job_list.len(),
            first: state.next,
        })?;

        let outcome = self.run_jobs(state).await?;
        if let ExecuteOutcome::Aborted(reason) = &outcome {
            error!("aborting the run: {reason}");
            let path = self.settings.results_path.join(ABORTED_FILE_NAME);
            write_atomic(&path, format!("{reason}\n").as_bytes())?;
        }

        let aborted = match &outcome {
            ExecuteOutcome::Completed => None,
            ExecuteOutcome::Aborted(reason) => Some(reason.as_str()),
        };
        self.reporter.report_event(&ReporterEvent::RunFinished {
            aborted,
            elapsed: start.elapsed(),
        })?;
        Ok(outcome)
    }

    async fn run_jobs(&mut self, state: &mut ExecuteState) -> Result<ExecuteOutcome, ExecuteError> {
        if let Some(reason) = self.monitor.check(self.settings.abort_mask & AbortMask::TAINT) {
            return Ok(ExecuteOutcome::Aborted(reason));
        }

        let job_list = self.job_list;
        let total = job_list.len();
        while let Some(next) = job_list.entries().get(state.next) {
            if self.overall_deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(ExecuteOutcome::Aborted(self.overall_timeout_reason()));
            }

            let index = state.next;
            let entry = state.resumed_entry.take().unwrap_or_else(|| next.clone());
            self.reporter.report_event(&ReporterEvent::JobStarted {
                index,
                total,
                entry: &entry,
            })?;
            let result = self.run_job(index, &entry).await?;
            self.reporter.report_event(&ReporterEvent::JobFinished {
                index,
                total,
                entry: &entry,
                termination: result.termination,
            })?;

            if let Some(event) = result.interrupted {
                return Ok(ExecuteOutcome::Aborted(format!(
                    "interrupted by signal {}",
                    event.signal_name()
                )));
            }
            state.next += 1;

            if result.overall_timed_out {
                return Ok(ExecuteOutcome::Aborted(self.overall_timeout_reason()));
            }
            if result.termination.is_some_and(|t| {
                t.kind == TerminationKind::Exited && t.code == IgtExitCode::ABORT
            }) {
                return Ok(ExecuteOutcome::Aborted(format!(
                    "test binary {} requested abort",
                    entry.binary
                )));
            }
            if let Some(reason) = self.monitor.check(self.settings.abort_mask) {
                return Ok(ExecuteOutcome::Aborted(reason));
            }
        }
        Ok(ExecuteOutcome::Completed)
    }

    fn overall_timeout_reason(&self) -> String {
        format!(
            "overall timeout of {}s exceeded",
            self.settings.overall_timeout.unwrap_or_default().as_secs()
        )
    }

    async fn run_job(
        &mut self,
        index: usize,
        entry: &JobListEntry,
    ) -> Result<JobResult, ExecuteError> {
        let Self {
            settings,
            reporter,
            signals,
            watchdog,
            overall_deadline,
            ..
        } = self;
        let settings: &Settings = settings;

        let dir = job_dir(&settings.results_path, index);
        std::fs::create_dir_all(&dir).map_err(|error| StateWriteError::new(&dir, error))?;
        let mut output = JobOutput::open(&dir, settings)?;
        let mut kmsg = KmsgReader::open();

        let binary = binary_path(settings, entry);
        let mut command = Command::new(&binary);
        command
            .args(entry.args())
            .envs(&settings.env_vars)
            .env(SENTINEL_ON_STDERR_ENV, "1")
            .env_remove(RUNNER_SOCKET_FD_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let socket_pair = if settings.use_socket {
            Some(attach_socket(&mut command).map_err(ExecuteError::Socket)?)
        } else {
            None
        };

        debug!("running {binary} {}", entry.args().join(" "));
        let start = Instant::now();
        let mut child = command.spawn().map_err(|error| ExecuteError::Spawn {
            binary: binary.clone(),
            error,
        })?;
        let child_io_err = |error| ExecuteError::ChildIo {
            binary: binary.clone(),
            error,
        };
        let mut socket = match socket_pair {
            Some((parent, child_end)) => {
                // Only the child (and its own children) should hold this end now.
                drop(child_end);
                Some(UnixStream::from_std(parent).map_err(ExecuteError::Socket)?)
            }
            None => None,
        };
        let pgid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);

        let mut stdout = LineReader::new(child.stdout.take());
        let mut stderr = LineReader::new(child.stderr.take());
        let mut socket_buf = BytesMut::new();
        let mut decoder = PacketDecoder::new();

        let mut status: Option<ExitStatus> = None;
        let mut terminating: Option<Terminating> = None;
        let mut interrupted = None;
        let mut overall_timed_out = false;
        let mut last_activity = start;
        let mut next_ping = watchdog.as_ref().map(|_| start + WATCHDOG_PING_INTERVAL);

        while status.is_none() || !stdout.done || !stderr.done || socket.is_some() {
            let timers = Timers {
                start,
                last_activity,
                next_ping,
                overall_deadline: *overall_deadline,
            };
            let timer = timers.next(settings, status.is_some(), terminating.as_ref());

            tokio::select! {
                line = stdout.next_line(), if !stdout.done => {
                    if let Some(line) = line.map_err(child_io_err)? {
                        last_activity = Instant::now();
                        output.stdout_line(&line, reporter)?;
                    }
                }
                line = stderr.next_line(), if !stderr.done => {
                    if let Some(line) = line.map_err(child_io_err)? {
                        last_activity = Instant::now();
                        output.stderr_line(&line, reporter)?;
                    }
                }
                read = read_socket(&mut socket, &mut socket_buf), if socket.is_some() => {
                    match read {
                        Ok(0) => socket = None,
                        Ok(_) => {
                            last_activity = Instant::now();
                            let data = socket_buf.split();
                            output.comms_bytes(&data)?;
                            decoder.push(&data);
                            while let Some(packet) = decoder.next_packet() {
                                match packet {
                                    Ok(packet) => output.packet(packet.body, reporter)?,
                                    Err(error) => debug!("skipping damaged packet: {error}"),
                                }
                            }
                        }
                        Err(error) => {
                            warn!("error reading from {binary}'s socket: {error}");
                            socket = None;
                        }
                    }
                }
                result = child.wait(), if status.is_none() => {
                    status = Some(result.map_err(child_io_err)?);
                    // Reap anything left in the group so the pipes reach EOF.
                    kill_group(pgid, Signal::SIGKILL);
                }
                event = signals.recv(), if interrupted.is_none() && status.is_none() => {
                    warn!("received {}, killing {binary}", event.signal_name());
                    kill_group(pgid, Signal::SIGKILL);
                    interrupted = Some(event);
                }
                timer = sleep_until(timer) => {
                    match timer {
                        Timer::Timeout { overall } => {
                            let what = if overall { "the overall timeout" } else { "a timeout" };
                            warn!("{binary} stopped after {what}, killing it");
                            output.runner_note(&format!(
                                "igt_runner: killing the test after {what} ({:.3}s)",
                                start.elapsed().as_secs_f64()
                            ))?;
                            overall_timed_out |= overall;
                            kill_group(pgid, Signal::SIGQUIT);
                            terminating = Some(Terminating {
                                kind: TerminationKind::TimedOut,
                                kill_at: Some(Instant::now() + KILL_GRACE_PERIOD),
                            });
                        }
                        Timer::Kill => {
                            debug!("{binary} survived SIGQUIT, sending SIGKILL");
                            kill_group(pgid, Signal::SIGKILL);
                            if let Some(terminating) = &mut terminating {
                                terminating.kill_at = None;
                            }
                        }
                        Timer::Ping => {
                            if let Some(watchdog) = watchdog.as_mut() {
                                watchdog.ping();
                            }
                            next_ping = Some(Instant::now() + WATCHDOG_PING_INTERVAL);
                        }
                    }
                }
            }

            if terminating.is_none()
                && status.is_none()
                && settings
                    .disk_usage_limit
                    .is_some_and(|limit| output.written > limit)
            {
                warn!("{binary} exceeded the disk usage limit, killing it");
                output.runner_note(&format!(
                    "igt_runner: disk usage limit of {} bytes exceeded, killing the test",
                    settings.disk_usage_limit.unwrap_or_default()
                ))?;
                kill_group(pgid, Signal::SIGKILL);
                terminating = Some(Terminating {
                    kind: TerminationKind::DiskLimit,
                    kill_at: None,
                });
            }
        }

        let code = status.map_or(-1, exit_code);
        let termination = interrupted.is_none().then(|| JobTermination {
            kind: terminating.map_or(TerminationKind::Exited, |t| t.kind),
            code,
            time: start.elapsed(),
        });
        if let Some(termination) = &termination {
            output.journal_line(&JournalLine::End(*termination))?;
        }
        if let Some(kmsg) = &mut kmsg {
            kmsg.drain(&mut output.dmesg)
                .map_err(|error| StateWriteError::new(dir.join(DMESG_FILE_NAME), error))?;
        }
        if settings.sync {
            output.sync()?;
        }

        Ok(JobResult {
            termination,
            interrupted,
            overall_timed_out,
        })
    }
}

/// A kill in progress.
#[derive(Copy, Clone, Debug)]
struct Terminating {
    kind: TerminationKind,
    /// When to escalate to SIGKILL, if not yet sent.
    kill_at: Option<Instant>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Timer {
    Timeout { overall: bool },
    Kill,
    Ping,
}

struct Timers {
    start: Instant,
    last_activity: Instant,
    next_ping: Option<Instant>,
    overall_deadline: Option<Instant>,
}

impl Timers {
    /// Returns the earliest timer that is still relevant.
    fn next(
        &self,
        settings: &Settings,
        exited: bool,
        terminating: Option<&Terminating>,
    ) -> Option<(Instant, Timer)> {
        let mut timers = Vec::new();
        match terminating {
            Some(terminating) => {
                if let Some(kill_at) = terminating.kill_at {
                    timers.push((kill_at, Timer::Kill));
                }
            }
            None if !exited => {
                let timeout = Timer::Timeout { overall: false };
                if let Some(t) = settings.per_test_timeout {
                    timers.push((self.start + t, timeout));
                }
                if let Some(t) = settings.inactivity_timeout {
                    timers.push((self.last_activity + t, timeout));
                }
                if let Some(deadline) = self.overall_deadline {
                    timers.push((deadline, Timer::Timeout { overall: true }));
                }
            }
            None => {}
        }
        if let Some(ping) = self.next_ping {
            timers.push((ping, Timer::Ping));
        }
        timers.into_iter().min_by_key(|(deadline, _)| *deadline)
    }
}

/// Waits for `timer` to fire and returns it. Never resolves if there is no timer.
async fn sleep_until(timer: Option<(Instant, Timer)>) -> Timer {
    match timer {
        Some((deadline, timer)) => {
            tokio::time::sleep_until(deadline).await;
            timer
        }
        None => std::future::pending().await,
    }
}

async fn read_socket(socket: &mut Option<UnixStream>, buf: &mut BytesMut) -> io::Result<usize> {
    match socket {
        Some(socket) => {
            buf.reserve(8192);
            socket.read_buf(buf).await
        }
        None => std::future::pending().await,
    }
}

fn kill_group(pgid: Option<Pid>, signal: Signal) {
    if let Some(pgid) = pgid {
        // ESRCH just means everything is gone already.
        if let Err(errno) = killpg(pgid, signal) {
            debug!("killpg({pgid}, {signal}): {errno}");
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => IgtExitCode::for_signal(signal),
        (None, None) => -1,
    }
}

/// Creates the socket pair for structured communication and arranges for the child's end to
/// survive `exec`.
fn attach_socket(command: &mut Command) -> io::Result<(StdUnixStream, StdUnixStream)> {
    let (parent, child) = StdUnixStream::pair()?;
    parent.set_nonblocking(true)?;
    let fd = child.as_raw_fd();
    command.env(RUNNER_SOCKET_FD_ENV, fd.to_string());
    // SAFETY: the closure only calls fcntl, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || clear_cloexec(fd));
    }
    Ok((parent, child))
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a valid descriptor with integer arguments.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads lines from a child pipe. Lines are kept with their newline, and bytes that aren't
/// UTF-8 are replaced.
struct LineReader<R> {
    reader: Option<BufReader<R>>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: Option<R>) -> Self {
        Self {
            done: reader.is_none(),
            reader: reader.map(BufReader::new),
            buf: Vec::new(),
        }
    }

    /// Returns the next line, or `None` at EOF. Cancel-safe: a partial line stays buffered.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let Some(reader) = &mut self.reader else {
            self.done = true;
            return Ok(None);
        };
        let n = reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            self.done = true;
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// The files a job writes, and the journal driven by what the child reports.
struct JobOutput {
    dir: Utf8PathBuf,
    out: File,
    err: File,
    dmesg: File,
    comms: Option<File>,
    journal: JournalWriter,
    sync: bool,
    current_subtest: Option<String>,
    written: u64,
}

impl JobOutput {
    fn open(dir: &Utf8Path, settings: &Settings) -> Result<Self, ExecuteError> {
        let open = |name: &str| {
            let path = dir.join(name);
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|error| StateWriteError::new(path, error))
        };
        let journal = JournalWriter::open(dir, settings.sync).map_err(|error| {
            StateWriteError::new(dir.join(crate::replay::JOURNAL_FILE_NAME), error)
        })?;
        Ok(Self {
            dir: dir.to_owned(),
            out: open(OUT_FILE_NAME)?,
            err: open(ERR_FILE_NAME)?,
            dmesg: open(DMESG_FILE_NAME)?,
            comms: settings
                .use_socket
                .then(|| open(COMMS_FILE_NAME))
                .transpose()?,
            journal,
            sync: settings.sync,
            current_subtest: None,
            written: 0,
        })
    }

    fn write(&mut self, stream: LogStream, text: &str) -> Result<(), StateWriteError> {
        let (file, name) = match stream {
            LogStream::Stdout => (&mut self.out, OUT_FILE_NAME),
            LogStream::Stderr => (&mut self.err, ERR_FILE_NAME),
        };
        let mut result = file.write_all(text.as_bytes());
        if !text.ends_with('\n') {
            result = result.and_then(|()| file.write_all(b"\n"));
        }
        result.map_err(|error| StateWriteError::new(self.dir.join(name), error))?;
        self.written += text.len() as u64;
        Ok(())
    }

    fn stdout_line(&mut self, line: &str, reporter: &mut TestReporter<'_>) -> Result<(), ExecuteError> {
        self.write(LogStream::Stdout, line)?;
        if let Some(marker) = MarkerLine::parse(line) {
            self.journal_marker(&marker)?;
        }
        reporter.report_event(&ReporterEvent::JobOutput {
            stream: LogStream::Stdout,
            text: line,
        })?;
        Ok(())
    }

    fn stderr_line(&mut self, line: &str, reporter: &mut TestReporter<'_>) -> Result<(), ExecuteError> {
        self.write(LogStream::Stderr, line)?;
        reporter.report_event(&ReporterEvent::JobOutput {
            stream: LogStream::Stderr,
            text: line,
        })?;
        Ok(())
    }

    fn comms_bytes(&mut self, data: &[u8]) -> Result<(), StateWriteError> {
        if let Some(comms) = &mut self.comms {
            comms
                .write_all(data)
                .map_err(|error| StateWriteError::new(self.dir.join(COMMS_FILE_NAME), error))?;
        }
        Ok(())
    }

    /// Handles a packet: output is written to the matching file, and progress packets are
    /// turned back into the marker lines a terminal run would have printed.
    fn packet(
        &mut self,
        body: PacketBody<'static>,
        reporter: &mut TestReporter<'_>,
    ) -> Result<(), ExecuteError> {
        let marker = match body {
            PacketBody::Log { stream, text } => {
                self.write(stream, &text)?;
                reporter.report_event(&ReporterEvent::JobOutput { stream, text: &text })?;
                return Ok(());
            }
            PacketBody::VersionString { text } => {
                self.write(LogStream::Stdout, &text)?;
                return Ok(());
            }
            PacketBody::Exec { command_line } => {
                debug!("test binary started as `{command_line}`");
                return Ok(());
            }
            PacketBody::Exit { code, timeused } => {
                debug!("test binary reported exit code {code} after {timeused}s");
                return Ok(());
            }
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
            } => match (result.parse(), parse_time(&timeused)) {
                (Ok(outcome), Some(time)) => MarkerLine::SubtestResult {
                    name: name.into_owned(),
                    outcome,
                    time,
                },
                _ => {
                    debug!("ignoring malformed result packet for {name}");
                    return Ok(());
                }
            },
            PacketBody::DynamicSubtestResult {
                name,
                result,
                timeused,
                ..
            } => match (result.parse(), parse_time(&timeused)) {
                (Ok(outcome), Some(time)) => MarkerLine::DynamicSubtestResult {
                    name: name.into_owned(),
                    outcome,
                    time,
                },
                _ => {
                    debug!("ignoring malformed result packet for {name}");
                    return Ok(());
                }
            },
        };

        let text = marker.to_string();
        self.write(LogStream::Stdout, &text)?;
        self.write(LogStream::Stderr, &text)?;
        self.journal_marker(&marker)?;
        reporter.report_event(&ReporterEvent::JobOutput {
            stream: LogStream::Stdout,
            text: &text,
        })?;
        Ok(())
    }

    fn journal_marker(&mut self, marker: &MarkerLine) -> Result<(), StateWriteError> {
        match marker {
            MarkerLine::SubtestStart { name } => {
                self.current_subtest = Some(name.clone());
                self.journal_line(&JournalLine::Subtest(name.clone()))
            }
            MarkerLine::DynamicSubtestStart { name } => match &self.current_subtest {
                Some(subtest) => {
                    let line = JournalLine::Dynamic {
                        subtest: subtest.clone(),
                        name: name.clone(),
                    };
                    self.journal_line(&line)
                }
                None => Ok(()),
            },
            MarkerLine::SubtestResult { .. } => {
                self.current_subtest = None;
                Ok(())
            }
            MarkerLine::DynamicSubtestResult { .. } | MarkerLine::PlainResult { .. } => Ok(()),
        }
    }

    fn journal_line(&mut self, line: &JournalLine) -> Result<(), StateWriteError> {
        self.journal.write_line(line).map_err(|error| {
            StateWriteError::new(self.dir.join(crate::replay::JOURNAL_FILE_NAME), error)
        })
    }

    /// Records something the runner did to the test in `err.txt`.
    fn runner_note(&mut self, note: &str) -> Result<(), StateWriteError> {
        self.write(LogStream::Stderr, note)
    }

    fn sync(&mut self) -> Result<(), StateWriteError> {
        for (file, name) in [
            (&self.out, OUT_FILE_NAME),
            (&self.err, ERR_FILE_NAME),
            (&self.dmesg, DMESG_FILE_NAME),
        ] {
            file.sync_all()
                .map_err(|error| StateWriteError::new(self.dir.join(name), error))?;
        }
        if let Some(comms) = &self.comms {
            comms
                .sync_all()
                .map_err(|error| StateWriteError::new(self.dir.join(COMMS_FILE_NAME), error))?;
        }
        Ok(())
    }
}
