// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Kernel state the runner keeps an eye on: taint flags, lockdep, the kernel log and the
//! hardware watchdog.

use crate::settings::AbortMask;
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    os::unix::fs::OpenOptionsExt,
    time::Duration,
};
use tracing::{debug, warn};

const TAINT_PATH: &str = "/proc/sys/kernel/tainted";
const LOCKDEP_PATH: &str = "/proc/lockdep_stats";
const KMSG_PATH: &str = "/dev/kmsg";
const WATCHDOG_PATH: &str = "/dev/watchdog";

/// Taint bits that make further results unreliable, with their descriptions.
const BAD_TAINTS: &[(u32, &str)] = &[
    (4, "TAINT_MACHINE_CHECK: processor reported a machine check exception"),
    (5, "TAINT_BAD_PAGE: bad page referenced or unexpected page flags"),
    (7, "TAINT_DIE: kernel died recently (OOPS or BUG)"),
    (9, "TAINT_WARN: kernel issued a warning"),
];

/// Returns the descriptions of the bad taint bits set in `taints`.
pub fn bad_taints(taints: u64) -> Vec<&'static str> {
    BAD_TAINTS
        .iter()
        .filter(|(bit, _)| taints & (1 << bit) != 0)
        .map(|(_, description)| *description)
        .collect()
}

fn read_taints(path: &Utf8Path) -> Option<u64> {
    let contents = std::fs::read_to_string(path)
        .inspect_err(|error| debug!("cannot read {path}: {error}"))
        .ok()?;
    contents.trim().parse().ok()
}

/// Returns true if `/proc/lockdep_stats` contents say lockdep has turned itself off, which it
/// does after reporting a problem.
pub fn lockdep_tripped(stats: &str) -> bool {
    stats.lines().any(|line| {
        line.split_once(':')
            .is_some_and(|(key, value)| key.trim() == "debug_locks" && value.trim() == "0")
    })
}

/// Where the monitored kernel conditions are read from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelMonitor {
    taint_path: Utf8PathBuf,
    lockdep_path: Utf8PathBuf,
}

impl Default for KernelMonitor {
    fn default() -> Self {
        Self::with_paths(TAINT_PATH, LOCKDEP_PATH)
    }
}

impl KernelMonitor {
    /// Reads the taint flags and lockdep statistics from the given files instead of `/proc`.
    pub fn with_paths(
        taint_path: impl Into<Utf8PathBuf>,
        lockdep_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            taint_path: taint_path.into(),
            lockdep_path: lockdep_path.into(),
        }
    }

    /// Checks the monitored kernel conditions in `mask`, returning an abort reason if any of
    /// them is set. Unreadable files count as healthy.
    pub fn check(&self, mask: AbortMask) -> Option<String> {
        let mut reasons = Vec::new();
        if mask.contains(AbortMask::TAINT) {
            if let Some(taints) = read_taints(&self.taint_path) {
                let bad = bad_taints(taints);
                if !bad.is_empty() {
                    reasons.push(format!(
                        "Kernel badly tainted ({taints:#x}):\n{}",
                        bad.join("\n")
                    ));
                }
            }
        }
        if mask.contains(AbortMask::LOCKDEP) {
            if let Ok(stats) = std::fs::read_to_string(&self.lockdep_path) {
                if lockdep_tripped(&stats) {
                    reasons.push("Lockdep not active".to_owned());
                }
            }
        }
        (!reasons.is_empty()).then(|| reasons.join("\n"))
    }
}

/// A record from the kernel log, in the format `/dev/kmsg` returns and `dmesg.txt` stores.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KmsgRecord<'a> {
    /// The log level, 0 (emergency) to 7 (debug).
    pub level: u8,

    /// The record sequence number.
    pub sequence: u64,

    /// Time since boot.
    pub timestamp: Duration,

    /// The message text.
    pub message: &'a str,
}

impl<'a> KmsgRecord<'a> {
    /// Parses a `prefix,seq,usecs,flags;message` record line. Continuation lines (which start
    /// with a space) return `None`.
    pub fn parse(line: &'a str) -> Option<Self> {
        let (header, message) = line.split_once(';')?;
        let mut fields = header.split(',');
        let prefix: u32 = fields.next()?.parse().ok()?;
        let sequence = fields.next()?.parse().ok()?;
        let usecs = fields.next()?.parse().ok()?;
        Some(Self {
            level: (prefix & 7) as u8,
            sequence,
            timestamp: Duration::from_micros(usecs),
            message: message.trim_end(),
        })
    }
}

/// Reads new kernel log records.
#[derive(Debug)]
pub struct KmsgReader {
    file: File,
}

impl KmsgReader {
    /// Opens the kernel log positioned after the newest record, or returns `None` if it isn't
    /// readable.
    pub fn open() -> Option<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(KMSG_PATH)
            .inspect_err(|error| debug!("not capturing kernel log: {error}"))
            .ok()?;
        file.seek(SeekFrom::End(0)).ok()?;
        Some(Self { file })
    }

    /// Copies every record logged since the last call to `out`.
    pub fn drain(&mut self, out: &mut impl Write) -> io::Result<()> {
        // Each read returns exactly one record.
        let mut buf = vec![0u8; 8192];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => out.write_all(&buf[..n])?,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                // The ring buffer overwrote records we hadn't read yet.
                Err(error) if error.raw_os_error() == Some(libc::EPIPE) => {
                    warn!("kernel log records were lost while a test was running");
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// The hardware watchdog, kept alive while the runner makes progress.
#[derive(Debug)]
pub struct Watchdog {
    file: File,
}

impl Watchdog {
    /// Opens the watchdog device. Opening it arms the watchdog.
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(WATCHDOG_PATH)?;
        Ok(Self { file })
    }

    /// Resets the watchdog timer.
    pub fn ping(&mut self) {
        if let Err(error) = self.file.write_all(b"\0").and_then(|()| self.file.flush()) {
            warn!("failed to ping watchdog: {error}");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // The magic close character disarms the watchdog.
        if let Err(error) = self.file.write_all(b"V") {
            warn!("failed to disarm watchdog: {error}");
        }
    }
}
