// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test binary's end of the runner socket.

use crate::sigsafe;
use igt_metadata::comms::{PacketBody, RUNNER_SOCKET_FD_ENV};
use std::{
    os::fd::RawFd,
    sync::atomic::{AtomicI32, Ordering},
};

/// The connected socket, or -1. Read from signal handlers.
static COMMS_FD: AtomicI32 = AtomicI32::new(-1);

/// A handle to the runner socket.
#[derive(Debug)]
pub(crate) struct CommsClient {
    fd: RawFd,
}

impl CommsClient {
    /// Connects to the socket named by `IGT_RUNNER_SOCKET_FD`, if set and valid.
    pub(crate) fn from_env() -> Option<Self> {
        let value = std::env::var(RUNNER_SOCKET_FD_ENV).ok()?;
        let fd: RawFd = match value.trim().parse() {
            Ok(fd) if fd >= 0 => fd,
            _ => {
                tracing::warn!(
                    target: "igt_core::comms",
                    "ignoring invalid {RUNNER_SOCKET_FD_ENV}={value:?}"
                );
                return None;
            }
        };
        // SAFETY: F_GETFD only queries the descriptor.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            tracing::warn!(
                target: "igt_core::comms",
                "{RUNNER_SOCKET_FD_ENV}={fd} is not an open file descriptor"
            );
            return None;
        }
        COMMS_FD.store(fd, Ordering::Release);
        Some(Self { fd })
    }

    pub(crate) fn send(&self, body: &PacketBody<'_>) {
        sigsafe::write_all(self.fd, &body.encode(std::process::id()));
    }
}

/// Returns the connected comms fd, if any. Async-signal-safe.
pub(crate) fn connected_fd() -> Option<RawFd> {
    let fd = COMMS_FD.load(Ordering::Acquire);
    (fd >= 0).then_some(fd)
}

/// Sends a packet without allocating. Returns false if not connected or the packet is too
/// large for the stack buffer. Async-signal-safe.
pub(crate) fn send_sigsafe(body: &PacketBody<'_>) -> bool {
    const BUF_SIZE: usize = 1024;

    let Some(fd) = connected_fd() else {
        return false;
    };
    if body.encoded_len() > BUF_SIZE {
        return false;
    }
    let mut storage = [0u8; BUF_SIZE];
    let len = body.encoded_len();
    let mut slice = &mut storage[..];
    // SAFETY: getpid is async-signal-safe.
    let pid = unsafe { libc::getpid() } as u32;
    body.encode_into(pid, &mut slice);
    sigsafe::write_all(fd, &storage[..len]);
    true
}
