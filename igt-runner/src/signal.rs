// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopping a run when the runner itself is signalled.
//!
//! SIGINT, SIGTERM and SIGHUP kill the running job's process group and abort the run with
//! `interrupted by signal <name>`. The interrupted job gets no termination line in its journal,
//! so `igt_resume` runs it again.

use crate::errors::SignalHandlerSetupError;
use std::{future::poll_fn, task::Poll};
use tokio::signal::unix::{Signal, SignalKind, signal};

/// Whether [`execute`](crate::executor::execute) listens for interrupting signals.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// Abort the run on SIGINT, SIGTERM or SIGHUP.
    Standard,

    /// Leave signal dispositions alone, for runs embedded in other programs such as tests.
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(self) -> Result<SignalHandler, SignalHandlerSetupError> {
        let streams: Vec<(ShutdownEvent, Signal)> = match self {
            Self::Standard => ShutdownEvent::ALL
                .into_iter()
                .map(|event| signal(event.kind()).map(|stream| (event, stream)))
                .collect::<std::io::Result<_>>()?,
            Self::Noop => Vec::new(),
        };
        Ok(SignalHandler { streams })
    }
}

/// The registered signal streams. Must be built inside a tokio runtime.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    streams: Vec<(ShutdownEvent, Signal)>,
}

impl SignalHandler {
    /// Waits for the next interrupting signal. Never resolves if nothing is registered.
    pub(crate) async fn recv(&mut self) -> ShutdownEvent {
        poll_fn(|cx| {
            for (event, stream) in &mut self.streams {
                // A closed stream stays pending; the others still wake us.
                if let Poll::Ready(Some(())) = stream.poll_recv(cx) {
                    return Poll::Ready(*event);
                }
            }
            Poll::Pending
        })
        .await
    }
}

/// A signal that aborts the run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ShutdownEvent {
    Hangup,
    Term,
    Interrupt,
}

impl ShutdownEvent {
    const ALL: [Self; 3] = [Self::Interrupt, Self::Term, Self::Hangup];

    fn kind(self) -> SignalKind {
        match self {
            Self::Hangup => SignalKind::hangup(),
            Self::Term => SignalKind::terminate(),
            Self::Interrupt => SignalKind::interrupt(),
        }
    }

    /// The name used in the abort reason.
    pub(crate) fn signal_name(self) -> &'static str {
        match self {
            Self::Hangup => "SIGHUP",
            Self::Term => "SIGTERM",
            Self::Interrupt => "SIGINT",
        }
    }
}
