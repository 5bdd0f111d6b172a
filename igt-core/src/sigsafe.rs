// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Primitives that are safe to call from a signal handler.
//!
//! Nothing in this module allocates, takes a lock or goes through buffered I/O. Output is
//! assembled in a fixed-size stack buffer and handed to `write(2)` directly.

use std::{
    os::fd::RawFd,
    sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
};

/// A fixed-capacity line assembler that writes with `write(2)`.
///
/// Output that doesn't fit is truncated.
pub(crate) struct SigsafeWriter<const N: usize = 512> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> SigsafeWriter<N> {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        let n = bytes.len().min(N - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        self
    }

    pub(crate) fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_bytes(s.as_bytes())
    }

    pub(crate) fn push_u64(&mut self, mut value: u64) -> &mut Self {
        let mut digits = [0u8; 20];
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (value % 10) as u8;
            value /= 10;
            if value == 0 {
                break;
            }
        }
        self.push_bytes(&digits[i..])
    }

    pub(crate) fn push_i64(&mut self, value: i64) -> &mut Self {
        if value < 0 {
            self.push_str("-");
        }
        self.push_u64(value.unsigned_abs())
    }

    /// Pushes a nanosecond count as seconds with three decimals, e.g. `1.234`.
    pub(crate) fn push_secs(&mut self, nanos: u64) -> &mut Self {
        let millis = nanos / 1_000_000;
        self.push_u64(millis / 1000);
        self.push_str(".");
        let frac = millis % 1000;
        if frac < 100 {
            self.push_str("0");
        }
        if frac < 10 {
            self.push_str("0");
        }
        self.push_u64(frac)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The buffer contents as a string. Truncation may split a UTF-8 sequence, in which case the
    /// valid prefix is returned.
    pub(crate) fn as_str(&self) -> &str {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(error) => {
                // SAFETY: valid_up_to() marks the end of a valid UTF-8 prefix.
                unsafe { std::str::from_utf8_unchecked(&self.buf[..error.valid_up_to()]) }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.len = 0;
    }

    /// Writes the buffer to `fd` and clears it.
    pub(crate) fn flush_to(&mut self, fd: RawFd) {
        write_all(fd, self.as_bytes());
        self.clear();
    }
}

/// Writes all of `bytes` to `fd`, retrying on `EINTR`. Errors are ignored.
pub(crate) fn write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: write(2) is async-signal-safe and `bytes` is a valid buffer.
        let ret = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if ret < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        if ret == 0 {
            return;
        }
        bytes = &bytes[ret as usize..];
    }
}

/// Returns the monotonic clock in nanoseconds.
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime is async-signal-safe and `ts` is a valid out pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

const NAME_CAPACITY: usize = 128;

/// A name plus start time, written from normal context and read from a signal handler.
///
/// The length is published last with release ordering, and cleared first, so a reader never
/// sees a length longer than the bytes written for it.
pub(crate) struct NameSlot {
    bytes: [AtomicU8; NAME_CAPACITY],
    len: AtomicUsize,
    start_ns: AtomicU64,
}

impl NameSlot {
    pub(crate) const fn new() -> Self {
        Self {
            bytes: [const { AtomicU8::new(0) }; NAME_CAPACITY],
            len: AtomicUsize::new(0),
            start_ns: AtomicU64::new(0),
        }
    }

    pub(crate) fn set(&self, name: &str, start_ns: u64) {
        self.len.store(0, Ordering::Release);
        let bytes = &name.as_bytes()[..name.len().min(NAME_CAPACITY)];
        for (slot, &b) in self.bytes.iter().zip(bytes) {
            slot.store(b, Ordering::Relaxed);
        }
        self.start_ns.store(start_ns, Ordering::Relaxed);
        self.len.store(bytes.len(), Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.len.store(0, Ordering::Release);
    }

    /// Copies the name into `out`, returning the number of bytes copied and the start time.
    /// Returns `None` if the slot is empty.
    pub(crate) fn read(&self, out: &mut [u8; NAME_CAPACITY]) -> Option<(usize, u64)> {
        let len = self.len.load(Ordering::Acquire);
        if len == 0 {
            return None;
        }
        for (dst, src) in out.iter_mut().zip(&self.bytes[..len]) {
            *dst = src.load(Ordering::Relaxed);
        }
        Some((len, self.start_ns.load(Ordering::Relaxed)))
    }
}

/// Buffer type for [`NameSlot::read`].
pub(crate) type NameBuf = [u8; NAME_CAPACITY];

/// The subtest currently running in this process, for the crash handler.
pub(crate) static CURRENT_SUBTEST: NameSlot = NameSlot::new();

/// The dynamic subtest currently running in this process, for the crash handler.
pub(crate) static CURRENT_DYNAMIC: NameSlot = NameSlot::new();

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, "0.000"; "zero")]
    #[test_case(1_234_000_000, "1.234"; "millis")]
    #[test_case(5_000_000, "0.005"; "leading zeros")]
    #[test_case(61_050_999_999, "61.050"; "truncates")]
    fn format_secs(nanos: u64, expected: &str) {
        let mut w = SigsafeWriter::<32>::new();
        w.push_secs(nanos);
        assert_eq!(w.as_str(), expected);
    }

    #[test]
    fn integers_and_truncation() {
        let mut w = SigsafeWriter::<16>::new();
        w.push_str("sig ").push_i64(-11).push_str(" ").push_u64(u64::MAX);
        assert_eq!(w.as_str(), "sig -11 18446744");
    }

    #[test]
    fn name_slot() {
        let slot = NameSlot::new();
        let mut buf: NameBuf = [0; NAME_CAPACITY];
        assert_eq!(slot.read(&mut buf), None);
        slot.set("b-subtest", 42);
        let (len, start) = slot.read(&mut buf).expect("slot is set");
        assert_eq!(&buf[..len], b"b-subtest");
        assert_eq!(start, 42);
        slot.clear();
        assert_eq!(slot.read(&mut buf), None);
    }
}
