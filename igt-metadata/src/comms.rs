// Copyright (c) The igt-runner Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The comms packet stream between a test binary and the runner.
//!
//! Every packet starts with a 16-byte header:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | magic, `IGTC` |
//! | 4 | 4 | total packet size including the header, little-endian |
//! | 8 | 4 | packet kind, little-endian |
//! | 12 | 4 | sender pid, little-endian |
//!
//! followed by the kind-specific payload. Strings are a little-endian `u32` byte length
//! followed by UTF-8 bytes. The magic lets a reader resynchronize after garbage or a torn
//! write: anything that doesn't start with the magic is skipped.

use crate::errors::DecodeError;
use bytes::{Buf, BufMut, BytesMut};
use std::borrow::Cow;

/// The environment variable through which the runner passes its socket fd to a test binary.
pub const RUNNER_SOCKET_FD_ENV: &str = "IGT_RUNNER_SOCKET_FD";

/// The sentinel at the start of every packet.
pub const MAGIC: [u8; 4] = *b"IGTC";

/// The size of the packet header.
pub const HEADER_SIZE: usize = 16;

/// The largest packet a reader accepts.
pub const MAX_PACKET_SIZE: usize = 1 << 20;

/// Which output stream a log packet belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl LogStream {
    fn to_u32(self) -> u32 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

mod kind {
    pub(super) const LOG: u32 = 1;
    pub(super) const EXEC: u32 = 2;
    pub(super) const EXIT: u32 = 3;
    pub(super) const SUBTEST_START: u32 = 4;
    pub(super) const SUBTEST_RESULT: u32 = 5;
    pub(super) const DYNAMIC_SUBTEST_START: u32 = 6;
    pub(super) const DYNAMIC_SUBTEST_RESULT: u32 = 7;
    pub(super) const VERSION_STRING: u32 = 8;
}

/// The payload of a comms packet.
///
/// Timings are carried as decimal seconds strings (for example `0.125`) and results as the
/// marker words (`SUCCESS`, `SKIP`, `FAIL`, `CRASH`), so a packet carries exactly what the
/// equivalent marker line would.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketBody<'a> {
    /// A line of output that would otherwise have gone to a terminal stream.
    Log {
        /// The stream the line belongs to.
        stream: LogStream,
        /// The text, including any trailing newline.
        text: Cow<'a, str>,
    },

    /// The command line the binary was started with.
    Exec {
        /// The command line, space-separated.
        command_line: Cow<'a, str>,
    },

    /// The process is about to exit.
    Exit {
        /// The exit code.
        code: i32,
        /// Total time since start.
        timeused: Cow<'a, str>,
    },

    /// A subtest started.
    SubtestStart {
        /// The subtest name.
        name: Cow<'a, str>,
    },

    /// A subtest finished.
    SubtestResult {
        /// The subtest name.
        name: Cow<'a, str>,
        /// The result word.
        result: Cow<'a, str>,
        /// Time spent in the subtest.
        timeused: Cow<'a, str>,
        /// A free-form reason, possibly empty.
        reason: Cow<'a, str>,
    },

    /// A dynamic subtest started.
    DynamicSubtestStart {
        /// The dynamic subtest name.
        name: Cow<'a, str>,
    },

    /// A dynamic subtest finished.
    DynamicSubtestResult {
        /// The dynamic subtest name.
        name: Cow<'a, str>,
        /// The result word.
        result: Cow<'a, str>,
        /// Time spent in the dynamic subtest.
        timeused: Cow<'a, str>,
        /// A free-form reason, possibly empty.
        reason: Cow<'a, str>,
    },

    /// The version line.
    VersionString {
        /// The version text.
        text: Cow<'a, str>,
    },
}

impl PacketBody<'_> {
    fn kind(&self) -> u32 {
        match self {
            Self::Log { .. } => kind::LOG,
            Self::Exec { .. } => kind::EXEC,
            Self::Exit { .. } => kind::EXIT,
            Self::SubtestStart { .. } => kind::SUBTEST_START,
            Self::SubtestResult { .. } => kind::SUBTEST_RESULT,
            Self::DynamicSubtestStart { .. } => kind::DYNAMIC_SUBTEST_START,
            Self::DynamicSubtestResult { .. } => kind::DYNAMIC_SUBTEST_RESULT,
            Self::VersionString { .. } => kind::VERSION_STRING,
        }
    }

    fn payload_len(&self) -> usize {
        fn s(text: &str) -> usize {
            4 + text.len()
        }
        match self {
            Self::Log { text, .. } => 4 + s(text),
            Self::Exec { command_line } => s(command_line),
            Self::Exit { timeused, .. } => 4 + s(timeused),
            Self::SubtestStart { name } | Self::DynamicSubtestStart { name } => s(name),
            Self::SubtestResult {
                name,
                result,
                timeused,
                reason,
            }
            | Self::DynamicSubtestResult {
                name,
                result,
                timeused,
                reason,
            } => s(name) + s(result) + s(timeused) + s(reason),
            Self::VersionString { text } => s(text),
        }
    }

    /// Returns the number of bytes [`encode_into`](Self::encode_into) writes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Encodes this packet, with the given sender pid, into `buf`.
    ///
    /// This doesn't allocate, so it can be used with a `&mut [u8]` on a stack buffer. The
    /// buffer must have at least [`encoded_len`](Self::encoded_len) bytes of room.
    pub fn encode_into<B: BufMut>(&self, sender_pid: u32, buf: &mut B) {
        fn put_str<B: BufMut>(buf: &mut B, text: &str) {
            buf.put_u32_le(text.len() as u32);
            buf.put_slice(text.as_bytes());
        }

        buf.put_slice(&MAGIC);
        buf.put_u32_le(self.encoded_len() as u32);
        buf.put_u32_le(self.kind());
        buf.put_u32_le(sender_pid);

        match self {
            Self::Log { stream, text } => {
                buf.put_u32_le(stream.to_u32());
                put_str(buf, text);
            }
            Self::Exec { command_line } => put_str(buf, command_line),
            Self::Exit { code, timeused } => {
                buf.put_i32_le(*code);
                put_str(buf, timeused);
            }
            Self::SubtestStart { name } | Self::DynamicSubtestStart { name } => {
                put_str(buf, name)
            }
            Self::SubtestResult {
                name,
                result,
                timeused,
                reason,
            }
            | Self::DynamicSubtestResult {
                name,
                result,
                timeused,
                reason,
            } => {
                put_str(buf, name);
                put_str(buf, result);
                put_str(buf, timeused);
                put_str(buf, reason);
            }
            Self::VersionString { text } => put_str(buf, text),
        }
    }

    /// Encodes this packet into a new vector.
    pub fn encode(&self, sender_pid: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(sender_pid, &mut out);
        out
    }

    /// Converts this body into one that owns its strings.
    pub fn into_owned(self) -> PacketBody<'static> {
        fn o(text: Cow<'_, str>) -> Cow<'static, str> {
            Cow::Owned(text.into_owned())
        }
        match self {
            Self::Log { stream, text } => PacketBody::Log {
                stream,
                text: o(text),
            },
            Self::Exec { command_line } => PacketBody::Exec {
                command_line: o(command_line),
            },
            Self::Exit { code, timeused } => PacketBody::Exit {
                code,
                timeused: o(timeused),
            },
            Self::SubtestStart { name } => PacketBody::SubtestStart { name: o(name) },
            Self::SubtestResult {
                name,
                result,
                timeused,
                reason,
            } => PacketBody::SubtestResult {
                name: o(name),
                result: o(result),
                timeused: o(timeused),
                reason: o(reason),
            },
            Self::DynamicSubtestStart { name } => PacketBody::DynamicSubtestStart { name: o(name) },
            Self::DynamicSubtestResult {
                name,
                result,
                timeused,
                reason,
            } => PacketBody::DynamicSubtestResult {
                name: o(name),
                result: o(result),
                timeused: o(timeused),
                reason: o(reason),
            },
            Self::VersionString { text } => PacketBody::VersionString { text: o(text) },
        }
    }
}

/// A decoded packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    /// The pid of the process that sent the packet.
    pub sender_pid: u32,

    /// The payload.
    pub body: PacketBody<'static>,
}

fn decode_payload(kind: u32, mut payload: &[u8]) -> Result<PacketBody<'static>, DecodeError> {
    fn get_u32(buf: &mut &[u8], field: &'static str) -> Result<u32, DecodeError> {
        if buf.remaining() < 4 {
            return Err(DecodeError::Truncated { field });
        }
        Ok(buf.get_u32_le())
    }

    fn get_str(buf: &mut &[u8], field: &'static str) -> Result<Cow<'static, str>, DecodeError> {
        let len = get_u32(buf, field)? as usize;
        if buf.remaining() < len {
            return Err(DecodeError::Truncated { field });
        }
        let (text, rest) = buf.split_at(len);
        *buf = rest;
        let text = std::str::from_utf8(text).map_err(|_| DecodeError::InvalidUtf8 { field })?;
        Ok(Cow::Owned(text.to_owned()))
    }

    let buf = &mut payload;
    let body = match kind {
        kind::LOG => {
            let stream = LogStream::from_u32(get_u32(buf, "stream")?)
                .ok_or(DecodeError::InvalidField { field: "stream" })?;
            PacketBody::Log {
                stream,
                text: get_str(buf, "text")?,
            }
        }
        kind::EXEC => PacketBody::Exec {
            command_line: get_str(buf, "command_line")?,
        },
        kind::EXIT => PacketBody::Exit {
            code: get_u32(buf, "code")? as i32,
            timeused: get_str(buf, "timeused")?,
        },
        kind::SUBTEST_START => PacketBody::SubtestStart {
            name: get_str(buf, "name")?,
        },
        kind::SUBTEST_RESULT => PacketBody::SubtestResult {
            name: get_str(buf, "name")?,
            result: get_str(buf, "result")?,
            timeused: get_str(buf, "timeused")?,
            reason: get_str(buf, "reason")?,
        },
        kind::DYNAMIC_SUBTEST_START => PacketBody::DynamicSubtestStart {
            name: get_str(buf, "name")?,
        },
        kind::DYNAMIC_SUBTEST_RESULT => PacketBody::DynamicSubtestResult {
            name: get_str(buf, "name")?,
            result: get_str(buf, "result")?,
            timeused: get_str(buf, "timeused")?,
            reason: get_str(buf, "reason")?,
        },
        kind::VERSION_STRING => PacketBody::VersionString {
            text: get_str(buf, "text")?,
        },
        kind => return Err(DecodeError::UnknownKind { kind }),
    };
    Ok(body)
}

/// An incremental decoder for a comms byte stream.
///
/// Bytes are fed in with [`push`](Self::push) as they arrive; complete packets are pulled out
/// with [`next_packet`](Self::next_packet). Garbage between packets is skipped.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
    skipped: usize,
}

impl PacketDecoder {
    /// Creates a new, empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the number of bytes skipped so far while resynchronizing.
    pub fn skipped_bytes(&self) -> usize {
        self.skipped
    }

    /// Returns the number of buffered bytes not yet decoded.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete packet.
    ///
    /// Returns `None` if more data is needed. A malformed packet is skipped and reported as an
    /// error; decoding can continue afterwards.
    pub fn next_packet(&mut self) -> Option<Result<Packet, DecodeError>> {
        self.resync();
        if self.buf.len() < HEADER_SIZE {
            return None;
        }

        let mut header = &self.buf[4..HEADER_SIZE];
        let size = header.get_u32_le();
        let kind = header.get_u32_le();
        let sender_pid = header.get_u32_le();

        if (size as usize) < HEADER_SIZE || size as usize > MAX_PACKET_SIZE {
            // Not a real packet start. Skip past this magic and look for the next one.
            self.skip(1);
            return Some(Err(DecodeError::InvalidSize { size }));
        }
        let size = size as usize;
        if self.buf.len() < size {
            return None;
        }

        let packet = self.buf.split_to(size);
        Some(decode_payload(kind, &packet[HEADER_SIZE..]).map(|body| Packet { sender_pid, body }))
    }

    fn resync(&mut self) {
        match find_magic(&self.buf) {
            Some(0) => {}
            Some(pos) => self.skip(pos),
            None => {
                // Keep a possible partial magic at the end.
                let keep = (1..MAGIC.len())
                    .rev()
                    .find(|&n| self.buf.ends_with(&MAGIC[..n]))
                    .unwrap_or(0);
                let drop = self.buf.len() - keep;
                self.skip(drop);
            }
        }
    }

    fn skip(&mut self, n: usize) {
        self.buf.advance(n);
        self.skipped += n;
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|w| w == MAGIC)
}

/// The result of decoding a complete comms file.
#[derive(Clone, Debug, Default)]
pub struct DecodedStream {
    /// The packets, in stream order.
    pub packets: Vec<Packet>,

    /// Errors encountered along the way.
    pub errors: Vec<DecodeError>,

    /// Bytes at the end that did not form a complete packet.
    pub trailing_bytes: usize,
}

/// Decodes a complete comms byte stream, such as a `comms` file on disk.
pub fn decode_all(data: &[u8]) -> DecodedStream {
    let mut decoder = PacketDecoder::new();
    decoder.push(data);
    let mut out = DecodedStream::default();
    while let Some(result) = decoder.next_packet() {
        match result {
            Ok(packet) => out.packets.push(packet),
            Err(error) => out.errors.push(error),
        }
    }
    out.trailing_bytes = decoder.pending_bytes();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sample_packets() -> Vec<PacketBody<'static>> {
        vec![
            PacketBody::VersionString {
                text: "IGT-Version: 1.0 (x86_64) (Linux: 6.1 x86_64)".into(),
            },
            PacketBody::SubtestStart {
                name: "b-subtest".into(),
            },
            PacketBody::Log {
                stream: LogStream::Stderr,
                text: "Test requirement not met\n".into(),
            },
            PacketBody::SubtestResult {
                name: "b-subtest".into(),
                result: "FAIL".into(),
                timeused: "0.010".into(),
                reason: "".into(),
            },
            PacketBody::Exit {
                code: 98,
                timeused: "0.020".into(),
            },
        ]
    }

    #[test]
    fn encode_into_stack_buffer() {
        let body = PacketBody::SubtestStart {
            name: "first-subtest".into(),
        };
        let mut storage = [0u8; 64];
        let len = body.encoded_len();
        let mut slice = &mut storage[..];
        body.encode_into(42, &mut slice);
        assert_eq!(slice.len(), 64 - len);
        assert_eq!(&storage[..len], &body.encode(42)[..]);
        assert_eq!(&storage[..4], b"IGTC");
    }

    #[test]
    fn decode_skips_garbage_and_torn_packets() {
        let packets = sample_packets();
        let mut stream = b"garbage before".to_vec();
        stream.extend(packets[0].encode(7));
        // A torn write: header and half the payload of a packet.
        let torn = packets[1].encode(7);
        stream.extend(&torn[..torn.len() - 3]);
        for body in &packets[1..] {
            stream.extend(body.encode(7));
        }

        let decoded = decode_all(&stream);
        let bodies: Vec<_> = decoded.packets.iter().map(|p| p.body.clone()).collect();
        // The torn packet swallows the start of the next one, which is then lost; decoding
        // resynchronizes on the magic after that.
        assert_eq!(bodies.len(), packets.len());
        assert_eq!(bodies.first(), Some(&packets[0]));
        assert_eq!(bodies.last(), Some(&packets[4]));
        assert!(decoded.packets.iter().all(|p| p.sender_pid == 7));
    }

    #[test]
    fn decode_incrementally() {
        let packets = sample_packets();
        let stream: Vec<u8> = packets.iter().flat_map(|p| p.encode(1)).collect();
        let mut decoder = PacketDecoder::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(5) {
            decoder.push(chunk);
            while let Some(result) = decoder.next_packet() {
                out.push(result.expect("valid packet").body);
            }
        }
        assert_eq!(out, packets);
        assert_eq!(decoder.skipped_bytes(), 0);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn unknown_kind_is_reported() {
        let mut bytes = PacketBody::SubtestStart { name: "x".into() }.encode(1);
        bytes[8] = 99;
        let decoded = decode_all(&bytes);
        assert!(decoded.packets.is_empty());
        assert_eq!(decoded.errors, vec![DecodeError::UnknownKind { kind: 99 }]);
    }

    proptest! {
        // Arbitrary noise in front of a stream never prevents the final packet from decoding.
        #[test]
        fn proptest_resync_after_noise(noise in proptest::collection::vec(any::<u8>(), 0..64)) {
            let last = PacketBody::Exit { code: 0, timeused: "1.000".into() };
            let mut stream = noise;
            stream.extend(last.encode(3));
            let decoded = decode_all(&stream);
            prop_assert_eq!(decoded.packets.last().map(|p| &p.body), Some(&last));
        }
    }
}
