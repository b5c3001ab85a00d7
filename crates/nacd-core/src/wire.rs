//! Wire protocol for DHCP hook invocations.
//!
//! The DHCP daemon invokes a short-lived hook client for every lease event.
//! The client forwards its entire invocation (argv, the `DNSMASQ_*`
//! environment, and its three standard descriptors) over a `SOCK_STREAM`
//! `AF_UNIX` socket to the long-running lease server, then exits with the
//! status byte the server sends back.
//!
//! # Envelope
//!
//! ```text
//! ┌───────────┬──────────────────────┬───────────┬──────────────────────┐
//! │ argc: u32 │ argv strings, each   │ envc: u32 │ env strings, each    │
//! │ (native   │ NUL-terminated       │ (native   │ KEY=VALUE,           │
//! │  endian)  │                      │  endian)  │ NUL-terminated       │
//! └───────────┴──────────────────────┴───────────┴──────────────────────┘
//! ```
//!
//! The three standard file descriptors (stdin, stdout, stderr) travel as a
//! single `SCM_RIGHTS` control message attached to the *first* `sendmsg`
//! call only; partial writes continue without ancillary data. After the full
//! envelope is written the sender half-closes its write side, which tells the
//! server the message is complete. The server replies with exactly one status
//! byte and closes the connection.
//!
//! The envelope has no per-string length prefixes, so the format is only
//! valid for strings without interior NUL bytes, which holds for argv and
//! environment data by construction.
//!
//! # Invariants
//!
//! - A message never exceeds [`MAX_MESSAGE_SIZE`] bytes; both sides enforce
//!   the cap before allocating or sending.
//! - Exactly [`PASSED_FD_COUNT`] descriptors are transferred per exchange.
//! - The decoder takes ownership of received descriptors; they are closed
//!   when the [`StdioHandles`] value drops unless consumed first.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use thiserror::Error;

/// Maximum size of an encoded invocation in bytes.
///
/// One page minus a trailing terminator byte, matching the receive buffer of
/// the deployed lease server. Enforced before allocation on the receive side
/// and before any I/O on the send side.
pub const MAX_MESSAGE_SIZE: usize = 4095;

/// Number of file descriptors passed with every invocation.
pub const PASSED_FD_COUNT: usize = 3;

/// Process exit codes mirrored between the hook client and the DHCP daemon.
///
/// These follow the BSD `sysexits.h` convention and are a load-bearing part
/// of the interface: the DHCP daemon distinguishes retryable from fatal hook
/// failures by exit status.
pub mod exit {
    /// Successful exchange.
    pub const OK: u8 = 0;
    /// Bad invocation: missing socket variable, oversized path, bad usage.
    pub const USAGE: u8 = 64;
    /// Protocol-shape violation: oversized message, bad response length.
    pub const DATA_ERR: u8 = 65;
    /// Internal server failure while applying an otherwise valid event.
    pub const SOFTWARE: u8 = 70;
    /// Operating system failure: connect, send, or receive error.
    pub const OS_ERR: u8 = 71;
}

/// Errors produced by the codec and the descriptor-passing transport.
#[derive(Debug, Error)]
pub enum WireError {
    /// The encoded message exceeds [`MAX_MESSAGE_SIZE`].
    ///
    /// Detected before allocation on the receive side.
    #[error("message too large: {size} bytes exceeds maximum {max} bytes")]
    MessageTooLarge {
        /// Observed (or would-be) message size.
        size: usize,
        /// Maximum allowed message size.
        max: usize,
    },

    /// A string contains an interior NUL byte and cannot be framed.
    #[error("while encoding {element}: string contains an interior NUL byte")]
    InteriorNul {
        /// The element being encoded, e.g. `argv[2]`.
        element: String,
    },

    /// An environment key contains `=` or is empty.
    #[error("while encoding {element}: invalid environment key")]
    InvalidEnvKey {
        /// The element being encoded, e.g. `environ[0]`.
        element: String,
    },

    /// The buffer ended before a fixed-size element was complete.
    #[error(
        "while parsing {element}: unexpected end of message, expected at \
         least {needed} more byte(s), but only {available} byte(s) left"
    )]
    UnexpectedEof {
        /// The element being parsed, e.g. `argc`.
        element: String,
        /// Bytes required to finish the element.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A string ran to the end of the message without a NUL terminator.
    #[error("while parsing {element}: string is not NUL-terminated")]
    UnterminatedString {
        /// The element being parsed, e.g. `argv[0]`.
        element: String,
    },

    /// An environment entry has no `=` separator.
    #[error("while parsing {element}: no equal sign in environment variable")]
    MissingSeparator {
        /// The element being parsed, e.g. `environ[3]`.
        element: String,
    },

    /// Bytes remained after the envelope was fully parsed.
    #[error("{count} byte(s) left over after parsing")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// The kernel truncated the `SCM_RIGHTS` control message.
    #[error("truncated ancillary data")]
    AncillaryTruncated,

    /// A number of descriptors other than [`PASSED_FD_COUNT`] was received.
    #[error("expected to receive exactly {PASSED_FD_COUNT} file descriptors, got {count}")]
    DescriptorCount {
        /// Descriptors actually received over the connection.
        count: usize,
    },

    /// The server response was not exactly one byte.
    #[error("received unexpected number of response bytes: {received}")]
    ResponseLength {
        /// Bytes received before the connection closed.
        received: usize,
    },

    /// Underlying transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Returns `true` for protocol-shape violations, as opposed to transport
    /// failures. Operators use this split to tell "network broke" from
    /// "protocol/version mismatch".
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_))
    }

    /// The `sysexits`-style process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Io(_) => exit::OS_ERR,
            _ => exit::DATA_ERR,
        }
    }
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// A decoded hook invocation: raw argv and split environment entries.
///
/// Values are kept as byte strings; the DHCP daemon's environment is not
/// guaranteed to be valid UTF-8 (client identifiers and hostnames supplied by
/// arbitrary clients pass through it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvocation {
    /// Argument vector, including the program name at index 0.
    pub argv: Vec<Vec<u8>>,
    /// Environment entries split at the first `=`.
    pub env: Vec<(Vec<u8>, Vec<u8>)>,
}

/// The three standard descriptors received with an invocation.
///
/// Ownership transfers to this struct on receipt; each descriptor is closed
/// on drop unless moved out first. This is the single-consumption handle for
/// the hook's stdio across the privilege boundary.
#[derive(Debug)]
pub struct StdioHandles {
    /// The hook client's standard input.
    pub stdin: OwnedFd,
    /// The hook client's standard output.
    pub stdout: OwnedFd,
    /// The hook client's standard error.
    pub stderr: OwnedFd,
}

/// Encode an invocation into a single contiguous buffer.
///
/// The deployed C client gathers argv and environ into as few iovecs as
/// possible; that coalescing is a pure optimization and one contiguous
/// buffer is bit-identical on the wire.
///
/// # Errors
///
/// Fails if any string contains an interior NUL, an environment key is empty
/// or contains `=`, or the total size exceeds [`MAX_MESSAGE_SIZE`].
pub fn encode_invocation(argv: &[Vec<u8>], env: &[(Vec<u8>, Vec<u8>)]) -> WireResult<Vec<u8>> {
    let mut size = 2 * size_of::<u32>();
    for (i, arg) in argv.iter().enumerate() {
        if arg.contains(&0) {
            return Err(WireError::InteriorNul {
                element: format!("argv[{i}]"),
            });
        }
        size += arg.len() + 1;
    }
    for (i, (key, value)) in env.iter().enumerate() {
        if key.is_empty() || key.contains(&b'=') {
            return Err(WireError::InvalidEnvKey {
                element: format!("environ[{i}]"),
            });
        }
        if key.contains(&0) || value.contains(&0) {
            return Err(WireError::InteriorNul {
                element: format!("environ[{i}]"),
            });
        }
        size += key.len() + 1 + value.len() + 1;
    }
    if size > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&u32::try_from(argv.len()).unwrap_or(u32::MAX).to_ne_bytes());
    for arg in argv {
        buf.extend_from_slice(arg);
        buf.push(0);
    }
    buf.extend_from_slice(&u32::try_from(env.len()).unwrap_or(u32::MAX).to_ne_bytes());
    for (key, value) in env {
        buf.extend_from_slice(key);
        buf.push(b'=');
        buf.extend_from_slice(value);
        buf.push(0);
    }
    Ok(buf)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take_uint(&mut self, element: &str) -> WireResult<u32> {
        let needed = size_of::<u32>();
        if self.remaining() < needed {
            return Err(WireError::UnexpectedEof {
                element: element.to_owned(),
                needed,
                available: self.remaining(),
            });
        }
        let mut raw = [0u8; size_of::<u32>()];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + needed]);
        self.pos += needed;
        Ok(u32::from_ne_bytes(raw))
    }

    fn take_string(&mut self, element: &str) -> WireResult<Vec<u8>> {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                Ok(rest[..end].to_vec())
            },
            None => Err(WireError::UnterminatedString {
                element: element.to_owned(),
            }),
        }
    }
}

/// Decode a complete invocation envelope.
///
/// # Errors
///
/// Fails on a truncated envelope, a string without its terminator, an
/// environment entry without `=`, or bytes left over after the declared
/// element counts were consumed.
pub fn decode_invocation(buf: &[u8]) -> WireResult<DecodedInvocation> {
    let mut cursor = Cursor { buf, pos: 0 };

    let argc = cursor.take_uint("argc")?;
    let mut argv = Vec::with_capacity(argc.min(64) as usize);
    for i in 0..argc {
        argv.push(cursor.take_string(&format!("argv[{i}]"))?);
    }

    let envc = cursor.take_uint("envc")?;
    let mut env = Vec::with_capacity(envc.min(64) as usize);
    for i in 0..envc {
        let element = format!("environ[{i}]");
        let entry = cursor.take_string(&element)?;
        match entry.iter().position(|&b| b == b'=') {
            Some(sep) => env.push((entry[..sep].to_vec(), entry[sep + 1..].to_vec())),
            None => return Err(WireError::MissingSeparator { element }),
        }
    }

    if cursor.remaining() > 0 {
        return Err(WireError::TrailingBytes {
            count: cursor.remaining(),
        });
    }
    Ok(DecodedInvocation { argv, env })
}

/// Send a full invocation over a connected stream socket.
///
/// The three descriptors are attached as `SCM_RIGHTS` to the first
/// `sendmsg` only; short writes continue without ancillary data until the
/// whole envelope is out, then the write side is shut down to mark the end
/// of the message.
///
/// # Errors
///
/// Fails on encoding errors (see [`encode_invocation`]) and on transport
/// failures, which surface as [`WireError::Io`].
pub fn send_invocation(
    stream: &UnixStream,
    argv: &[Vec<u8>],
    env: &[(Vec<u8>, Vec<u8>)],
    stdio: [BorrowedFd<'_>; PASSED_FD_COUNT],
) -> WireResult<()> {
    let buf = encode_invocation(argv, env)?;
    let raw_fds: [RawFd; PASSED_FD_COUNT] = [
        stdio[0].as_raw_fd(),
        stdio[1].as_raw_fd(),
        stdio[2].as_raw_fd(),
    ];

    let scm_rights = [ControlMessage::ScmRights(&raw_fds)];
    let mut offset = 0;
    while offset < buf.len() {
        let iov = [IoSlice::new(&buf[offset..])];
        // Ancillary data rides on the first write only.
        let cmsgs: &[ControlMessage<'_>] = if offset == 0 { &scm_rights } else { &[] };
        match sendmsg::<()>(
            stream.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::empty(),
            None,
        ) {
            Ok(sent) => offset += sent,
            Err(Errno::EINTR) => {},
            Err(e) => return Err(WireError::Io(e.into())),
        }
    }

    stream.shutdown(Shutdown::Write)?;
    Ok(())
}

/// Receive a full invocation from a connected stream socket.
///
/// Reads until the peer half-closes its write side, enforcing
/// [`MAX_MESSAGE_SIZE`], and collects the passed descriptors from
/// `SCM_RIGHTS` control messages. Descriptors are received with
/// `MSG_CMSG_CLOEXEC` and owned by the returned [`StdioHandles`]; on any
/// error, descriptors collected so far are closed before returning.
///
/// # Errors
///
/// Fails on transport errors, an oversized message, truncated ancillary
/// data, a descriptor count other than [`PASSED_FD_COUNT`], or a malformed
/// envelope.
pub fn recv_invocation(stream: &UnixStream) -> WireResult<(DecodedInvocation, StdioHandles)> {
    // One spare byte past the cap so an oversized sender is detected rather
    // than silently truncated.
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE + 1];
    let mut filled = 0;
    let mut fds: Vec<OwnedFd> = Vec::new();

    loop {
        let mut cmsg_buf = cmsg_space!([RawFd; PASSED_FD_COUNT]);
        let fds_before = fds.len();
        let (bytes, truncated) = {
            let mut iov = [IoSliceMut::new(&mut buf[filled..])];
            let msg = match recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(WireError::Io(e.into())),
            };
            let cmsgs = msg.cmsgs().map_err(|_| WireError::AncillaryTruncated)?;
            for cmsg in cmsgs {
                match cmsg {
                    ControlMessageOwned::ScmRights(received) => {
                        for raw in received {
                            // recvmsg transferred these descriptors into this
                            // process; we are their sole owner from here on.
                            fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    },
                    other => {
                        tracing::warn!(?other, "ignoring unexpected control message");
                    },
                }
            }
            (
                msg.bytes,
                msg.flags.contains(MsgFlags::MSG_CTRUNC),
            )
        };

        if truncated {
            return Err(WireError::AncillaryTruncated);
        }
        if bytes == 0 && fds.len() == fds_before {
            break;
        }
        filled += bytes;
        if filled > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: filled,
                max: MAX_MESSAGE_SIZE,
            });
        }
    }

    let [stdin, stdout, stderr]: [OwnedFd; PASSED_FD_COUNT] = fds
        .try_into()
        .map_err(|fds: Vec<OwnedFd>| WireError::DescriptorCount { count: fds.len() })?;
    let stdio = StdioHandles {
        stdin,
        stdout,
        stderr,
    };

    let decoded = decode_invocation(&buf[..filled])?;
    Ok((decoded, stdio))
}

/// Read the single status byte the server sends back.
///
/// # Errors
///
/// Returns [`WireError::ResponseLength`] if the connection closes before any
/// byte arrives or more than one byte is received, and [`WireError::Io`] on
/// transport failures.
pub fn recv_status(stream: &mut UnixStream) -> WireResult<u8> {
    let mut buf = [0u8; 16];
    let mut received = 0;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                received += n;
                if received >= 1 {
                    break;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e.into()),
        }
    }
    if received != 1 {
        return Err(WireError::ResponseLength { received });
    }
    Ok(buf[0])
}

/// Write the status byte ending an exchange.
///
/// # Errors
///
/// Returns [`WireError::Io`] if the byte cannot be written.
pub fn send_status(stream: &mut UnixStream, status: u8) -> WireResult<()> {
    stream.write_all(&[status])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn bytes(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn pair(k: &str, v: &str) -> (Vec<u8>, Vec<u8>) {
        (bytes(k), bytes(v))
    }

    #[test]
    fn test_round_trip_basic() {
        let argv = vec![
            bytes("nacd-dhcp-script"),
            bytes("add"),
            bytes("de:ad:be:ef:00:00"),
            bytes("192.168.1.13"),
        ];
        let env = vec![
            pair("DNSMASQ_TIME_REMAINING", "86400"),
            pair("DNSMASQ_TAGS", "known eth2"),
        ];
        let buf = encode_invocation(&argv, &env).unwrap();
        let decoded = decode_invocation(&buf).unwrap();
        assert_eq!(decoded.argv, argv);
        assert_eq!(decoded.env, env);
    }

    #[test]
    fn test_round_trip_empty_strings_and_equals_in_values() {
        let argv = vec![bytes(""), bytes("add"), bytes("")];
        let env = vec![
            pair("KEY", ""),
            pair("OTHER", "a=b=c"),
            pair("THIRD", "="),
        ];
        let buf = encode_invocation(&argv, &env).unwrap();
        let decoded = decode_invocation(&buf).unwrap();
        assert_eq!(decoded.argv, argv);
        assert_eq!(decoded.env, env);
    }

    #[test]
    fn test_round_trip_empty_invocation() {
        let buf = encode_invocation(&[], &[]).unwrap();
        let decoded = decode_invocation(&buf).unwrap();
        assert!(decoded.argv.is_empty());
        assert!(decoded.env.is_empty());
    }

    #[test]
    fn test_encode_rejects_interior_nul() {
        let err = encode_invocation(&[b"a\0b".to_vec()], &[]).unwrap_err();
        assert!(matches!(err, WireError::InteriorNul { .. }));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_encode_rejects_equals_in_key() {
        let err = encode_invocation(&[], &[pair("BAD=KEY", "v")]).unwrap_err();
        assert!(matches!(err, WireError::InvalidEnvKey { .. }));
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let big = vec![b'x'; MAX_MESSAGE_SIZE];
        let err = encode_invocation(&[big], &[]).unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
    }

    #[test]
    fn test_decode_truncated_argc() {
        let err = decode_invocation(&[1, 0]).unwrap_err();
        match err {
            WireError::UnexpectedEof {
                element,
                needed,
                available,
            } => {
                assert_eq!(element, "argc");
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_unterminated_string() {
        let mut buf = 1u32.to_ne_bytes().to_vec();
        buf.extend_from_slice(b"add"); // missing NUL
        let err = decode_invocation(&buf).unwrap_err();
        match err {
            WireError::UnterminatedString { element } => assert_eq!(element, "argv[0]"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_env_without_separator() {
        let mut buf = 0u32.to_ne_bytes().to_vec();
        buf.extend_from_slice(&1u32.to_ne_bytes());
        buf.extend_from_slice(b"NOEQUALS\0");
        let err = decode_invocation(&buf).unwrap_err();
        match err {
            WireError::MissingSeparator { element } => assert_eq!(element, "environ[0]"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut buf = encode_invocation(&[bytes("init")], &[]).unwrap();
        buf.extend_from_slice(b"junk");
        let err = decode_invocation(&buf).unwrap_err();
        assert!(matches!(err, WireError::TrailingBytes { count: 4 }));
    }

    #[test]
    fn test_exit_code_classification() {
        let io_err = WireError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(io_err.exit_code(), exit::OS_ERR);
        assert!(!io_err.is_protocol_violation());

        let data_err = WireError::ResponseLength { received: 0 };
        assert_eq!(data_err.exit_code(), exit::DATA_ERR);
        assert!(data_err.is_protocol_violation());
    }

    proptest! {
        /// Any NUL-free argv/env combination survives a round trip, including
        /// empty strings, embedded `=` in values, and long user-class lists.
        #[test]
        fn prop_round_trip(
            argv in prop::collection::vec(
                prop::collection::vec(1u8..=255, 0..24),
                0..8,
            ),
            env in prop::collection::vec(
                (
                    prop::collection::vec(
                        (1u8..=255).prop_filter("no equals", |b| *b != b'='),
                        1..16,
                    ),
                    prop::collection::vec(1u8..=255, 0..24),
                ),
                0..32,
            ),
        ) {
            let buf = encode_invocation(&argv, &env).unwrap();
            prop_assert!(buf.len() <= MAX_MESSAGE_SIZE);
            let decoded = decode_invocation(&buf).unwrap();
            prop_assert_eq!(decoded.argv, argv);
            prop_assert_eq!(decoded.env, env);
        }
    }
}
