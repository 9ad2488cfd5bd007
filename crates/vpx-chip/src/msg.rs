//! Mailbox message wire format.
//!
//! Firmware→host messages are a length-prefixed sequence of 32-bit words
//! read out of consecutive mailbox registers. Word 0 is the header:
//!
//! ```text
//!  31      24 23      16 15       8 7        0
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │  length  │   type   │  byte 1  │  byte 0  │
//! └──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `length` counts words *including* the header. `byte 0` / `byte 1` are
//! the first two payload bytes of an abort string — the packing straddles
//! the header because the string starts in whatever room the header word
//! has left. This is a wire-compatibility detail shared with the firmware;
//! reproduce it exactly.
//!
//! Everything in this module is pure computation so the decoder can be
//! tested without an interrupt path behind it.

use core::fmt;

/// Maximum message size in words, header included. Sized to the mailbox
/// scratch area firmware stages a message in before raising the interrupt.
pub const MAX_WORDS: usize = 16;

/// Maximum abort-string length in bytes, terminator excluded: two bytes in
/// the header word plus four per remaining payload word.
pub const ABORT_MAX_LEN: usize = 2 + (MAX_WORDS - 1) * 4;

/// Shift of the length field in word 0.
pub const LEN_SHIFT: u32 = 24;
/// Shift of the type field in word 0.
pub const TYPE_SHIFT: u32 = 16;

/// Message type values. The protocol defines exactly these four; anything
/// else is a firmware/driver consistency failure, not a forward-compat
/// extension point.
pub mod msg_type {
    /// Firmware finished its startup path.
    pub const BOOT_DONE: u32 = 1;
    /// Firmware hit an unrecoverable condition; payload is a diagnostic
    /// string.
    pub const ABORT: u32 = 2;
    /// Firmware asks the host to drain the debug-print ring.
    pub const FLUSH_PRINT: u32 = 3;
    /// A firmware-internal fast reset did not converge.
    pub const FAST_RESET_FAILURE: u32 = 4;
}

/// A decoded firmware→host message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Startup complete. Timestamps are the firmware timebase at entry to
    /// and exit from its init path, each sent high word first.
    BootDone {
        /// Timebase value when firmware init began.
        start: u64,
        /// Timebase value when firmware init finished.
        end: u64,
    },
    /// Firmware aborted; the payload is its diagnostic string, truncated
    /// to [`ABORT_MAX_LEN`] bytes.
    Abort(String),
    /// Drain the debug-print ring.
    FlushPrint,
    /// Firmware-internal fast reset failed.
    FastResetFailure,
}

/// Wire-format decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The header's length field disagrees with the word count presented.
    Length {
        /// Length claimed by the header.
        header: usize,
        /// Words actually presented.
        got: usize,
    },
    /// The header length exceeds [`MAX_WORDS`].
    Oversize(usize),
    /// A payload was shorter than its type requires.
    Truncated(u32),
    /// Unknown type field value.
    UnknownType(u32),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length { header, got } => {
                write!(f, "header claims {header} words, {got} presented")
            }
            Self::Oversize(len) => write!(f, "message length {len} exceeds {MAX_WORDS} words"),
            Self::Truncated(ty) => write!(f, "payload truncated for message type {ty}"),
            Self::UnknownType(ty) => write!(f, "unknown message type {ty:#x}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Extract the length field (word count including the header) from word 0.
#[must_use]
pub const fn header_len(word0: u32) -> usize {
    (word0 >> LEN_SHIFT) as usize
}

/// Extract the type field from word 0.
#[must_use]
pub const fn header_type(word0: u32) -> u32 {
    (word0 >> TYPE_SHIFT) & 0xFF
}

/// Decode a complete message.
///
/// `words` must be exactly the words read from the mailbox, header first.
///
/// # Errors
///
/// Returns a [`WireError`] if the header length disagrees with `words`,
/// the payload is short for its type, or the type value is not one of the
/// four the protocol defines.
pub fn decode(words: &[u32]) -> Result<Message, WireError> {
    let Some(&word0) = words.first() else {
        return Err(WireError::Length { header: 1, got: 0 });
    };
    let len = header_len(word0);
    if len > MAX_WORDS {
        return Err(WireError::Oversize(len));
    }
    if len != words.len() {
        return Err(WireError::Length {
            header: len,
            got: words.len(),
        });
    }

    match header_type(word0) {
        msg_type::BOOT_DONE => {
            let &[start_hi, start_lo, end_hi, end_lo] = &words[1..] else {
                return Err(WireError::Truncated(msg_type::BOOT_DONE));
            };
            Ok(Message::BootDone {
                start: (u64::from(start_hi) << 32) | u64::from(start_lo),
                end: (u64::from(end_hi) << 32) | u64::from(end_lo),
            })
        }
        msg_type::ABORT => Ok(Message::Abort(unpack_abort_string(word0, &words[1..]))),
        msg_type::FLUSH_PRINT => Ok(Message::FlushPrint),
        msg_type::FAST_RESET_FAILURE => Ok(Message::FastResetFailure),
        other => Err(WireError::UnknownType(other)),
    }
}

/// Reassemble an abort string: bytes 0 and 1 from the header word, four
/// bytes per payload word after that, little end first, stopping at the
/// first NUL or at [`ABORT_MAX_LEN`] bytes. Non-ASCII bytes are replaced
/// so a corrupted payload still yields a loggable string.
fn unpack_abort_string(word0: u32, payload: &[u32]) -> String {
    let mut bytes = Vec::with_capacity(ABORT_MAX_LEN);
    bytes.push((word0 & 0xFF) as u8);
    bytes.push(((word0 >> 8) & 0xFF) as u8);
    for &word in payload {
        bytes.extend_from_slice(&word.to_le_bytes());
    }

    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(bytes.len())
        .min(ABORT_MAX_LEN);
    bytes.truncate(end);

    bytes
        .into_iter()
        .map(|b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

/// Build a header word from a length (words, header included), a type and
/// the two header payload bytes.
#[must_use]
pub const fn header(len: usize, ty: u32, byte0: u8, byte1: u8) -> u32 {
    ((len as u32) << LEN_SHIFT)
        | ((ty & 0xFF) << TYPE_SHIFT)
        | ((byte1 as u32) << 8)
        | byte0 as u32
}

/// Encode a boot-done message. Used by the simulator and the round-trip
/// tests; real hardware encodes this in firmware.
#[must_use]
pub fn encode_boot_done(start: u64, end: u64) -> Vec<u32> {
    vec![
        header(5, msg_type::BOOT_DONE, 0, 0),
        (start >> 32) as u32,
        start as u32,
        (end >> 32) as u32,
        end as u32,
    ]
}

/// Encode an abort message, truncating `reason` to [`ABORT_MAX_LEN`]
/// bytes. The NUL terminator is implicit when the string is shorter than
/// the encoded capacity and implied by the length cap otherwise.
#[must_use]
pub fn encode_abort(reason: &str) -> Vec<u32> {
    let bytes = reason.as_bytes();
    let take = bytes.len().min(ABORT_MAX_LEN);

    // Room for the string plus a terminator where it fits.
    let tail = take.saturating_sub(2);
    let payload_words = (tail + 4) / 4; // one spare byte keeps the NUL in-band
    let len = (1 + payload_words).min(MAX_WORDS);

    let b = |i: usize| -> u8 {
        if i < take {
            bytes[i]
        } else {
            0
        }
    };

    let mut words = Vec::with_capacity(len);
    words.push(header(len, msg_type::ABORT, b(0), b(1)));
    for w in 0..len - 1 {
        let base = 2 + w * 4;
        words.push(u32::from_le_bytes([
            b(base),
            b(base + 1),
            b(base + 2),
            b(base + 3),
        ]));
    }
    words
}

/// Encode a payload-free message ([`msg_type::FLUSH_PRINT`] or
/// [`msg_type::FAST_RESET_FAILURE`]).
#[must_use]
pub fn encode_bare(ty: u32) -> Vec<u32> {
    vec![header(1, ty, 0, 0)]
}
