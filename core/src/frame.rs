//! Wire format of the serial link.
//!
//! Requests from the host look like `QT:<N>;<cmd><arg>.` and replies like
//! `RP:<N>;<payload>end`. In both directions `N` is the decimal length of everything between
//! the `;` and the terminator.

use heapless::{String, Vec};

use crate::config::{ARG_CAPACITY, RX_FRAME_CAPACITY};
use crate::CurveKind;

const REQUEST_HEADER: &[u8] = b"QT:";
const REQUEST_TERMINATOR: u8 = b'.';
const REPLY_HEADER: &[u8] = b"RP:";
const REPLY_TERMINATOR: &[u8] = b"end";
const LENGTH_SEPARATOR: u8 = b';';

/// Sample pairs packed per call into the writer when encoding a capture.
const PACK_CHUNK_PAIRS: usize = 16;

/// A decoded request: one command byte and its raw argument text.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Instruction {
    pub cmd: char,
    pub arg: String<ARG_CAPACITY>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// More bytes than a request frame can hold.
    FrameTooLong,
    /// The frame does not start with `QT:`.
    BadHeader,
    /// No `;` after the header.
    MissingSeparator,
    /// The declared length is not a decimal number.
    BadLength,
    /// No `.` terminator after the body.
    Unterminated,
    /// The body is not as long as the header claims.
    LengthMismatch { declared: usize, actual: usize },
    /// The body is empty, so there is no command byte.
    MissingCommand,
    /// The command byte is not a printable ASCII character.
    BadCommand,
    /// The argument does not fit [`ARG_CAPACITY`].
    ArgumentTooLong,
    /// The argument is not ASCII text.
    BadArgument,
}

/// Decodes one complete request frame.
///
/// Only the bytes of `frame` are ever looked at; anything after the first terminator is
/// ignored.
pub fn decode(frame: &[u8]) -> Result<Instruction, DecodeError> {
    if frame.len() > RX_FRAME_CAPACITY {
        return Err(DecodeError::FrameTooLong);
    }

    let rest = frame
        .strip_prefix(REQUEST_HEADER)
        .ok_or(DecodeError::BadHeader)?;

    let separator = rest
        .iter()
        .position(|&b| b == LENGTH_SEPARATOR)
        .ok_or(DecodeError::MissingSeparator)?;
    let declared = parse_decimal(&rest[..separator]).ok_or(DecodeError::BadLength)?;

    let tail = &rest[separator + 1..];
    let end = tail
        .iter()
        .position(|&b| b == REQUEST_TERMINATOR)
        .ok_or(DecodeError::Unterminated)?;
    let body = &tail[..end];

    if body.len() != declared {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    let (&cmd, arg) = body.split_first().ok_or(DecodeError::MissingCommand)?;
    if !cmd.is_ascii_graphic() {
        return Err(DecodeError::BadCommand);
    }
    if arg.len() > ARG_CAPACITY {
        return Err(DecodeError::ArgumentTooLong);
    }
    if !arg.is_ascii() {
        return Err(DecodeError::BadArgument);
    }

    let arg = core::str::from_utf8(arg).map_err(|_| DecodeError::BadArgument)?;
    let arg = String::try_from(arg).map_err(|_| DecodeError::ArgumentTooLong)?;

    Ok(Instruction {
        cmd: char::from(cmd),
        arg,
    })
}

impl Instruction {
    /// Writes this instruction in request form, the inverse of [`decode`].
    pub fn encode<E>(&self, mut write: impl FnMut(&[u8]) -> Result<(), E>) -> Result<(), E> {
        let mut cmd = [0; 4];
        let cmd = self.cmd.encode_utf8(&mut cmd).as_bytes();
        let mut digits = [0; 20];

        write(REQUEST_HEADER)?;
        write(decimal(cmd.len() + self.arg.len(), &mut digits))?;
        write(&[LENGTH_SEPARATOR])?;
        write(cmd)?;
        write(self.arg.as_bytes())?;
        write(&[REQUEST_TERMINATOR])
    }
}

/// Content of a reply frame.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// Short status text such as `c,0`.
    Status(&'a str),
    /// A finished sweep, sent as the curve tag, a `,` and the packed samples.
    Capture { kind: CurveKind, samples: &'a [u16] },
}

impl Payload<'_> {
    /// Number of payload bytes on the wire, the `N` of the reply header.
    pub fn len(&self) -> usize {
        match self {
            Payload::Status(text) => text.len(),
            Payload::Capture { samples, .. } => 2 + samples.len().div_ceil(2) * 3,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes `payload` as a complete reply frame.
///
/// The writer is called with consecutive pieces of the frame, so a capture of any size can be
/// streamed without an intermediate buffer.
pub fn encode<E>(
    payload: &Payload<'_>,
    mut write: impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    let mut digits = [0; 20];

    write(REPLY_HEADER)?;
    write(decimal(payload.len(), &mut digits))?;
    write(&[LENGTH_SEPARATOR])?;

    match payload {
        Payload::Status(text) => write(text.as_bytes())?,
        Payload::Capture { kind, samples } => {
            write(&[kind.tag(), b','])?;

            let mut packed = [0u8; PACK_CHUNK_PAIRS * 3];
            for chunk in samples.chunks(PACK_CHUNK_PAIRS * 2) {
                let mut len = 0;
                for pair in chunk.chunks(2) {
                    let a = pair[0];
                    let b = pair.get(1).copied().unwrap_or(0);
                    packed[len..len + 3].copy_from_slice(&pack_pair(a, b));
                    len += 3;
                }
                write(&packed[..len])?;
            }
        }
    }

    write(REPLY_TERMINATOR)
}

/// Packs two 12-bit samples into three bytes, low byte of `a` first and the two high nibbles
/// sharing the middle byte.
pub const fn pack_pair(a: u16, b: u16) -> [u8; 3] {
    [
        a as u8,
        ((a >> 4) as u8 & 0xF0) | ((b >> 8) as u8 & 0x0F),
        b as u8,
    ]
}

fn parse_decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || digits.len() > 5 {
        return None;
    }

    digits.iter().try_fold(0usize, |acc, &d| {
        d.is_ascii_digit().then(|| acc * 10 + usize::from(d - b'0'))
    })
}

fn decimal(mut value: usize, buf: &mut [u8; 20]) -> &[u8] {
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[start..]
}

/// Outcome of feeding one byte into a [`FrameAssembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Progress {
    /// More bytes are needed.
    Pending,
    /// The terminator arrived, [`FrameAssembler::frame`] holds the whole frame.
    Complete,
    /// The frame filled the buffer without a terminator and was dropped.
    Overflow,
}

/// Collects received bytes until a request terminator shows up.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8, RX_FRAME_CAPACITY>,
}

impl FrameAssembler {
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, byte: u8) -> Progress {
        if self.buffer.push(byte).is_err() {
            self.buffer.clear();
            return Progress::Overflow;
        }

        if byte == REQUEST_TERMINATOR {
            Progress::Complete
        } else if self.buffer.is_full() {
            self.buffer.clear();
            Progress::Overflow
        } else {
            Progress::Pending
        }
    }

    /// Bytes collected so far.
    pub fn frame(&self) -> &[u8] {
        &self.buffer
    }

    /// True when no frame is in progress.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
