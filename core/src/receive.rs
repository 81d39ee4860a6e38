//! Turning received frames into commands.

use core::future::Future;

use crate::config::{Instant, FRAME_TIMEOUT};
use crate::frame::{decode, DecodeError, FrameAssembler, Progress};
use crate::instruction::{Command, CommandError};
use crate::StatusEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiveError {
    /// The terminator did not arrive in time.
    Timeout,
    /// The frame did not fit the receive buffer.
    Overflow,
    Decode(DecodeError),
    Command(CommandError),
}

impl From<DecodeError> for ReceiveError {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<CommandError> for ReceiveError {
    fn from(value: CommandError) -> Self {
        Self::Command(value)
    }
}

impl From<ReceiveError> for StatusEvent {
    fn from(value: ReceiveError) -> Self {
        match value {
            ReceiveError::Timeout => StatusEvent::Timeout,
            ReceiveError::Overflow => StatusEvent::Overflow,
            ReceiveError::Decode(_) | ReceiveError::Command(_) => StatusEvent::ErrorReceive,
        }
    }
}

/// Decodes a complete frame into the command it carries.
pub fn parse(frame: &[u8]) -> Result<Command, ReceiveError> {
    let instruction = decode(frame)?;
    Ok(Command::try_from(&instruction)?)
}

/// Received bytes together with the clock they arrive by.
pub trait ByteSource {
    fn now(&self) -> Instant;

    /// Waits for the next byte, however long that takes.
    fn next_byte(&mut self) -> impl Future<Output = u8>;

    /// Waits for the next byte, giving up with `None` at `deadline`.
    fn next_byte_before(&mut self, deadline: Instant) -> impl Future<Output = Option<u8>>;
}

/// Reads one frame and decodes the command it carries.
///
/// Waits as long as needed for the first byte. From then on the terminator has to arrive
/// within [`FRAME_TIMEOUT`]. The assembler is left empty whatever the outcome, so the next
/// call starts on a fresh frame.
pub async fn receive_frame<S: ByteSource>(
    assembler: &mut FrameAssembler,
    source: &mut S,
) -> Result<Command, ReceiveError> {
    assembler.clear();

    let mut byte = source.next_byte().await;
    let deadline = source.now() + FRAME_TIMEOUT;

    let result = loop {
        match assembler.push(byte) {
            Progress::Pending => {}
            Progress::Complete => break parse(assembler.frame()),
            Progress::Overflow => break Err(ReceiveError::Overflow),
        }

        match source.next_byte_before(deadline).await {
            Some(next) => byte = next,
            None => break Err(ReceiveError::Timeout),
        }
    };

    assembler.clear();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FRAME_TIMEOUT_MS;
    use futures::executor::block_on;
    use std::collections::VecDeque;

    fn feed(assembler: &mut FrameAssembler, bytes: &[u8]) -> Option<Result<Command, ReceiveError>> {
        for &byte in bytes {
            match assembler.push(byte) {
                Progress::Pending => {}
                Progress::Complete => {
                    let result = parse(assembler.frame());
                    assembler.clear();
                    return Some(result);
                }
                Progress::Overflow => return Some(Err(ReceiveError::Overflow)),
            }
        }
        None
    }

    #[test]
    fn frames_in_a_byte_stream() {
        let mut assembler = FrameAssembler::new();

        assert_eq!(feed(&mut assembler, b"QT:1;"), None);
        assert_eq!(feed(&mut assembler, b"c."), Some(Ok(Command::Start)));
        assert!(assembler.is_idle());

        assert_eq!(
            feed(&mut assembler, b"QT:3;a1."),
            Some(Err(ReceiveError::Decode(DecodeError::LengthMismatch {
                declared: 3,
                actual: 2
            })))
        );
        assert_eq!(
            feed(&mut assembler, b"QT:1;x."),
            Some(Err(ReceiveError::Command(CommandError::UnknownCommand('x'))))
        );
        assert_eq!(feed(&mut assembler, b"QT:1;0."), Some(Ok(Command::HeartbeatAck)));
    }

    #[test]
    fn runaway_frame_overflows() {
        let mut assembler = FrameAssembler::new();
        let noise = [b'x'; 64];
        assert_eq!(feed(&mut assembler, &noise), Some(Err(ReceiveError::Overflow)));
    }

    /// Bytes scheduled at fixed points of a simulated millisecond clock.
    struct Scripted {
        now: Instant,
        pending: VecDeque<(u64, u8)>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                now: Instant::from_ticks(0),
                pending: VecDeque::new(),
            }
        }

        fn at(mut self, ms: u64, bytes: &[u8]) -> Self {
            self.pending.extend(bytes.iter().map(|&b| (ms, b)));
            self
        }

        fn take(&mut self) -> u8 {
            let (ms, byte) = self.pending.pop_front().expect("script ran out of bytes");
            self.now = self.now.max(Instant::from_ticks(ms));
            byte
        }
    }

    impl ByteSource for Scripted {
        fn now(&self) -> Instant {
            self.now
        }

        fn next_byte(&mut self) -> impl Future<Output = u8> {
            core::future::ready(self.take())
        }

        fn next_byte_before(&mut self, deadline: Instant) -> impl Future<Output = Option<u8>> {
            let next = match self.pending.front() {
                Some(&(ms, _)) if Instant::from_ticks(ms) <= deadline => Some(self.take()),
                _ => {
                    self.now = deadline;
                    None
                }
            };
            core::future::ready(next)
        }
    }

    #[test]
    fn stalled_frame_times_out_and_the_next_one_decodes() {
        let mut assembler = FrameAssembler::new();
        let mut source = Scripted::new()
            .at(0, b"QT:1")
            .at(FRAME_TIMEOUT_MS + 40, b"QT:1;c.");

        assert_eq!(
            block_on(receive_frame(&mut assembler, &mut source)),
            Err(ReceiveError::Timeout)
        );
        assert!(assembler.is_idle());
        assert_eq!(source.now(), Instant::from_ticks(FRAME_TIMEOUT_MS));

        assert_eq!(
            block_on(receive_frame(&mut assembler, &mut source)),
            Ok(Command::Start)
        );
        assert!(assembler.is_idle());
    }

    #[test]
    fn deadline_runs_from_the_first_byte() {
        let mut assembler = FrameAssembler::new();
        // Idle time before a frame does not count, a slow but timely frame still decodes
        let mut source = Scripted::new()
            .at(500, b"QT:1;")
            .at(500 + FRAME_TIMEOUT_MS, b"0.");

        assert_eq!(
            block_on(receive_frame(&mut assembler, &mut source)),
            Ok(Command::HeartbeatAck)
        );
    }

    #[test]
    fn overflow_clears_the_assembler() {
        let mut assembler = FrameAssembler::new();
        let mut source = Scripted::new().at(0, &[b'x'; 64]);

        assert_eq!(
            block_on(receive_frame(&mut assembler, &mut source)),
            Err(ReceiveError::Overflow)
        );
        assert!(assembler.is_idle());
    }

    #[test]
    fn failures_map_to_status_events() {
        assert_eq!(StatusEvent::from(ReceiveError::Timeout), StatusEvent::Timeout);
        assert_eq!(StatusEvent::from(ReceiveError::Overflow), StatusEvent::Overflow);
        assert_eq!(
            StatusEvent::from(ReceiveError::Decode(DecodeError::BadHeader)),
            StatusEvent::ErrorReceive
        );
        assert_eq!(
            StatusEvent::from(ReceiveError::Command(CommandError::BadNumber)),
            StatusEvent::ErrorReceive
        );
    }
}
