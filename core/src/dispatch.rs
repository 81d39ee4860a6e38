//! Applying host commands to the acquisition.

use crate::acquisition::{Acquisition, Hardware, SweepError};
use crate::instruction::{Command, SweepRequest};
use crate::CurveKind;

/// What a command did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Dispatched {
    HeartbeatAck,
    Loaded(SweepRequest),
    /// The relay is switching. Arming goes on with [`Acquisition::switch_gain_path`] and
    /// [`Acquisition::finish_arm`] once it settled.
    Arming(CurveKind),
}

/// Applies `command`. Starting a sweep requires a live link, there would be nobody to send
/// the capture to otherwise.
pub fn dispatch<H: Hardware>(
    command: Command,
    acquisition: &mut Acquisition<H>,
    link_up: bool,
) -> Result<Dispatched, SweepError> {
    match command {
        Command::HeartbeatAck => Ok(Dispatched::HeartbeatAck),
        Command::LoadVce(request) | Command::LoadVbe(request) => {
            acquisition.load(request)?;
            Ok(Dispatched::Loaded(request))
        }
        Command::Start if !link_up => Err(SweepError::LinkDown),
        Command::Start => acquisition.begin_arm().map(Dispatched::Arming),
    }
}
