//! Typed commands built from decoded [`Instruction`]s.

use crate::config::{GAIN_DISABLED, VCE_FULL_SCALE_TENTHS};
use crate::frame::Instruction;
use crate::CurveKind;

const ARG_DELIMITER: char = '-';

/// Parameters of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SweepRequest {
    pub kind: CurveKind,
    /// Collector sweep amplitude in tenths of a volt, only used for VCE curves.
    pub amplitude_tenths: u16,
    /// Digital potentiometer code applied while capturing, only used for VCE curves.
    pub gain: u8,
    /// Number of sweeps the host averages. Logged only, every sweep is captured and sent.
    pub sample_count: u8,
}

impl SweepRequest {
    /// Parses the `<amplitude_tenths>-<gain>-<sample_count>` argument of a VCE request.
    pub fn parse_vce(arg: &str) -> Result<Self, CommandError> {
        let mut fields = arg.split(ARG_DELIMITER);
        let mut next = || fields.next().ok_or(CommandError::MissingField);

        let amplitude_tenths: u16 = next()?.parse().map_err(|_| CommandError::BadNumber)?;
        let gain: u8 = next()?.parse().map_err(|_| CommandError::BadNumber)?;
        let sample_count: u8 = next()?.parse().map_err(|_| CommandError::BadNumber)?;

        if fields.next().is_some() {
            return Err(CommandError::TrailingField);
        }
        if amplitude_tenths > VCE_FULL_SCALE_TENTHS {
            return Err(CommandError::AmplitudeOutOfRange);
        }

        Ok(Self {
            kind: CurveKind::Vce,
            amplitude_tenths,
            gain,
            sample_count,
        })
    }

    /// A VBE request; the base ramp is fixed and the gain stage stays disabled.
    pub const fn vbe() -> Self {
        Self {
            kind: CurveKind::Vbe,
            amplitude_tenths: 0,
            gain: GAIN_DISABLED,
            sample_count: 0,
        }
    }
}

/// Everything the host can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// `0`: answer to our heartbeat.
    HeartbeatAck,
    /// `a`: plan a VCE sweep.
    LoadVce(SweepRequest),
    /// `b`: plan a VBE sweep.
    LoadVbe(SweepRequest),
    /// `c`: start the planned sweep.
    Start,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    UnknownCommand(char),
    MissingField,
    TrailingField,
    BadNumber,
    AmplitudeOutOfRange,
}

impl TryFrom<&Instruction> for Command {
    type Error = CommandError;

    fn try_from(instruction: &Instruction) -> Result<Self, Self::Error> {
        match instruction.cmd {
            '0' => Ok(Command::HeartbeatAck),
            'a' => SweepRequest::parse_vce(&instruction.arg).map(Command::LoadVce),
            'b' => Ok(Command::LoadVbe(SweepRequest::vbe())),
            'c' => Ok(Command::Start),
            other => Err(CommandError::UnknownCommand(other)),
        }
    }
}
