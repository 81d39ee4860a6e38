#![cfg_attr(not(test), no_std)]

pub mod acquisition;
pub mod config;
pub mod dispatch;
pub mod frame;
pub mod heartbeat;
pub mod instruction;
pub mod planner;
pub mod receive;

/// Which transistor characteristic a sweep traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CurveKind {
    /// Output characteristic, the collector bias is swept.
    Vce,
    /// Input characteristic, the base bias is swept.
    Vbe,
}

impl CurveKind {
    /// The DAC channel driven by the ramp.
    pub const fn swept_channel(self) -> BiasChannel {
        match self {
            CurveKind::Vce => BiasChannel::Collector,
            CurveKind::Vbe => BiasChannel::Base,
        }
    }

    /// Byte identifying the curve in a reply frame.
    pub const fn tag(self) -> u8 {
        match self {
            CurveKind::Vce => b'e',
            CurveKind::Vbe => b'f',
        }
    }
}

/// One of the two bias DAC outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BiasChannel {
    Collector,
    Base,
}

/// Events posted to the status channel.
///
/// Consuming these never feeds back into the acquisition state, they exist for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StatusEvent {
    ErrorGeneric = 0,
    Ok = 1,
    Transmit = 2,
    Receive = 3,
    Timeout = 4,
    Overflow = 5,
    ErrorReceive = 6,
    Disconnect = 7,
}

impl StatusEvent {
    /// Text sent to the far end for this event, if it is reported over the link at all.
    pub const fn report(self) -> Option<&'static str> {
        match self {
            StatusEvent::ErrorGeneric => Some("c,Error"),
            StatusEvent::Timeout => Some("c,Timeout"),
            StatusEvent::Overflow => Some("c,Overflow"),
            StatusEvent::ErrorReceive => Some("c,ErrorReceive"),
            StatusEvent::Ok
            | StatusEvent::Transmit
            | StatusEvent::Receive
            | StatusEvent::Disconnect => None,
        }
    }

    pub const fn is_fault(self) -> bool {
        matches!(
            self,
            StatusEvent::ErrorGeneric
                | StatusEvent::Timeout
                | StatusEvent::Overflow
                | StatusEvent::ErrorReceive
                | StatusEvent::Disconnect
        )
    }
}

/// Payload of the liveness frame sent by the heartbeat task.
pub const HEARTBEAT_TEXT: &str = "c,0";
