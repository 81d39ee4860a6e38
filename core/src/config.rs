//! Compile-time configuration of the tracer.
//!
//! Everything the firmware needs to agree on with the far end of the link, or with the analog
//! front end, lives here. Pin assignments and bus addresses are board specific and live in the
//! firmware crate instead.

use fugit::{MicrosDurationU32, MillisDurationU64, TimerInstantU64};

/// Total duration of one sweep.
pub const SWEEP_PERIOD_US: u32 = 40_000;
/// Period of the sweep timer, one ramp entry per tick.
pub const STEP_INTERVAL_US: u32 = 200;
pub const STEP_INTERVAL: MicrosDurationU32 = MicrosDurationU32::from_ticks(STEP_INTERVAL_US);
/// Number of entries in a ramp, both ends included.
pub const RAMP_LEN: usize = (SWEEP_PERIOD_US / STEP_INTERVAL_US) as usize + 1;

/// Highest code accepted by the 12-bit bias DACs.
pub const DAC_FULL_SCALE: u16 = 4095;
/// VCE amplitude (in tenths of a volt) that maps onto the full DAC range.
pub const VCE_FULL_SCALE_TENTHS: u16 = 50;
/// Fraction of the DAC range the base bias ramps up to for a VBE curve.
pub const VBE_TARGET_FRACTION: f32 = 0.3030;

/// Samples captured per sweep, two interleaved ADC channels.
pub const CAPTURE_LEN: usize = 19_100;

/// Potentiometer code that leaves the gain stage disabled (maximum resistance).
pub const GAIN_DISABLED: u8 = 255;

/// Busy-wait cycles after enabling the amplifier.
pub const AMPLIFIER_ON_SETTLE_CYCLES: u32 = 1_000;
/// Busy-wait cycles after gating the amplifier off.
pub const AMPLIFIER_OFF_SETTLE_CYCLES: u32 = 100;
/// Busy-wait cycles around each relay or gain switch transition.
pub const RELAY_SETTLE_CYCLES: u32 = 1_000_000;
/// Relay settle time when the caller can sleep instead of spinning.
pub const RELAY_SETTLE_MS: u64 = 5;
/// Busy-wait cycles after zeroing the collector bias before a VBE sweep.
pub const ARM_SETTLE_CYCLES: u32 = 100;
/// Busy-wait cycles between applying the gain and opening the capture window.
pub const CAPTURE_SETTLE_CYCLES: u32 = 50;

/// Largest inbound frame, terminator included.
pub const RX_FRAME_CAPACITY: usize = 50;
/// Largest argument of an inbound instruction.
pub const ARG_CAPACITY: usize = 40;
/// Time allowed between the first byte of a frame and its terminator.
pub const FRAME_TIMEOUT_MS: u64 = 10;
pub const FRAME_TIMEOUT: MillisDurationU64 = MillisDurationU64::from_ticks(FRAME_TIMEOUT_MS);

/// Point in time on the millisecond tick of the firmware's monotonic clock.
pub type Instant = TimerInstantU64<1_000>;

pub const INSTRUCTION_QUEUE_LEN: usize = 2;
pub const STATUS_QUEUE_LEN: usize = 10;

pub const HEARTBEAT_PERIOD_MS: u64 = 1_000;
pub const HEARTBEAT_ACK_TIMEOUT_MS: u64 = 100;
/// Consecutive unacknowledged heartbeats before the link counts as lost.
pub const DISCONNECT_AFTER_MISSES: u16 = 1;

/// Toggles of the error LED for a generic error, an even count leaves it off.
pub const ERROR_FLASH_TOGGLES: u8 = 10;
pub const ERROR_FLASH_INTERVAL_MS: u64 = 10;
