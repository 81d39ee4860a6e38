use curve_tracer_core::{acquisition::FrontEndGate, CurveKind};
use embedded_hal::digital::v2::{OutputPin, PinState};

/// Amplifier enable, relay and gain switch of the analog front end.
pub struct FrontEnd<AMP, RELAY, SWITCH> {
    amplifier: AMP,
    relay: RELAY,
    gain_switch: SWITCH,
}

impl<AMP, RELAY, SWITCH> FrontEnd<AMP, RELAY, SWITCH>
where
    AMP: OutputPin,
    RELAY: OutputPin,
    SWITCH: OutputPin,
{
    /// Takes the pins with the amplifier off and the VCE routing selected.
    pub fn new(mut amplifier: AMP, mut relay: RELAY, mut gain_switch: SWITCH) -> Self {
        let _ = amplifier.set_low();
        let _ = relay.set_low();
        let _ = gain_switch.set_low();

        Self {
            amplifier,
            relay,
            gain_switch,
        }
    }
}

/// Pin level of relay and gain switch for a curve.
pub const fn routing(kind: CurveKind) -> PinState {
    match kind {
        CurveKind::Vce => PinState::Low,
        CurveKind::Vbe => PinState::High,
    }
}

impl<AMP, RELAY, SWITCH> FrontEndGate for FrontEnd<AMP, RELAY, SWITCH>
where
    AMP: OutputPin,
    RELAY: OutputPin,
    SWITCH: OutputPin,
{
    fn set_amplifier(&mut self, enabled: bool) {
        let _ = self.amplifier.set_state(PinState::from(enabled));
    }

    fn set_relay(&mut self, kind: CurveKind) {
        let _ = self.relay.set_state(routing(kind));
    }

    fn set_gain_switch(&mut self, kind: CurveKind) {
        let _ = self.gain_switch.set_state(routing(kind));
    }

    fn settle(&mut self, cycles: u32) {
        cortex_m::asm::delay(cycles);
    }
}
