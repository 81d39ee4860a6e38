//! The sweep state machine.
//!
//! [`Acquisition`] owns everything a sweep touches: the planned ramp, the capture buffer, the
//! sweep timer and the analog front end. The dispatch task plans and arms sweeps, the timer
//! interrupt calls [`Acquisition::on_tick`] and, once the completion signal fired, the
//! dispatch task borrows the captured samples through [`Acquisition::complete`].

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use fugit::MicrosDurationU32;

use crate::config::{
    AMPLIFIER_OFF_SETTLE_CYCLES, AMPLIFIER_ON_SETTLE_CYCLES, ARM_SETTLE_CYCLES, CAPTURE_LEN,
    CAPTURE_SETTLE_CYCLES, GAIN_DISABLED, RAMP_LEN, RELAY_SETTLE_CYCLES, STEP_INTERVAL,
};
use crate::instruction::SweepRequest;
use crate::planner::SweepPlan;
use crate::{BiasChannel, CurveKind, StatusEvent};

/// Memory the ADC samples are written to.
pub type CaptureBuffer = &'static mut [u16; CAPTURE_LEN];

/// Signal posted from interrupt context when a sweep finished.
pub type SweepDone = Signal<CriticalSectionRawMutex, SweepReport>;

/// The two bias DACs.
pub trait BiasOutput {
    type Error;

    /// Checks that the DAC behind `channel` answers on its bus.
    fn probe(&mut self, channel: BiasChannel) -> Result<(), Self::Error>;

    fn write(&mut self, channel: BiasChannel, code: u16) -> Result<(), Self::Error>;
}

/// Amplifier, relay and gain switch conditioning the analog path.
pub trait FrontEndGate {
    fn set_amplifier(&mut self, enabled: bool);

    /// Switches the measurement relay to the path of `kind`. Takes a while to settle.
    fn set_relay(&mut self, kind: CurveKind);

    /// Switches the current sense gain path to `kind`. Takes a while to settle.
    fn set_gain_switch(&mut self, kind: CurveKind);

    /// Busy-waits roughly `cycles` core clock cycles.
    fn settle(&mut self, cycles: u32);
}

/// Digital potentiometer setting the gain of the base current measurement.
pub trait GainSelector {
    type Error;

    fn set_gain(&mut self, code: u8) -> Result<(), Self::Error>;
}

/// DMA engine moving free-running ADC conversions into a [`CaptureBuffer`].
pub trait CaptureTransport {
    /// Starts the ADC on the channel pair of `kind`, sampling into `buffer` until it is full
    /// or [`CaptureTransport::stop`] is called.
    fn start(&mut self, buffer: CaptureBuffer, kind: CurveKind);

    /// Halts the ADC and the DMA stream, returning the buffer if one was in flight.
    fn stop(&mut self) -> Option<CaptureBuffer>;

    /// Drops stale conversions and clears pending transfer flags.
    fn drain(&mut self);

    fn is_armed(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerUnavailable;

/// The periodic timer pacing the sweep.
pub trait SweepTimer {
    fn start(&mut self, interval: MicrosDurationU32) -> Result<(), TimerUnavailable>;

    fn stop(&mut self);

    /// Clears the pending tick so the interrupt does not fire again right away.
    fn acknowledge(&mut self);
}

/// Types making up the hardware a sweep runs on.
pub trait Hardware {
    type Bias: BiasOutput;
    type FrontEnd: FrontEndGate;
    type Gain: GainSelector;
    type Capture: CaptureTransport;
    type Timer: SweepTimer;
}

pub struct Peripherals<H: Hardware> {
    pub bias: H::Bias,
    pub front_end: H::FrontEnd,
    pub gain: H::Gain,
    pub capture: H::Capture,
    pub timer: H::Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SweepState {
    Idle,
    Arming,
    /// Ticking, the value is the next ramp index to drive.
    Running(u16),
    /// The capture finished and waits to be collected.
    Draining,
    /// The samples are lent out for transmission.
    Complete,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SweepError {
    /// Another sweep owns the buffer or the timer.
    Busy,
    /// Nothing was planned to start.
    NotLoaded,
    /// A bias DAC did not answer while arming.
    Hardware,
    TimerUnavailable,
    /// The host stopped answering heartbeats.
    LinkDown,
    /// No finished capture to collect.
    NoCapture,
}

impl From<SweepError> for StatusEvent {
    fn from(value: SweepError) -> Self {
        match value {
            // The host is not listening, only the LEDs can tell
            SweepError::LinkDown => StatusEvent::Disconnect,
            SweepError::Busy
            | SweepError::NotLoaded
            | SweepError::Hardware
            | SweepError::TimerUnavailable
            | SweepError::NoCapture => StatusEvent::ErrorGeneric,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepOutcome {
    Continue,
    Stop,
}

/// Summary posted with the completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SweepReport {
    pub kind: CurveKind,
    pub steps: u16,
    /// Bus writes that failed while ticking.
    pub bus_faults: u16,
}

/// Samples of a finished sweep, lent out until passed back to [`Acquisition::release`].
pub struct Capture {
    kind: CurveKind,
    buffer: CaptureBuffer,
}

impl Capture {
    pub fn kind(&self) -> CurveKind {
        self.kind
    }

    pub fn samples(&self) -> &[u16] {
        &self.buffer[..]
    }
}

pub struct Acquisition<H: Hardware> {
    hw: Peripherals<H>,
    state: SweepState,
    plan: Option<SweepPlan>,
    buffer: Option<CaptureBuffer>,
    done: &'static SweepDone,
    bus_faults: u16,
}

impl<H: Hardware> Acquisition<H> {
    pub fn new(hw: Peripherals<H>, buffer: CaptureBuffer, done: &'static SweepDone) -> Self {
        Self {
            hw,
            state: SweepState::Idle,
            plan: None,
            buffer: Some(buffer),
            done,
            bus_faults: 0,
        }
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    /// The request that the next [`Acquisition::arm`] will run.
    pub fn planned(&self) -> Option<&SweepRequest> {
        self.plan.as_ref().map(|plan| &plan.request)
    }

    /// True while a sweep owns the timer, the ramp or the capture buffer.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            SweepState::Arming
                | SweepState::Running(_)
                | SweepState::Draining
                | SweepState::Complete
        )
    }

    /// Plans the ramp of the next sweep.
    pub fn load(&mut self, request: SweepRequest) -> Result<(), SweepError> {
        if self.is_busy() {
            return Err(SweepError::Busy);
        }

        self.plan = Some(SweepPlan::new(request));
        Ok(())
    }

    /// Arms the planned sweep in one go, spinning while the relays settle.
    pub fn arm(&mut self) -> Result<CurveKind, SweepError> {
        self.begin_arm()?;
        self.hw.front_end.settle(RELAY_SETTLE_CYCLES);
        self.switch_gain_path();
        self.hw.front_end.settle(RELAY_SETTLE_CYCLES);
        self.finish_arm()
    }

    /// Claims the planned sweep, powers the amplifier and switches the relay.
    ///
    /// Arming continues with [`Acquisition::switch_gain_path`] and ends with
    /// [`Acquisition::finish_arm`], each once the previous switch settled. The caller can
    /// sleep in between, nothing else touches the front end while the state is
    /// [`SweepState::Arming`].
    pub fn begin_arm(&mut self) -> Result<CurveKind, SweepError> {
        if self.is_busy() {
            return Err(SweepError::Busy);
        }
        let kind = match &self.plan {
            Some(plan) => plan.request.kind,
            None => return Err(SweepError::NotLoaded),
        };
        let Some(buffer) = self.buffer.as_deref_mut() else {
            return Err(SweepError::Busy);
        };

        self.state = SweepState::Arming;
        self.bus_faults = 0;
        buffer.fill(0);

        self.hw.front_end.set_amplifier(true);
        self.hw.front_end.settle(AMPLIFIER_ON_SETTLE_CYCLES);
        self.hw.front_end.set_relay(kind);
        Ok(kind)
    }

    /// Second arming step, does nothing unless arming.
    pub fn switch_gain_path(&mut self) {
        if let Some(kind) = self.arming_kind() {
            self.hw.front_end.set_gain_switch(kind);
        }
    }

    /// Last arming step: checks the swept DAC answers and starts the sweep timer.
    pub fn finish_arm(&mut self) -> Result<CurveKind, SweepError> {
        let Some(kind) = self.arming_kind() else {
            return Err(if self.is_busy() {
                SweepError::Busy
            } else {
                SweepError::NotLoaded
            });
        };

        if self.hw.bias.probe(kind.swept_channel()).is_err() {
            self.fault();
            return Err(SweepError::Hardware);
        }

        if kind == CurveKind::Vbe {
            if self.hw.bias.write(BiasChannel::Collector, 0).is_err() {
                self.fault();
                return Err(SweepError::Hardware);
            }
            self.hw.front_end.settle(ARM_SETTLE_CYCLES);
        }

        if self.hw.timer.start(STEP_INTERVAL).is_err() {
            self.gate_off(kind);
            self.state = SweepState::Idle;
            return Err(SweepError::TimerUnavailable);
        }

        self.state = SweepState::Running(0);
        Ok(kind)
    }

    fn arming_kind(&self) -> Option<CurveKind> {
        match (self.state, &self.plan) {
            (SweepState::Arming, Some(plan)) => Some(plan.request.kind),
            _ => None,
        }
    }

    /// Timer interrupt entry point.
    pub fn on_tick(&mut self) -> StepOutcome {
        self.hw.timer.acknowledge();

        match self.state {
            SweepState::Running(index) => self.step(index),
            _ => {
                // Stray tick, nothing is sweeping
                self.hw.timer.stop();
                StepOutcome::Stop
            }
        }
    }

    /// Drives ramp entry `index` and opens the capture window on the first one.
    ///
    /// Runs in interrupt context: never blocks beyond the bus transaction and never fails, bus
    /// errors are only counted.
    fn step(&mut self, index: u16) -> StepOutcome {
        let Some(plan) = &self.plan else {
            self.fault();
            self.hw.timer.stop();
            return StepOutcome::Stop;
        };
        let request = plan.request;
        let code = plan.ramp[usize::from(index)];

        if self.hw.bias.write(request.kind.swept_channel(), code).is_err() {
            self.bus_faults = self.bus_faults.saturating_add(1);
        }

        if index == 0 {
            if let Some(stale) = self.hw.capture.stop() {
                self.buffer = Some(stale);
            }
            self.hw.capture.drain();

            if request.kind == CurveKind::Vce && self.hw.gain.set_gain(request.gain).is_err() {
                self.bus_faults = self.bus_faults.saturating_add(1);
            }
            self.hw.front_end.settle(CAPTURE_SETTLE_CYCLES);

            if let Some(buffer) = self.buffer.take() {
                self.hw.capture.start(buffer, request.kind);
            }
        }

        let next = index + 1;
        if usize::from(next) >= RAMP_LEN {
            self.finish(request.kind, next);
            StepOutcome::Stop
        } else {
            self.state = SweepState::Running(next);
            StepOutcome::Continue
        }
    }

    fn finish(&mut self, kind: CurveKind, steps: u16) {
        self.state = SweepState::Draining;

        if let Some(buffer) = self.hw.capture.stop() {
            self.buffer = Some(buffer);
        }
        self.hw.capture.drain();
        self.gate_off(kind);
        self.hw.timer.stop();

        if self.buffer.is_none() {
            self.state = SweepState::Faulted;
        }

        self.done.signal(SweepReport {
            kind,
            steps,
            bus_faults: self.bus_faults,
        });
    }

    /// Collects the samples of the finished sweep.
    pub fn complete(&mut self) -> Result<Capture, SweepError> {
        if self.state != SweepState::Draining || self.hw.capture.is_armed() {
            return Err(SweepError::NoCapture);
        }
        let kind = match &self.plan {
            Some(plan) => plan.request.kind,
            None => return Err(SweepError::NoCapture),
        };
        let buffer = self.buffer.take().ok_or(SweepError::NoCapture)?;

        self.state = SweepState::Complete;
        Ok(Capture { kind, buffer })
    }

    /// Takes the samples back after transmission, making the next sweep possible.
    pub fn release(&mut self, capture: Capture) {
        self.buffer = Some(capture.buffer);
        if self.state == SweepState::Complete {
            self.state = SweepState::Idle;
        }
    }

    /// Leaves the bias at zero and the amplifier off.
    fn gate_off(&mut self, kind: CurveKind) {
        let mut failed = self.hw.bias.write(BiasChannel::Collector, 0).is_err();
        if kind == CurveKind::Vbe {
            failed |= self.hw.bias.write(BiasChannel::Base, 0).is_err();
        }
        if failed {
            self.bus_faults = self.bus_faults.saturating_add(1);
        }

        self.hw.front_end.set_amplifier(false);
        self.hw.front_end.settle(AMPLIFIER_OFF_SETTLE_CYCLES);

        if kind == CurveKind::Vce && self.hw.gain.set_gain(GAIN_DISABLED).is_err() {
            self.bus_faults = self.bus_faults.saturating_add(1);
        }
    }

    fn fault(&mut self) {
        let _ = self.hw.bias.write(BiasChannel::Collector, 0);
        let _ = self.hw.bias.write(BiasChannel::Base, 0);
        self.hw.front_end.set_amplifier(false);
        self.state = SweepState::Faulted;
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{acquisition, Event};
    use super::*;

    fn vce(gain: u8) -> SweepRequest {
        SweepRequest {
            kind: CurveKind::Vce,
            amplitude_tenths: 50,
            gain,
            sample_count: 10,
        }
    }

    fn run_to_end(acq: &mut Acquisition<mock::Mock>) -> usize {
        let mut ticks = 1;
        while acq.on_tick() == StepOutcome::Continue {
            ticks += 1;
        }
        ticks
    }

    #[test]
    fn vce_sweep_lifecycle() {
        let (mut acq, log, done) = acquisition();

        acq.load(vce(7)).unwrap();
        assert_eq!(acq.state(), SweepState::Idle);
        assert_eq!(acq.arm(), Ok(CurveKind::Vce));
        assert_eq!(acq.state(), SweepState::Running(0));
        assert_eq!(
            log.borrow().events,
            [
                Event::Amplifier(true),
                Event::Relay(CurveKind::Vce),
                Event::GainSwitch(CurveKind::Vce),
                Event::TimerStart
            ]
        );

        assert_eq!(run_to_end(&mut acq), RAMP_LEN);
        assert_eq!(acq.state(), SweepState::Draining);
        assert_eq!(
            done.try_take(),
            Some(SweepReport {
                kind: CurveKind::Vce,
                steps: RAMP_LEN as u16,
                bus_faults: 0,
            })
        );

        let log = log.borrow();
        let events = &log.events;
        let ramp: Vec<u16> = events
            .iter()
            .filter_map(|e| match e {
                Event::Bias(BiasChannel::Collector, code) => Some(*code),
                _ => None,
            })
            .collect();
        // every ramp entry, then zero when gating off
        assert_eq!(ramp.len(), RAMP_LEN + 1);
        assert_eq!(ramp[RAMP_LEN - 1], 4095);
        assert_eq!(ramp[RAMP_LEN], 0);

        assert!(events.contains(&Event::Gain(7)));
        assert_eq!(events.last(), Some(&Event::TimerStop));
        assert!(events.ends_with(&[
            Event::CaptureStop,
            Event::Drain,
            Event::Bias(BiasChannel::Collector, 0),
            Event::Amplifier(false),
            Event::Gain(GAIN_DISABLED),
            Event::TimerStop,
        ]));
    }

    #[test]
    fn first_tick_opens_capture_window_once() {
        let (mut acq, log, _) = acquisition();
        acq.load(vce(3)).unwrap();
        acq.arm().unwrap();

        acq.on_tick();
        {
            let log = log.borrow();
            let events = &log.events;
            let first_tick = &events[4..];
            assert_eq!(
                first_tick,
                [
                    Event::Bias(BiasChannel::Collector, 0),
                    Event::CaptureStop,
                    Event::Drain,
                    Event::Gain(3),
                    Event::CaptureStart(CurveKind::Vce),
                ]
            );
        }
        assert!(acq.hw.capture.is_armed());

        run_to_end(&mut acq);
        let starts = log
            .borrow()
            .events
            .iter()
            .filter(|e| matches!(e, Event::CaptureStart(_)))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn vbe_sweep_zeroes_collector_and_skips_gain() {
        let (mut acq, log, done) = acquisition();
        acq.load(SweepRequest::vbe()).unwrap();
        assert_eq!(acq.arm(), Ok(CurveKind::Vbe));

        assert_eq!(
            log.borrow().events,
            [
                Event::Amplifier(true),
                Event::Relay(CurveKind::Vbe),
                Event::GainSwitch(CurveKind::Vbe),
                Event::Bias(BiasChannel::Collector, 0),
                Event::TimerStart
            ]
        );

        run_to_end(&mut acq);
        assert_eq!(done.try_take().map(|r| r.kind), Some(CurveKind::Vbe));

        let log = log.borrow();
        let events = &log.events;
        assert!(!events.iter().any(|e| matches!(e, Event::Gain(_))));
        assert!(events.contains(&Event::Bias(BiasChannel::Base, 1241)));
        assert!(events.ends_with(&[
            Event::Bias(BiasChannel::Collector, 0),
            Event::Bias(BiasChannel::Base, 0),
            Event::Amplifier(false),
            Event::TimerStop,
        ]));
    }

    #[test]
    fn second_start_is_rejected_while_sweeping() {
        let (mut acq, log, _) = acquisition();
        acq.load(vce(1)).unwrap();
        acq.arm().unwrap();
        for _ in 0..10 {
            acq.on_tick();
        }
        let snapshot = acq.plan.clone();
        let events_before = log.borrow().events.len();

        assert_eq!(acq.arm(), Err(SweepError::Busy));
        assert_eq!(acq.load(vce(9)), Err(SweepError::Busy));

        assert_eq!(acq.state(), SweepState::Running(10));
        assert_eq!(acq.plan, snapshot);
        assert_eq!(log.borrow().events.len(), events_before);
        assert!(acq.hw.capture.is_armed());
    }

    #[test]
    fn capture_is_lent_until_released() {
        let (mut acq, _, _) = acquisition();
        acq.load(vce(1)).unwrap();

        assert_eq!(acq.complete().err(), Some(SweepError::NoCapture));

        acq.arm().unwrap();
        assert_eq!(acq.complete().err(), Some(SweepError::NoCapture));
        run_to_end(&mut acq);

        let capture = acq.complete().unwrap();
        assert_eq!(acq.state(), SweepState::Complete);
        assert_eq!(capture.kind(), CurveKind::Vce);
        assert_eq!(capture.samples().len(), CAPTURE_LEN);
        assert_eq!(capture.samples()[5], 5);

        // Still busy until the samples are back
        assert_eq!(acq.arm(), Err(SweepError::Busy));
        assert_eq!(acq.complete().err(), Some(SweepError::NoCapture));

        acq.release(capture);
        assert_eq!(acq.state(), SweepState::Idle);
        assert_eq!(acq.arm(), Ok(CurveKind::Vce));
    }

    #[test]
    fn arm_clears_previous_samples() {
        let (mut acq, _, _) = acquisition();
        acq.load(vce(1)).unwrap();
        acq.arm().unwrap();
        run_to_end(&mut acq);
        let capture = acq.complete().unwrap();
        acq.release(capture);

        acq.arm().unwrap();
        assert!(acq.buffer.as_ref().unwrap().iter().all(|&s| s == 0));
    }

    #[test]
    fn start_without_plan() {
        let (mut acq, log, _) = acquisition();
        assert_eq!(acq.arm(), Err(SweepError::NotLoaded));
        assert_eq!(acq.state(), SweepState::Idle);
        assert!(log.borrow().events.is_empty());
    }

    #[test]
    fn unresponsive_dac_faults_the_sweep() {
        let (mut acq, log, _) = acquisition();
        acq.load(vce(1)).unwrap();
        log.borrow_mut().bias_fails = true;

        assert_eq!(acq.arm(), Err(SweepError::Hardware));
        assert_eq!(acq.state(), SweepState::Faulted);
        assert!(!log.borrow().events.contains(&Event::TimerStart));
        assert_eq!(log.borrow().events.last(), Some(&Event::Amplifier(false)));

        // The next attempt starts over
        log.borrow_mut().bias_fails = false;
        assert_eq!(acq.arm(), Ok(CurveKind::Vce));
    }

    #[test]
    fn timer_failure_leaves_idle() {
        let (mut acq, log, _) = acquisition();
        acq.load(vce(1)).unwrap();
        log.borrow_mut().timer_fails = true;

        assert_eq!(acq.arm(), Err(SweepError::TimerUnavailable));
        assert_eq!(acq.state(), SweepState::Idle);
        assert!(log.borrow().events.contains(&Event::Amplifier(false)));
    }

    #[test]
    fn phased_arming_leaves_relay_settling_to_the_caller() {
        let (mut acq, log, _) = acquisition();
        acq.load(vce(2)).unwrap();

        assert_eq!(acq.begin_arm(), Ok(CurveKind::Vce));
        assert_eq!(acq.state(), SweepState::Arming);
        assert_eq!(
            log.borrow().events,
            [Event::Amplifier(true), Event::Relay(CurveKind::Vce)]
        );

        // Nothing else may start while the relay settles
        assert_eq!(acq.begin_arm(), Err(SweepError::Busy));
        assert_eq!(acq.load(vce(9)), Err(SweepError::Busy));

        acq.switch_gain_path();
        assert_eq!(acq.finish_arm(), Ok(CurveKind::Vce));
        assert_eq!(acq.state(), SweepState::Running(0));
        assert_eq!(
            log.borrow().events[2..],
            [Event::GainSwitch(CurveKind::Vce), Event::TimerStart]
        );
        assert!(log.borrow().settled < RELAY_SETTLE_CYCLES);

        // Arming steps out of order do nothing
        acq.switch_gain_path();
        assert_eq!(acq.finish_arm(), Err(SweepError::Busy));
        assert_eq!(log.borrow().events.len(), 4);
    }

    #[test]
    fn finish_arm_needs_begin_arm() {
        let (mut acq, log, _) = acquisition();
        acq.load(vce(2)).unwrap();
        acq.switch_gain_path();
        assert_eq!(acq.finish_arm(), Err(SweepError::NotLoaded));
        assert_eq!(acq.state(), SweepState::Idle);
        assert!(log.borrow().events.is_empty());
    }

    #[test]
    fn refused_start_on_a_dead_link_is_not_reported_to_the_host() {
        assert_eq!(
            StatusEvent::from(SweepError::LinkDown),
            StatusEvent::Disconnect
        );
        assert_eq!(StatusEvent::from(SweepError::LinkDown).report(), None);
        assert_eq!(StatusEvent::from(SweepError::Busy), StatusEvent::ErrorGeneric);
        assert_eq!(
            StatusEvent::from(SweepError::Hardware).report(),
            Some("c,Error")
        );
    }

    #[test]
    fn stray_tick_stops_timer() {
        let (mut acq, log, done) = acquisition();
        assert_eq!(acq.on_tick(), StepOutcome::Stop);
        assert_eq!(log.borrow().events, [Event::TimerStop]);
        assert_eq!(done.try_take(), None);
    }
}
