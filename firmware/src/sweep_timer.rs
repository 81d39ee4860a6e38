use curve_tracer_core::acquisition::{SweepTimer, TimerUnavailable};
use fugit::MicrosDurationU32;
use stm32f7xx_hal::{
    pac,
    rcc::Clocks,
    timer::{CounterUs, Event, TimerExt},
};

/// TIM3 in up-counting mode, raising its update interrupt once per sweep step.
pub struct StepTimer {
    counter: CounterUs<pac::TIM3>,
}

impl StepTimer {
    pub fn new(tim3: pac::TIM3, clocks: &Clocks) -> Self {
        let mut counter = tim3.counter_us(clocks);
        counter.listen(Event::Update);

        Self { counter }
    }
}

impl SweepTimer for StepTimer {
    fn start(&mut self, interval: MicrosDurationU32) -> Result<(), TimerUnavailable> {
        self.counter.start(interval).map_err(|e| {
            defmt::error!("Sweep timer refused {}: {}", interval, defmt::Debug2Format(&e));
            TimerUnavailable
        })
    }

    fn stop(&mut self) {
        // Fails only when already stopped
        let _ = self.counter.cancel();
    }

    fn acknowledge(&mut self) {
        self.counter.clear_interrupt(Event::Update);
    }
}
