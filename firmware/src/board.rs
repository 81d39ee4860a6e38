//! Peripherals of the tracer as wired on the Nucleo-F767ZI.

use curve_tracer_core::acquisition::Hardware;
use stm32f7xx_hal::{
    gpio::{Alternate, OpenDrain, Output, Pin},
    i2c::BlockingI2c,
    pac,
    serial,
    spi::{Enabled, Spi},
};

use crate::{
    adc_capture::AdcCapture, bias::BiasDacs, front_end::FrontEnd, gain::DigitalPot,
    sweep_timer::StepTimer,
};

pub const I2C_FREQUENCY_HZ: u32 = 400_000;
/// I2C data timeout.
pub const I2C_TIMEOUT_US: u32 = 10_000;
pub const SPI_FREQUENCY_HZ: u32 = 1_000_000;

pub type I2cBus =
    BlockingI2c<pac::I2C1, Pin<'B', 8, Alternate<4, OpenDrain>>, Pin<'B', 9, Alternate<4, OpenDrain>>>;

pub type SpiBus = Spi<
    pac::SPI1,
    (
        Pin<'B', 3, Alternate<5>>,
        Pin<'B', 4, Alternate<5>>,
        Pin<'B', 5, Alternate<5>>,
    ),
    Enabled<u8>,
>;

pub type PotSelect = Pin<'D', 14, Output>;
pub type AmplifierEnable = Pin<'A', 4, Output>;
pub type Relay = Pin<'E', 2, Output>;
pub type GainSwitch = Pin<'A', 6, Output>;

pub type StatusLed = Pin<'B', 7, Output>;
pub type ErrorLed = Pin<'B', 14, Output>;

pub type SerialTx = serial::Tx<pac::USART3>;
pub type SerialRx = serial::Rx<pac::USART3>;

pub enum Board {}

impl Hardware for Board {
    type Bias = BiasDacs<I2cBus>;
    type FrontEnd = FrontEnd<AmplifierEnable, Relay, GainSwitch>;
    type Gain = DigitalPot<SpiBus, PotSelect>;
    type Capture = AdcCapture;
    type Timer = StepTimer;
}

/// Blinks the error LED forever. Used when the board cannot work at all.
pub fn halt(led: &mut ErrorLed) -> ! {
    loop {
        led.toggle();
        cortex_m::asm::delay(50_000_000);
    }
}
