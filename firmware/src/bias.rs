//! The two MCP4725 DACs biasing the device under test.

use curve_tracer_core::{acquisition::BiasOutput, config::DAC_FULL_SCALE, BiasChannel};
use embedded_hal::blocking::i2c::{Read, Write};

pub const COLLECTOR_ADDRESS: u8 = 0x60;
pub const BASE_ADDRESS: u8 = 0x61;

pub const fn address(channel: BiasChannel) -> u8 {
    match channel {
        BiasChannel::Collector => COLLECTOR_ADDRESS,
        BiasChannel::Base => BASE_ADDRESS,
    }
}

/// Fast mode write: power down bits clear, code in the low 12 bits.
pub const fn fast_write(code: u16) -> [u8; 2] {
    let code = if code > DAC_FULL_SCALE {
        DAC_FULL_SCALE
    } else {
        code
    };
    [(code >> 8) as u8 & 0x0F, code as u8]
}

pub struct BiasDacs<I2C> {
    i2c: I2C,
}

impl<I2C> BiasDacs<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self { i2c }
    }
}

impl<I2C, E> BiasOutput for BiasDacs<I2C>
where
    I2C: Write<Error = E> + Read<Error = E>,
{
    type Error = E;

    fn probe(&mut self, channel: BiasChannel) -> Result<(), E> {
        let mut status = [0u8; 1];
        self.i2c.read(address(channel), &mut status)
    }

    fn write(&mut self, channel: BiasChannel, code: u16) -> Result<(), E> {
        self.i2c.write(address(channel), &fast_write(code))
    }
}
