//! MCP41010 digital potentiometer setting the base current gain.

use curve_tracer_core::acquisition::GainSelector;
use embedded_hal::{blocking::spi::Write, digital::v2::OutputPin};

/// Write data to potentiometer 0.
const WRITE_POT0: u8 = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum PotError<S> {
    Spi(S),
    ChipSelect,
}

pub struct DigitalPot<SPI, CS> {
    spi: SPI,
    cs: CS,
}

impl<SPI, CS: OutputPin> DigitalPot<SPI, CS> {
    pub fn new(spi: SPI, mut cs: CS) -> Self {
        let _ = cs.set_high();
        Self { spi, cs }
    }
}

impl<SPI, CS> GainSelector for DigitalPot<SPI, CS>
where
    SPI: Write<u8>,
    CS: OutputPin,
{
    type Error = PotError<SPI::Error>;

    fn set_gain(&mut self, code: u8) -> Result<(), Self::Error> {
        self.cs.set_low().map_err(|_| PotError::ChipSelect)?;
        let written = self.spi.write(&[WRITE_POT0, code]).map_err(PotError::Spi);
        self.cs.set_high().map_err(|_| PotError::ChipSelect)?;
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc, vec::Vec};

    #[derive(Debug, PartialEq)]
    enum Wire {
        Select(bool),
        Data(Vec<u8>),
    }

    type Trace = Rc<RefCell<Vec<Wire>>>;

    struct Spi(Trace);
    struct Cs(Trace);

    impl Write<u8> for Spi {
        type Error = ();

        fn write(&mut self, words: &[u8]) -> Result<(), ()> {
            self.0.borrow_mut().push(Wire::Data(words.to_vec()));
            Ok(())
        }
    }

    impl OutputPin for Cs {
        type Error = core::convert::Infallible;

        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.0.borrow_mut().push(Wire::Select(true));
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.0.borrow_mut().push(Wire::Select(false));
            Ok(())
        }
    }

    #[test]
    fn gain_write_is_framed_by_chip_select() {
        let trace = Trace::default();
        let mut pot = DigitalPot::new(Spi(trace.clone()), Cs(trace.clone()));
        pot.set_gain(42).unwrap();

        assert_eq!(
            *trace.borrow(),
            [
                Wire::Select(false),
                Wire::Select(true),
                Wire::Data(vec![0x11, 42]),
                Wire::Select(false),
            ]
        );
    }
}
