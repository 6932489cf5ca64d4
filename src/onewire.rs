//! Adapters from embedded-hal 1.0 pins and delays to the embedded-hal 0.2
//! traits that `one-wire-bus` and `ds18b20` are written against.

use core::cell::RefCell;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use embedded_hal_02::blocking::delay::{DelayMs, DelayUs};
use embedded_hal_02::digital::v2 as digital02;

/// Open-drain data line of the one-wire bus.
///
/// The 0.2 `InputPin` reads through `&self` while the 1.0 one needs
/// `&mut self`, hence the `RefCell`.
pub struct BusPin<P> {
    pin: RefCell<P>,
}

impl<P> BusPin<P>
where
    P: InputPin + OutputPin,
{
    pub fn new(pin: P) -> Self {
        Self {
            pin: RefCell::new(pin),
        }
    }
}

impl<P> digital02::InputPin for BusPin<P>
where
    P: InputPin + OutputPin,
{
    type Error = <P as ErrorType>::Error;

    fn is_high(&self) -> Result<bool, Self::Error> {
        self.pin.borrow_mut().is_high()
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.pin.borrow_mut().is_low()
    }
}

impl<P> digital02::OutputPin for BusPin<P>
where
    P: InputPin + OutputPin,
{
    type Error = <P as ErrorType>::Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.pin.get_mut().set_low()
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.pin.get_mut().set_high()
    }
}

/// Blocking delay usable by the one-wire timing code.
pub struct BusDelay<D>(pub D);

impl<D: DelayNs> DelayUs<u16> for BusDelay<D> {
    fn delay_us(&mut self, us: u16) {
        self.0.delay_us(u32::from(us));
    }
}

impl<D: DelayNs> DelayMs<u16> for BusDelay<D> {
    fn delay_ms(&mut self, ms: u16) {
        self.0.delay_ms(u32::from(ms));
    }
}
