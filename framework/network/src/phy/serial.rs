use core::cell::RefCell;
use core::fmt::Debug;

use embedded_hal_nb::serial;
use rclite::Rc;

use super::{Device, SerialError, Word9};

/// An embedded-hal serial driver wrapper.
///
/// The driver must run the UART in 9-bit mode and expose the words as
/// `u16`, the multiprocessor bit at bit 8.
#[derive(Debug)]
pub struct Serial<D>
where
    D: serial::Read<u16> + serial::Write<u16>,
{
    lower: Rc<RefCell<D>>,
}

impl<D> Serial<D>
where
    D: serial::Read<u16> + serial::Write<u16>,
{
    /// Creates a serial device, bound to the given driver.
    pub fn new(driver: D) -> Self {
        Serial {
            lower: Rc::new(RefCell::new(driver)),
        }
    }
}

fn map_error<E: serial::Error>(err: E) -> SerialError {
    match err.kind() {
        serial::ErrorKind::Overrun => SerialError::Overrun,
        serial::ErrorKind::Parity => SerialError::Parity,
        serial::ErrorKind::FrameFormat => SerialError::Frame,
        serial::ErrorKind::Noise => SerialError::Noise,
        _ => SerialError::Frame,
    }
}

impl<D> Device for Serial<D>
where
    D: serial::Read<u16> + serial::Write<u16>,
{
    fn read(&mut self) -> nb::Result<Word9, SerialError> {
        let mut lower = self.lower.borrow_mut();
        match lower.read() {
            Ok(raw) => Ok(Word9::from_raw(raw)),
            Err(nb::Error::WouldBlock) => Err(nb::Error::WouldBlock),
            Err(nb::Error::Other(err)) => Err(nb::Error::Other(map_error(err))),
        }
    }

    fn write(&mut self, word: Word9) -> nb::Result<(), SerialError> {
        let mut lower = self.lower.borrow_mut();
        match lower.write(word.raw()) {
            Ok(()) => Ok(()),
            Err(nb::Error::WouldBlock) => Err(nb::Error::WouldBlock),
            Err(nb::Error::Other(err)) => Err(nb::Error::Other(map_error(err))),
        }
    }
}
