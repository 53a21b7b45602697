/*! Access to the sub-bus transceiver.

The sub-bus runs 9-bit words: the ninth "multiprocessor" bit marks
command (token) bytes. The transceiver is half-duplex wired-AND, so a
device also receives every word it transmits; the link layer uses the
echo for collision detection.
*/

use cfg_if::cfg_if;
use core::fmt;

cfg_if! {
    if #[cfg(feature = "phy-serial")] {
        mod serial;
        pub use self::serial::Serial;
    }
}

#[cfg(any(test, feature = "std"))]
mod loopback;
#[cfg(any(test, feature = "std"))]
pub use self::loopback::Loopback;

/// One 9-bit bus word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Word9(u16);

impl Word9 {
    const COMMAND_BIT: u16 = 0x100;

    /// A plain data word.
    pub const fn data(byte: u8) -> Word9 {
        Word9(byte as u16)
    }

    /// A word with the multiprocessor bit set.
    pub const fn command(byte: u8) -> Word9 {
        Word9(byte as u16 | Self::COMMAND_BIT)
    }

    pub const fn from_raw(raw: u16) -> Word9 {
        Word9(raw & 0x1FF)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn byte(self) -> u8 {
        self.0 as u8
    }

    pub const fn is_command(self) -> bool {
        self.0 & Self::COMMAND_BIT != 0
    }
}

impl fmt::Display for Word9 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{:02X}",
            if self.is_command() { "*" } else { "" },
            self.byte()
        )
    }
}

/// Receive-side fault reported by the transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SerialError {
    Overrun,
    Parity,
    Frame,
    Noise,
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SerialError::Overrun => write!(f, "overrun"),
            SerialError::Parity => write!(f, "parity"),
            SerialError::Frame => write!(f, "frame"),
            SerialError::Noise => write!(f, "noise"),
        }
    }
}

/// Interface to the sub-bus transceiver.
///
/// Both directions are non-blocking; [`nb::Error::WouldBlock`] means
/// no word is pending or the transmitter is busy. Collisions surface
/// as receive errors or as echo mismatches, never as write errors.
pub trait Device {
    /// Take the next received word, the own echo included.
    fn read(&mut self) -> nb::Result<Word9, SerialError>;

    /// Queue one word for transmission.
    fn write(&mut self, word: Word9) -> nb::Result<(), SerialError>;
}
