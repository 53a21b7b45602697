/*! Serialisation of BiDiB messages and sub-bus frames.

A message on the wire is `{length, address stack…0, sequence, opcode,
payload}` with the length octet counting everything after itself. The
same coding is used on the sub-bus (inside a CRC-framed packet) and on
netBiDiB (raw over the stream).
*/

use core::fmt;

mod crc;
mod message;
pub mod subbus;

pub use self::crc::{crc8, crc8_update};
pub use self::message::{unpack_all, Message, MessageList, MAX_PAYLOAD, MESSAGES_PER_PACKET};

/// Parsing of a message or frame failed.
///
/// Either it's malformed, or not supported by this library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Error;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

impl From<bidib_core::addr::Error> for Error {
    fn from(_: bidib_core::addr::Error) -> Error {
        Error
    }
}

pub type Result<T> = core::result::Result<T, Error>;
