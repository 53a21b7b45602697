use num_enum::{FromPrimitive, IntoPrimitive};

/// Week day in the model clock broadcast.
#[derive(FromPrimitive, IntoPrimitive, Debug, Clone, PartialEq, Eq, Copy, Default)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Weekday {
    #[default]
    Monday = 0,
    Tuesday = 1,
    Wednesday = 2,
    Thursday = 3,
    Friday = 4,
    Saturday = 5,
    Sunday = 6,
}

/// The accelerated layout time distributed with `SysClock`.
///
/// `factor` is the acceleration ratio against wall time; 0 stops the
/// clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModelTime {
    pub minute: u8,
    pub hour: u8,
    pub weekday: Weekday,
    pub factor: u8,
}

impl ModelTime {
    /// Encode as the four TCODE octets of `SysClock`.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            self.minute % 60,
            0x80 | (self.hour % 24),
            0x40 | u8::from(self.weekday),
            0xC0 | (self.factor & 0x1F),
        ]
    }

    /// Decode the four TCODE octets; order on the wire is fixed.
    pub fn from_bytes(data: &[u8]) -> Option<ModelTime> {
        if data.len() < 4 {
            return None;
        }
        if data[0] & 0xC0 != 0x00 || data[1] & 0xE0 != 0x80 || data[2] & 0xF8 != 0x40 {
            return None;
        }
        Some(ModelTime {
            minute: data[0] & 0x3F,
            hour: data[1] & 0x1F,
            weekday: Weekday::from(data[2] & 0x07),
            factor: data[3] & 0x1F,
        })
    }
}
