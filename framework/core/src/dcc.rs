use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Decoder format of a drive telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DccFormat {
    Mm1 = 0,
    Mm2 = 1,
    Dcc14 = 2,
    Dcc27 = 3,
    Dcc28 = 4,
    Dcc126 = 5,
    Sdf = 6,
    M4 = 7,
}

impl DccFormat {
    /// Speed steps of the decoder-side range.
    pub const fn steps(self) -> u8 {
        match self {
            DccFormat::Mm1 | DccFormat::Dcc14 => 14,
            DccFormat::Dcc27 => 27,
            DccFormat::Mm2 | DccFormat::Dcc28 => 28,
            DccFormat::Dcc126 | DccFormat::Sdf | DccFormat::M4 => 126,
        }
    }
}

bitflags! {
    /// Which parts of a drive telegram are valid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ActiveGroups: u8 {
        const SPEED = 0x01;
        const F0_F4 = 0x08;
        const F5_F8 = 0x10;
        const F9_F12 = 0x20;
        const F13_F20 = 0x40;
        const F21_F28 = 0x80;
    }
}

/// Length of the drive block in `CsDrive` and `CsDriveState`.
pub const DRIVE_LEN: usize = 9;

/// A decoded drive telegram.
///
/// `speed` keeps the message coding: bit 7 is the direction (set =
/// forward), bits 0..6 carry 0 = stop, 1 = emergency stop, 2..127 =
/// steps 1..126.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveCommand {
    pub addr: u16,
    pub format: DccFormat,
    pub active: ActiveGroups,
    pub speed: u8,
    pub functions: [u8; 4],
}

impl Default for DccFormat {
    fn default() -> Self {
        DccFormat::Dcc28
    }
}

impl DriveCommand {
    /// Decode the nine-octet drive block. Unknown format codes fail.
    pub fn from_bytes(data: &[u8]) -> Option<DriveCommand> {
        if data.len() < DRIVE_LEN {
            return None;
        }
        Some(DriveCommand {
            addr: LittleEndian::read_u16(&data[0..2]) & 0x3FFF,
            format: DccFormat::try_from(data[2]).ok()?,
            active: ActiveGroups::from_bits_truncate(data[3]),
            speed: data[4],
            functions: [data[5], data[6], data[7], data[8]],
        })
    }

    pub fn to_bytes(&self) -> [u8; DRIVE_LEN] {
        let mut data = [0u8; DRIVE_LEN];
        LittleEndian::write_u16(&mut data[0..2], self.addr);
        data[2] = self.format.into();
        data[3] = self.active.bits();
        data[4] = self.speed;
        data[5..9].copy_from_slice(&self.functions);
        data
    }

    pub const fn forward(&self) -> bool {
        self.speed & 0x80 != 0
    }

    /// Speed magnitude in message coding, without the direction bit.
    pub const fn speed_value(&self) -> u8 {
        self.speed & 0x7F
    }

    /// F0 (light), bit 4 of the first function octet.
    pub const fn f0(&self) -> bool {
        self.functions[0] & 0x10 != 0
    }
}

/// Scale a speed magnitude (message coding, 126-step range) to the
/// decoder format range, rounding partial steps up.
pub fn speed_to_format(value: u8, format: DccFormat) -> u8 {
    let steps = format.steps() as u16;
    match value {
        0 | 1 => value,
        v => {
            let n = (v as u16 - 1).min(126);
            ((n * steps).div_ceil(126) + 1) as u8
        }
    }
}

/// Scale a decoder-format speed back into the 126-step message range.
/// Rounds down so that scaling back to the same format returns the
/// original step.
pub fn speed_from_format(value: u8, format: DccFormat) -> u8 {
    let steps = format.steps() as u16;
    match value {
        0 | 1 => value,
        v => {
            let n = (v as u16 - 1).min(steps);
            (n * 126 / steps + 1) as u8
        }
    }
}

/// Current code for "track output shorted".
pub const CURRENT_CODE_SHORT: u8 = 254;

/// Current code for "no measurement available".
pub const CURRENT_CODE_UNKNOWN: u8 = 255;

/// Encode a current in milliamps into the piece-wise linear message
/// coding: direct below 16 mA, then 4/16/64/256 mA steps.
pub fn current_to_code(ma: u32) -> u8 {
    match ma {
        0..=15 => ma as u8,
        16..=204 => (ma / 4 + 12) as u8,
        205..=1216 => (ma / 16 + 51) as u8,
        1217..=5312 => (ma / 64 + 108) as u8,
        5313..=20224 => (ma / 256 + 171) as u8,
        _ => 250,
    }
}

/// Decode a message-coded current back to milliamps. The short and
/// unknown markers and the reserved codes have no numeric value.
pub fn code_to_current(code: u8) -> Option<u32> {
    match code {
        0..=15 => Some(code as u32),
        16..=63 => Some((code as u32 - 12) * 4),
        64..=127 => Some((code as u32 - 51) * 16),
        128..=191 => Some((code as u32 - 108) * 64),
        192..=250 => Some((code as u32 - 171) * 256),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drive_block_roundtrip() {
        let cmd = DriveCommand::from_bytes(&[0x03, 0x00, 0x04, 0x09, 0x80, 0x10, 0, 0, 0]).unwrap();
        assert_eq!(cmd.addr, 3);
        assert_eq!(cmd.format, DccFormat::Dcc28);
        assert_eq!(cmd.active, ActiveGroups::SPEED | ActiveGroups::F0_F4);
        assert!(cmd.forward());
        assert_eq!(cmd.speed_value(), 0);
        assert!(cmd.f0());
        assert_eq!(cmd.to_bytes(), [0x03, 0x00, 0x04, 0x09, 0x80, 0x10, 0, 0, 0]);
    }

    #[test]
    fn drive_block_rejects_bad_format() {
        assert!(DriveCommand::from_bytes(&[0, 0, 0x09, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(DriveCommand::from_bytes(&[0, 0, 0, 0]).is_none());
    }

    #[test]
    fn speed_scaling_ceils() {
        // stop and emergency stop pass through untouched
        assert_eq!(speed_to_format(0, DccFormat::Dcc14), 0);
        assert_eq!(speed_to_format(1, DccFormat::Dcc28), 1);
        // full speed maps to full speed
        assert_eq!(speed_to_format(127, DccFormat::Dcc14), 15);
        assert_eq!(speed_to_format(127, DccFormat::Dcc28), 29);
        assert_eq!(speed_to_format(127, DccFormat::Dcc126), 127);
        // one internal step is already step one on a coarse format
        assert_eq!(speed_to_format(2, DccFormat::Dcc14), 2);
        assert_eq!(speed_from_format(2, DccFormat::Dcc14), 10);
        // scaling a coarse value up and down again is the identity
        for v in 2..=29u8 {
            let wide = speed_from_format(v, DccFormat::Dcc28);
            assert_eq!(speed_to_format(wide, DccFormat::Dcc28), v);
        }
    }

    #[test]
    fn current_code_breakpoints() {
        assert_eq!(current_to_code(0), 0);
        assert_eq!(current_to_code(15), 15);
        assert_eq!(current_to_code(16), 16);
        assert_eq!(current_to_code(204), 63);
        assert_eq!(current_to_code(1216), 127);
        assert_eq!(current_to_code(5312), 191);
        assert_eq!(current_to_code(20224), 250);
        assert_eq!(current_to_code(999_999), 250);
        assert_eq!(code_to_current(16), Some(16));
        assert_eq!(code_to_current(63), Some(204));
        assert_eq!(code_to_current(CURRENT_CODE_SHORT), None);
        assert_eq!(code_to_current(CURRENT_CODE_UNKNOWN), None);
        for ma in [0u32, 10, 100, 1000, 5000, 20000] {
            let code = current_to_code(ma);
            let back = code_to_current(code).unwrap();
            // quantisation only ever rounds down, within one step
            assert!(back <= ma && ma - back <= 256);
        }
    }
}
