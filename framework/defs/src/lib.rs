#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

//! Protocol definitions for the BiDiB wire protocol.
//!
//! Numbering follows the published BiDiB specification; only the
//! subset spoken by this stack is defined here. Messages keep their
//! opcode as a raw byte so unknown opcodes survive routing byte-exact;
//! [`MsgType`] is the typed view used at dispatch sites.

use bitflags::bitflags;
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

/// Answer to `SysGetMagic` when the node runs its application firmware.
pub const BIDIB_SYS_MAGIC: u16 = 0xAFFE;

/// Answer to `SysGetMagic` when the node sits in its bootloader.
pub const BIDIB_BOOT_MAGIC: u16 = 0xB00D;

/// Protocol version implemented by this stack, minor before major on the wire.
pub const BIDIB_VERSION: [u8; 2] = [8, 0];

/// UDP/TCP port of the netBiDiB transport.
pub const NETBIDIB_PORT: u16 = 62875;

/// Leading bytes of `LocalProtocolSignature`.
pub const PROTOCOL_SIGNATURE: &[u8] = b"BiDiB";

/// Maximum payload of one sub-bus packet. One byte below the 64-byte
/// specification limit; some fielded nodes overrun their receive buffer
/// at exactly 64.
pub const SUBBUS_MAX_PAYLOAD: usize = 62;

/// Local addresses on a sub-bus are 6 bits wide, 0 is the master.
pub const SUBBUS_MAX_NODES: u8 = 63;

/// Limit on synthesised feedback nodes per virtual bus type.
pub const MAX_FB_PER_TYPE: u16 = 4095;

/// Product and user strings are capped at 24 characters.
pub const MAX_STRING_SIZE: usize = 24;

/// Link-local opcodes never carry a sequence number and are not
/// forwarded beyond the immediate link.
#[inline]
pub const fn msg_is_local(opcode: u8) -> bool {
    (opcode & 0x70) == 0x70
}

/// Broadcast opcodes do not consume a sequence number and fan out
/// to all children.
#[inline]
pub fn msg_is_broadcast(opcode: u8) -> bool {
    matches!(
        MsgType::try_from(opcode),
        Ok(MsgType::SysEnable)
            | Ok(MsgType::SysDisable)
            | Ok(MsgType::SysReset)
            | Ok(MsgType::SysClock)
            | Ok(MsgType::BoostOff)
            | Ok(MsgType::BoostOn)
            | Ok(MsgType::LocalAccessory)
            | Ok(MsgType::LocalSync)
    )
}

#[inline]
pub const fn msg_is_upstream(opcode: u8) -> bool {
    opcode >= 0x80
}

/// Message opcodes.
///
/// Downstream opcodes occupy 0x00..0x7F, upstream 0x80..0xFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgType {
    SysGetMagic = 0x01,
    SysGetPVersion = 0x02,
    SysEnable = 0x03,
    SysDisable = 0x04,
    SysGetUniqueId = 0x05,
    SysGetSwVersion = 0x06,
    SysPing = 0x07,
    SysIdentify = 0x08,
    SysReset = 0x09,
    GetPktCapacity = 0x0A,
    NodeTabGetAll = 0x0B,
    NodeTabGetNext = 0x0C,
    NodeChangedAck = 0x0D,
    SysGetError = 0x0E,

    FeatureGetAll = 0x10,
    FeatureGetNext = 0x11,
    FeatureGet = 0x12,
    FeatureSet = 0x13,
    SysClock = 0x18,
    StringGet = 0x19,
    StringSet = 0x1A,

    BmGetRange = 0x20,
    BmMirrorMultiple = 0x21,
    BmMirrorOcc = 0x22,
    BmMirrorFree = 0x23,
    BmGetConfidence = 0x25,

    BoostOff = 0x30,
    BoostOn = 0x31,
    BoostQuery = 0x32,

    CsAllocate = 0x60,
    CsSetState = 0x62,
    CsDrive = 0x64,
    CsAccessory = 0x65,
    CsPom = 0x67,
    CsQuery = 0x6A,
    CsProg = 0x6F,

    LocalLogonAck = 0x70,
    LocalPing = 0x71,
    LocalLogonRejected = 0x72,
    LocalAccessory = 0x73,
    LocalSync = 0x74,
    LocalDiscover = 0x75,

    SysMagic = 0x81,
    SysPong = 0x82,
    SysPVersion = 0x83,
    SysUniqueId = 0x84,
    SysSwVersion = 0x85,
    SysError = 0x86,
    SysIdentifyState = 0x87,
    NodeTabCount = 0x88,
    NodeTab = 0x89,
    PktCapacity = 0x8A,
    NodeNa = 0x8B,
    NodeLost = 0x8C,
    NodeNew = 0x8D,
    Stall = 0x8E,

    Feature = 0x90,
    FeatureNa = 0x91,
    FeatureCount = 0x92,
    String = 0x95,

    BmOcc = 0xA0,
    BmFree = 0xA1,
    BmMultiple = 0xA2,
    BmCv = 0xA5,
    BmConfidence = 0xA9,

    BoostStat = 0xB0,
    BoostDiagnostic = 0xB2,

    CsAllocAck = 0xE0,
    CsState = 0xE1,
    CsDriveAck = 0xE2,
    CsAccessoryAck = 0xE3,
    CsPomAck = 0xE4,
    CsDriveState = 0xEA,
    CsProgState = 0xEF,

    LocalLogon = 0xF0,
    LocalPong = 0xF1,
    LocalLogoff = 0xF2,
    LocalAnnounce = 0xF3,
    LocalProtocolSignature = 0xFE,
    LocalLink = 0xFF,
}

/// First payload byte of `LocalLink` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkData {
    DescriptorUid = 0x00,
    DescriptorProdString = 0x01,
    DescriptorUserString = 0x02,
    DescriptorPVersion = 0x03,
    NodeUnavailable = 0x80,
    NodeAvailable = 0x81,
    PairingRequest = 0xFC,
    StatusUnpaired = 0xFD,
    StatusPaired = 0xFE,
}

/// Feature ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FeatureId {
    BmSize = 0,
    BmOn = 1,
    BmSecackAvailable = 2,
    BmSecackOn = 3,
    BmCurmeasAvailable = 4,
    BmCurmeasInterval = 5,
    BstVoltAdjustable = 15,
    BstVolt = 16,
    BstCutoutAvailable = 17,
    BstCutoutOn = 18,
    BstAmpereAdjustable = 21,
    BstAmpere = 22,
    BstCurmeasInterval = 23,
    BstInhibitAutostart = 26,
    GenSpyMode = 100,
    GenWatchdog = 101,
    GenDriveAck = 102,
    GenSwitchAck = 103,
    GenLokDbSize = 104,
    GenLokDbString = 105,
    GenPomRepeat = 106,
    GenStartState = 110,
    StringSize = 252,
    RelevantPidBits = 253,
    FwUpdateMode = 254,
    Extension = 255,
}

/// Error sub-codes carried in `SysError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorCode {
    #[default]
    None = 0x00,
    Txt = 0x01,
    Crc = 0x02,
    Size = 0x03,
    Sequence = 0x04,
    Parameter = 0x05,
    Bus = 0x10,
    AddrStack = 0x11,
    IdDouble = 0x12,
    SubCrc = 0x13,
    SubTime = 0x14,
    SubPacket = 0x15,
    Overrun = 0x16,
    Hw = 0x20,
    ResetRequired = 0x21,
    NoSecackByHost = 0x30,
}

/// Command-station state codes (`CsSetState` / `CsState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CsState {
    Off = 0x00,
    Stop = 0x01,
    SoftStop = 0x02,
    Go = 0x03,
    GoIgnWd = 0x04,
    Prog = 0x08,
    ProgBusy = 0x09,
    Busy = 0x0D,
    #[default]
    Query = 0xFF,
}

/// Booster state codes (`BoostStat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BoostState {
    #[default]
    Off = 0x00,
    OffShort = 0x01,
    OffHot = 0x02,
    OffNoPower = 0x03,
    OffGoReq = 0x04,
    OffHere = 0x05,
    OffNoDcc = 0x06,
    On = 0x80,
    OnLimit = 0x81,
    OnHot = 0x82,
    OnStopReq = 0x83,
    OnHere = 0x84,
}

/// Operation byte of `CsProg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProgOp {
    #[default]
    Break = 0x00,
    Query = 0x01,
    RdByte = 0x02,
    RdwrBit = 0x03,
    WrByte = 0x04,
}

/// Result byte of `CsProgState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProgState {
    #[default]
    Start = 0x00,
    Running = 0x01,
    Stopped = 0x40,
    Okay = 0x80,
    NoLoco = 0xC0,
    NoAnswer = 0xC1,
    Short = 0xC2,
    VerifyFailed = 0xC3,
}

/// Operation byte of `CsPom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PomOp {
    RdBlock = 0x00,
    RdByte = 0x01,
    WrBit = 0x02,
    WrByte = 0x03,
    XRdBlock = 0x81,
    XWrBit = 0x82,
    XWrByte = 0x83,
}

bitflags! {
    /// Class bits, first byte of a unique id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClassBits: u8 {
        const SWITCH = 0x01;
        const BOOSTER = 0x02;
        const ACCESSORY = 0x04;
        const PROG = 0x08;
        const MAIN = 0x10;
        const UI = 0x20;
        const OCCUPANCY = 0x40;
        const BRIDGE = 0x80;
    }
}
