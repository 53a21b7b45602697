/*! Collaborator interfaces of the protocol stack.

The stack terminates BiDiB; it does not generate track signals, keep
loco databases or count feedback bits itself. Those live behind the
traits in this module, implemented by the surrounding firmware and
handed to the stack on every poll.
*/

use crate::dcc::DriveCommand;
use bidib_defs::{BoostState, CsState, PomOp, ProgOp, ProgState};

/// Internal track output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrackMode {
    #[default]
    Off,
    Stop,
    SoftStop,
    Go,
    Prog,
}

impl TrackMode {
    pub fn from_cs_state(state: CsState) -> Option<TrackMode> {
        match state {
            CsState::Off => Some(TrackMode::Off),
            CsState::Stop => Some(TrackMode::Stop),
            CsState::SoftStop => Some(TrackMode::SoftStop),
            CsState::Go | CsState::GoIgnWd => Some(TrackMode::Go),
            CsState::Prog => Some(TrackMode::Prog),
            _ => None,
        }
    }

    pub fn cs_state(self) -> CsState {
        match self {
            TrackMode::Off => CsState::Off,
            TrackMode::Stop => CsState::Stop,
            TrackMode::SoftStop => CsState::SoftStop,
            TrackMode::Go => CsState::Go,
            TrackMode::Prog => CsState::Prog,
        }
    }

    pub fn boost_state(self) -> BoostState {
        match self {
            TrackMode::Go => BoostState::On,
            TrackMode::Off => BoostState::Off,
            _ => BoostState::OffGoReq,
        }
    }
}

/// Timing qualifier of an accessory command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessoryTime {
    /// Units of 100 ms.
    Tenths(u8),
    /// Whole seconds.
    Seconds(u8),
}

impl AccessoryTime {
    pub fn from_byte(t: u8) -> AccessoryTime {
        if t & 0x80 != 0 {
            AccessoryTime::Seconds(t & 0x7F)
        } else {
            AccessoryTime::Tenths(t)
        }
    }
}

/// The DCC signal generator.
pub trait SignalControl {
    fn track_mode(&self) -> TrackMode;

    /// Request a mode change; returns the mode actually reached.
    fn set_track_mode(&mut self, mode: TrackMode) -> TrackMode;

    /// Whether a signal source is present at all.
    fn has_signal(&self) -> bool;
}

/// The loco database and refresh stack.
pub trait LocoControl {
    /// Apply a drive telegram, creating the loco if necessary.
    /// Returns false when the loco cannot be taken on.
    fn drive(&mut self, cmd: &DriveCommand) -> bool;

    fn loco_count(&self) -> usize;

    /// State of the n-th loco on the refresh stack.
    fn loco_state(&self, index: usize) -> Option<DriveCommand>;

    fn loco_state_by_addr(&self, addr: u16) -> Option<DriveCommand>;
}

/// The turnout/accessory output.
pub trait AccessoryControl {
    fn switch(&mut self, addr: u16, aspect: u8, time: Option<AccessoryTime>) -> bool;
}

/// Decoder programming, main and service track. Results arrive later
/// through [`Backend::poll_event`].
pub trait ProgTrack {
    fn pom(&mut self, addr: u16, op: PomOp, cv: u32, data: u8) -> bool;

    fn prog(&mut self, op: ProgOp, cv: u16, data: u8) -> bool;
}

/// The global 64 k-bit occupancy bitfield fed by all feedback sources.
pub trait FeedbackSpace {
    fn set(&mut self, index: u16, occupied: bool);

    fn get(&self, index: u16) -> bool;
}

/// Live electrical values of the track output.
pub trait BoosterMonitor {
    fn current_ma(&self) -> u32;

    /// Track voltage in 100 mV units.
    fn voltage_dv(&self) -> u16;

    fn temperature_c(&self) -> u8;
}

/// Completion reported by the backend after an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BackendEvent {
    /// A PoM read finished; reported upstream as `BmCv`.
    PomCv { addr: u16, cv: u16, value: u8 },
    /// A service-mode step finished; reported upstream as `CsProgState`.
    Prog {
        state: ProgState,
        cv: u16,
        value: u8,
    },
    /// The signal generator changed the track mode on its own
    /// (watchdog, short, local stop key).
    TrackMode(TrackMode),
}

/// Everything the command-station side of the stack needs from the
/// surrounding firmware.
pub trait Backend:
    SignalControl + LocoControl + AccessoryControl + ProgTrack + FeedbackSpace + BoosterMonitor
{
    /// Drain one pending completion, oldest first.
    fn poll_event(&mut self) -> Option<BackendEvent>;
}
