// SPDX-License-Identifier: AGPL-3.0-only

//! Application-level opcodes: signals, core states, allocation and
//! nearest-neighbour flood-fill.

use std::fmt;
use std::str::FromStr;

/// Signals that can be broadcast to the cores of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AppSignal {
    /// Initialise.
    Init = 0,
    /// Power down.
    PowerDown = 1,
    /// Stop the application and free its resources.
    Stop = 2,
    /// Start applications waiting in the `wait` state.
    Start = 3,
    /// Release barrier 0.
    Sync0 = 4,
    /// Release barrier 1.
    Sync1 = 5,
    /// Pause.
    Pause = 6,
    /// Continue after pause.
    Cont = 7,
    /// Exit cleanly.
    Exit = 8,
    /// Timer.
    Timer = 9,
    /// User signal 0.
    Usr0 = 10,
    /// User signal 1.
    Usr1 = 11,
    /// User signal 2.
    Usr2 = 12,
    /// User signal 3.
    Usr3 = 13,
}

/// How a signal is propagated through the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SignalType {
    /// Nearest-neighbour flood.
    NearestNeighbour = 0,
    /// Point-to-point.
    PointToPoint = 1,
    /// Multicast.
    Multicast = 2,
}

impl AppSignal {
    /// Transmission type SC&MP uses for this signal.
    #[must_use]
    pub const fn signal_type(self) -> SignalType {
        match self {
            Self::Init | Self::PowerDown | Self::Stop | Self::Start | Self::Exit => {
                SignalType::NearestNeighbour
            }
            _ => SignalType::Multicast,
        }
    }
}

impl FromStr for AppSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "init" => Self::Init,
            "power_down" => Self::PowerDown,
            "stop" => Self::Stop,
            "start" => Self::Start,
            "sync0" => Self::Sync0,
            "sync1" => Self::Sync1,
            "pause" => Self::Pause,
            "cont" => Self::Cont,
            "exit" => Self::Exit,
            "timer" => Self::Timer,
            "usr0" => Self::Usr0,
            "usr1" => Self::Usr1,
            "usr2" => Self::Usr2,
            "usr3" => Self::Usr3,
            other => return Err(format!("unknown signal '{other}'")),
        })
    }
}

/// Diagnostic signals (queries answered by the monitor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiagnosticSignal {
    /// Logical OR of per-core results.
    Or = 0,
    /// Logical AND of per-core results.
    And = 1,
    /// Count of cores matching.
    Count = 2,
}

impl DiagnosticSignal {
    /// Transmission type used for diagnostic queries.
    #[must_use]
    pub const fn signal_type(self) -> SignalType {
        SignalType::PointToPoint
    }
}

/// State of an application core as reported by SARK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AppState {
    /// Dead.
    Dead = 0,
    /// Powered down.
    PowerDown = 1,
    /// Runtime exception.
    RuntimeException = 2,
    /// Watchdog fired.
    Watchdog = 3,
    /// Initialising.
    Init = 4,
    /// Loaded and waiting for `start`.
    Wait = 5,
    /// In `c_main`.
    CMain = 6,
    /// Running.
    Run = 7,
    /// At barrier 0.
    Sync0 = 8,
    /// At barrier 1.
    Sync1 = 9,
    /// Paused.
    Pause = 10,
    /// Exited.
    Exit = 11,
    /// Idle.
    Idle = 15,
}

impl AppState {
    /// Decode a raw state value.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Dead,
            1 => Self::PowerDown,
            2 => Self::RuntimeException,
            3 => Self::Watchdog,
            4 => Self::Init,
            5 => Self::Wait,
            6 => Self::CMain,
            7 => Self::Run,
            8 => Self::Sync0,
            9 => Self::Sync1,
            10 => Self::Pause,
            11 => Self::Exit,
            15 => Self::Idle,
            _ => return None,
        })
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `alloc_free` sub-operations (low byte of `arg1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AllocOperation {
    /// Allocate SDRAM.
    AllocSdram = 0,
    /// Free SDRAM by pointer.
    FreeSdramByPtr = 1,
    /// Free SDRAM by tag and app id.
    FreeSdramByTag = 2,
    /// Allocate router entries.
    AllocRtr = 3,
    /// Free router entries by position.
    FreeRtrByPos = 4,
    /// Free router entries by app id.
    FreeRtrByApp = 5,
}

/// `router` sub-operations (low byte of `arg1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RouterOperation {
    /// Initialise the router.
    Init = 0,
    /// Clear entries.
    Clear = 1,
    /// Load entries from a staging buffer.
    Load = 2,
    /// Set or get the fixed route.
    FixedRoute = 3,
}

/// IP tag sub-commands (`arg1 >> 16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IptagCommand {
    /// Set a tag.
    Set = 1,
    /// Get a tag.
    Get = 2,
    /// Clear a tag.
    Clear = 3,
}

/// LED actions, two bits per LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LedAction {
    /// Toggle.
    Toggle = 1,
    /// Off.
    Off = 2,
    /// On.
    On = 3,
}

impl LedAction {
    /// `Some(true)` → on, `Some(false)` → off, `None` → toggle.
    #[must_use]
    pub const fn from_state(state: Option<bool>) -> Self {
        match state {
            Some(true) => Self::On,
            Some(false) => Self::Off,
            None => Self::Toggle,
        }
    }
}

/// Nearest-neighbour flood-fill commands (`arg1 >> 24`).
pub mod nn {
    /// Flood-fill start.
    pub const FLOOD_FILL_START: u32 = 6;
    /// Flood-fill core select.
    pub const FLOOD_FILL_CORE_SELECT: u32 = 7;
    /// Flood-fill end.
    pub const FLOOD_FILL_END: u32 = 15;
    /// Forwarding mask.
    pub const FORWARD: u32 = 0x3F;
    /// Retry count.
    pub const RETRY: u32 = 24;
    /// Highest nearest-neighbour id before wrapping.
    pub const MAX_ID: u8 = 126;
}

/// Application flag: wait for `start` after loading.
pub const APP_FLAG_WAIT: u32 = 0x01;

/// Chip mask meaning "all chips" in signal `arg3`.
pub const SIGNAL_ALL_CHIPS: u32 = 0x0000_FFFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_types() {
        assert_eq!(AppSignal::Stop.signal_type(), SignalType::NearestNeighbour);
        assert_eq!(AppSignal::Start.signal_type(), SignalType::NearestNeighbour);
        assert_eq!(AppSignal::Sync0.signal_type(), SignalType::Multicast);
        assert_eq!(AppSignal::Usr3.signal_type(), SignalType::Multicast);
    }

    #[test]
    fn signal_names_parse() {
        assert_eq!("sync0".parse::<AppSignal>(), Ok(AppSignal::Sync0));
        assert!("bogus".parse::<AppSignal>().is_err());
    }

    #[test]
    fn app_state_codes() {
        assert_eq!(AppState::from_code(5), Some(AppState::Wait));
        assert_eq!(AppState::from_code(15), Some(AppState::Idle));
        assert_eq!(AppState::from_code(12), None);
    }
}
