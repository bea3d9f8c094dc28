// SPDX-License-Identifier: AGPL-3.0-only

//! Board Management Processor control.
//!
//! A BMP manages power and status LEDs for the boards in a frame. Each
//! frame usually has one BMP reachable over Ethernet; individual boards can
//! also be given their own address. Connections are keyed by
//! `(cabinet, frame, board)` and lookups fall back from a board-specific
//! connection to the frame's.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use spinn_chip::app::LedAction;
use spinn_chip::scp::{Command, BMP_POWER_ON_TIMEOUT_MS};
use tracing::{debug, info};

use crate::connection::{ScpCall, ScpConfig, ScpConnection};
use crate::error::{Result, SpinnError};
use crate::machine::decode_version_string;
use crate::packets::CoreAddr;
use crate::transport::{Transport, UdpTransport};

/// `(cabinet, frame, board)`; `None` addresses the whole frame.
pub type BmpKey = (u8, u8, Option<u8>);

/// BMP controller parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmpConfig {
    /// SCP parameters for every BMP connection
    pub scp: ScpConfig,
    /// Pause after powering boards on while they boot
    pub post_power_on_delay: Duration,
}

impl Default for BmpConfig {
    fn default() -> Self {
        Self {
            scp: ScpConfig::default(),
            post_power_on_delay: Duration::from_secs(5),
        }
    }
}

/// BMP software identification, from `sver`.
#[derive(Debug, Clone, PartialEq)]
pub struct BmpInfo {
    /// Code block
    pub code_block: u8,
    /// Frame number the BMP reports
    pub frame_id: u8,
    /// CAN bus address
    pub can_id: u8,
    /// Board number
    pub board_id: u8,
    /// Software version
    pub version: f32,
    /// Data bytes accepted per SCP packet
    pub buffer_size: usize,
    /// Build date (seconds since the epoch)
    pub build_date: u32,
    /// Software name and hardware
    pub version_string: String,
}

impl fmt::Display for BmpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{:.2} (frame {}, board {}, CAN {})",
            self.version_string, self.version, self.frame_id, self.board_id, self.can_id
        )
    }
}

fn board_mask(boards: &[u8]) -> Result<u32> {
    boards.iter().try_fold(0u32, |mask, &b| {
        if b >= 32 {
            Err(SpinnError::invalid_argument(format!("board {b} out of range")))
        } else {
            Ok(mask | (1 << b))
        }
    })
}

/// Controller for the BMPs of one or more frames.
#[derive(Debug)]
pub struct BmpController<T = UdpTransport> {
    config: BmpConfig,
    connections: BTreeMap<BmpKey, ScpConnection<T>>,
}

impl BmpController<UdpTransport> {
    /// Connect to the BMP of cabinet 0, frame 0.
    ///
    /// # Errors
    ///
    /// Returns [`SpinnError::Io`] if the socket cannot be created.
    pub fn connect(host: &str, config: BmpConfig) -> Result<Self> {
        let mut controller = Self::new(config);
        controller.add_host((0, 0, None), host)?;
        Ok(controller)
    }

    /// Open a UDP connection for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SpinnError::Io`] if the socket cannot be created.
    pub fn add_host(&mut self, key: BmpKey, host: &str) -> Result<()> {
        let transport = UdpTransport::connect(host, self.config.scp.port)?;
        info!(host, cabinet = key.0, frame = key.1, board = ?key.2, "BMP connection opened");
        self.add_transport(key, transport);
        Ok(())
    }
}

impl<T: Transport> BmpController<T> {
    /// A controller with no connections.
    pub fn new(config: BmpConfig) -> Self {
        Self {
            config,
            connections: BTreeMap::new(),
        }
    }

    /// Reach `key` through `transport`.
    pub fn add_transport(&mut self, key: BmpKey, transport: T) {
        self.connections
            .insert(key, ScpConnection::new(transport, self.config.scp.clone()));
    }

    /// Transport serving `(cabinet, frame, board)`, after fallback.
    pub fn transport(&self, cabinet: u8, frame: u8, board: u8) -> Option<&T> {
        self.connections
            .get(&(cabinet, frame, Some(board)))
            .or_else(|| self.connections.get(&(cabinet, frame, None)))
            .map(ScpConnection::transport)
    }

    fn connection(&mut self, cabinet: u8, frame: u8, board: u8) -> Result<&mut ScpConnection<T>> {
        let key = if self.connections.contains_key(&(cabinet, frame, Some(board))) {
            (cabinet, frame, Some(board))
        } else {
            (cabinet, frame, None)
        };
        self.connections.get_mut(&key).ok_or_else(|| {
            SpinnError::invalid_argument(format!(
                "no BMP connection for cabinet {cabinet}, frame {frame}, board {board}"
            ))
        })
    }

    /// Identify the software on a board's BMP.
    ///
    /// # Errors
    ///
    /// No connection for the board, or timeout or rejection of `sver`.
    pub fn software_version(&mut self, cabinet: u8, frame: u8, board: u8) -> Result<BmpInfo> {
        let reply = self
            .connection(cabinet, frame, board)?
            .send_scp(ScpCall::new(CoreAddr::new(0, 0, board), Command::Sver))?;
        let (a1, a2) = (reply.arg(0), reply.arg(1));
        Ok(BmpInfo {
            code_block: (a1 >> 24) as u8,
            frame_id: ((a1 >> 16) & 0xFF) as u8,
            can_id: ((a1 >> 8) & 0xFF) as u8,
            board_id: (a1 & 0xFF) as u8,
            version: (a2 >> 16) as f32 / 100.0,
            buffer_size: (a2 & 0xFFFF) as usize,
            build_date: reply.arg(2),
            version_string: decode_version_string(&reply.data),
        })
    }

    /// Power `boards` of a frame on or off, after `delay`.
    ///
    /// Powering on waits for the boards to come up before returning.
    ///
    /// # Errors
    ///
    /// Board number out of range, no connection, timeout or rejection.
    pub fn set_power(
        &mut self,
        state: bool,
        cabinet: u8,
        frame: u8,
        boards: &[u8],
        delay: Duration,
    ) -> Result<()> {
        let mask = board_mask(boards)?;
        let delay_ms = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX).min(0xFFFF);
        let extra = if state {
            Duration::from_millis(BMP_POWER_ON_TIMEOUT_MS)
        } else {
            Duration::ZERO
        };
        self.connection(cabinet, frame, 0)?.send_scp(
            ScpCall::new(CoreAddr::new(0, 0, 0), Command::Power)
                .args((delay_ms << 16) | u32::from(state), mask, 0)
                .expected_args(0)
                .extra_timeout(extra),
        )?;
        info!(state, cabinet, frame, boards = ?boards, "Board power set");
        if state {
            std::thread::sleep(self.config.post_power_on_delay);
        }
        Ok(())
    }

    /// Set (`Some(true)`), clear (`Some(false)`) or toggle (`None`) front
    /// panel LEDs on `boards`.
    ///
    /// # Errors
    ///
    /// Board number out of range, no connection, timeout or rejection.
    pub fn set_led(
        &mut self,
        leds: &[u8],
        action: Option<bool>,
        cabinet: u8,
        frame: u8,
        boards: &[u8],
    ) -> Result<()> {
        let mask = board_mask(boards)?;
        let code = LedAction::from_state(action) as u32;
        let arg1 = leds.iter().fold(0u32, |acc, &led| acc | (code << (u32::from(led) * 2)));
        self.connection(cabinet, frame, 0)?.send_scp(
            ScpCall::new(CoreAddr::new(0, 0, 0), Command::Led)
                .args(arg1, mask, 0)
                .expected_args(0),
        )?;
        debug!(cabinet, frame, arg1, mask, "BMP LEDs set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedMachine;

    fn controller() -> BmpController<SimulatedMachine> {
        let mut bmp = BmpController::new(BmpConfig {
            scp: ScpConfig::default().with_timeout(Duration::from_millis(20)),
            post_power_on_delay: Duration::ZERO,
        });
        bmp.add_transport((0, 0, None), SimulatedMachine::bmp());
        bmp
    }

    #[test]
    fn board_masks() {
        assert_eq!(board_mask(&[0, 2, 5]).unwrap(), 0b10_0101);
        assert_eq!(board_mask(&[]).unwrap(), 0);
        assert!(board_mask(&[32]).is_err());
    }

    #[test]
    fn info_decode() {
        let mut bmp = controller();
        let info = bmp.software_version(0, 0, 3).unwrap();
        assert_eq!(info.board_id, 3);
        assert_eq!(info.can_id, 3);
        assert_eq!(info.version_string, "BC&MP/Spin5-BMP");
        assert!(info.to_string().contains("board 3"));
    }

    #[test]
    fn connection_fallback() {
        let mut bmp = controller();
        bmp.add_transport((0, 0, Some(7)), SimulatedMachine::bmp());
        bmp.software_version(0, 0, 7).unwrap();
        bmp.software_version(0, 0, 1).unwrap();
        assert_eq!(bmp.transport(0, 0, 7).unwrap().count_commands(Command::Sver), 1);
        assert_eq!(bmp.transport(0, 0, 1).unwrap().count_commands(Command::Sver), 1);

        let err = bmp.software_version(1, 0, 0).unwrap_err();
        assert!(matches!(err, SpinnError::InvalidArgument { .. }));
    }
}
