// SPDX-License-Identifier: AGPL-3.0-only

//! SCP/SDP wire constants.
//!
//! ## Datagram layout
//!
//! ```text
//! offset  size  field
//! 0       2     padding (zero), UDP framing only
//! 2       1     flags   (0x87 reply expected, 0x07 no reply)
//! 3       1     IP tag
//! 4       1     dest port (7:5) | dest cpu (4:0)
//! 5       1     src  port (7:5) | src  cpu (4:0)
//! 6       2     dest p2p (x << 8 | y)          little-endian
//! 8       2     src  p2p (x << 8 | y)          little-endian
//! 10      2     cmd_rc                         little-endian
//! 12      2     seq                            little-endian
//! 14      0–12  arg1..arg3 (u32 each, present only as needed)
//! ..      ≤256  data
//! ```

use std::fmt;

// ── Ports and sizes ──────────────────────────────────────────────────────────

/// UDP port SC&MP listens on for SCP.
pub const SCP_PORT: u16 = 17893;

/// UDP port the boot ROM listens on.
pub const BOOT_PORT: u16 = 54321;

/// Zero padding that precedes the SDP header in every UDP datagram.
pub const UDP_PADDING: usize = 2;

/// SDP header length (flags, tag, cpu/port pairs, p2p addresses).
pub const SDP_HEADER_LENGTH: usize = 8;

/// `cmd_rc` + `seq`.
pub const SCP_HEADER_LENGTH: usize = 4;

/// Largest SCP data field SC&MP supports.
pub const SCP_DATA_MAX: usize = 256;

/// Receive length used before the machine has reported its buffer size.
///
/// Smallest power of two able to hold the largest datagram (256 + headers).
pub const SCP_RECEIVE_LENGTH: usize = 512;

/// Largest valid SDP payload (SCP header, three arguments and data).
pub const SDP_PAYLOAD_MAX: usize = SCP_HEADER_LENGTH + 12 + SCP_DATA_MAX;

// ── Header fields ────────────────────────────────────────────────────────────

/// SDP flags: a reply is expected.
pub const FLAG_REPLY: u8 = 0x87;

/// SDP flags: no reply is expected.
pub const FLAG_NO_REPLY: u8 = 0x07;

/// IP tag meaning "reply to the sender".
pub const TAG_REPLY_TO_SENDER: u8 = 0xFF;

/// Highest addressable application core.
pub const MAX_CPU: u8 = 17;

/// Special CPU number used for IP-tagged traffic.
pub const CPU_IPTAG: u8 = 31;

/// Highest SDP port number (3-bit field).
pub const MAX_PORT: u8 = 7;

/// Extra time granted to a BMP power-on command (FPGAs must load).
pub const BMP_POWER_ON_TIMEOUT_MS: u64 = 5_000;

// ── Commands ─────────────────────────────────────────────────────────────────

/// SCP command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Software version and buffer size.
    Sver = 0,
    /// Read memory.
    Read = 2,
    /// Write memory.
    Write = 3,
    /// Nearest-neighbour packet (flood-fill control).
    NearestNeighbourPacket = 20,
    /// Application signal or diagnostic query.
    Signal = 22,
    /// Flood-fill data block.
    FloodFillData = 23,
    /// LED control.
    Led = 25,
    /// IP tag control.
    Iptag = 26,
    /// SDRAM / router entry allocation.
    AllocFree = 28,
    /// Router control.
    Router = 29,
    /// BMP board power control.
    Power = 57,
}

impl Command {
    /// Numeric code carried in `cmd_rc`.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Look up a command by its code.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => Self::Sver,
            2 => Self::Read,
            3 => Self::Write,
            20 => Self::NearestNeighbourPacket,
            22 => Self::Signal,
            23 => Self::FloodFillData,
            25 => Self::Led,
            26 => Self::Iptag,
            28 => Self::AllocFree,
            29 => Self::Router,
            57 => Self::Power,
            _ => return None,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sver => "SVER",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::NearestNeighbourPacket => "NNP",
            Self::Signal => "SIG",
            Self::FloodFillData => "FFD",
            Self::Led => "LED",
            Self::Iptag => "IPTAG",
            Self::AllocFree => "ALLOC",
            Self::Router => "RTR",
            Self::Power => "POWER",
        };
        f.write_str(name)
    }
}

// ── Return codes ─────────────────────────────────────────────────────────────

/// SCP return codes carried in the `cmd_rc` field of replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ReturnCode {
    /// Command completed.
    Ok = 0x80,
    /// Bad packet length.
    Len = 0x81,
    /// Bad checksum.
    Sum = 0x82,
    /// Bad or invalid command.
    Cmd = 0x83,
    /// Invalid arguments.
    Arg = 0x84,
    /// Bad port number.
    Port = 0x85,
    /// Monitor timed out.
    Timeout = 0x86,
    /// No P2P route.
    Route = 0x87,
    /// Bad CPU number.
    Cpu = 0x88,
    /// SHM destination dead.
    Super = 0x89,
    /// No free shared-memory buffers.
    Buf = 0x8A,
    /// No reply to P2P open.
    P2pNoReply = 0x8B,
    /// P2P open rejected.
    P2pReject = 0x8C,
    /// P2P destination busy.
    P2pBusy = 0x8D,
    /// P2P packet timed out.
    P2pTimeout = 0x8E,
    /// Packet transmission failed.
    PktTx = 0x8F,
}

impl ReturnCode {
    /// Look up a return code.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x80 => Self::Ok,
            0x81 => Self::Len,
            0x82 => Self::Sum,
            0x83 => Self::Cmd,
            0x84 => Self::Arg,
            0x85 => Self::Port,
            0x86 => Self::Timeout,
            0x87 => Self::Route,
            0x88 => Self::Cpu,
            0x89 => Self::Super,
            0x8A => Self::Buf,
            0x8B => Self::P2pNoReply,
            0x8C => Self::P2pReject,
            0x8D => Self::P2pBusy,
            0x8E => Self::P2pTimeout,
            0x8F => Self::PktTx,
            _ => return None,
        })
    }

    /// Numeric code.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Codes that indicate the packet was lost in the machine rather than
    /// rejected. These are handled exactly like a missing reply.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Sum | Self::P2pTimeout | Self::PktTx)
    }

    /// Short human-readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Ok => "command completed",
            Self::Len => "bad packet length",
            Self::Sum => "bad checksum",
            Self::Cmd => "bad/invalid command",
            Self::Arg => "invalid arguments",
            Self::Port => "bad port number",
            Self::Timeout => "monitor timed out",
            Self::Route => "no P2P route",
            Self::Cpu => "bad CPU number",
            Self::Super => "SHM destination dead",
            Self::Buf => "no free shared-memory buffers",
            Self::P2pNoReply => "no reply to P2P open",
            Self::P2pReject => "P2P open rejected",
            Self::P2pBusy => "P2P destination busy",
            Self::P2pTimeout => "P2P packet timed out",
            Self::PktTx => "packet transmission failed",
        }
    }
}

/// Returns true when a raw `cmd_rc` value should be retried like a lost packet.
#[must_use]
pub fn is_retryable_code(code: u16) -> bool {
    ReturnCode::from_code(code).is_some_and(ReturnCode::is_retryable)
}

// ── Memory access width ──────────────────────────────────────────────────────

/// Access width used by SC&MP for read/write commands (`arg3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    /// Byte accesses.
    Byte = 0,
    /// Half-word accesses.
    Short = 1,
    /// Word accesses.
    Word = 2,
}

impl DataType {
    /// Widest access allowed by the alignment of `address` and `length`.
    #[must_use]
    pub const fn for_transfer(address: u32, length: usize) -> Self {
        let a = address % 4;
        let l = length % 4;
        if a == 0 && l == 0 {
            Self::Word
        } else if a % 2 == 0 && l % 2 == 0 {
            Self::Short
        } else {
            Self::Byte
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for cmd in [
            Command::Sver,
            Command::Read,
            Command::Write,
            Command::Signal,
            Command::AllocFree,
            Command::Router,
            Command::Power,
        ] {
            assert_eq!(Command::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(Command::from_code(1), None);
    }

    #[test]
    fn retryable_return_codes() {
        assert!(ReturnCode::Sum.is_retryable());
        assert!(ReturnCode::P2pTimeout.is_retryable());
        assert!(ReturnCode::PktTx.is_retryable());
        assert!(!ReturnCode::Ok.is_retryable());
        assert!(!ReturnCode::Arg.is_retryable());
        assert!(is_retryable_code(0x8F));
        assert!(!is_retryable_code(0x1234));
    }

    #[test]
    fn data_type_follows_alignment() {
        assert_eq!(DataType::for_transfer(0x6000_0000, 256), DataType::Word);
        assert_eq!(DataType::for_transfer(0x6000_0002, 256), DataType::Short);
        assert_eq!(DataType::for_transfer(0x6000_0000, 6), DataType::Short);
        assert_eq!(DataType::for_transfer(0x6000_0001, 256), DataType::Byte);
        assert_eq!(DataType::for_transfer(0x6000_0000, 3), DataType::Byte);
    }

    #[test]
    fn payload_bound() {
        assert_eq!(SDP_PAYLOAD_MAX, 272);
        assert!(UDP_PADDING + SDP_HEADER_LENGTH + SDP_PAYLOAD_MAX <= SCP_RECEIVE_LENGTH);
    }
}
