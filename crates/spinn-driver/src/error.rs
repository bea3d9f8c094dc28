// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for SpiNNaker driver operations

use spinn_chip::scp::{Command, ReturnCode};
use spinn_routing::RoutingError;
use thiserror::Error;

use crate::packets::CoreAddr;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, SpinnError>;

/// Errors that can occur while talking to a SpiNNaker machine
#[derive(Debug, Error)]
pub enum SpinnError {
    /// No reply arrived after every permitted attempt
    #[error("No reply from {dest} to {command} after {attempts} attempts")]
    Timeout {
        /// Core the command was addressed to
        dest: CoreAddr,
        /// Command that went unanswered
        command: Command,
        /// Number of transmissions made
        attempts: u32,
    },

    /// The monitor answered with a non-success return code
    #[error("{dest} rejected {command}: {} (0x{rc:02x})", describe_rc(.rc))]
    Command {
        /// Core the command was addressed to
        dest: CoreAddr,
        /// Rejected command
        command: Command,
        /// Raw return code
        rc: u16,
    },

    /// SDRAM allocation returned a null pointer
    #[error("Could not allocate {size} bytes of SDRAM on ({x}, {y}) with tag {tag}")]
    MemoryAllocation {
        /// Chip x
        x: u8,
        /// Chip y
        y: u8,
        /// Requested size in bytes
        size: u32,
        /// Requested tag
        tag: u8,
    },

    /// Router entry allocation failed
    #[error("Could not allocate {count} router entries on ({x}, {y})")]
    RouterAllocation {
        /// Chip x
        x: u8,
        /// Chip y
        y: u8,
        /// Entries requested
        count: usize,
    },

    /// Cores failed to reach the wait state after every load attempt
    #[error("Application failed to load: {loaded} of {expected} cores ready after {attempts} attempts")]
    LoadingFailed {
        /// Cores found in the wait state on the last attempt
        loaded: usize,
        /// Cores that should have been loaded
        expected: usize,
        /// Flood fills performed
        attempts: u32,
    },

    /// A packet could not be encoded or decoded
    #[error("Invalid packet: {reason}")]
    InvalidPacket {
        /// What was wrong
        reason: String,
    },

    /// Caller-supplied argument out of range
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Routing table error
    #[error(transparent)]
    Routing {
        /// Underlying routing error
        #[from]
        source: RoutingError,
    },

    /// I/O error on the transport
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn describe_rc(rc: &u16) -> &'static str {
    ReturnCode::from_code(*rc).map_or("unknown return code", ReturnCode::description)
}

impl SpinnError {
    /// Create a timeout error
    pub fn timeout(dest: CoreAddr, command: Command, attempts: u32) -> Self {
        Self::Timeout { dest, command, attempts }
    }

    /// Create a command rejection error
    pub fn command(dest: CoreAddr, command: Command, rc: u16) -> Self {
        Self::Command { dest, command, rc }
    }

    /// Create an invalid packet error
    pub fn invalid_packet(reason: impl Into<String>) -> Self {
        Self::InvalidPacket {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Machine unreachable: check the network.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Machine answered but refused: check addressing and arguments.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Command { .. })
    }

    /// Something would not fit: redesign routing or placement.
    pub fn is_capacity(&self) -> bool {
        match self {
            Self::MemoryAllocation { .. } | Self::RouterAllocation { .. } => true,
            Self::Routing { source } => source.is_capacity(),
            _ => false,
        }
    }
}
