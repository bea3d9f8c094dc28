// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side driver for SpiNNaker machines.
//!
//! Talks SCP (SpiNNaker Command Protocol) over SDP-in-UDP to a machine's
//! Ethernet-attached chips and to Board Management Processors.
//!
//! # Layers
//!
//! ```text
//! MachineController / BmpController     application-level operations
//!          │
//!    ScpConnection                      sequence numbers, retries, windowing
//!          │
//!    ScpPacket / SdpPacket              wire codec
//!          │
//!    Transport                          UdpTransport | SimulatedMachine
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use spinn_driver::{MachineConfig, MachineController};
//!
//! # fn main() -> spinn_driver::Result<()> {
//! let mut mc = MachineController::connect("spinn-4", MachineConfig::default())?;
//! let info = mc.software_version(0, 0, 0)?;
//! println!("{info}");
//!
//! let data = mc.read(0, 0, 0, 0x6000_0000, 1024)?;
//! assert_eq!(data.len(), 1024);
//! # Ok(())
//! # }
//! ```
//!
//! Without hardware, the same controller runs against
//! [`SimulatedMachine`], which can also be told to lose, duplicate or
//! reject packets.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

pub mod bmp;
pub mod boot;
mod connection;
mod error;
pub mod machine;
pub mod packets;
pub mod transport;

pub use bmp::{BmpConfig, BmpController, BmpInfo};
pub use boot::BootConfig;
pub use connection::{receive_length, RequestState, ScpCall, ScpConfig, ScpConnection};
pub use error::{Result, SpinnError};
pub use machine::{
    ChipConstants, CoreInfo, CoreTargets, IpTag, LoadedRoute, MachineConfig, MachineController,
};
pub use packets::{CoreAddr, ScpPacket, SdpHeader, SdpPacket};
pub use transport::{FaultPlan, SimulatedMachine, Transport, UdpTransport};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BmpController, CoreAddr, MachineConfig, MachineController, Result, ScpCall, ScpConfig,
        SpinnError, Transport,
    };
    pub use spinn_chip::app::{AppSignal, AppState};
}
