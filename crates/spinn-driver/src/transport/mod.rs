// SPDX-License-Identifier: AGPL-3.0-only

//! Datagram transports
//!
//! The SCP engine only needs to send a datagram and to wait a bounded time
//! for the next one. Two implementations are provided:
//!
//! - [`UdpTransport`]: a connected UDP socket (production)
//! - [`SimulatedMachine`]: an in-process machine answering SCP with
//!   configurable loss, for tests and development without hardware

mod simulated;
mod udp;

pub use simulated::{FaultPlan, SimulatedMachine};
pub use udp::UdpTransport;

use std::fmt::Debug;
use std::io;
use std::time::Duration;

/// A connected, unreliable datagram channel.
pub trait Transport: Debug + Send {
    /// Transmit one datagram.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn send(&mut self, datagram: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for the next datagram.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Datagrams longer than
    /// `buf` are truncated.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        (**self).send(datagram)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        (**self).recv(buf, timeout)
    }
}
