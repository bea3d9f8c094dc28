// SPDX-License-Identifier: AGPL-3.0-only

//! SCP request/response engine
//!
//! Every command is sent with a fresh 16-bit sequence number and matched to
//! its reply by that number. Lost packets are retransmitted with the same
//! sequence number until the attempt budget runs out; replies for sequence
//! numbers no longer in flight are discarded.
//!
//! Bulk transfers use a sliding window: up to `window_size` requests are
//! outstanding at once and each reply is delivered to the caller with the
//! index of the request it answers, so results can be placed by offset
//! regardless of completion order.
//!
//! ```text
//! Pending ──send──▶ AwaitingReply ──reply ok──▶ Acked
//!                      │    ▲
//!              timeout │    │ resend
//!                      ▼    │
//!                  Retransmitting ──attempts exhausted──▶ Failed
//!
//! AwaitingReply ──error return code──▶ Failed
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use spinn_chip::scp::{
    is_retryable_code, Command, DataType, ReturnCode, SCP_DATA_MAX, SCP_PORT, SDP_HEADER_LENGTH,
};
use tracing::{debug, trace, warn};

use crate::error::{Result, SpinnError};
use crate::packets::{CoreAddr, ScpPacket};
use crate::transport::Transport;

// ── Configuration ────────────────────────────────────────────────────────────

/// SCP connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpConfig {
    /// UDP port of the SCP endpoint
    pub port: u16,
    /// Time to wait for each reply before retransmitting
    pub timeout: Duration,
    /// Retransmissions allowed after the first attempt
    pub retries: u32,
    /// Requests allowed in flight during bulk transfers
    pub window_size: usize,
    /// Data bytes per packet; `None` asks the machine via `sver`
    pub buffer_size: Option<usize>,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            port: SCP_PORT,
            timeout: Duration::from_millis(500),
            retries: 4,
            window_size: 1,
            buffer_size: None,
        }
    }
}

impl ScpConfig {
    /// Set the UDP port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the per-attempt reply timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of retransmissions.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the bulk-transfer window (at least 1).
    #[must_use]
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    /// Fix the data bytes per packet instead of querying the machine.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Total transmissions allowed for one request.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Receive buffer length for a given SCP data size: the next power of two
/// that holds the data plus the SDP header.
pub fn receive_length(buffer_size: usize) -> usize {
    (buffer_size + SDP_HEADER_LENGTH).next_power_of_two()
}

// ── Request state ────────────────────────────────────────────────────────────

/// Lifecycle of one SCP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Built but not yet sent
    Pending,
    /// Sent `attempts` times, waiting for the reply
    AwaitingReply {
        /// Transmissions so far
        attempts: u32,
    },
    /// Timed out after `attempts` transmissions; about to resend
    Retransmitting {
        /// Transmissions so far
        attempts: u32,
    },
    /// Matching reply received
    Acked,
    /// Retries exhausted or the request was rejected
    Failed,
}

impl RequestState {
    /// The request has just been (re)transmitted.
    #[must_use]
    pub fn transmitted(self) -> Self {
        match self {
            Self::Pending => Self::AwaitingReply { attempts: 1 },
            Self::Retransmitting { attempts } => Self::AwaitingReply {
                attempts: attempts + 1,
            },
            other => other,
        }
    }

    /// The reply deadline passed.
    #[must_use]
    pub fn timed_out(self, max_attempts: u32) -> Self {
        match self {
            Self::AwaitingReply { attempts } if attempts >= max_attempts => Self::Failed,
            Self::AwaitingReply { attempts } => Self::Retransmitting { attempts },
            other => other,
        }
    }

    /// A successful reply arrived.
    #[must_use]
    pub fn acked(self) -> Self {
        match self {
            Self::AwaitingReply { .. } => Self::Acked,
            other => other,
        }
    }

    /// An error reply arrived.
    #[must_use]
    pub fn rejected(self) -> Self {
        match self {
            Self::AwaitingReply { .. } => Self::Failed,
            other => other,
        }
    }

    /// Transmissions made so far.
    pub fn attempts(self) -> u32 {
        match self {
            Self::AwaitingReply { attempts } | Self::Retransmitting { attempts } => attempts,
            _ => 0,
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Failed)
    }
}

// ── Calls ────────────────────────────────────────────────────────────────────

/// One SCP command to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpCall {
    /// Destination core
    pub dest: CoreAddr,
    /// Command
    pub command: Command,
    /// `arg1`..`arg3`
    pub args: [u32; 3],
    /// Payload data
    pub data: Bytes,
    /// Argument words expected in the reply
    pub expected_args: usize,
    /// Added to the connection timeout for this call
    pub extra_timeout: Duration,
}

impl ScpCall {
    /// A call with zero arguments, no data and three expected reply args.
    pub fn new(dest: CoreAddr, command: Command) -> Self {
        Self {
            dest,
            command,
            args: [0; 3],
            data: Bytes::new(),
            expected_args: 3,
            extra_timeout: Duration::ZERO,
        }
    }

    /// Set the arguments.
    #[must_use]
    pub fn args(mut self, arg1: u32, arg2: u32, arg3: u32) -> Self {
        self.args = [arg1, arg2, arg3];
        self
    }

    /// Attach data.
    #[must_use]
    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Number of reply arguments to decode.
    #[must_use]
    pub fn expected_args(mut self, n: usize) -> Self {
        self.expected_args = n;
        self
    }

    /// Extend the reply timeout for this call.
    #[must_use]
    pub fn extra_timeout(mut self, extra: Duration) -> Self {
        self.extra_timeout = extra;
        self
    }
}

#[derive(Debug)]
struct Outstanding {
    index: usize,
    dest: CoreAddr,
    command: Command,
    expected_args: usize,
    datagram: Bytes,
    timeout: Duration,
    deadline: Instant,
    state: RequestState,
}

// ── Connection ───────────────────────────────────────────────────────────────

/// SCP connection over a datagram transport.
///
/// Owns the sequence counter and the in-flight table; not for concurrent
/// use without external locking.
#[derive(Debug)]
pub struct ScpConnection<T> {
    transport: T,
    config: ScpConfig,
    buffer_size: usize,
    next_seq: u16,
}

impl<T: Transport> ScpConnection<T> {
    /// Wrap a transport.
    pub fn new(transport: T, config: ScpConfig) -> Self {
        let buffer_size = config.buffer_size.map_or(SCP_DATA_MAX, |b| b.clamp(4, SCP_DATA_MAX));
        Self {
            transport,
            config,
            buffer_size,
            next_seq: 0,
        }
    }

    /// Connection parameters.
    pub fn config(&self) -> &ScpConfig {
        &self.config
    }

    /// Data bytes per packet used for bulk transfers.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Change the data bytes per packet (clamped to 4..=256).
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size.clamp(4, SCP_DATA_MAX);
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Unwrap the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn allocate_seq(&mut self, in_flight: &BTreeMap<u16, Outstanding>) -> u16 {
        loop {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if !in_flight.contains_key(&seq) {
                return seq;
            }
        }
    }

    /// Send one command and wait for its reply.
    ///
    /// # Errors
    ///
    /// - [`SpinnError::Timeout`] when every attempt goes unanswered
    /// - [`SpinnError::Command`] when the machine returns an error code
    pub fn send_scp(&mut self, call: ScpCall) -> Result<ScpPacket> {
        let mut reply = None;
        self.send_scp_burst(1, std::iter::once(call), |_, packet| {
            reply = Some(packet);
            Ok(())
        })?;
        reply.ok_or_else(|| SpinnError::invalid_packet("burst completed without a reply"))
    }

    /// Send many commands with up to `window_size` in flight.
    ///
    /// `on_reply` receives the position of the call in `calls` and its reply,
    /// in completion order. An error from `on_reply` aborts the burst.
    ///
    /// # Errors
    ///
    /// The first timeout, rejection, transport error or callback error.
    /// Requests still in flight are abandoned.
    pub fn send_scp_burst<I, F>(
        &mut self,
        window_size: usize,
        calls: I,
        mut on_reply: F,
    ) -> Result<()>
    where
        I: IntoIterator<Item = ScpCall>,
        F: FnMut(usize, ScpPacket) -> Result<()>,
    {
        let window_size = window_size.max(1);
        let mut calls = calls.into_iter().enumerate();
        let mut queued = true;
        let mut outstanding: BTreeMap<u16, Outstanding> = BTreeMap::new();
        let mut buf = vec![0u8; receive_length(SCP_DATA_MAX)];
        let max_attempts = self.config.attempts();

        while queued || !outstanding.is_empty() {
            while queued && outstanding.len() < window_size {
                let Some((index, call)) = calls.next() else {
                    queued = false;
                    break;
                };
                let seq = self.allocate_seq(&outstanding);
                let packet = ScpPacket::request(call.dest, call.command, seq, call.args, call.data);
                let datagram = packet.to_datagram()?;
                let timeout = self.config.timeout + call.extra_timeout;

                self.transport.send(&datagram)?;
                trace!(seq, index, dest = %call.dest, command = %call.command, "SCP sent");
                outstanding.insert(
                    seq,
                    Outstanding {
                        index,
                        dest: call.dest,
                        command: call.command,
                        expected_args: call.expected_args,
                        datagram,
                        timeout,
                        deadline: Instant::now() + timeout,
                        state: RequestState::Pending.transmitted(),
                    },
                );
            }

            let Some(deadline) = outstanding.values().map(|o| o.deadline).min() else {
                continue;
            };
            let wait = deadline.saturating_duration_since(Instant::now());
            if let Some(n) = self.transport.recv(&mut buf, wait)? {
                Self::handle_reply(&buf[..n], &mut outstanding, &mut on_reply)?;
            }

            let now = Instant::now();
            for (&seq, o) in outstanding.iter_mut().filter(|(_, o)| o.deadline <= now) {
                o.state = o.state.timed_out(max_attempts);
                if o.state == RequestState::Failed {
                    warn!(
                        seq,
                        dest = %o.dest,
                        command = %o.command,
                        attempts = max_attempts,
                        "SCP retries exhausted"
                    );
                    return Err(SpinnError::timeout(o.dest, o.command, max_attempts));
                }
                debug!(
                    seq,
                    dest = %o.dest,
                    command = %o.command,
                    attempt = o.state.attempts() + 1,
                    "SCP retransmit"
                );
                self.transport.send(&o.datagram)?;
                o.state = o.state.transmitted();
                o.deadline = now + o.timeout;
            }
        }
        Ok(())
    }

    fn handle_reply<F>(
        raw: &[u8],
        outstanding: &mut BTreeMap<u16, Outstanding>,
        on_reply: &mut F,
    ) -> Result<()>
    where
        F: FnMut(usize, ScpPacket) -> Result<()>,
    {
        let Some((rc, seq)) = ScpPacket::peek_rc_seq(raw) else {
            trace!(len = raw.len(), "Discarding runt datagram");
            return Ok(());
        };
        let Some(o) = outstanding.get_mut(&seq) else {
            trace!(seq, rc, "Discarding stale reply");
            return Ok(());
        };

        if rc != ReturnCode::Ok.code() {
            if is_retryable_code(rc) {
                debug!(seq, rc, dest = %o.dest, "Retryable return code, awaiting timeout");
                return Ok(());
            }
            o.state = o.state.rejected();
            return Err(SpinnError::command(o.dest, o.command, rc));
        }

        let packet = ScpPacket::from_datagram(raw, o.expected_args)?;
        o.state = o.state.acked();
        let index = o.index;
        outstanding.remove(&seq);
        on_reply(index, packet)
    }

    /// Read `length` bytes from `address` on `dest`.
    ///
    /// # Errors
    ///
    /// As for [`ScpConnection::send_scp_burst`], plus
    /// [`SpinnError::InvalidPacket`] if a reply carries the wrong amount of
    /// data.
    pub fn read(&mut self, dest: CoreAddr, address: u32, length: usize) -> Result<Vec<u8>> {
        let chunk = self.buffer_size;
        let mut out = vec![0u8; length];
        let calls = (0..length).step_by(chunk).map(|offset| {
            let size = chunk.min(length - offset);
            let at = address.wrapping_add(offset as u32);
            ScpCall::new(dest, Command::Read)
                .args(at, size as u32, DataType::for_transfer(at, size) as u32)
                .expected_args(0)
        });
        let window = self.config.window_size;
        self.send_scp_burst(window, calls, |index, reply| {
            let offset = index * chunk;
            let size = chunk.min(length - offset);
            if reply.data.len() < size {
                return Err(SpinnError::invalid_packet(format!(
                    "read of {size} bytes at offset {offset} returned {}",
                    reply.data.len()
                )));
            }
            out[offset..offset + size].copy_from_slice(&reply.data[..size]);
            Ok(())
        })?;
        Ok(out)
    }

    /// Write `data` to `address` on `dest`.
    ///
    /// # Errors
    ///
    /// As for [`ScpConnection::send_scp_burst`].
    pub fn write(&mut self, dest: CoreAddr, address: u32, data: &[u8]) -> Result<()> {
        let chunk = self.buffer_size;
        let data = Bytes::copy_from_slice(data);
        let calls = (0..data.len()).step_by(chunk).map(|offset| {
            let block = data.slice(offset..data.len().min(offset + chunk));
            let at = address.wrapping_add(offset as u32);
            ScpCall::new(dest, Command::Write)
                .args(at, block.len() as u32, DataType::for_transfer(at, block.len()) as u32)
                .data(block)
                .expected_args(0)
        });
        let window = self.config.window_size;
        self.send_scp_burst(window, calls, |_, _| Ok(()))
    }
}
