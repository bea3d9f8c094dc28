// SPDX-License-Identifier: AGPL-3.0-only

//! High-level control of a booted SpiNNaker machine.
//!
//! [`MachineController`] wraps one [`ScpConnection`] to the machine's root
//! Ethernet chip and exposes the operations a host needs to run an
//! application: memory access, SDRAM and router allocation, IP tags, LEDs,
//! signals, application loading by flood-fill, and the scoped
//! [`MachineController::with_application`] which always tears down.
//!
//! ```text
//! load_application
//!   └─ flood_fill_aplx ── FFS ─▶ FFCS × regions ─▶ FFD × blocks ─▶ FFE
//!   └─ count_cores_in_state(wait) == expected ? done : retry
//!   └─ signal(start)                       (unless told to leave in wait)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use bytes::Bytes;
use spinn_chip::app::{
    nn, AllocOperation, AppSignal, AppState, DiagnosticSignal, IptagCommand, LedAction,
    RouterOperation, APP_FLAG_WAIT, SIGNAL_ALL_CHIPS,
};
use spinn_chip::regions::compress_flood_fill_regions;
use spinn_chip::router::{RouterRecord, RECORD_SIZE, RTR_ENTRIES};
use spinn_chip::scp::{Command, BOOT_PORT};
use spinn_chip::RouteSet;
use spinn_routing::RoutingTableEntry;
use tracing::{debug, info, warn};

use crate::boot::{self, BootConfig};
use crate::connection::{ScpCall, ScpConfig, ScpConnection};
use crate::error::{Result, SpinnError};
use crate::packets::{CoreAddr, ScpPacket};
use crate::transport::{Transport, UdpTransport};

/// Cores to load, per chip.
pub type CoreTargets = BTreeMap<(u8, u8), BTreeSet<u8>>;

// ── Configuration ────────────────────────────────────────────────────────────

/// Per-chip memory map values normally read from the system-variable block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipConstants {
    /// Router entries on each chip
    pub router_entries: usize,
    /// System SDRAM buffer used to stage router loads and flood-fill data
    pub sdram_sys: u32,
    /// Monitor's copy of the router table
    pub rtr_copy: u32,
}

impl Default for ChipConstants {
    fn default() -> Self {
        Self {
            router_entries: RTR_ENTRIES,
            sdram_sys: 0x7F80_0000,
            rtr_copy: 0xE504_0000,
        }
    }
}

/// Machine controller parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// SCP connection parameters
    pub scp: ScpConfig,
    /// UDP port the boot ROM listens on
    pub boot_port: u16,
    /// Boot pacing
    pub boot: BootConfig,
    /// Memory map
    pub chip: ChipConstants,
    /// Pause between a flood fill and checking how many cores loaded
    pub app_start_delay: Duration,
    /// Flood fills attempted before giving up on a load
    pub load_tries: u32,
    /// Pause between polls in [`MachineController::wait_for_cores_to_reach_state`]
    pub poll_interval: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            scp: ScpConfig::default(),
            boot_port: BOOT_PORT,
            boot: BootConfig::default(),
            chip: ChipConstants::default(),
            app_start_delay: Duration::from_millis(100),
            load_tries: 3,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl MachineConfig {
    /// Replace the SCP parameters.
    #[must_use]
    pub fn with_scp(mut self, scp: ScpConfig) -> Self {
        self.scp = scp;
        self
    }

    /// Replace the memory map.
    #[must_use]
    pub fn with_chip_constants(mut self, chip: ChipConstants) -> Self {
        self.chip = chip;
        self
    }

    /// Set the delay before load verification.
    #[must_use]
    pub fn with_app_start_delay(mut self, delay: Duration) -> Self {
        self.app_start_delay = delay;
        self
    }

    /// Set the number of flood fills attempted per load (at least 1).
    #[must_use]
    pub fn with_load_tries(mut self, tries: u32) -> Self {
        self.load_tries = tries.max(1);
        self
    }

    /// Set the polling interval for state waits.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

// ── Decoded replies ──────────────────────────────────────────────────────────

/// Software running on a monitor core, from `sver`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreInfo {
    /// Chip position reported by the monitor
    pub position: (u8, u8),
    /// Physical core number
    pub physical_cpu: u8,
    /// Virtual core number
    pub virtual_cpu: u8,
    /// Software version
    pub version: f32,
    /// Data bytes the monitor accepts per SCP packet
    pub buffer_size: usize,
    /// Build date (seconds since the epoch)
    pub build_date: u32,
    /// Software name and hardware
    pub version_string: String,
}

impl CoreInfo {
    /// Decode an `sver` reply.
    pub fn from_reply(reply: &ScpPacket) -> Self {
        let (a1, a2) = (reply.arg(0), reply.arg(1));
        let p2p = a1 >> 16;
        Self {
            position: ((p2p >> 8) as u8, (p2p & 0xFF) as u8),
            physical_cpu: ((a1 >> 8) & 0xFF) as u8,
            virtual_cpu: (a1 & 0xFF) as u8,
            version: (a2 >> 16) as f32 / 100.0,
            buffer_size: (a2 & 0xFFFF) as usize,
            build_date: reply.arg(2),
            version_string: decode_version_string(&reply.data),
        }
    }
}

impl fmt::Display for CoreInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{:.2} at ({}, {}, {})",
            self.version_string, self.version, self.position.0, self.position.1, self.virtual_cpu
        )
    }
}

pub(crate) fn decode_version_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// One IP tag as reported by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpTag {
    /// Destination address
    pub addr: Ipv4Addr,
    /// Destination MAC
    pub mac: [u8; 6],
    /// Destination port
    pub port: u16,
    /// Reverse-IP-tag timeout
    pub timeout: u16,
    /// Flags (bit 15 = in use)
    pub flags: u16,
    /// Packets sent through the tag
    pub count: u32,
    /// Receive port (reverse tags)
    pub rx_port: u16,
    /// SpiNNaker destination (reverse tags)
    pub spin_addr: u16,
    /// SpiNNaker port (reverse tags)
    pub spin_port: u8,
}

impl IpTag {
    /// Length of an encoded tag.
    pub const SIZE: usize = 25;

    const IN_USE: u16 = 0x8000;

    /// Decode the data of an `iptag get` reply.
    ///
    /// # Errors
    ///
    /// [`SpinnError::InvalidPacket`] if `raw` is shorter than [`IpTag::SIZE`].
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < Self::SIZE {
            return Err(SpinnError::invalid_packet(format!(
                "IP tag of {} bytes, need {}",
                raw.len(),
                Self::SIZE
            )));
        }
        let u16_at = |o: usize| u16::from_le_bytes([raw[o], raw[o + 1]]);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&raw[4..10]);
        Ok(Self {
            addr: Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]),
            mac,
            port: u16_at(10),
            timeout: u16_at(12),
            flags: u16_at(14),
            count: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
            rx_port: u16_at(20),
            spin_addr: u16_at(22),
            spin_port: raw[24],
        })
    }

    /// The tag is configured.
    pub fn in_use(&self) -> bool {
        self.flags & Self::IN_USE != 0
    }
}

/// A live router entry read back from a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedRoute {
    /// Key, mask and route
    pub entry: RoutingTableEntry,
    /// Owning application
    pub app_id: u8,
    /// Core that allocated it
    pub core: u8,
}

// ── Controller ───────────────────────────────────────────────────────────────

/// Controller for one SpiNNaker machine.
///
/// All commands go through a single SCP connection to the root chip, which
/// forwards them across the machine.
#[derive(Debug)]
pub struct MachineController<T = UdpTransport> {
    host: Option<String>,
    config: MachineConfig,
    connection: ScpConnection<T>,
    buffer_known: bool,
    nn_id: u8,
    routed_chips: BTreeMap<u8, BTreeSet<(u8, u8)>>,
}

impl MachineController<UdpTransport> {
    /// Open a UDP connection to `host`.
    ///
    /// # Errors
    ///
    /// Returns [`SpinnError::Io`] if the socket cannot be created.
    pub fn connect(host: &str, config: MachineConfig) -> Result<Self> {
        let transport = UdpTransport::connect(host, config.scp.port)?;
        info!(host, port = config.scp.port, "Machine connection opened");
        let mut controller = Self::with_transport(transport, config);
        controller.host = Some(host.to_string());
        Ok(controller)
    }

    /// Boot the machine with a monitor image.
    ///
    /// `sv` optionally supplies the 128-byte system-variable block.
    ///
    /// # Errors
    ///
    /// See [`boot::boot`].
    pub fn boot(&mut self, image: &[u8], sv: Option<&[u8]>) -> Result<()> {
        let host = self
            .host
            .clone()
            .ok_or_else(|| SpinnError::invalid_argument("controller has no host to boot"))?;
        let mut transport = UdpTransport::connect(&host, self.config.boot_port)?;
        boot::boot(&mut transport, image, sv, &self.config.boot)?;
        info!(host, "Boot image sent");
        Ok(())
    }
}

impl<T: Transport> MachineController<T> {
    /// Control a machine reachable through `transport`.
    pub fn with_transport(transport: T, config: MachineConfig) -> Self {
        let buffer_known = config.scp.buffer_size.is_some();
        let connection = ScpConnection::new(transport, config.scp.clone());
        Self {
            host: None,
            config,
            connection,
            buffer_known,
            nn_id: 0,
            routed_chips: BTreeMap::new(),
        }
    }

    /// Controller parameters.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// The underlying SCP connection.
    pub fn connection(&mut self) -> &mut ScpConnection<T> {
        &mut self.connection
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        self.connection.transport()
    }

    /// Send one raw SCP command.
    ///
    /// # Errors
    ///
    /// See [`ScpConnection::send_scp`].
    pub fn send_scp(&mut self, call: ScpCall) -> Result<ScpPacket> {
        self.connection.send_scp(call)
    }

    /// Data bytes per SCP packet, asking the root chip on first use.
    ///
    /// # Errors
    ///
    /// Propagates a failed `sver`.
    pub fn scp_data_length(&mut self) -> Result<usize> {
        if !self.buffer_known {
            let info = self.software_version(0, 0, 0)?;
            self.connection.set_buffer_size(info.buffer_size);
            self.buffer_known = true;
            debug!(buffer_size = self.connection.buffer_size(), "SCP buffer size negotiated");
        }
        Ok(self.connection.buffer_size())
    }

    /// Identify the software on a core.
    ///
    /// # Errors
    ///
    /// Timeout or rejection of `sver`.
    pub fn software_version(&mut self, x: u8, y: u8, p: u8) -> Result<CoreInfo> {
        let reply = self.send_scp(ScpCall::new(CoreAddr::new(x, y, p), Command::Sver))?;
        Ok(CoreInfo::from_reply(&reply))
    }

    /// Read `length` bytes of memory.
    ///
    /// # Errors
    ///
    /// See [`ScpConnection::read`].
    pub fn read(&mut self, x: u8, y: u8, p: u8, address: u32, length: usize) -> Result<Vec<u8>> {
        self.scp_data_length()?;
        self.connection.read(CoreAddr::new(x, y, p), address, length)
    }

    /// Write memory.
    ///
    /// # Errors
    ///
    /// See [`ScpConnection::write`].
    pub fn write(&mut self, x: u8, y: u8, p: u8, address: u32, data: &[u8]) -> Result<()> {
        self.scp_data_length()?;
        self.connection.write(CoreAddr::new(x, y, p), address, data)
    }

    /// Allocate `size` bytes of SDRAM on a chip for `app_id`.
    ///
    /// # Errors
    ///
    /// [`SpinnError::MemoryAllocation`] when the monitor returns a null
    /// pointer.
    pub fn sdram_alloc(&mut self, x: u8, y: u8, size: u32, tag: u8, app_id: u8) -> Result<u32> {
        let arg1 = (u32::from(app_id) << 8) | AllocOperation::AllocSdram as u32;
        let reply = self.send_scp(
            ScpCall::new(CoreAddr::monitor(x, y), Command::AllocFree)
                .args(arg1, size, u32::from(tag))
                .expected_args(1),
        )?;
        match reply.arg(0) {
            0 => Err(SpinnError::MemoryAllocation { x, y, size, tag }),
            address => {
                debug!(x, y, size, tag, address = format_args!("{address:#010x}"), "SDRAM allocated");
                Ok(address)
            }
        }
    }

    // ── IP tags and LEDs ─────────────────────────────────────────────────────

    /// Point IP tag `iptag` on a chip at `addr:port`.
    ///
    /// # Errors
    ///
    /// Timeout or rejection.
    pub fn iptag_set(&mut self, x: u8, y: u8, iptag: u8, addr: Ipv4Addr, port: u16) -> Result<()> {
        let arg1 = ((IptagCommand::Set as u32) << 16) | u32::from(iptag);
        self.send_scp(
            ScpCall::new(CoreAddr::monitor(x, y), Command::Iptag)
                .args(arg1, u32::from(port), u32::from_le_bytes(addr.octets()))
                .expected_args(0),
        )?;
        Ok(())
    }

    /// Read IP tag `iptag` from a chip.
    ///
    /// # Errors
    ///
    /// Timeout, rejection or a short reply.
    pub fn iptag_get(&mut self, x: u8, y: u8, iptag: u8) -> Result<IpTag> {
        let arg1 = ((IptagCommand::Get as u32) << 16) | u32::from(iptag);
        let reply = self.send_scp(
            ScpCall::new(CoreAddr::monitor(x, y), Command::Iptag)
                .args(arg1, 1, 0)
                .expected_args(0),
        )?;
        IpTag::from_bytes(&reply.data)
    }

    /// Clear IP tag `iptag` on a chip.
    ///
    /// # Errors
    ///
    /// Timeout or rejection.
    pub fn iptag_clear(&mut self, x: u8, y: u8, iptag: u8) -> Result<()> {
        let arg1 = ((IptagCommand::Clear as u32) << 16) | u32::from(iptag);
        self.send_scp(
            ScpCall::new(CoreAddr::monitor(x, y), Command::Iptag)
                .args(arg1, 0, 0)
                .expected_args(0),
        )?;
        Ok(())
    }

    /// Set (`Some(true)`), clear (`Some(false)`) or toggle (`None`) LEDs.
    ///
    /// # Errors
    ///
    /// Timeout or rejection.
    pub fn set_led(&mut self, x: u8, y: u8, leds: &[u8], state: Option<bool>) -> Result<()> {
        let action = LedAction::from_state(state) as u32;
        let arg1 = leds.iter().fold(0u32, |acc, &led| acc | (action << (u32::from(led) * 2)));
        self.send_scp(
            ScpCall::new(CoreAddr::monitor(x, y), Command::Led)
                .args(arg1, 0, 0)
                .expected_args(0),
        )?;
        Ok(())
    }

    // ── Signals ──────────────────────────────────────────────────────────────

    /// Broadcast `signal` to every core running `app_id`.
    ///
    /// # Errors
    ///
    /// Timeout or rejection.
    pub fn send_signal(&mut self, signal: AppSignal, app_id: u8) -> Result<()> {
        let arg1 = signal.signal_type() as u32;
        let arg2 = ((signal as u32) << 16) | 0xFF00 | u32::from(app_id);
        self.send_scp(
            ScpCall::new(CoreAddr::monitor(0, 0), Command::Signal)
                .args(arg1, arg2, SIGNAL_ALL_CHIPS)
                .expected_args(0),
        )?;
        debug!(?signal, app_id, "Signal sent");
        Ok(())
    }

    /// Count the cores of `app_id` in `state`.
    ///
    /// # Errors
    ///
    /// Timeout or rejection.
    pub fn count_cores_in_state(&mut self, state: AppState, app_id: u8) -> Result<usize> {
        let kind = DiagnosticSignal::Count;
        let arg1 = kind.signal_type() as u32;
        let arg2 = ((kind as u32) << 20) | ((state as u32) << 16) | 0xFF00 | u32::from(app_id);
        let reply = self.send_scp(
            ScpCall::new(CoreAddr::monitor(0, 0), Command::Signal)
                .args(arg1, arg2, SIGNAL_ALL_CHIPS)
                .expected_args(1),
        )?;
        Ok(reply.arg(0) as usize)
    }

    /// Poll until at least `count` cores of `app_id` are in `state`, or
    /// `timeout` passes. Returns the last count seen.
    ///
    /// # Errors
    ///
    /// Timeout or rejection of a poll.
    pub fn wait_for_cores_to_reach_state(
        &mut self,
        state: AppState,
        count: usize,
        app_id: u8,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let start = Instant::now();
        loop {
            let seen = self.count_cores_in_state(state, app_id)?;
            if seen >= count || timeout.is_some_and(|t| start.elapsed() >= t) {
                return Ok(seen);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    // ── Routing tables ───────────────────────────────────────────────────────

    /// Load `entries` into a chip's router on behalf of `app_id`.
    ///
    /// Entries are staged in system SDRAM, then copied into a block of
    /// router slots allocated for the application.
    ///
    /// # Errors
    ///
    /// [`SpinnError::RouterAllocation`] if the router has no room.
    pub fn load_routing_table_entries(
        &mut self,
        x: u8,
        y: u8,
        entries: &[RoutingTableEntry],
        app_id: u8,
    ) -> Result<()> {
        let count = entries.len();
        if count == 0 {
            return Ok(());
        }
        if count > self.config.chip.router_entries {
            return Err(SpinnError::RouterAllocation { x, y, count });
        }
        let monitor = CoreAddr::monitor(x, y);
        let app = u32::from(app_id);

        let reply = self.send_scp(
            ScpCall::new(monitor, Command::AllocFree)
                .args((app << 8) | AllocOperation::AllocRtr as u32, count as u32, 0)
                .expected_args(1),
        )?;
        let base = reply.arg(0);
        if base == 0 {
            return Err(SpinnError::RouterAllocation { x, y, count });
        }

        let staged: Vec<u8> = entries
            .iter()
            .enumerate()
            .flat_map(|(i, e)| {
                RouterRecord::staged(i as u16, e.route.bits(), e.key, e.mask).to_bytes()
            })
            .collect();
        let buffer = self.config.chip.sdram_sys;
        self.write(x, y, 0, buffer, &staged)?;

        let arg1 = ((count as u32) << 16) | (app << 8) | RouterOperation::Load as u32;
        self.send_scp(
            ScpCall::new(monitor, Command::Router)
                .args(arg1, buffer, base)
                .expected_args(0),
        )?;
        self.routed_chips.entry(app_id).or_default().insert((x, y));
        debug!(x, y, count, base, app_id, "Routing entries loaded");
        Ok(())
    }

    /// Load a routing table onto every chip in `tables`.
    ///
    /// # Errors
    ///
    /// The first chip that fails.
    pub fn load_routing_tables(
        &mut self,
        tables: &BTreeMap<(u8, u8), Vec<RoutingTableEntry>>,
        app_id: u8,
    ) -> Result<()> {
        for (&(x, y), entries) in tables {
            self.load_routing_table_entries(x, y, entries, app_id)?;
        }
        Ok(())
    }

    /// Read a chip's router, one slot per element; `None` marks a free slot.
    ///
    /// # Errors
    ///
    /// Timeout or rejection of the reads.
    pub fn get_routing_table_entries(&mut self, x: u8, y: u8) -> Result<Vec<Option<LoadedRoute>>> {
        let chip = self.config.chip;
        let raw = self.read(x, y, 0, chip.rtr_copy, chip.router_entries * RECORD_SIZE)?;
        Ok(raw
            .chunks_exact(RECORD_SIZE)
            .map(|chunk| {
                let mut bytes = [0u8; RECORD_SIZE];
                bytes.copy_from_slice(chunk);
                let record = RouterRecord::from_bytes(&bytes);
                (!record.is_unused()).then(|| LoadedRoute {
                    entry: RoutingTableEntry::new(
                        RouteSet::from_bits(record.route),
                        record.key,
                        record.mask,
                    ),
                    app_id: record.app_id(),
                    core: record.core(),
                })
            })
            .collect())
    }

    /// Free every router entry `app_id` holds on a chip.
    ///
    /// # Errors
    ///
    /// Timeout or rejection.
    pub fn clear_routing_table_entries(&mut self, x: u8, y: u8, app_id: u8) -> Result<()> {
        let arg1 = (u32::from(app_id) << 8) | AllocOperation::FreeRtrByApp as u32;
        self.send_scp(
            ScpCall::new(CoreAddr::monitor(x, y), Command::AllocFree)
                .args(arg1, 1, 0)
                .expected_args(1),
        )?;
        if let Some(chips) = self.routed_chips.get_mut(&app_id) {
            chips.remove(&(x, y));
            if chips.is_empty() {
                self.routed_chips.remove(&app_id);
            }
        }
        Ok(())
    }

    // ── Application loading ──────────────────────────────────────────────────

    fn next_nn_id(&mut self) -> u32 {
        self.nn_id = if self.nn_id < nn::MAX_ID { self.nn_id + 1 } else { 1 };
        u32::from(self.nn_id) * 2
    }

    fn send_nn(&mut self, arg1: u32, arg2: u32, arg3: u32) -> Result<()> {
        self.send_scp(
            ScpCall::new(CoreAddr::monitor(0, 0), Command::NearestNeighbourPacket)
                .args(arg1, arg2, arg3)
                .expected_args(0),
        )?;
        Ok(())
    }

    /// Flood-fill an application image onto `targets`.
    ///
    /// Cores start running immediately unless `wait` is set, in which case
    /// they stop in [`AppState::Wait`] until sent [`AppSignal::Start`].
    ///
    /// # Errors
    ///
    /// [`SpinnError::InvalidArgument`] for an empty image, more than 255
    /// blocks or a core number above 31; otherwise timeout or rejection.
    pub fn flood_fill_aplx(
        &mut self,
        targets: &CoreTargets,
        aplx: &[u8],
        app_id: u8,
        wait: bool,
    ) -> Result<()> {
        if aplx.is_empty() {
            return Err(SpinnError::invalid_argument("empty application image"));
        }
        let mut masks = BTreeMap::new();
        for (&chip, cores) in targets {
            let mut mask = 0u32;
            for &p in cores {
                if p >= 32 {
                    return Err(SpinnError::invalid_argument(format!("core {p} out of range")));
                }
                mask |= 1 << p;
            }
            masks.insert(chip, mask);
        }

        let block_size = self.scp_data_length()? & !3;
        let mut image = aplx.to_vec();
        image.resize(image.len().next_multiple_of(4), 0);
        let n_blocks = image.len().div_ceil(block_size);
        if n_blocks > 0xFF {
            return Err(SpinnError::invalid_argument(format!(
                "application of {} bytes needs {n_blocks} blocks, at most 255 allowed",
                image.len()
            )));
        }

        let pid = self.next_nn_id();
        let fr = (nn::FORWARD << 8) | nn::RETRY;
        debug!(pid, n_blocks, chips = masks.len(), app_id, "Flood fill start");

        self.send_nn(
            (nn::FLOOD_FILL_START << 24) | (pid << 16) | ((n_blocks as u32) << 8),
            0,
            fr | (1 << 31),
        )?;
        for (region, cores) in compress_flood_fill_regions(&masks) {
            self.send_nn((nn::FLOOD_FILL_CORE_SELECT << 24) | cores, region, fr)?;
        }

        let mut address = self.config.chip.sdram_sys;
        let ffd_arg1 = (nn::FORWARD << 24) | (nn::RETRY << 16) | pid;
        for (block, data) in image.chunks(block_size).enumerate() {
            let words = (data.len() / 4) as u32;
            self.send_scp(
                ScpCall::new(CoreAddr::monitor(0, 0), Command::FloodFillData)
                    .args(ffd_arg1, ((block as u32) << 16) | ((words - 1) << 8), address)
                    .data(Bytes::copy_from_slice(data))
                    .expected_args(0),
            )?;
            address = address.wrapping_add(data.len() as u32);
        }

        let flags = if wait { APP_FLAG_WAIT } else { 0 };
        self.send_nn(
            (nn::FLOOD_FILL_END << 24) | pid,
            (u32::from(app_id) << 24) | (flags << 18),
            fr,
        )?;
        Ok(())
    }

    /// Load an application and verify every target core came up.
    ///
    /// The image is flood-filled with the wait flag, then the cores in
    /// [`AppState::Wait`] are counted. Missing cores trigger another fill,
    /// up to [`MachineConfig::load_tries`] fills in total. Unless `wait` is
    /// set the application is then started.
    ///
    /// # Errors
    ///
    /// [`SpinnError::LoadingFailed`] when cores are still missing after the
    /// last attempt.
    pub fn load_application(
        &mut self,
        targets: &CoreTargets,
        aplx: &[u8],
        app_id: u8,
        wait: bool,
    ) -> Result<()> {
        let expected: usize = targets.values().map(BTreeSet::len).sum();
        let tries = self.config.load_tries.max(1);
        let mut loaded = 0;
        let mut attempts = 0;

        while attempts < tries {
            attempts += 1;
            self.flood_fill_aplx(targets, aplx, app_id, true)?;
            std::thread::sleep(self.config.app_start_delay);
            loaded = self.count_cores_in_state(AppState::Wait, app_id)?;
            if loaded >= expected {
                break;
            }
            warn!(loaded, expected, attempt = attempts, app_id, "Application load incomplete");
        }

        if loaded < expected {
            return Err(SpinnError::LoadingFailed { loaded, expected, attempts });
        }
        info!(cores = expected, app_id, attempts, "Application loaded");
        if !wait {
            self.send_signal(AppSignal::Start, app_id)?;
        }
        Ok(())
    }

    /// Stop `app_id` and free the router entries loaded for it.
    ///
    /// Every step is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Timeout or rejection of the stop signal or a router clear.
    pub fn stop_application(&mut self, app_id: u8) -> Result<()> {
        let mut result = self.send_signal(AppSignal::Stop, app_id);
        let chips = self.routed_chips.get(&app_id).cloned().unwrap_or_default();
        for (x, y) in chips {
            let cleared = self.clear_routing_table_entries(x, y, app_id);
            if result.is_ok() {
                result = cleared;
            }
        }
        result
    }

    /// Run `f` with `app_id` and tear the application down afterwards,
    /// whether `f` succeeds, fails or panics.
    ///
    /// An error from `f` takes precedence over a teardown error. A panic in
    /// `f` is resumed once teardown has been attempted.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns, else a teardown failure.
    pub fn with_application<R, F>(&mut self, app_id: u8, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *self))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                if let Err(e) = self.stop_application(app_id) {
                    warn!(app_id, error = %e, "Teardown after panic failed");
                }
                panic::resume_unwind(payload);
            }
        };
        let teardown = self.stop_application(app_id);
        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!(app_id, error = %teardown, "Teardown after failure also failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedMachine;

    fn controller(sim: SimulatedMachine) -> MachineController<SimulatedMachine> {
        let scp = ScpConfig::default().with_timeout(Duration::from_millis(20));
        MachineController::with_transport(
            sim,
            MachineConfig::default()
                .with_scp(scp)
                .with_app_start_delay(Duration::ZERO)
                .with_poll_interval(Duration::from_millis(1)),
        )
    }

    #[test]
    fn core_info_decode() {
        let mut mc = controller(SimulatedMachine::new(2, 2));
        let info = mc.software_version(1, 0, 3).unwrap();
        assert_eq!(info.position, (1, 0));
        assert_eq!(info.virtual_cpu, 3);
        assert_eq!(info.buffer_size, 256);
        assert!((info.version - 1.33).abs() < 1e-6);
        assert_eq!(info.version_string, "SC&MP/SpiNNaker");
        assert!(info.to_string().starts_with("SC&MP/SpiNNaker v1.33"));
    }

    #[test]
    fn buffer_size_negotiated_once() {
        let mut mc = controller(SimulatedMachine::new(1, 1).with_buffer_size(128));
        assert_eq!(mc.scp_data_length().unwrap(), 128);
        mc.write(0, 0, 0, 0x6000_0000, &[7; 300]).unwrap();
        assert_eq!(mc.read(0, 0, 0, 0x6000_0000, 300).unwrap(), vec![7; 300]);
        assert_eq!(mc.transport().count_commands(Command::Sver), 1);
        assert_eq!(mc.transport().count_commands(Command::Write), 3);
    }

    #[test]
    fn sdram_alloc_returns_address() {
        let mut mc = controller(SimulatedMachine::new(1, 1));
        let a = mc.sdram_alloc(0, 0, 100, 1, 30).unwrap();
        let b = mc.sdram_alloc(0, 0, 100, 2, 30).unwrap();
        assert_ne!(a, 0);
        assert!(b >= a + 100);
        let err = mc.sdram_alloc(0, 0, u32::MAX, 3, 30).unwrap_err();
        assert!(matches!(err, SpinnError::MemoryAllocation { size: u32::MAX, tag: 3, .. }));
        assert!(err.is_capacity());
    }

    #[test]
    fn iptags() {
        let mut mc = controller(SimulatedMachine::new(1, 1));
        let addr = Ipv4Addr::new(192, 168, 1, 2);
        mc.iptag_set(0, 0, 1, addr, 50_000).unwrap();
        let tag = mc.iptag_get(0, 0, 1).unwrap();
        assert_eq!(tag.addr, addr);
        assert_eq!(tag.port, 50_000);
        assert!(tag.in_use());

        mc.iptag_clear(0, 0, 1).unwrap();
        assert!(!mc.iptag_get(0, 0, 1).unwrap().in_use());
    }

    #[test]
    fn iptag_decode_rejects_short_data() {
        assert!(IpTag::from_bytes(&[0; 24]).is_err());
    }

    #[test]
    fn leds() {
        let mut mc = controller(SimulatedMachine::new(1, 1));
        mc.set_led(0, 0, &[0, 1], Some(true)).unwrap();
        assert_eq!(mc.transport().leds(0, 0), 0b1111);
        mc.set_led(0, 0, &[1], None).unwrap();
        assert_eq!(mc.transport().leds(0, 0), 0b0100);
    }

    #[test]
    fn version_string_stops_at_nul() {
        assert_eq!(decode_version_string(b"abc\0\0junk"), "abc");
        assert_eq!(decode_version_string(b"abc"), "abc");
    }

    #[test]
    fn nn_ids_wrap() {
        let mut mc = controller(SimulatedMachine::new(1, 1));
        assert_eq!(mc.next_nn_id(), 2);
        mc.nn_id = nn::MAX_ID;
        assert_eq!(mc.next_nn_id(), 2);
    }

    #[test]
    fn flood_fill_rejects_bad_targets() {
        let mut mc = controller(SimulatedMachine::new(1, 1));
        let targets = CoreTargets::from([((0, 0), BTreeSet::from([40]))]);
        assert!(mc.flood_fill_aplx(&targets, &[0; 8], 1, false).is_err());
        let targets = CoreTargets::from([((0, 0), BTreeSet::from([1]))]);
        assert!(mc.flood_fill_aplx(&targets, &[], 1, false).is_err());
        assert!(mc.flood_fill_aplx(&targets, &vec![0; 256 * 256], 1, false).is_err());
    }

    #[test]
    fn wait_for_state_times_out_with_last_count() {
        let mut mc = controller(SimulatedMachine::new(1, 1));
        let seen = mc
            .wait_for_cores_to_reach_state(AppState::Run, 4, 9, Some(Duration::from_millis(5)))
            .unwrap();
        assert_eq!(seen, 0);
    }
}
