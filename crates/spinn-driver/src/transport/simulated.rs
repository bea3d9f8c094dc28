// SPDX-License-Identifier: AGPL-3.0-only

//! In-process SpiNNaker machine.
//!
//! Answers SCP the way SC&MP (or a BMP) would, with just enough state to
//! make the driver's operations observable: sparse memory per chip, an SDRAM
//! bump allocator, the router and its monitor copy, IP tags, core states
//! and board power. A [`FaultPlan`] injects loss, duplication, stale replies
//! and error return codes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use spinn_chip::app::{
    nn, AllocOperation, AppSignal, AppState, DiagnosticSignal, IptagCommand, RouterOperation,
    SignalType, APP_FLAG_WAIT,
};
use spinn_chip::regions::{region_for_chip, CHIP_LEVEL};
use spinn_chip::router::{RouterRecord, RECORD_SIZE};
use spinn_chip::scp::{Command, ReturnCode};
use tracing::trace;

use super::Transport;
use crate::machine::ChipConstants;
use crate::packets::{CoreAddr, ScpPacket};

const PAGE_SIZE: usize = 4096;
const SDRAM_HEAP_BASE: u32 = 0x6000_0000;
const SDRAM_HEAP_SIZE: u32 = 64 * 1024 * 1024;
const NUM_IPTAGS: usize = 8;
const SCAMP_VERSION: u32 = 133;
const BUILD_DATE: u32 = 0x5A5A_0000;

// ── Fault injection ──────────────────────────────────────────────────────────

/// Faults applied to traffic through a [`SimulatedMachine`].
///
/// Request and reply indices count every datagram seen in that direction,
/// starting at zero, including retransmissions.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    drop_all: bool,
    drop_requests: BTreeSet<usize>,
    drop_replies: BTreeSet<usize>,
    duplicate_replies: bool,
    stale_replies: bool,
    overrides: Vec<(Command, u16, usize)>,
}

impl FaultPlan {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// Lose every request.
    #[must_use]
    pub fn drop_all(mut self) -> Self {
        self.drop_all = true;
        self
    }

    /// Lose the `index`th request.
    #[must_use]
    pub fn drop_request(mut self, index: usize) -> Self {
        self.drop_requests.insert(index);
        self
    }

    /// Lose the `index`th reply.
    #[must_use]
    pub fn drop_reply(mut self, index: usize) -> Self {
        self.drop_replies.insert(index);
        self
    }

    /// Deliver every reply twice.
    #[must_use]
    pub fn duplicate_replies(mut self) -> Self {
        self.duplicate_replies = true;
        self
    }

    /// Precede every reply with one carrying the previous sequence number.
    #[must_use]
    pub fn stale_replies(mut self) -> Self {
        self.stale_replies = true;
        self
    }

    /// Answer every `command` with return code `rc`.
    #[must_use]
    pub fn reject(self, command: Command, rc: u16) -> Self {
        self.reject_times(command, rc, usize::MAX)
    }

    /// Answer the next `times` occurrences of `command` with `rc`.
    #[must_use]
    pub fn reject_times(mut self, command: Command, rc: u16, times: usize) -> Self {
        self.overrides.push((command, rc, times));
        self
    }

    fn take_override(&mut self, command: Command) -> Option<u16> {
        let slot = self.overrides.iter_mut().find(|(c, _, n)| *c == command && *n > 0)?;
        slot.2 = slot.2.saturating_sub(1);
        Some(slot.1)
    }
}

// ── Machine state ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimChip {
    memory: HashMap<u32, Box<[u8; PAGE_SIZE]>>,
    sdram_next: u32,
    router: Vec<RouterRecord>,
    reserved: BTreeMap<usize, u8>,
    iptags: [Option<(u32, u16)>; NUM_IPTAGS],
    leds: u32,
    cores: BTreeMap<u8, (u8, AppState)>,
}

impl SimChip {
    fn new(constants: &ChipConstants) -> Self {
        let mut chip = Self {
            memory: HashMap::new(),
            sdram_next: SDRAM_HEAP_BASE,
            router: vec![RouterRecord::UNUSED; constants.router_entries],
            reserved: BTreeMap::new(),
            iptags: [None; NUM_IPTAGS],
            leds: 0,
            cores: BTreeMap::new(),
        };
        chip.mirror_router(constants.rtr_copy);
        chip
    }

    fn read(&self, address: u32, length: usize) -> Vec<u8> {
        (0..length)
            .map(|i| {
                let a = address.wrapping_add(i as u32);
                self.memory
                    .get(&(a / PAGE_SIZE as u32))
                    .map_or(0, |page| page[a as usize % PAGE_SIZE])
            })
            .collect()
    }

    fn write(&mut self, address: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let a = address.wrapping_add(i as u32);
            let page = self
                .memory
                .entry(a / PAGE_SIZE as u32)
                .or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[a as usize % PAGE_SIZE] = byte;
        }
    }

    fn mirror_router(&mut self, rtr_copy: u32) {
        let data: Vec<u8> = self.router.iter().flat_map(RouterRecord::to_bytes).collect();
        self.write(rtr_copy, &data);
    }

    fn alloc_sdram(&mut self, size: u32) -> u32 {
        let base = self.sdram_next;
        let end = u64::from(base) + u64::from(size).next_multiple_of(4);
        if end > u64::from(SDRAM_HEAP_BASE) + u64::from(SDRAM_HEAP_SIZE) {
            return 0;
        }
        self.sdram_next = end as u32;
        base
    }

    /// First run of `count` free slots, skipping slot 0 (a zero base means
    /// failure on the wire).
    fn alloc_router(&mut self, count: usize, app_id: u8) -> u32 {
        if count == 0 {
            return 0;
        }
        let free = |i: usize| self.router[i].is_unused() && !self.reserved.contains_key(&i);
        let Some(base) = (1..self.router.len())
            .find(|&b| b + count <= self.router.len() && (b..b + count).all(free))
        else {
            return 0;
        };
        for i in base..base + count {
            self.reserved.insert(i, app_id);
        }
        base as u32
    }

    fn free_router(&mut self, app_id: u8) -> u32 {
        let mut freed = 0;
        for record in &mut self.router {
            if !record.is_unused() && record.app_id() == app_id {
                *record = RouterRecord::UNUSED;
                freed += 1;
            }
        }
        self.reserved.retain(|_, owner| *owner != app_id);
        freed
    }
}

#[derive(Debug, Default)]
struct FloodFill {
    pid: u32,
    n_blocks: u32,
    blocks: u32,
    selections: Vec<(u32, u32)>,
}

/// A simulated SpiNNaker machine (or BMP) reachable as a [`Transport`].
#[derive(Debug)]
pub struct SimulatedMachine {
    width: u8,
    height: u8,
    constants: ChipConstants,
    bmp: bool,
    buffer_size: u16,
    chips: BTreeMap<(u8, u8), SimChip>,
    flood_fill: FloodFill,
    failed_loads: usize,
    powered_boards: u32,
    bmp_leds: u32,
    faults: FaultPlan,
    replies: VecDeque<Bytes>,
    requests_seen: usize,
    replies_made: usize,
    commands: Vec<(CoreAddr, Command)>,
}

impl SimulatedMachine {
    /// A booted machine of `width × height` chips.
    pub fn new(width: u8, height: u8) -> Self {
        Self {
            width,
            height,
            constants: ChipConstants::default(),
            bmp: false,
            buffer_size: 256,
            chips: BTreeMap::new(),
            flood_fill: FloodFill::default(),
            failed_loads: 0,
            powered_boards: 0,
            bmp_leds: 0,
            faults: FaultPlan::none(),
            replies: VecDeque::new(),
            requests_seen: 0,
            replies_made: 0,
            commands: Vec::new(),
        }
    }

    /// A board management processor.
    pub fn bmp() -> Self {
        Self {
            bmp: true,
            ..Self::new(1, 1)
        }
    }

    /// Apply a fault plan.
    #[must_use]
    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Use non-default memory map constants.
    #[must_use]
    pub fn with_chip_constants(mut self, constants: ChipConstants) -> Self {
        self.constants = constants;
        self
    }

    /// SCP data buffer size reported by `sver`.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: u16) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Make the next `n` flood fills load nothing.
    #[must_use]
    pub fn with_failed_loads(mut self, n: usize) -> Self {
        self.failed_loads = n;
        self
    }

    /// Replace the fault plan.
    pub fn set_faults(&mut self, faults: FaultPlan) {
        self.faults = faults;
    }

    /// Datagrams received, including ones the fault plan dropped.
    pub fn datagrams_received(&self) -> usize {
        self.requests_seen
    }

    /// Commands executed, in order, after loss.
    pub fn commands(&self) -> &[(CoreAddr, Command)] {
        &self.commands
    }

    /// Number of executed commands of one kind.
    pub fn count_commands(&self, command: Command) -> usize {
        self.commands.iter().filter(|(_, c)| *c == command).count()
    }

    /// Peek at chip memory.
    pub fn memory(&self, x: u8, y: u8, address: u32, length: usize) -> Vec<u8> {
        self.chips
            .get(&(x, y))
            .map_or_else(|| vec![0; length], |chip| chip.read(address, length))
    }

    /// Live router records of a chip, with their slot index.
    pub fn router_entries(&self, x: u8, y: u8) -> Vec<(usize, RouterRecord)> {
        self.chips.get(&(x, y)).map_or_else(Vec::new, |chip| {
            chip.router
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.is_unused())
                .map(|(i, r)| (i, *r))
                .collect()
        })
    }

    /// Application and state of a core, if anything is loaded on it.
    pub fn core_state(&self, x: u8, y: u8, p: u8) -> Option<(u8, AppState)> {
        self.chips.get(&(x, y))?.cores.get(&p).copied()
    }

    /// LED word last written to a chip.
    pub fn leds(&self, x: u8, y: u8) -> u32 {
        self.chips.get(&(x, y)).map_or(0, |chip| chip.leds)
    }

    /// Bit mask of powered boards (BMP only).
    pub fn powered_boards(&self) -> u32 {
        self.powered_boards
    }

    /// LED word and board mask last written to the BMP.
    pub fn bmp_leds(&self) -> u32 {
        self.bmp_leds
    }

    fn chip_mut(&mut self, x: u8, y: u8) -> &mut SimChip {
        let constants = &self.constants;
        self.chips.entry((x, y)).or_insert_with(|| SimChip::new(constants))
    }

    fn exists(&self, x: u8, y: u8) -> bool {
        self.bmp || (x < self.width && y < self.height)
    }

    // ── Command execution ────────────────────────────────────────────────────

    fn execute(&mut self, request: &ScpPacket) -> (u16, Vec<u32>, Bytes) {
        let ok = ReturnCode::Ok.code();
        let dest = request.header.dest();
        let Some(command) = Command::from_code(request.cmd_rc) else {
            return (ReturnCode::Cmd.code(), Vec::new(), Bytes::new());
        };
        self.commands.push((dest, command));

        if let Some(rc) = self.faults.take_override(command) {
            return (rc, Vec::new(), Bytes::new());
        }
        if !self.exists(dest.x, dest.y) {
            return (ReturnCode::Route.code(), Vec::new(), Bytes::new());
        }

        let (a1, a2, a3) = (request.arg(0), request.arg(1), request.arg(2));
        match command {
            Command::Sver => self.sver(dest),
            Command::Read => {
                if a2 as usize > usize::from(self.buffer_size) {
                    return (ReturnCode::Len.code(), Vec::new(), Bytes::new());
                }
                let data = self.chip_mut(dest.x, dest.y).read(a1, a2 as usize);
                (ok, Vec::new(), Bytes::from(data))
            }
            Command::Write => {
                if a2 as usize != request.data.len() {
                    return (ReturnCode::Len.code(), Vec::new(), Bytes::new());
                }
                self.chip_mut(dest.x, dest.y).write(a1, &request.data);
                (ok, Vec::new(), Bytes::new())
            }
            Command::Signal => (ok, self.signal(a1, a2), Bytes::new()),
            Command::NearestNeighbourPacket => self.nearest_neighbour(a1, a2),
            Command::FloodFillData => {
                let words = ((a2 >> 8) & 0xFF) + 1;
                if request.data.len() < 4 * words as usize {
                    return (ReturnCode::Len.code(), Vec::new(), Bytes::new());
                }
                self.flood_fill.blocks += 1;
                (ok, Vec::new(), Bytes::new())
            }
            Command::Led => {
                if self.bmp {
                    self.bmp_leds = a1;
                } else {
                    self.chip_mut(dest.x, dest.y).leds = a1;
                }
                (ok, Vec::new(), Bytes::new())
            }
            Command::Iptag => self.iptag(dest, a1, a2, a3),
            Command::AllocFree => self.alloc_free(dest, a1, a2),
            Command::Router => self.router(dest, a1, a2, a3),
            Command::Power => {
                if !self.bmp {
                    return (ReturnCode::Cmd.code(), Vec::new(), Bytes::new());
                }
                if a1 & 1 == 1 {
                    self.powered_boards |= a2;
                } else {
                    self.powered_boards &= !a2;
                }
                (ok, Vec::new(), Bytes::new())
            }
        }
    }

    fn sver(&self, dest: CoreAddr) -> (u16, Vec<u32>, Bytes) {
        let (arg1, name) = if self.bmp {
            let board = u32::from(dest.p);
            ((board << 8) | board, "BC&MP/Spin5-BMP\0")
        } else {
            let p2p = (u32::from(dest.x) << 8) | u32::from(dest.y);
            ((p2p << 16) | (u32::from(dest.p) << 8) | u32::from(dest.p), "SC&MP/SpiNNaker\0")
        };
        let arg2 = (SCAMP_VERSION << 16) | u32::from(self.buffer_size);
        (ReturnCode::Ok.code(), vec![arg1, arg2, BUILD_DATE], Bytes::from_static(name.as_bytes()))
    }

    fn signal(&mut self, kind: u32, word: u32) -> Vec<u32> {
        let app_id = (word & 0xFF) as u8;
        let code = (word >> 16) & 0xF;

        if kind == SignalType::PointToPoint as u32
            && (word >> 20) & 0x3 == DiagnosticSignal::Count as u32
        {
            let count = self
                .chips
                .values()
                .flat_map(|chip| chip.cores.values())
                .filter(|&&(app, state)| app == app_id && state as u32 == code)
                .count();
            return vec![count as u32];
        }

        for chip in self.chips.values_mut() {
            if code == AppSignal::Stop as u32 {
                chip.cores.retain(|_, (app, _)| *app != app_id);
            } else if code == AppSignal::Start as u32 {
                for (app, state) in chip.cores.values_mut() {
                    if *app == app_id && *state == AppState::Wait {
                        *state = AppState::Run;
                    }
                }
            }
        }
        Vec::new()
    }

    fn nearest_neighbour(&mut self, a1: u32, a2: u32) -> (u16, Vec<u32>, Bytes) {
        match a1 >> 24 {
            nn::FLOOD_FILL_START => {
                self.flood_fill = FloodFill {
                    pid: (a1 >> 16) & 0xFF,
                    n_blocks: (a1 >> 8) & 0xFF,
                    ..FloodFill::default()
                };
            }
            nn::FLOOD_FILL_CORE_SELECT => self.flood_fill.selections.push((a2, a1 & 0x00FF_FFFF)),
            nn::FLOOD_FILL_END => {
                let fill = std::mem::take(&mut self.flood_fill);
                if fill.pid != a1 & 0xFF || fill.blocks != fill.n_blocks {
                    trace!(pid = fill.pid, blocks = fill.blocks, "Incomplete flood fill ignored");
                } else if self.failed_loads > 0 {
                    self.failed_loads -= 1;
                } else {
                    self.complete_flood_fill(&fill, (a2 >> 24) as u8, (a2 >> 18) & 0x3F);
                }
            }
            _ => return (ReturnCode::Arg.code(), Vec::new(), Bytes::new()),
        }
        (ReturnCode::Ok.code(), Vec::new(), Bytes::new())
    }

    fn complete_flood_fill(&mut self, fill: &FloodFill, app_id: u8, flags: u32) {
        let state = if flags & APP_FLAG_WAIT != 0 { AppState::Wait } else { AppState::Run };
        for x in 0..self.width {
            for y in 0..self.height {
                let here = region_for_chip(x, y, CHIP_LEVEL);
                let cores: u32 = fill
                    .selections
                    .iter()
                    .filter(|(region, _)| {
                        region & 0xFFFF_0000 == here & 0xFFFF_0000 && region & here & 0xFFFF != 0
                    })
                    .fold(0, |mask, (_, cores)| mask | cores);
                if cores == 0 {
                    continue;
                }
                let chip = self.chip_mut(x, y);
                for p in (1..32u8).filter(|p| cores & (1 << p) != 0) {
                    chip.cores.insert(p, (app_id, state));
                }
            }
        }
    }

    fn iptag(&mut self, dest: CoreAddr, a1: u32, a2: u32, a3: u32) -> (u16, Vec<u32>, Bytes) {
        let ok = ReturnCode::Ok.code();
        let index = (a1 & 0xFF) as usize;
        if index >= NUM_IPTAGS {
            return (ReturnCode::Arg.code(), Vec::new(), Bytes::new());
        }
        let chip = self.chip_mut(dest.x, dest.y);
        match a1 >> 16 {
            op if op == IptagCommand::Set as u32 => {
                chip.iptags[index] = Some((a3, a2 as u16));
                (ok, Vec::new(), Bytes::new())
            }
            op if op == IptagCommand::Get as u32 => {
                let (ip, port) = chip.iptags[index].unwrap_or((0, 0));
                let mut data = BytesMut::with_capacity(28);
                data.put_u32_le(ip);
                data.put_bytes(0, 6);
                data.put_u16_le(port);
                data.put_u16_le(0);
                data.put_u16_le(if port == 0 { 0 } else { 0x8000 });
                data.put_u32_le(0);
                data.put_u16_le(0);
                data.put_u16_le(0);
                data.put_u8(0);
                (ok, Vec::new(), data.freeze())
            }
            op if op == IptagCommand::Clear as u32 => {
                chip.iptags[index] = None;
                (ok, Vec::new(), Bytes::new())
            }
            _ => (ReturnCode::Arg.code(), Vec::new(), Bytes::new()),
        }
    }

    fn alloc_free(&mut self, dest: CoreAddr, a1: u32, a2: u32) -> (u16, Vec<u32>, Bytes) {
        let app_id = ((a1 >> 8) & 0xFF) as u8;
        let rtr_copy = self.constants.rtr_copy;
        let chip = self.chip_mut(dest.x, dest.y);
        let result = match a1 & 0xFF {
            op if op == AllocOperation::AllocSdram as u32 => chip.alloc_sdram(a2),
            op if op == AllocOperation::AllocRtr as u32 => chip.alloc_router(a2 as usize, app_id),
            op if op == AllocOperation::FreeRtrByApp as u32 => {
                let freed = chip.free_router(app_id);
                chip.mirror_router(rtr_copy);
                freed
            }
            _ => 0,
        };
        (ReturnCode::Ok.code(), vec![result], Bytes::new())
    }

    fn router(&mut self, dest: CoreAddr, a1: u32, a2: u32, a3: u32) -> (u16, Vec<u32>, Bytes) {
        let rtr_copy = self.constants.rtr_copy;
        let chip = self.chip_mut(dest.x, dest.y);
        match a1 & 0xFF {
            op if op == RouterOperation::Load as u32 => {
                let count = (a1 >> 16) as usize;
                let app_id = (a1 >> 8) & 0xFF;
                let base = a3 as usize;
                if base + count > chip.router.len() {
                    return (ReturnCode::Arg.code(), Vec::new(), Bytes::new());
                }
                let staged = chip.read(a2, count * RECORD_SIZE);
                for (i, raw) in staged.chunks_exact(RECORD_SIZE).enumerate() {
                    let mut bytes = [0u8; RECORD_SIZE];
                    bytes.copy_from_slice(raw);
                    let record = RouterRecord::from_bytes(&bytes);
                    chip.router[base + i] =
                        RouterRecord { next: 0, free: app_id as u16, ..record };
                    chip.reserved.remove(&(base + i));
                }
            }
            op if op == RouterOperation::Clear as u32 => {
                chip.router.fill(RouterRecord::UNUSED);
                chip.reserved.clear();
            }
            _ => return (ReturnCode::Arg.code(), Vec::new(), Bytes::new()),
        }
        chip.mirror_router(rtr_copy);
        (ReturnCode::Ok.code(), Vec::new(), Bytes::new())
    }

    fn enqueue(&mut self, datagram: Bytes) {
        let index = self.replies_made;
        self.replies_made += 1;
        if self.faults.drop_replies.contains(&index) {
            trace!(index, "Simulated reply loss");
            return;
        }
        self.replies.push_back(datagram);
    }
}

impl Transport for SimulatedMachine {
    fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        let index = self.requests_seen;
        self.requests_seen += 1;
        if self.faults.drop_all || self.faults.drop_requests.contains(&index) {
            trace!(index, "Simulated request loss");
            return Ok(());
        }
        let Ok(request) = ScpPacket::from_datagram(datagram, 3) else {
            return Ok(());
        };
        if !request.header.reply_expected {
            return Ok(());
        }

        let (rc, args, data) = self.execute(&request);
        let reply = ScpPacket {
            header: request.header.reply(),
            cmd_rc: rc,
            seq: request.seq,
            args,
            data,
        };
        let encoded = reply
            .to_datagram()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if self.faults.stale_replies {
            let stale = ScpPacket {
                seq: request.seq.wrapping_sub(1),
                args: vec![0xBAD],
                ..reply
            };
            if let Ok(stale) = stale.to_datagram() {
                self.replies.push_back(stale);
            }
        }
        if self.faults.duplicate_replies {
            self.enqueue(encoded.clone());
        }
        self.enqueue(encoded);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let Some(datagram) = self.replies.pop_front() else {
            std::thread::sleep(timeout);
            return Ok(None);
        };
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spinn_chip::scp::SCP_RECEIVE_LENGTH;

    fn call(
        sim: &mut SimulatedMachine,
        dest: CoreAddr,
        cmd: Command,
        args: [u32; 3],
        data: &[u8],
        reply_args: usize,
    ) -> ScpPacket {
        let request = ScpPacket::request(dest, cmd, 1, args, Bytes::copy_from_slice(data));
        sim.send(&request.to_datagram().unwrap()).unwrap();
        let mut buf = [0u8; SCP_RECEIVE_LENGTH];
        let n = sim.recv(&mut buf, Duration::ZERO).unwrap().unwrap();
        ScpPacket::from_datagram(&buf[..n], reply_args).unwrap()
    }

    #[test]
    fn memory_round_trip() {
        let mut sim = SimulatedMachine::new(2, 2);
        let dest = CoreAddr::new(1, 1, 0);
        let reply = call(&mut sim, dest, Command::Write, [0x6000_0FFE, 4, 0], &[1, 2, 3, 4], 0);
        assert_eq!(reply.cmd_rc, 0x80);

        let reply = call(&mut sim, dest, Command::Read, [0x6000_0FFC, 8, 0], &[], 0);
        assert_eq!(&reply.data[..], &[0, 0, 1, 2, 3, 4, 0, 0]);
        assert_eq!(sim.memory(1, 1, 0x6000_1000, 2), vec![3, 4]);
    }

    #[test]
    fn missing_chip_has_no_route() {
        let mut sim = SimulatedMachine::new(2, 2);
        let reply = call(&mut sim, CoreAddr::new(5, 0, 0), Command::Sver, [0; 3], &[], 2);
        assert_eq!(reply.cmd_rc, ReturnCode::Route.code());
    }

    #[test]
    fn router_allocation_skips_slot_zero() {
        let mut sim = SimulatedMachine::new(1, 1);
        let chip = sim.chip_mut(0, 0);
        assert_eq!(chip.alloc_router(3, 1), 1);
        assert_eq!(chip.alloc_router(2, 2), 4);
        assert_eq!(chip.alloc_router(2000, 2), 0);
        chip.free_router(1);
        assert_eq!(chip.alloc_router(3, 3), 1);
    }

    #[test]
    fn silent_when_idle() {
        let mut sim = SimulatedMachine::new(1, 1);
        let mut buf = [0u8; 16];
        assert_eq!(sim.recv(&mut buf, Duration::from_millis(1)).unwrap(), None);
    }

    #[test]
    fn overrides_expire() {
        let mut sim = SimulatedMachine::new(1, 1)
            .with_faults(FaultPlan::none().reject_times(Command::Sver, 0x84, 1));
        let dest = CoreAddr::new(0, 0, 0);
        assert_eq!(call(&mut sim, dest, Command::Sver, [0; 3], &[], 2).cmd_rc, 0x84);
        assert_eq!(call(&mut sim, dest, Command::Sver, [0; 3], &[], 2).cmd_rc, 0x80);
    }
}
