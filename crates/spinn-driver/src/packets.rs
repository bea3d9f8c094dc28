// SPDX-License-Identifier: AGPL-3.0-only

//! SDP and SCP packet codec.
//!
//! Datagrams on the wire carry two bytes of zero padding ahead of the SDP
//! header; [`SdpPacket::to_datagram`] and [`SdpPacket::from_datagram`] deal
//! in that framing directly. All multi-byte fields are little-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spinn_chip::scp::{
    Command, CPU_IPTAG, FLAG_NO_REPLY, FLAG_REPLY, MAX_PORT, SCP_DATA_MAX, SCP_HEADER_LENGTH,
    SDP_HEADER_LENGTH, SDP_PAYLOAD_MAX, TAG_REPLY_TO_SENDER, UDP_PADDING,
};

use crate::error::{Result, SpinnError};

/// Highest CPU number the 5-bit SDP field can carry.
const MAX_SDP_CPU: u8 = 0x1F;

/// Offset of `cmd_rc` within a padded datagram.
const CMD_RC_OFFSET: usize = UDP_PADDING + SDP_HEADER_LENGTH;

/// A core on the machine: chip `(x, y)` and processor `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CoreAddr {
    /// Chip x coordinate
    pub x: u8,
    /// Chip y coordinate
    pub y: u8,
    /// Processor on the chip
    pub p: u8,
}

impl CoreAddr {
    /// Address a core.
    pub const fn new(x: u8, y: u8, p: u8) -> Self {
        Self { x, y, p }
    }

    /// The monitor processor of chip `(x, y)`.
    pub const fn monitor(x: u8, y: u8) -> Self {
        Self { x, y, p: 0 }
    }
}

impl fmt::Display for CoreAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.p)
    }
}

// ── SDP ──────────────────────────────────────────────────────────────────────

/// SDP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpHeader {
    /// Whether the receiver should acknowledge
    pub reply_expected: bool,
    /// IP tag
    pub tag: u8,
    /// Destination port (0-7)
    pub dest_port: u8,
    /// Destination CPU (0-31)
    pub dest_cpu: u8,
    /// Source port (0-7)
    pub src_port: u8,
    /// Source CPU (0-31)
    pub src_cpu: u8,
    /// Destination chip x
    pub dest_x: u8,
    /// Destination chip y
    pub dest_y: u8,
    /// Source chip x
    pub src_x: u8,
    /// Source chip y
    pub src_y: u8,
}

impl SdpHeader {
    /// Header for a host request to `dest` that expects a reply.
    pub const fn request(dest: CoreAddr) -> Self {
        Self {
            reply_expected: true,
            tag: TAG_REPLY_TO_SENDER,
            dest_port: 0,
            dest_cpu: dest.p,
            src_port: MAX_PORT,
            src_cpu: CPU_IPTAG,
            dest_x: dest.x,
            dest_y: dest.y,
            src_x: 0,
            src_y: 0,
        }
    }

    /// Header of a reply to a request carrying this header.
    pub const fn reply(&self) -> Self {
        Self {
            reply_expected: false,
            tag: self.tag,
            dest_port: self.src_port,
            dest_cpu: self.src_cpu,
            src_port: self.dest_port,
            src_cpu: self.dest_cpu,
            dest_x: self.src_x,
            dest_y: self.src_y,
            src_x: self.dest_x,
            src_y: self.dest_y,
        }
    }

    /// Destination as a core address.
    pub const fn dest(&self) -> CoreAddr {
        CoreAddr::new(self.dest_x, self.dest_y, self.dest_cpu)
    }

    fn validate(&self) -> Result<()> {
        if self.dest_cpu > MAX_SDP_CPU || self.src_cpu > MAX_SDP_CPU {
            return Err(SpinnError::invalid_packet(format!(
                "cpu out of range: dest {}, src {}",
                self.dest_cpu, self.src_cpu
            )));
        }
        if self.dest_port > MAX_PORT || self.src_port > MAX_PORT {
            return Err(SpinnError::invalid_packet(format!(
                "port out of range: dest {}, src {}",
                self.dest_port, self.src_port
            )));
        }
        Ok(())
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(if self.reply_expected { FLAG_REPLY } else { FLAG_NO_REPLY });
        buf.put_u8(self.tag);
        buf.put_u8(((self.dest_port & 7) << 5) | (self.dest_cpu & MAX_SDP_CPU));
        buf.put_u8(((self.src_port & 7) << 5) | (self.src_cpu & MAX_SDP_CPU));
        buf.put_u16_le((u16::from(self.dest_x) << 8) | u16::from(self.dest_y));
        buf.put_u16_le((u16::from(self.src_x) << 8) | u16::from(self.src_y));
    }

    fn get(buf: &mut impl Buf) -> Self {
        let flags = buf.get_u8();
        let tag = buf.get_u8();
        let dest_cpu_port = buf.get_u8();
        let src_cpu_port = buf.get_u8();
        let [dest_x, dest_y] = buf.get_u16_le().to_be_bytes();
        let [src_x, src_y] = buf.get_u16_le().to_be_bytes();
        Self {
            reply_expected: flags & 0x80 != 0,
            tag,
            dest_port: dest_cpu_port >> 5,
            dest_cpu: dest_cpu_port & MAX_SDP_CPU,
            src_port: src_cpu_port >> 5,
            src_cpu: src_cpu_port & MAX_SDP_CPU,
            dest_x,
            dest_y,
            src_x,
            src_y,
        }
    }
}

/// An SDP packet: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpPacket {
    /// Header
    pub header: SdpHeader,
    /// Payload following the header
    pub payload: Bytes,
}

impl SdpPacket {
    /// Encode with UDP padding.
    ///
    /// # Errors
    ///
    /// [`SpinnError::InvalidPacket`] if a field does not fit its width or the
    /// payload is larger than an SCP packet can be.
    pub fn to_datagram(&self) -> Result<Bytes> {
        self.header.validate()?;
        if self.payload.len() > SDP_PAYLOAD_MAX {
            return Err(SpinnError::invalid_packet(format!(
                "payload of {} bytes exceeds {SDP_PAYLOAD_MAX}",
                self.payload.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(UDP_PADDING + SDP_HEADER_LENGTH + self.payload.len());
        buf.put_bytes(0, UDP_PADDING);
        self.header.put(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode a padded datagram.
    ///
    /// # Errors
    ///
    /// [`SpinnError::InvalidPacket`] if the datagram is shorter than a header.
    pub fn from_datagram(raw: &[u8]) -> Result<Self> {
        if raw.len() < UDP_PADDING + SDP_HEADER_LENGTH {
            return Err(SpinnError::invalid_packet(format!(
                "datagram of {} bytes is shorter than an SDP header",
                raw.len()
            )));
        }
        let mut buf = &raw[UDP_PADDING..];
        let header = SdpHeader::get(&mut buf);
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

// ── SCP ──────────────────────────────────────────────────────────────────────

/// An SCP packet: an SDP packet whose payload starts with `cmd_rc`, `seq`
/// and up to three argument words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpPacket {
    /// SDP header
    pub header: SdpHeader,
    /// Command code (requests) or return code (replies)
    pub cmd_rc: u16,
    /// Sequence number echoed by the reply
    pub seq: u16,
    /// Argument words present in the packet (at most three)
    pub args: Vec<u32>,
    /// Data following the arguments
    pub data: Bytes,
}

impl ScpPacket {
    /// A request to `dest` carrying all three arguments.
    pub fn request(dest: CoreAddr, command: Command, seq: u16, args: [u32; 3], data: Bytes) -> Self {
        Self {
            header: SdpHeader::request(dest),
            cmd_rc: command.code(),
            seq,
            args: args.to_vec(),
            data,
        }
    }

    /// Argument `i`, or 0 when the packet did not carry it.
    pub fn arg(&self, i: usize) -> u32 {
        self.args.get(i).copied().unwrap_or(0)
    }

    /// Wrap as an SDP packet.
    ///
    /// # Errors
    ///
    /// [`SpinnError::InvalidPacket`] for more than three arguments or more
    /// than [`SCP_DATA_MAX`] bytes of data.
    pub fn to_sdp(&self) -> Result<SdpPacket> {
        if self.args.len() > 3 {
            return Err(SpinnError::invalid_packet(format!(
                "{} arguments, at most 3 allowed",
                self.args.len()
            )));
        }
        if self.data.len() > SCP_DATA_MAX {
            return Err(SpinnError::invalid_packet(format!(
                "{} bytes of data, at most {SCP_DATA_MAX} allowed",
                self.data.len()
            )));
        }
        let mut payload =
            BytesMut::with_capacity(SCP_HEADER_LENGTH + 4 * self.args.len() + self.data.len());
        payload.put_u16_le(self.cmd_rc);
        payload.put_u16_le(self.seq);
        for &arg in &self.args {
            payload.put_u32_le(arg);
        }
        payload.put_slice(&self.data);
        Ok(SdpPacket {
            header: self.header,
            payload: payload.freeze(),
        })
    }

    /// Interpret an SDP packet as SCP, reading up to `n_args` argument words.
    ///
    /// Fewer arguments are read if the payload is too short to hold them.
    ///
    /// # Errors
    ///
    /// [`SpinnError::InvalidPacket`] if the payload cannot hold `cmd_rc` and
    /// `seq`.
    pub fn from_sdp(sdp: SdpPacket, n_args: usize) -> Result<Self> {
        let mut payload = sdp.payload;
        if payload.len() < SCP_HEADER_LENGTH {
            return Err(SpinnError::invalid_packet(format!(
                "SCP payload of {} bytes is shorter than its header",
                payload.len()
            )));
        }
        let cmd_rc = payload.get_u16_le();
        let seq = payload.get_u16_le();
        let n_args = n_args.min(3).min(payload.len() / 4);
        let args = (0..n_args).map(|_| payload.get_u32_le()).collect();
        Ok(Self {
            header: sdp.header,
            cmd_rc,
            seq,
            args,
            data: payload,
        })
    }

    /// Encode as a padded datagram.
    ///
    /// # Errors
    ///
    /// See [`ScpPacket::to_sdp`] and [`SdpPacket::to_datagram`].
    pub fn to_datagram(&self) -> Result<Bytes> {
        self.to_sdp()?.to_datagram()
    }

    /// Decode a padded datagram.
    ///
    /// # Errors
    ///
    /// See [`SdpPacket::from_datagram`] and [`ScpPacket::from_sdp`].
    pub fn from_datagram(raw: &[u8], n_args: usize) -> Result<Self> {
        Self::from_sdp(SdpPacket::from_datagram(raw)?, n_args)
    }

    /// `(cmd_rc, seq)` of a datagram without decoding the rest.
    pub fn peek_rc_seq(raw: &[u8]) -> Option<(u16, u16)> {
        let field = raw.get(CMD_RC_OFFSET..CMD_RC_OFFSET + 4)?;
        Some((
            u16::from_le_bytes([field[0], field[1]]),
            u16::from_le_bytes([field[2], field[3]]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let packet = ScpPacket::request(
            CoreAddr::new(1, 2, 3),
            Command::Read,
            0x1234,
            [0xDEAD_BEEF, 16, 2],
            Bytes::new(),
        );
        let raw = packet.to_datagram().unwrap();
        assert_eq!(
            &raw[..],
            &[
                0x00, 0x00, // padding
                0x87, 0xFF, // flags, tag
                0x03, 0xFF, // dest port 0 cpu 3, src port 7 cpu 31
                0x02, 0x01, // dest p2p (1, 2)
                0x00, 0x00, // src p2p
                0x02, 0x00, // cmd
                0x34, 0x12, // seq
                0xEF, 0xBE, 0xAD, 0xDE, // arg1
                0x10, 0x00, 0x00, 0x00, // arg2
                0x02, 0x00, 0x00, 0x00, // arg3
            ][..]
        );
    }

    #[test]
    fn decode_reply_with_fewer_args_than_expected() {
        let reply = ScpPacket {
            header: SdpHeader::request(CoreAddr::new(0, 0, 0)).reply(),
            cmd_rc: 0x80,
            seq: 7,
            args: vec![42],
            data: Bytes::new(),
        };
        let raw = reply.to_datagram().unwrap();
        let back = ScpPacket::from_datagram(&raw, 3).unwrap();
        assert_eq!(back.args, vec![42]);
        assert_eq!(back.arg(2), 0);
        assert!(!back.header.reply_expected);
        assert_eq!(ScpPacket::peek_rc_seq(&raw), Some((0x80, 7)));
    }

    #[test]
    fn data_follows_expected_args() {
        let reply = ScpPacket {
            header: SdpHeader::request(CoreAddr::new(0, 0, 0)).reply(),
            cmd_rc: 0x80,
            seq: 1,
            args: Vec::new(),
            data: Bytes::from_static(b"hello world!"),
        };
        let raw = reply.to_datagram().unwrap();
        assert_eq!(&raw[14..], b"hello world!");
        let back = ScpPacket::from_datagram(&raw, 0).unwrap();
        assert_eq!(&back.data[..], b"hello world!");
    }

    #[test]
    fn reply_header_swaps_endpoints() {
        let request = SdpHeader::request(CoreAddr::new(4, 5, 6));
        let reply = request.reply();
        assert_eq!((reply.src_x, reply.src_y, reply.src_cpu), (4, 5, 6));
        assert_eq!(reply.dest_cpu, CPU_IPTAG);
        assert_eq!(reply.reply(), SdpHeader { reply_expected: false, ..request });
    }

    #[test]
    fn oversized_fields_rejected() {
        let mut packet =
            ScpPacket::request(CoreAddr::new(0, 0, 32), Command::Sver, 0, [0; 3], Bytes::new());
        assert!(matches!(packet.to_datagram(), Err(SpinnError::InvalidPacket { .. })));

        packet.header.dest_cpu = 1;
        packet.data = Bytes::from(vec![0u8; SCP_DATA_MAX + 1]);
        assert!(matches!(packet.to_datagram(), Err(SpinnError::InvalidPacket { .. })));

        packet.data = Bytes::from(vec![0u8; SCP_DATA_MAX]);
        assert_eq!(packet.to_datagram().unwrap().len(), 2 + 8 + 4 + 12 + SCP_DATA_MAX);
    }

    #[test]
    fn runt_datagrams_rejected() {
        assert!(SdpPacket::from_datagram(&[0; 9]).is_err());
        assert!(ScpPacket::from_datagram(&[0; 12], 0).is_err());
        assert_eq!(ScpPacket::peek_rc_seq(&[0; 13]), None);
    }
}
