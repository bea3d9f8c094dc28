// SPDX-License-Identifier: AGPL-3.0-only

//! Boot-ROM protocol.
//!
//! An unbooted chip listens on [`BOOT_PORT`](spinn_chip::scp::BOOT_PORT)
//! for a monitor image sent as a stream of unacknowledged packets:
//!
//! ```text
//! header (big-endian): version u16 = 1 | cmd u32 | arg1 u32 | arg2 u32 | arg3 u32
//! data:                image words, byte-swapped to big-endian
//!
//! start       cmd 1, arg3 = blocks - 1
//! send_block  cmd 3, arg1 = (words_per_block - 1) << 8 | block
//! end         cmd 5, arg1 = 1
//! ```

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::error::{Result, SpinnError};
use crate::transport::Transport;

/// Boot image size limit (instruction memory of the monitor core).
pub const DTCM_SIZE: usize = 32 * 1024;

/// Bytes of image per boot packet.
pub const BOOT_BYTE_SIZE: usize = 1024;

/// Blocks that fit in DTCM.
pub const BOOT_MAX_BLOCKS: usize = DTCM_SIZE / BOOT_BYTE_SIZE;

/// Offset of the system-variable block within the image.
pub const BOOT_DATA_OFFSET: usize = 3 * 128;

/// Length of the system-variable block.
pub const BOOT_DATA_LENGTH: usize = 128;

const PROTOCOL_VERSION: u16 = 1;

/// Boot packet commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BootCommand {
    /// Begin; `arg3` = number of blocks - 1
    Start = 1,
    /// One block of image data
    SendBlock = 3,
    /// Finished; `arg1` = 1
    End = 5,
}

/// Boot pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    /// Pause after each packet
    pub block_delay: Duration,
    /// Pause after the final packet while the machine comes up
    pub post_boot_delay: Duration,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            block_delay: Duration::from_millis(10),
            post_boot_delay: Duration::from_secs(2),
        }
    }
}

/// Encode one boot packet. `data` must be whole words.
///
/// # Errors
///
/// [`SpinnError::InvalidPacket`] if `data` is not a multiple of four bytes.
pub fn boot_packet(cmd: BootCommand, arg1: u32, arg2: u32, arg3: u32, data: &[u8]) -> Result<Bytes> {
    if data.len() % 4 != 0 {
        return Err(SpinnError::invalid_packet(format!(
            "boot data of {} bytes is not word-aligned",
            data.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(18 + data.len());
    buf.put_u16(PROTOCOL_VERSION);
    buf.put_u32(cmd as u32);
    buf.put_u32(arg1);
    buf.put_u32(arg2);
    buf.put_u32(arg3);
    for word in data.chunks_exact(4) {
        buf.put_u32(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
    }
    Ok(buf.freeze())
}

/// Patch the system-variable block into `image` and pad it to whole words.
///
/// # Errors
///
/// [`SpinnError::InvalidArgument`] if `sv` is shorter than
/// [`BOOT_DATA_LENGTH`] or the result does not fit in DTCM.
pub fn prepare_image(image: &[u8], sv: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut buf = image.to_vec();
    if let Some(sv) = sv {
        let block = sv.get(..BOOT_DATA_LENGTH).ok_or_else(|| {
            SpinnError::invalid_argument(format!(
                "system variables of {} bytes, need {BOOT_DATA_LENGTH}",
                sv.len()
            ))
        })?;
        let end = BOOT_DATA_OFFSET + BOOT_DATA_LENGTH;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[BOOT_DATA_OFFSET..end].copy_from_slice(block);
    }
    buf.resize(buf.len().next_multiple_of(4), 0);
    if buf.len() >= DTCM_SIZE {
        return Err(SpinnError::invalid_argument(format!(
            "boot image of {} bytes does not fit in {DTCM_SIZE} bytes of DTCM",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Send a boot image.
///
/// Boot packets are not acknowledged; success can only be confirmed by
/// talking SCP to the machine afterwards.
///
/// # Errors
///
/// See [`prepare_image`]; transport errors are propagated.
pub fn boot<T: Transport + ?Sized>(
    transport: &mut T,
    image: &[u8],
    sv: Option<&[u8]>,
    config: &BootConfig,
) -> Result<()> {
    let image = prepare_image(image, sv)?;
    let n_blocks = image.len().div_ceil(BOOT_BYTE_SIZE);
    if n_blocks == 0 {
        return Err(SpinnError::invalid_argument("empty boot image"));
    }
    debug_assert!(n_blocks <= BOOT_MAX_BLOCKS);
    info!(bytes = image.len(), blocks = n_blocks, "Booting");

    transport.send(&boot_packet(BootCommand::Start, 0, 0, n_blocks as u32 - 1, &[])?)?;
    std::thread::sleep(config.block_delay);

    let words_per_block = (BOOT_BYTE_SIZE / 4) as u32;
    for (block, data) in image.chunks(BOOT_BYTE_SIZE).enumerate() {
        let arg1 = ((words_per_block - 1) << 8) | block as u32;
        transport.send(&boot_packet(BootCommand::SendBlock, arg1, 0, 0, data)?)?;
        debug!(block, "Boot block sent");
        std::thread::sleep(config.block_delay);
    }

    transport.send(&boot_packet(BootCommand::End, 1, 0, 0, &[])?)?;
    std::thread::sleep(config.post_boot_delay);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, Default)]
    struct Recorder {
        sent: Vec<Vec<u8>>,
    }

    impl Transport for Recorder {
        fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
            self.sent.push(datagram.to_vec());
            Ok(())
        }

        fn recv(&mut self, _buf: &mut [u8], _timeout: Duration) -> io::Result<Option<usize>> {
            Ok(None)
        }
    }

    fn quick() -> BootConfig {
        BootConfig {
            block_delay: Duration::ZERO,
            post_boot_delay: Duration::ZERO,
        }
    }

    #[test]
    fn packet_layout() {
        let p = boot_packet(BootCommand::SendBlock, 0xFF01, 0, 0, &[0x11, 0x22, 0x33, 0x44]).unwrap();
        assert_eq!(
            &p[..],
            &[
                0x00, 0x01, // version
                0x00, 0x00, 0x00, 0x03, // cmd
                0x00, 0x00, 0xFF, 0x01, // arg1
                0, 0, 0, 0, // arg2
                0, 0, 0, 0, // arg3
                0x44, 0x33, 0x22, 0x11, // word, swapped
            ][..]
        );
        assert!(boot_packet(BootCommand::End, 1, 0, 0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn boot_sequence() {
        let image: Vec<u8> = (0..2050u32).map(|i| i as u8).collect();
        let mut recorder = Recorder::default();
        boot(&mut recorder, &image, None, &quick()).unwrap();

        // start, 3 blocks, end
        assert_eq!(recorder.sent.len(), 5);
        assert_eq!(&recorder.sent[0][14..18], &[0, 0, 0, 2]);
        assert_eq!(&recorder.sent[2][6..10], &[0, 0, 0xFF, 0x01]);
        assert_eq!(recorder.sent[1].len(), 18 + 1024);
        // Last block padded to whole words.
        assert_eq!(recorder.sent[3].len(), 18 + 4);
        assert_eq!(&recorder.sent[4][2..10], &[0, 0, 0, 5, 0, 0, 0, 1]);
    }

    #[test]
    fn system_variables_patched() {
        let image = vec![0xAAu8; 1024];
        let sv = vec![0x55u8; 200];
        let prepared = prepare_image(&image, Some(&sv)).unwrap();
        assert_eq!(prepared[BOOT_DATA_OFFSET - 1], 0xAA);
        assert!(prepared[BOOT_DATA_OFFSET..BOOT_DATA_OFFSET + 128].iter().all(|&b| b == 0x55));
        assert_eq!(prepared[BOOT_DATA_OFFSET + 128], 0xAA);

        assert!(prepare_image(&image, Some(&sv[..100])).is_err());
        assert!(prepare_image(&vec![0; DTCM_SIZE], None).is_err());
    }
}
