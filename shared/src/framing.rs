//! Packet framing for the display's write characteristic
//!
//! Large uploads go through two independent chunking layers:
//!
//! ```text
//! payload ─► protocol chunks (4096 B, each prefixed with its own header)
//!          └► transport packets (≤ negotiated write size, no header)
//! ```
//!
//! The firmware assembles protocol chunks by arrival order. There is no
//! sequence number in the header, so packets must be written exactly in the
//! order produced here.
//!
//! Structured header (GIF layout, 16 bytes):
//!
//! ```text
//! [ 0..2 chunk len LE ][ 2 class ][ 3 sub ][ 4 continuation ]
//! [ 5..9 payload len LE ][ 9..13 payload CRC-32 LE ][ 13..15 time BE ][ 15 type ]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol chunk size used by the image and GIF upload flows
pub const PROTOCOL_CHUNK_SIZE: usize = 4096;

/// Transport chunk the vendor app uses when the link negotiated a large MTU
pub const LEGACY_TRANSPORT_CHUNK: usize = 509;

/// Continuation flag of the first protocol chunk
pub const CONTINUATION_FIRST: u8 = 0;

/// Continuation flag of every following protocol chunk
pub const CONTINUATION_NEXT: u8 = 2;

/// Errors that can occur while framing a payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Cannot frame an empty payload")]
    EmptyPayload,

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("Chunk of {0} bytes does not fit the 16-bit length field")]
    ChunkTooLarge(usize),

    #[error("Payload of {0} bytes does not fit the 32-bit length field")]
    PayloadTooLarge(usize),
}

/// CRC-32 (IEEE, as used by zlib) over the whole logical payload
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Continuation flag for the protocol chunk at `index`
pub fn continuation_flag(index: usize) -> u8 {
    if index == 0 {
        CONTINUATION_FIRST
    } else {
        CONTINUATION_NEXT
    }
}

/// Per-chunk values handed to a header layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkContext {
    /// Position of the chunk within the payload
    pub index: usize,
    /// Body bytes in this chunk (header excluded)
    pub chunk_len: usize,
    /// Length of the entire logical payload
    pub total_len: u32,
    /// CRC-32 of the entire logical payload
    pub crc: u32,
}

/// A fixed-size header written in front of every protocol chunk
pub trait ChunkHeaderLayout: Send + Sync {
    /// Header size in bytes
    fn size(&self) -> usize;

    /// Append the header for one chunk to `buf`
    fn encode(&self, ctx: &ChunkContext, buf: &mut BytesMut);
}

/// 16-byte header of the GIF / animation upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GifChunkHeader {
    pub command_class: u8,
    pub sub_command: u8,
    /// Written big-endian. Meaning unverified, kept byte-exact.
    pub time_signature: u16,
    pub content_type: u8,
}

impl GifChunkHeader {
    pub const SIZE: usize = 16;

    /// GIF type that carries no time signature
    pub const TYPE_NO_TIME_SIGNATURE: u8 = 12;

    /// GIF type used by the vendor app for DIY animations
    pub const TYPE_DIY_ANIMATION: u8 = 13;

    /// Header for a GIF upload of the given type
    ///
    /// `time_sign_key` goes through the vendor app's time table. Type 12
    /// always sends zero.
    pub fn new(gif_type: u8, time_sign_key: u8) -> Self {
        let time_signature = if gif_type == Self::TYPE_NO_TIME_SIGNATURE {
            0
        } else {
            material_time(time_sign_key)
        };

        Self {
            command_class: 1,
            sub_command: 0,
            time_signature,
            content_type: gif_type,
        }
    }
}

impl ChunkHeaderLayout for GifChunkHeader {
    fn size(&self) -> usize {
        Self::SIZE
    }

    fn encode(&self, ctx: &ChunkContext, buf: &mut BytesMut) {
        buf.put_u16_le((ctx.chunk_len + Self::SIZE) as u16);
        buf.put_u8(self.command_class);
        buf.put_u8(self.sub_command);
        buf.put_u8(continuation_flag(ctx.index));
        buf.put_u32_le(ctx.total_len);
        buf.put_u32_le(ctx.crc);
        buf.put_u16(self.time_signature);
        buf.put_u8(self.content_type);
    }
}

/// 9-byte header of the DIY image upload (no checksum)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiyImageChunkHeader;

impl DiyImageChunkHeader {
    pub const SIZE: usize = 9;
}

impl ChunkHeaderLayout for DiyImageChunkHeader {
    fn size(&self) -> usize {
        Self::SIZE
    }

    fn encode(&self, ctx: &ChunkContext, buf: &mut BytesMut) {
        buf.put_u16_le((ctx.chunk_len + Self::SIZE) as u16);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(continuation_flag(ctx.index));
        buf.put_u32_le(ctx.total_len);
    }
}

/// Vendor time-signature table (`DeviceMaterialTimeConvert`)
pub fn material_time(key: u8) -> u16 {
    match key {
        1 => 10,
        2 => 30,
        3 => 60,
        4 => 300,
        _ => 5,
    }
}

/// Chunk sizes for one structured framing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingOptions {
    /// Size of each protocol chunk body
    pub protocol_chunk_size: usize,
    /// Fixed transport chunk, clamped to the negotiated write size
    pub transport_chunk: Option<usize>,
}

impl Default for FramingOptions {
    fn default() -> Self {
        Self {
            protocol_chunk_size: PROTOCOL_CHUNK_SIZE,
            transport_chunk: None,
        }
    }
}

impl FramingOptions {
    /// Options matching the vendor app's upload flows
    pub fn legacy_upload() -> Self {
        Self {
            protocol_chunk_size: PROTOCOL_CHUNK_SIZE,
            transport_chunk: Some(LEGACY_TRANSPORT_CHUNK),
        }
    }

    /// Transport chunk to use given what the link negotiated
    pub fn effective_write_size(&self, negotiated: usize) -> usize {
        self.transport_chunk
            .map_or(negotiated, |chunk| chunk.min(negotiated))
    }
}

/// Ordered groups of transport packets, one group per protocol chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramedCommand {
    groups: Vec<Vec<Bytes>>,
}

impl FramedCommand {
    /// Wrap packets that a caller already framed
    pub fn from_groups(groups: Vec<Vec<Bytes>>) -> Self {
        Self { groups }
    }

    /// A command without protocol chunking
    pub fn single_group(packets: Vec<Bytes>) -> Self {
        Self {
            groups: vec![packets],
        }
    }

    pub fn groups(&self) -> &[Vec<Bytes>] {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn packet_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    /// Bytes on the wire, headers included
    pub fn wire_len(&self) -> usize {
        self.groups.iter().flatten().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packet_count() == 0
    }

    /// Largest single packet
    pub fn max_packet_len(&self) -> usize {
        self.groups
            .iter()
            .flatten()
            .map(Bytes::len)
            .max()
            .unwrap_or(0)
    }
}

fn split(data: Bytes, max_write: usize) -> Vec<Bytes> {
    let len = data.len();
    (0..len)
        .step_by(max_write)
        .map(|start| data.slice(start..(start + max_write).min(len)))
        .collect()
}

/// Split a payload into consecutive transport-sized slices
///
/// A payload that fits in `max_write` comes back as a single packet.
pub fn frame_simple(payload: &[u8], max_write: usize) -> Result<Vec<Bytes>, FramingError> {
    if payload.is_empty() {
        return Err(FramingError::EmptyPayload);
    }
    if max_write == 0 {
        return Err(FramingError::InvalidChunkSize(max_write));
    }

    Ok(split(Bytes::copy_from_slice(payload), max_write))
}

/// Two-level framing for large uploads
///
/// Length and checksum fields describe the whole payload and repeat
/// unchanged in every chunk header.
pub fn frame_structured<H>(
    payload: &[u8],
    header: &H,
    protocol_chunk_size: usize,
    max_write: usize,
) -> Result<FramedCommand, FramingError>
where
    H: ChunkHeaderLayout + ?Sized,
{
    if payload.is_empty() {
        return Err(FramingError::EmptyPayload);
    }
    if protocol_chunk_size == 0 {
        return Err(FramingError::InvalidChunkSize(protocol_chunk_size));
    }
    if max_write == 0 {
        return Err(FramingError::InvalidChunkSize(max_write));
    }

    let header_size = header.size();
    let largest_chunk = protocol_chunk_size.min(payload.len()) + header_size;
    if largest_chunk > u16::MAX as usize {
        return Err(FramingError::ChunkTooLarge(largest_chunk));
    }

    let total_len =
        u32::try_from(payload.len()).map_err(|_| FramingError::PayloadTooLarge(payload.len()))?;
    let crc = checksum(payload);

    let groups = payload
        .chunks(protocol_chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let ctx = ChunkContext {
                index,
                chunk_len: chunk.len(),
                total_len,
                crc,
            };

            let mut buf = BytesMut::with_capacity(header_size + chunk.len());
            header.encode(&ctx, &mut buf);
            buf.extend_from_slice(chunk);

            split(buf.freeze(), max_write)
        })
        .collect();

    Ok(FramedCommand::from_groups(groups))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Rebuild each protocol chunk (header + body) from its transport packets
    fn reassemble(framed: &FramedCommand) -> Vec<Vec<u8>> {
        framed
            .groups()
            .iter()
            .map(|group| group.iter().flat_map(|p| p.iter().copied()).collect())
            .collect()
    }

    #[test]
    fn test_simple_short_payload_is_one_packet() {
        let payload = [5u8, 0, 7, 1, 1];
        let packets = frame_simple(&payload, 20).expect("frame failed");

        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][..], &payload[..]);
    }

    #[test]
    fn test_simple_splits_without_headers() {
        let payload: Vec<u8> = (0..50).collect();
        let packets = frame_simple(&payload, 20).expect("frame failed");

        let sizes: Vec<usize> = packets.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![20, 20, 10]);
        assert_eq!(packets.concat(), payload);
    }

    #[test]
    fn test_simple_rejects_empty_and_zero_size() {
        assert_eq!(frame_simple(&[], 20), Err(FramingError::EmptyPayload));
        assert_eq!(
            frame_simple(&[1, 2, 3], 0),
            Err(FramingError::InvalidChunkSize(0))
        );
    }

    #[test]
    fn test_structured_ten_thousand_zero_bytes() {
        let payload = vec![0u8; 10_000];
        let header = GifChunkHeader::new(GifChunkHeader::TYPE_NO_TIME_SIGNATURE, 1);
        let framed =
            frame_structured(&payload, &header, PROTOCOL_CHUNK_SIZE, 512).expect("frame failed");

        assert_eq!(framed.group_count(), 3);

        let chunks = reassemble(&framed);
        let bodies: Vec<usize> = chunks.iter().map(|c| c.len() - GifChunkHeader::SIZE).collect();
        assert_eq!(bodies, vec![4096, 4096, 1808]);

        for (chunk, body) in chunks.iter().zip(&bodies) {
            let len_field = u16::from_le_bytes([chunk[0], chunk[1]]) as usize;
            assert_eq!(len_field, body + GifChunkHeader::SIZE);
        }
    }

    #[test]
    fn test_structured_exact_multiple_has_no_trailing_chunk() {
        let payload = vec![7u8; PROTOCOL_CHUNK_SIZE * 2];
        let framed = frame_structured(&payload, &GifChunkHeader::new(12, 0), PROTOCOL_CHUNK_SIZE, 509)
            .expect("frame failed");

        assert_eq!(framed.group_count(), 2);
        assert!(framed
            .groups()
            .iter()
            .all(|g| g.iter().map(Bytes::len).sum::<usize>() == PROTOCOL_CHUNK_SIZE + 16));
    }

    #[test]
    fn test_gif_header_layout() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let header = GifChunkHeader::new(GifChunkHeader::TYPE_DIY_ANIMATION, 2);
        let framed =
            frame_structured(&payload, &header, PROTOCOL_CHUNK_SIZE, 4200).expect("frame failed");
        let chunks = reassemble(&framed);
        let crc = checksum(&payload).to_le_bytes();

        let first = &chunks[0];
        assert_eq!(&first[0..2], &(4096u16 + 16).to_le_bytes());
        assert_eq!(first[2], 1);
        assert_eq!(first[3], 0);
        assert_eq!(first[4], CONTINUATION_FIRST);
        assert_eq!(&first[5..9], &5000u32.to_le_bytes());
        assert_eq!(&first[9..13], &crc);
        assert_eq!(&first[13..15], &30u16.to_be_bytes());
        assert_eq!(first[15], GifChunkHeader::TYPE_DIY_ANIMATION);

        let second = &chunks[1];
        assert_eq!(&second[0..2], &(904u16 + 16).to_le_bytes());
        assert_eq!(second[4], CONTINUATION_NEXT);
        assert_eq!(&second[5..9], &5000u32.to_le_bytes());
        assert_eq!(&second[9..13], &crc);
    }

    #[test]
    fn test_gif_type_twelve_zeroes_time_signature() {
        let header = GifChunkHeader::new(GifChunkHeader::TYPE_NO_TIME_SIGNATURE, 4);
        assert_eq!(header.time_signature, 0);

        let header = GifChunkHeader::new(GifChunkHeader::TYPE_DIY_ANIMATION, 4);
        assert_eq!(header.time_signature, 300);
    }

    #[test]
    fn test_material_time_table() {
        assert_eq!(material_time(0), 5);
        assert_eq!(material_time(1), 10);
        assert_eq!(material_time(2), 30);
        assert_eq!(material_time(3), 60);
        assert_eq!(material_time(4), 300);
        assert_eq!(material_time(9), 5);
    }

    #[test]
    fn test_diy_image_header_layout() {
        let payload = vec![0xAAu8; 64 * 64 * 3];
        let framed = frame_structured(&payload, &DiyImageChunkHeader, PROTOCOL_CHUNK_SIZE, 509)
            .expect("frame failed");
        let chunks = reassemble(&framed);

        assert_eq!(chunks.len(), 3);
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(&chunk[0..2], &(4096u16 + 9).to_le_bytes());
            assert_eq!(chunk[2], 0);
            assert_eq!(chunk[3], 0);
            assert_eq!(chunk[4], continuation_flag(index));
            assert_eq!(&chunk[5..9], &12288u32.to_le_bytes());
        }
    }

    #[test]
    fn test_structured_rejects_bad_input() {
        let header = GifChunkHeader::new(12, 0);
        assert_eq!(
            frame_structured(&[], &header, 4096, 509),
            Err(FramingError::EmptyPayload)
        );
        assert_eq!(
            frame_structured(&[1], &header, 0, 509),
            Err(FramingError::InvalidChunkSize(0))
        );
        assert_eq!(
            frame_structured(&[1], &header, 4096, 0),
            Err(FramingError::InvalidChunkSize(0))
        );
        assert!(matches!(
            frame_structured(&vec![0u8; 70_000], &header, 70_000, 509),
            Err(FramingError::ChunkTooLarge(_))
        ));
    }

    #[test]
    fn test_framing_options_clamp_to_negotiated() {
        let options = FramingOptions::legacy_upload();
        assert_eq!(options.effective_write_size(514), 509);
        assert_eq!(options.effective_write_size(244), 244);
        assert_eq!(FramingOptions::default().effective_write_size(182), 182);
    }

    #[test]
    fn test_crc_matches_zlib_check_value() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
    }

    proptest! {
        #[test]
        fn prop_structured_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 1..20_000),
            chunk in 1usize..6000,
            max_write in 1usize..600,
        ) {
            let header = GifChunkHeader::new(13, 1);
            let framed = frame_structured(&payload, &header, chunk, max_write).unwrap();

            prop_assert_eq!(framed.group_count(), payload.len().div_ceil(chunk));
            prop_assert!(framed.max_packet_len() <= max_write);

            let crc = checksum(&payload).to_le_bytes();
            let total = (payload.len() as u32).to_le_bytes();
            let mut body = Vec::with_capacity(payload.len());

            for (index, wire) in reassemble(&framed).iter().enumerate() {
                prop_assert_eq!(wire[4], continuation_flag(index));
                prop_assert_eq!(&wire[5..9], &total[..]);
                prop_assert_eq!(&wire[9..13], &crc[..]);
                body.extend_from_slice(&wire[GifChunkHeader::SIZE..]);
            }

            prop_assert_eq!(body, payload);
        }

        #[test]
        fn prop_simple_preserves_bytes(
            payload in proptest::collection::vec(any::<u8>(), 1..4000),
            max_write in 1usize..600,
        ) {
            let packets = frame_simple(&payload, max_write).unwrap();

            prop_assert_eq!(packets.len(), payload.len().div_ceil(max_write));
            prop_assert!(packets.iter().all(|p| !p.is_empty() && p.len() <= max_write));
            prop_assert_eq!(packets.concat(), payload);
        }
    }
}
