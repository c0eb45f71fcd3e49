use crate::error::{BkError, Result};

const TAG_RAW: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Bytes of framing prepended to every encoded payload:
/// 1-byte codec tag + 4-byte little-endian uncompressed length.
const FRAME_LEN: usize = 5;

/// Maximum decompressed output (2x the largest chunk the splitter emits).
/// Prevents decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Raw,
    Lz4,
    Zstd { level: i32 },
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Zstd { level: 3 }
    }
}

/// Compress `data`, prepending the codec tag and uncompressed length.
/// Falls back to raw storage (tag 0) whenever compression would inflate.
pub fn encode(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > u32::MAX as usize {
        return Err(BkError::Integrity("chunk exceeds 4 GiB".into()));
    }
    let body = match codec {
        Codec::Raw => None,
        Codec::Lz4 => Some((TAG_LZ4, lz4_flex::compress(data))),
        Codec::Zstd { level } => {
            let compressed = zstd::bulk::compress(data, level)
                .map_err(|e| BkError::Decompression(format!("zstd compress: {e}")))?;
            Some((TAG_ZSTD, compressed))
        }
    };

    let mut out = Vec::with_capacity(FRAME_LEN + data.len());
    match body {
        Some((tag, compressed)) if compressed.len() < data.len() => {
            out.push(tag);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
        }
        _ => {
            out.push(TAG_RAW);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
    }
    Ok(out)
}

/// Reverse [`encode`]: read the tag, decompress, and check the recovered
/// length against the header.
pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < FRAME_LEN {
        return Err(BkError::Decompression("frame too short".into()));
    }
    let tag = data[0];
    let claimed = u32::from_le_bytes(data[1..5].try_into().unwrap()) as usize;
    if claimed > MAX_DECOMPRESS_SIZE {
        return Err(BkError::Decompression(format!(
            "claimed size {claimed} exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    let payload = &data[5..];

    let plain = match tag {
        TAG_RAW => payload.to_vec(),
        TAG_LZ4 => lz4_flex::decompress(payload, claimed)
            .map_err(|e| BkError::Decompression(format!("lz4: {e}")))?,
        TAG_ZSTD => zstd::bulk::decompress(payload, claimed)
            .map_err(|e| BkError::Decompression(format!("zstd: {e}")))?,
        other => return Err(BkError::UnknownCompressionTag(other)),
    };

    if plain.len() != claimed {
        return Err(BkError::Decompression(format!(
            "length mismatch: header says {claimed}, got {}",
            plain.len()
        )));
    }
    Ok(plain)
}
