//! Varint primitives and the chunked-region framing shared by the block
//! map's on-disk encoding (`map.rs`) and the super-block byte layout read
//! during delta streaming (`delta.rs`).
//!
//! Stream bodies elsewhere in this workspace (the remote storage
//! protocol's "block records") use the same `varint(len) || bytes`
//! shape, zero-length terminated; this module is that convention's
//! block-delta-side counterpart.

use tokio::io::{AsyncRead, AsyncReadExt};

use pg_util::CoreError;

/// Appends `value` as an unsigned LEB128 varint.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint from `bytes` starting at `pos`,
/// advancing `pos` past it.
pub fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, CoreError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| CoreError::Format("truncated varint".into()))?;
        *pos += 1;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(CoreError::Format("varint too long".into()));
        }
    }
}

/// Maps signed deltas onto the unsigned varint space (`0, -1, 1, -2, 2, ...`).
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

async fn read_varint_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, CoreError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await.map_err(|e| CoreError::Io {
            op: "read",
            path: "<super-block>".into(),
            source: e,
        })?;
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(CoreError::Format("varint too long".into()));
        }
    }
}

/// Reads one `varint(len) || bytes[len]` chunked region: a sequence of
/// length-prefixed chunks concatenated until a zero-length chunk
/// terminates it (spec §6 "Remote storage framing", reused here for the
/// bundle-side chunked super-block region).
pub async fn read_chunked_region<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::new();
    loop {
        let len = read_varint_async(reader).await?;
        if len == 0 {
            return Ok(out);
        }
        let mut chunk = vec![0u8; len as usize];
        reader.read_exact(&mut chunk).await.map_err(|e| CoreError::Io {
            op: "read",
            path: "<super-block>".into(),
            source: e,
        })?;
        out.extend_from_slice(&chunk);
    }
}

/// Block-record header bits (spec §6 "On-disk block layout"). `0` is
/// reserved as the end-of-super-block sentinel, so an ordinary block
/// always sets [`BLOCK_PRESENT`] even though `FLAG_SIZE` is otherwise the
/// only meaningful bit described in the spec prose.
pub const BLOCK_TERMINATOR: u64 = 0;
pub const BLOCK_PRESENT: u64 = 0x1;
pub const BLOCK_FLAG_SIZE: u64 = 0x2;

pub fn encode_block_header(short: bool) -> u64 {
    if short {
        BLOCK_PRESENT | BLOCK_FLAG_SIZE
    } else {
        BLOCK_PRESENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trips_across_byte_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn zigzag_round_trips_signed_deltas() {
        for value in [0i64, 1, -1, 2, -2, i32::MIN as i64, i32::MAX as i64] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[tokio::test]
    async fn chunked_region_concatenates_until_zero_chunk() {
        let mut wire = Vec::new();
        write_varint(&mut wire, 5);
        wire.extend_from_slice(b"hello");
        write_varint(&mut wire, 6);
        wire.extend_from_slice(b" world");
        write_varint(&mut wire, 0);

        let mut cursor = std::io::Cursor::new(wire);
        let region = read_chunked_region(&mut cursor).await.unwrap();
        assert_eq!(region, b"hello world");
    }
}
