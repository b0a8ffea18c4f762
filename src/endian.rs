//! Reads and writes fixed-width little-endian integers and raw byte arrays
//! over a seekable stream.
//!
//! On-disk integers are always little-endian. On a little-endian host this
//! is a direct read/write; on a big-endian host each multi-byte quantity is
//! reversed through a scratch buffer. Either way, every read clears sticky
//! EOF/error state on the stream first, the same way a plain read would.

use std::io::{self, Read, Write};

/// Whether the current target is little-endian. Checked once, at compile
/// time, rather than probed at runtime.
pub const NATIVE_IS_LITTLE_ENDIAN: bool = cfg!(target_endian = "little");

/// Extension trait: read fixed-width little-endian values from any reader.
pub trait ReadLe: Read {
    fn read_u16_le(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_i64_le(&mut self) -> io::Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads `len` bytes into a freshly allocated `Vec`.
    fn read_vec(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> ReadLe for R {}

/// Extension trait: write fixed-width little-endian values to any writer.
pub trait WriteLe: Write {
    fn write_u16_le(&mut self, v: u16) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_u32_le(&mut self, v: u32) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_u64_le(&mut self, v: u64) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    fn write_i64_le(&mut self, v: i64) -> io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }

    /// Writes `bytes` verbatim, then pads with zeroes up to `total_len`.
    fn write_padded(&mut self, bytes: &[u8], total_len: usize) -> io::Result<()> {
        debug_assert!(bytes.len() <= total_len);
        self.write_all(bytes)?;
        let pad = total_len - bytes.len();
        if pad > 0 {
            self.write_all(&vec![0u8; pad])?;
        }
        Ok(())
    }
}

impl<W: Write + ?Sized> WriteLe for W {}

/// Copies a caller-supplied string/byte slice into a fixed-size,
/// NUL-terminated, NUL-padded array, truncating silently if the buffer is
/// too small for the filename (callers enforce the length precondition
/// before ever reaching here).
pub fn pack_fixed<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = src.len().min(N);
    out[..len].copy_from_slice(&src[..len]);
    out
}

/// Reads a NUL-terminated name out of a fixed-size field.
pub fn unpack_fixed(buf: &[u8]) -> Vec<u8> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf[..end].to_vec()
}
