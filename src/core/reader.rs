//! # Byte Readers
//!
//! Bounds-checked sequential readers the unpickler pulls opcodes and operands
//! from. [`SliceReader`] borrows an in-memory buffer and hands out operands
//! without copying; [`IoReader`] wraps any `std::io::Read` and reads exactly
//! the bytes one value needs, leaving the rest of the source untouched.

use crate::error::{ProtocolError, Result};
use std::borrow::Cow;
use std::io::Read;

/// Source of pickle bytes.
pub trait PickleRead {
    /// Offset of the next byte to be read.
    fn position(&self) -> usize;

    fn read_byte(&mut self) -> Result<u8>;

    /// Read exactly `len` bytes.
    fn read_bytes(&mut self, len: usize) -> Result<Cow<'_, [u8]>>;

    /// Read up to and excluding the next `\n`, consuming the newline.
    fn read_line(&mut self) -> Result<Vec<u8>>;

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.read_byte()
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    fn read_i32_le(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_f64_be(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.read_array()?))
    }
}

/// Reader over a borrowed byte slice.
pub struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

impl PickleRead for SliceReader<'_> {
    fn position(&self) -> usize {
        self.pos
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or(ProtocolError::Truncated {
            needed: 1,
            offset: self.pos,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Cow<'_, [u8]>> {
        let available = self.data.len() - self.pos;
        if len > available {
            return Err(ProtocolError::Truncated {
                needed: len - available,
                offset: self.pos,
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(Cow::Borrowed(&self.data[start..self.pos]))
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(ProtocolError::Truncated {
                needed: 1,
                offset: self.data.len(),
            })?;
        self.pos += end + 1;
        Ok(rest[..end].to_vec())
    }
}

/// Reader over any `std::io::Read` source.
pub struct IoReader<R> {
    inner: R,
    pos: usize,
}

impl<R: Read> IoReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, pos: 0 }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> PickleRead for IoReader<R> {
    fn position(&self) -> usize {
        self.pos
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        match self.inner.read_exact(&mut byte) {
            Ok(()) => {
                self.pos += 1;
                Ok(byte[0])
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ProtocolError::Truncated {
                    needed: 1,
                    offset: self.pos,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<Cow<'_, [u8]>> {
        // Grows with the data actually read, so a bogus length cannot force a huge allocation.
        let mut buf = Vec::new();
        (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() < len {
            return Err(ProtocolError::Truncated {
                needed: len - buf.len(),
                offset: self.pos + buf.len(),
            });
        }
        self.pos += len;
        Ok(Cow::Owned(buf))
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let byte = self.read_byte()?;
            if byte == b'\n' {
                return Ok(line);
            }
            line.push(byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_reader_truncation_reports_offset() {
        let mut reader = SliceReader::new(&[1, 2, 3]);
        assert_eq!(reader.read_byte().expect("byte"), 1);
        match reader.read_bytes(5) {
            Err(ProtocolError::Truncated { needed, offset }) => {
                assert_eq!(needed, 3);
                assert_eq!(offset, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_read_line_consumes_newline() {
        let mut reader = SliceReader::new(b"I42\nrest");
        assert_eq!(reader.read_byte().expect("op"), b'I');
        assert_eq!(reader.read_line().expect("line"), b"42");
        assert_eq!(reader.remaining(), b"rest");
    }

    #[test]
    fn test_io_reader_stops_after_request() {
        let data: &[u8] = b"abcdef";
        let mut reader = IoReader::new(data);
        assert_eq!(&*reader.read_bytes(3).expect("bytes"), b"abc");
        assert_eq!(reader.position(), 3);
        assert_eq!(reader.read_u16_le().expect("u16"), u16::from_le_bytes(*b"de"));
        assert!(matches!(
            reader.read_u16_le(),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
