//! Big-endian packet cursors. Every integer on the wire is big-endian; these
//! two types are the only place the byte order is spelled out.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MasterError, Result};

/// Sequential reader over a received payload.
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(MasterError::Protocol(format!(
                "packet truncated: wanted {} bytes, {} left",
                n,
                self.remaining()
            )));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }
}

/// Builder for one outbound frame: 8-byte header plus payload.
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    /// `size` must match the number of payload bytes subsequently written.
    pub fn new(ptype: u32, size: u32) -> Self {
        let mut buf = BytesMut::with_capacity(8 + size as usize);
        buf.put_u32(ptype);
        buf.put_u32(size);
        Self { buf }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn finish(self) -> Bytes {
        debug_assert_eq!(
            self.buf.len(),
            8 + u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize,
            "frame length mismatch"
        );
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let mut w = PacketWriter::new(7, 15);
        w.put_u8(0xAB).put_u16(0x1234).put_u32(0xDEADBEEF).put_u64(42);
        let frame = w.finish();
        assert_eq!(frame.len(), 23);
        assert_eq!(&frame[..4], &7u32.to_be_bytes());
        assert_eq!(&frame[4..8], &15u32.to_be_bytes());
        let mut r = PacketReader::new(&frame[8..]);
        assert_eq!(r.get_u8().unwrap(), 0xAB);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.get_u64().unwrap(), 42);
        assert_eq!(r.remaining(), 0);
        assert!(r.get_u8().is_err());
    }
}
