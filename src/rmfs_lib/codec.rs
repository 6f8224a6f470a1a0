//! Wire codec: `type:u32be, length:u32be, payload` framing plus the
//! big-endian field readers/writers used inside payloads. Names are
//! `len:u8` prefixed (<=255 bytes), paths and blobs `len:u32` prefixed.

use std::io::{Read, Write};

use anyhow::{anyhow, bail, Result};
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::rmfs_lib::types::{MAX_NAME_LENG, MAX_PATH_LENG};

#[derive(Debug, Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
struct FrameHeader {
    ptype: U32<BigEndian>,
    length: U32<BigEndian>,
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: u32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(ptype: u32) -> Packet {
        Packet { ptype, data: Vec::new() }
    }

    pub fn with_capacity(ptype: u32, cap: usize) -> Packet {
        Packet { ptype, data: Vec::with_capacity(cap) }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.data.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.data.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.data.extend_from_slice(v);
        self
    }

    /// `len:u8` prefixed name, at most 255 bytes.
    pub fn put_name(&mut self, v: &[u8]) -> &mut Self {
        debug_assert!(v.len() <= MAX_NAME_LENG);
        self.data.push(v.len() as u8);
        self.data.extend_from_slice(v);
        self
    }

    /// `len:u32` prefixed blob (paths, symlink targets, xattr values).
    pub fn put_data(&mut self, v: &[u8]) -> &mut Self {
        self.data.extend_from_slice(&(v.len() as u32).to_be_bytes());
        self.data.extend_from_slice(v);
        self
    }
}

/// Big-endian field reader over a packet payload.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Cursor<'a> {
        Cursor { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("packet too short: need {} bytes, {} left", n, self.remaining());
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn get_name(&mut self) -> Result<&'a [u8]> {
        let leng = self.get_u8()? as usize;
        self.take(leng)
    }

    pub fn get_data(&mut self) -> Result<&'a [u8]> {
        let leng = self.get_u32()? as usize;
        if leng > MAX_PATH_LENG.max(1 << 20) {
            bail!("blob too long: {}", leng);
        }
        self.take(leng)
    }

    /// All payload bytes must have been consumed by the handler.
    pub fn expect_end(&self) -> Result<()> {
        if self.remaining() != 0 {
            bail!("trailing {} bytes in packet", self.remaining());
        }
        Ok(())
    }
}

/// Read one framed packet. Returns `None` on a clean EOF at a frame
/// boundary; an oversized length or a short payload read is an error and
/// the caller drops the connection.
pub fn read_packet(r: &mut impl Read, maxsize: u32) -> Result<Option<Packet>> {
    let mut hdr = [0u8; 8];
    match r.read_exact(&mut hdr[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    r.read_exact(&mut hdr[1..])?;
    let fh = FrameHeader::read_from(&hdr[..]).ok_or_else(|| anyhow!("bad frame header"))?;
    let length = fh.length.get();
    if length > maxsize {
        bail!("packet too long ({} > {})", length, maxsize);
    }
    let mut data = vec![0u8; length as usize];
    r.read_exact(&mut data)?;
    Ok(Some(Packet { ptype: fh.ptype.get(), data }))
}

pub fn write_packet(w: &mut impl Write, p: &Packet) -> Result<()> {
    let fh = FrameHeader {
        ptype: U32::new(p.ptype),
        length: U32::new(p.data.len() as u32),
    };
    w.write_all(fh.as_bytes())?;
    w.write_all(&p.data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn field_roundtrip() -> Result<()> {
        let mut p = Packet::new(42);
        p.put_u8(7).put_u16(0x1234).put_u32(0xDEADBEEF).put_u64(0x0102030405060708);
        p.put_name(b"hello").put_data(b"world!");
        let mut c = Cursor::new(&p.data);
        assert_eq!(c.get_u8()?, 7);
        assert_eq!(c.get_u16()?, 0x1234);
        assert_eq!(c.get_u32()?, 0xDEADBEEF);
        assert_eq!(c.get_u64()?, 0x0102030405060708);
        assert_eq!(c.get_name()?, b"hello");
        assert_eq!(c.get_data()?, b"world!");
        c.expect_end()?;
        Ok(())
    }

    #[test]
    fn big_endian_on_the_wire() {
        let mut p = Packet::new(1);
        p.put_u32(0x01020304);
        assert_eq!(p.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn short_packet_is_an_error() {
        let mut c = Cursor::new(&[1, 2]);
        assert!(c.get_u32().is_err());
    }

    #[test]
    fn frame_roundtrip() -> Result<()> {
        let mut p = Packet::new(1406);
        p.put_u32(0xABCD).put_name(b"f");
        let mut buf = Vec::new();
        write_packet(&mut buf, &p)?;
        assert_eq!(&buf[0..4], &1406u32.to_be_bytes());
        assert_eq!(&buf[4..8], &(p.data.len() as u32).to_be_bytes());
        let mut rd = &buf[..];
        let q = read_packet(&mut rd, 1000)?.unwrap();
        assert_eq!(q, p);
        assert!(read_packet(&mut rd, 1000)?.is_none());
        Ok(())
    }

    #[test]
    fn oversized_frame_kills_the_read() -> Result<()> {
        let mut p = Packet::new(7);
        p.put_bytes(&[0u8; 64]);
        let mut buf = Vec::new();
        write_packet(&mut buf, &p)?;
        let mut rd = &buf[..];
        assert!(read_packet(&mut rd, 16).is_err());
        Ok(())
    }

    #[test]
    fn truncated_payload_kills_the_read() -> Result<()> {
        let mut p = Packet::new(7);
        p.put_bytes(&[0u8; 64]);
        let mut buf = Vec::new();
        write_packet(&mut buf, &p)?;
        buf.truncate(buf.len() - 10);
        let mut rd = &buf[..];
        assert!(read_packet(&mut rd, 1000).is_err());
        Ok(())
    }
}
