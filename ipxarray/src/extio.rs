//! Extend Read and Write with some convenience methods for binary i/o
//!
use std::io::{self, Read, Write};

use cid::Cid;
use unsigned_varint::{encode, io::read_u64 as varint_read_u64};

use crate::errors::{Error, Result};

pub(crate) trait ExtendedRead: Read {
    /// Read a byte from a stream
    fn read_byte(&mut self) -> io::Result<u8> {
        let mut buffer = [0; 1];
        self.read_exact(&mut buffer)?;

        Ok(buffer[0])
    }

    /// Read a Big Endian encoded 16 bit unsigned integer from a stream
    fn read_u16(&mut self) -> io::Result<u16> {
        let mut buffer = [0; 2];
        self.read_exact(&mut buffer)?;

        Ok(u16::from_be_bytes(buffer))
    }

    /// Read a Big Endian encoded 32 bit unsigned integer from a stream
    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buffer = [0; 4];
        self.read_exact(&mut buffer)?;

        Ok(u32::from_be_bytes(buffer))
    }

    /// Read an unsigned varint from a stream
    fn read_varint(&mut self) -> Result<u64>
    where
        Self: Sized,
    {
        varint_read_u64(self).map_err(|err| Error::Decode(format!("bad varint: {err}")))
    }

    /// Read a CID from a stream
    fn read_cid(&mut self) -> Result<Cid>
    where
        Self: Sized,
    {
        Ok(Cid::read_bytes(self)?)
    }
}

impl<R: Read> ExtendedRead for R {}

pub(crate) trait ExtendedWrite: Write {
    /// Write a byte to a stream
    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    /// Write a Big Endian encoded 16 bit unsigned integer to a stream
    fn write_u16(&mut self, word: u16) -> io::Result<()> {
        self.write_all(&word.to_be_bytes())
    }

    /// Write a Big Endian encoded 32 bit unsigned integer to a stream
    fn write_u32(&mut self, word: u32) -> io::Result<()> {
        self.write_all(&word.to_be_bytes())
    }

    /// Write an unsigned varint to a stream
    fn write_varint(&mut self, n: u64) -> io::Result<()> {
        let mut buffer = encode::u64_buffer();
        self.write_all(encode::u64(n, &mut buffer))
    }

    /// Write a CID to a stream
    fn write_cid(&mut self, cid: &Cid) -> Result<()>
    where
        Self: Sized,
    {
        cid.write_bytes(self)?;

        Ok(())
    }
}

impl<W: Write> ExtendedWrite for W {}
