//! Big-endian cursor and writer helpers for class file structures.

use super::ClassFileError;

/// Read cursor over a borrowed byte slice.
///
/// Every read is bounds-checked and reports the offset it failed at, so a
/// truncated class file surfaces as `UnexpectedEof` instead of a panic.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof { offset: self.pos });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ClassFileError> {
        self.take(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, ClassFileError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ClassFileError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ClassFileError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i16(&mut self) -> Result<i16, ClassFileError> {
        self.u16().map(|v| v as i16)
    }

    pub fn i32(&mut self) -> Result<i32, ClassFileError> {
        self.u32().map(|v| v as i32)
    }

    /// Fail if any input is left over.
    pub fn finish(&self) -> Result<(), ClassFileError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ClassFileError::TrailingBytes(n)),
        }
    }
}

/// Big-endian append helpers for `Vec<u8>`.
pub trait ByteWriter {
    fn put_u8(&mut self, v: u8);
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
}

impl ByteWriter for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_be_bytes());
    }
}

/// Convert a collection length to the `u16` count prefix used everywhere
/// in the class file format.
pub fn count_u16(len: usize, what: &'static str) -> Result<u16, ClassFileError> {
    u16::try_from(len).map_err(|_| ClassFileError::TooMany { what, count: len })
}
