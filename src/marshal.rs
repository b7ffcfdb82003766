//! Big-endian TPM structure encoding.
//!
//! Only the handful of structures that feed into names and policy digests
//! are encoded here, plus the records persisted next to a sealed key.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MarshalError {
    #[error("truncated input: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
    #[error("sized buffer of {0} bytes does not fit a TPM2B")]
    Oversized(usize),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

pub type Result<T, E = MarshalError> = core::result::Result<T, E>;

pub trait Marshal {
    fn marshal(&self, buf: &mut Vec<u8>);

    fn to_marshalled(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.marshal(&mut buf);
        buf
    }
}

pub trait Unmarshal: Sized {
    fn unmarshal(reader: &mut Reader<'_>) -> Result<Self>;
}

pub fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Writes a TPM2B: a u16 length followed by the bytes.
///
/// `data` must pass [`check_tpm2b`]. Digests, names and key public areas
/// always do; records holding caller supplied buffers check before encoding.
pub fn put_tpm2b(buf: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(check_tpm2b(data).is_ok());
    let len = data.len().min(u16::MAX as usize);
    put_u16(buf, len as u16);
    buf.extend_from_slice(&data[..len]);
}

/// Fails with [`MarshalError::Oversized`] when `data` is too long for a TPM2B.
pub fn check_tpm2b(data: &[u8]) -> Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(MarshalError::Oversized(data.len()));
    }
    Ok(())
}

pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(MarshalError::Truncated {
                offset: self.offset,
                needed: n,
            })?;
        let out = &self.data[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(out))
    }

    pub fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn tpm2b(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    pub fn read<T: Unmarshal>(&mut self) -> Result<T> {
        T::unmarshal(self)
    }

    /// Fails if anything is left unread
    pub fn finish(self) -> Result<()> {
        match self.data.len() - self.offset {
            0 => Ok(()),
            n => Err(MarshalError::TrailingBytes(n)),
        }
    }
}
