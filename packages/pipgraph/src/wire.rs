//! Little-endian wire codec for on-disk records.
//!
//! Bundle envelopes, the tracker's previous-inputs body, journal
//! checkpoints, and sideband files all share this byte-level vocabulary:
//! `u32`/`u64` little-endian integers, length-prefixed UTF-8 strings,
//! raw 32-byte digests, and 16-byte tokens.

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use uuid::Uuid;

use crate::hash::{ContentHash, Fingerprint, HASH_LEN};

/// Appends wire-encoded values to an owned buffer.
#[derive(Default, Debug)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Raw bytes, no length prefix. The reader must know the width.
    pub fn put_raw(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn put_hash(&mut self, value: &ContentHash) {
        self.put_raw(value.as_bytes());
    }

    pub fn put_fingerprint(&mut self, value: &Fingerprint) {
        self.put_raw(value.as_bytes());
    }

    /// 16 raw bytes.
    pub fn put_token(&mut self, value: &Uuid) {
        self.put_raw(value.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Reads wire-encoded values from a byte slice, front to back.
///
/// Every method fails cleanly on truncated input; callers treat any
/// decode failure as record corruption, never as a panic.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!(
                "record truncated: need {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            );
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => bail!("invalid boolean byte: {other:#04x}"),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).context("decode string")
    }

    pub fn get_hash(&mut self) -> Result<ContentHash> {
        let bytes = self.take(HASH_LEN)?;
        Ok(ContentHash::from_bytes(bytes.try_into().unwrap()))
    }

    pub fn get_fingerprint(&mut self) -> Result<Fingerprint> {
        let bytes = self.take(HASH_LEN)?;
        Ok(Fingerprint::from_bytes(bytes.try_into().unwrap()))
    }

    pub fn get_token(&mut self) -> Result<Uuid> {
        let bytes = self.take(16)?;
        Ok(Uuid::from_bytes(bytes.try_into().unwrap()))
    }
}
