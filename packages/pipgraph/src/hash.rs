//! Hashing operations and types.
//!
//! Two hash flavors exist in the engine and must not be confused:
//! - [`ContentHash`] identifies raw bytes (file contents, serialized tables).
//! - [`Fingerprint`] identifies a canonicalized sequence of keyed values
//!   (for example the composite graph fingerprint).
//!
//! Both are 32-byte Blake3 digests; the type distinction keeps content
//! identity and computed identity from being swapped at call sites.

use std::{fmt, str::FromStr};

use color_eyre::{
    Report, Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::trace;

/// Number of raw bytes in a [`ContentHash`] or [`Fingerprint`].
pub const HASH_LEN: usize = 32;

/// A Blake3 content hash over raw bytes.
///
/// A small closed set of marker values exists alongside real digests;
/// see [`ContentHash::ABSENT_FILE`] and friends. Marker bytes are literal
/// constants and must stay byte-stable across invocations, since they are
/// written into tracker records on disk.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", self.to_hex())]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Marker recorded for a path that was probed and found absent.
    pub const ABSENT_FILE: ContentHash = ContentHash([0xAF; HASH_LEN]);

    /// Marker recorded for a path whose existence was probed (present)
    /// but whose content was never read.
    pub const EXISTENT_FILE_PROBE: ContentHash = ContentHash([0xEF; HASH_LEN]);

    /// The all-zero hash.
    pub const ZERO: ContentHash = ContentHash([0x00; HASH_LEN]);

    /// Hash the contents of a buffer.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let hash = blake3::hash(buffer);
        trace!(bytes = ?buffer.len(), "hash buffer");
        Self(*hash.as_bytes())
    }

    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// View the raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Render the digest as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this value is one of the closed set of marker hashes
    /// rather than a real content digest.
    pub const fn is_marker(&self) -> bool {
        matches!(
            *self,
            ContentHash::ABSENT_FILE | ContentHash::EXISTENT_FILE_PROBE | ContentHash::ZERO
        )
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ContentHash::ABSENT_FILE => f.write_str("ContentHash(AbsentFile)"),
            ContentHash::EXISTENT_FILE_PROBE => f.write_str("ContentHash(ExistentFileProbe)"),
            ContentHash::ZERO => f.write_str("ContentHash(Zero)"),
            _ => write!(f, "ContentHash({})", self.to_hex()),
        }
    }
}

impl FromStr for ContentHash {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("decode hash hex")?;
        let Ok(bytes) = <[u8; HASH_LEN]>::try_from(bytes) else {
            bail!("hash must be {HASH_LEN} bytes: {s:?}");
        };
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A fingerprint: a fixed-width hash computed from a canonicalized
/// sequence of keyed values.
///
/// Build one with [`FingerprintBuilder`], which also records a
/// human-readable trace of every element that contributed.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{}", self.to_hex())]
pub struct Fingerprint([u8; HASH_LEN]);

impl Fingerprint {
    /// The all-zero fingerprint, used where "no fingerprint" must be
    /// representable in fixed-width storage.
    pub const ZERO: Fingerprint = Fingerprint([0x00; HASH_LEN]);

    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Compute a fingerprint over a single buffer.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(buffer.as_ref()).as_bytes())
    }

    /// View the raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Render the digest as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("decode fingerprint hex")?;
        let Ok(bytes) = <[u8; HASH_LEN]>::try_from(bytes) else {
            bail!("fingerprint must be {HASH_LEN} bytes: {s:?}");
        };
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incrementally computes a [`Fingerprint`] over named elements.
///
/// Elements are fed to the hasher as `name || 0x00 || value || 0x01` so
/// that adjacent elements cannot alias each other, and every element is
/// also recorded as a `(name, rendered value)` pair for the trace listing.
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
    trace: Vec<(String, String)>,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            trace: Vec::new(),
        }
    }

    /// Add a named UTF-8 text element.
    pub fn add_text(&mut self, name: &str, value: &str) -> &mut Self {
        self.add_raw(name, value.as_bytes(), value.to_owned())
    }

    /// Add a named content hash element.
    pub fn add_hash(&mut self, name: &str, value: &ContentHash) -> &mut Self {
        self.add_raw(name, value.as_bytes(), value.to_hex())
    }

    /// Add a named nested fingerprint element.
    pub fn add_fingerprint(&mut self, name: &str, value: &Fingerprint) -> &mut Self {
        self.add_raw(name, value.as_bytes(), value.to_hex())
    }

    /// Add a named boolean element.
    pub fn add_bool(&mut self, name: &str, value: bool) -> &mut Self {
        self.add_raw(name, &[value as u8], value.to_string())
    }

    fn add_raw(&mut self, name: &str, value: &[u8], rendered: String) -> &mut Self {
        self.hasher.update(name.as_bytes());
        self.hasher.update(&[0x00]);
        self.hasher.update(value);
        self.hasher.update(&[0x01]);
        self.trace.push((name.to_owned(), rendered));
        self
    }

    /// Finish, producing the fingerprint and its trace listing.
    pub fn finish(self) -> (Fingerprint, Vec<(String, String)>) {
        let hash = self.hasher.finalize();
        (Fingerprint(*hash.as_bytes()), self.trace)
    }

    /// Finish, discarding the trace.
    pub fn finish_fingerprint(self) -> Fingerprint {
        self.finish().0
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;

    #[test]
    fn markers_are_byte_stable() {
        pretty_assert_eq!(ContentHash::ABSENT_FILE.as_bytes(), &[0xAF; HASH_LEN]);
        pretty_assert_eq!(
            ContentHash::EXISTENT_FILE_PROBE.as_bytes(),
            &[0xEF; HASH_LEN]
        );
        pretty_assert_eq!(ContentHash::ZERO.as_bytes(), &[0x00; HASH_LEN]);
    }

    #[test]
    fn hex_round_trip() {
        let hash = ContentHash::from_buffer(b"some content");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        pretty_assert_eq!(hash, parsed);
    }

    #[test]
    fn builder_is_deterministic() {
        let build = || {
            let mut b = FingerprintBuilder::new();
            b.add_text("version", "1.0");
            b.add_bool("elevated", false);
            b.finish_fingerprint()
        };
        pretty_assert_eq!(build(), build());
    }

    #[test]
    fn builder_elements_do_not_alias() {
        let mut a = FingerprintBuilder::new();
        a.add_text("ab", "c");
        let mut b = FingerprintBuilder::new();
        b.add_text("a", "bc");
        assert_ne!(a.finish_fingerprint(), b.finish_fingerprint());
    }

    #[test]
    fn trace_records_every_element() {
        let mut b = FingerprintBuilder::new();
        b.add_text("os", "linux");
        b.add_bool("compressed", true);
        let (_, trace) = b.finish();
        pretty_assert_eq!(
            trace,
            vec![
                ("os".to_owned(), "linux".to_owned()),
                ("compressed".to_owned(), "true".to_owned()),
            ]
        );
    }
}
