//! Object-store contract.
//!
//! The production object database (pack files, deltas, alternates) is an
//! external collaborator; the populator only requires synchronous read access
//! to whole objects. [`BlobDir`] is the loose implementation shipped for the
//! helper binary and tests: one file per object, named by its hex id.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Largest raw object id this crate carries (SHA-256 class).
pub const OID_RAW_MAX: usize = 32;

/// Identity of one object in the object database.
///
/// Holds up to [`OID_RAW_MAX`] raw bytes plus the explicit hash length, so
/// SHA-1 (20 byte) and SHA-256 (32 byte) ids travel through the same wire
/// records.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    len: u8,
    bytes: [u8; OID_RAW_MAX],
}

impl ObjectId {
    /// Wrap raw hash bytes. Accepts 20 or 32 byte ids.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() != 20 && raw.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; OID_RAW_MAX];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(ObjectId {
            len: raw.len() as u8,
            bytes,
        })
    }

    /// Parse a lowercase or uppercase hex id.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 40 && hex.len() != 64 {
            return None;
        }
        let mut raw = [0u8; OID_RAW_MAX];
        for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            raw[i] = ((hi << 4) | lo) as u8;
        }
        Some(ObjectId {
            len: (hex.len() / 2) as u8,
            bytes: raw,
        })
    }

    /// The significant hash bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Fixed-width raw form for wire records: the padded buffer plus the
    /// significant length.
    pub fn to_wire(&self) -> ([u8; OID_RAW_MAX], u8) {
        (self.bytes, self.len)
    }

    /// Rebuild from the fixed-width wire form.
    pub fn from_wire(bytes: [u8; OID_RAW_MAX], len: u8) -> Option<Self> {
        if len != 20 && len != 32 {
            return None;
        }
        Some(ObjectId { len, bytes })
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(usize::from(self.len) * 2);
        for b in self.as_bytes() {
            out.push(char::from_digit(u32::from(b >> 4), 16).unwrap_or('0'));
            out.push(char::from_digit(u32::from(b & 0xf), 16).unwrap_or('0'));
        }
        out
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// Kind of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// File content.
    Blob,
    /// Anything the populator has no business writing to a worktree.
    Other,
}

/// One object read out of the store.
#[derive(Debug)]
pub struct ObjectBytes {
    /// Object kind.
    pub kind: ObjectKind,
    /// The full object payload.
    pub data: Vec<u8>,
}

/// Synchronous read access to the object database.
pub trait ObjectStore: Send + Sync {
    /// Read one whole object.
    fn read_object(&self, oid: &ObjectId) -> io::Result<ObjectBytes>;
}

/// Loose blob directory: `<root>/<hex-oid>` holds each object's raw bytes.
#[derive(Debug, Clone)]
pub struct BlobDir {
    root: PathBuf,
}

impl BlobDir {
    /// Open a blob directory rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BlobDir { root: root.into() }
    }

    /// Store `data` under `oid`; used to seed fixtures.
    pub fn insert(&self, oid: &ObjectId, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(oid.to_hex()), data)
    }
}

impl ObjectStore for BlobDir {
    fn read_object(&self, oid: &ObjectId) -> io::Result<ObjectBytes> {
        let data = fs::read(self.root.join(oid.to_hex()))?;
        Ok(ObjectBytes {
            kind: ObjectKind::Blob,
            data,
        })
    }
}
