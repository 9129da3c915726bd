//! Figure dump storage
//!
//! Owns the persisted byte blob that stands in for the figure sitting on the
//! portal. The blob is a single flat file of raw bytes (no header, no
//! checksum) no larger than [`MAX_DUMP_SIZE`].
//!
//! SPDX-License-Identifier: GPL-3.0

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for a dump, comfortably above an NFC tag payload
pub const MAX_DUMP_SIZE: usize = 8192;

/// Size of the synthesized stand-in dump
pub const DEFAULT_DUMP_SIZE: usize = 512;

/// Fill byte of the synthesized dump
pub const DEFAULT_FILL_BYTE: u8 = 0xAA;

/// Marker written to byte 0 of the synthesized dump
pub const DEFAULT_MARKER_BYTE: u8 = 0x53;

// ============================================================================
// Dump Buffer
// ============================================================================

/// In-memory figure dump
///
/// The length never exceeds [`MAX_DUMP_SIZE`] and never changes after
/// construction; writes overwrite in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpBuffer {
    bytes: Vec<u8>,
}

impl DumpBuffer {
    /// Wrap loaded bytes, rejecting anything over the size bound
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, DumpError> {
        if bytes.len() > MAX_DUMP_SIZE {
            return Err(DumpError::TooLarge { size: bytes.len() as u64 });
        }
        Ok(Self { bytes })
    }

    /// Structurally plausible stand-in used when no real dump exists
    ///
    /// A real figure needs a byte-accurate payload; this only keeps the
    /// consumer from seeing an empty portal.
    pub fn synthesize_default() -> Self {
        let mut bytes = vec![DEFAULT_FILL_BYTE; DEFAULT_DUMP_SIZE];
        bytes[0] = DEFAULT_MARKER_BYTE;
        Self { bytes }
    }

    /// Zero-filled buffer of the maximum size, allocated on a first write
    pub fn zeroed() -> Self {
        Self { bytes: vec![0u8; MAX_DUMP_SIZE] }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Fill `out` from the start of the dump, zero-padding past its end
    ///
    /// Returns the number of dump bytes copied.
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        let copied = out.len().min(self.bytes.len());
        out[..copied].copy_from_slice(&self.bytes[..copied]);
        out[copied..].fill(0);
        copied
    }

    /// Overwrite bytes starting at `offset`, clamped to the current length
    ///
    /// Returns the number of bytes written; an offset past the end writes
    /// nothing.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> usize {
        let Some(dest) = self.bytes.get_mut(offset..) else {
            return 0;
        };
        let written = data.len().min(dest.len());
        dest[..written].copy_from_slice(&data[..written]);
        written
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Raw byte storage behind the dump file
pub trait Storage: Send + Sync {
    /// Read at most `limit` bytes from `path`
    ///
    /// Implementations may stop early; a result longer than the dump bound is
    /// enough for the caller to reject the file.
    fn read(&self, path: &Path, limit: usize) -> io::Result<Vec<u8>>;

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// Filesystem-backed storage
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorage;

impl Storage for FsStorage {
    fn read(&self, path: &Path, limit: usize) -> io::Result<Vec<u8>> {
        let file = File::open(path)?;
        let mut bytes = Vec::new();
        file.take(limit as u64).read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, bytes)
    }
}

// ============================================================================
// Dump Store
// ============================================================================

/// Loads and persists the dump at one fixed path
#[derive(Clone)]
pub struct DumpStore {
    path: PathBuf,
    storage: Arc<dyn Storage>,
}

impl DumpStore {
    pub fn new<P: Into<PathBuf>>(path: P, storage: Arc<dyn Storage>) -> Self {
        Self {
            path: path.into(),
            storage,
        }
    }

    /// Store backed by the local filesystem
    pub fn on_disk<P: Into<PathBuf>>(path: P) -> Self {
        Self::new(path, Arc::new(FsStorage))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full dump
    pub fn load(&self) -> Result<DumpBuffer, DumpError> {
        let bytes = self
            .storage
            .read(&self.path, MAX_DUMP_SIZE + 1)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    DumpError::NotFound
                } else {
                    DumpError::Io(e)
                }
            })?;

        if bytes.is_empty() {
            return Err(DumpError::Empty);
        }

        let buffer = DumpBuffer::from_bytes(bytes)?;
        tracing::info!(
            path = %self.path.display(),
            len = buffer.len(),
            "Figure dump loaded"
        );
        Ok(buffer)
    }

    /// Write the buffer's bytes verbatim
    pub fn persist(&self, buffer: &DumpBuffer) -> Result<(), DumpError> {
        if buffer.is_empty() {
            return Err(DumpError::NothingToPersist);
        }

        self.storage
            .write(&self.path, buffer.as_bytes())
            .map_err(DumpError::Io)?;

        tracing::debug!(path = %self.path.display(), len = buffer.len(), "Figure dump persisted");
        Ok(())
    }

    /// Load the dump, or synthesize and persist the stand-in
    ///
    /// Persisting the stand-in right away means later restarts load the same
    /// bytes instead of synthesizing again.
    pub fn load_or_default(&self) -> DumpBuffer {
        match self.load() {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "No usable figure dump, synthesizing default"
                );
                let buffer = DumpBuffer::synthesize_default();
                if let Err(e) = self.persist(&buffer) {
                    tracing::warn!(error = %e, "Failed to persist default figure dump");
                }
                buffer
            }
        }
    }
}

impl std::fmt::Debug for DumpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpStore").field("path", &self.path).finish()
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Dump store error type
#[derive(Debug)]
pub enum DumpError {
    /// No dump file at the path
    NotFound,
    /// Dump file larger than [`MAX_DUMP_SIZE`]
    TooLarge { size: u64 },
    /// Dump file exists but holds no bytes
    Empty,
    /// Persist requested for a zero-length buffer
    NothingToPersist,
    /// I/O error
    Io(io::Error),
}

impl std::fmt::Display for DumpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DumpError::NotFound => write!(f, "Figure dump not found"),
            DumpError::TooLarge { size } => write!(
                f,
                "Figure dump too large ({} bytes, max {})",
                size, MAX_DUMP_SIZE
            ),
            DumpError::Empty => write!(f, "Figure dump is empty"),
            DumpError::NothingToPersist => write!(f, "Nothing to persist"),
            DumpError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for DumpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DumpError::Io(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
