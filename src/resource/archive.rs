//! Random-access reading of zip archives held in memory.

use std::io::{Cursor, Read};

use bytes::Bytes;
use parking_lot::Mutex;
use zip::ZipArchive;

use crate::error::MeridianError;

/// A single file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub uncompressed_size: u64,
    index: usize,
}

/// A zip archive indexed for by-path entry access.
///
/// The entry index is built eagerly from the central directory; entry contents are decompressed
/// on demand.
pub struct SceneArchive {
    entries: Vec<ArchiveEntry>,
    reader: Mutex<ZipArchive<Cursor<Bytes>>>,
}

impl SceneArchive {
    /// Builds an archive index from raw bytes.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, MeridianError> {
        let mut reader = ZipArchive::new(Cursor::new(bytes))?;

        let mut entries = Vec::with_capacity(reader.len());
        for index in 0..reader.len() {
            let file = reader.by_index(index)?;
            entries.push(ArchiveEntry {
                path: file.name().to_owned(),
                uncompressed_size: file.size(),
                index,
            });
        }

        Ok(Self {
            entries,
            reader: Mutex::new(reader),
        })
    }

    /// Entries in archive order.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn find_entry(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|entry| entry.path == path)
    }

    /// The "base" scene document of the archive: the first entry with a `yaml` or `yml`
    /// extension located at the archive root.
    pub fn base_document(&self) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|entry| {
            let extension = match entry.path.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => ext,
                _ => "",
            };
            (extension == "yaml" || extension == "yml") && !entry.path.contains('/')
        })
    }

    /// Decompresses the entry contents.
    pub fn decompress_entry(&self, entry: &ArchiveEntry) -> Result<Vec<u8>, MeridianError> {
        let mut reader = self.reader.lock();
        let mut file = reader.by_index(entry.index)?;
        let mut content = Vec::with_capacity(entry.uncompressed_size as usize);
        file.read_to_end(&mut content)?;

        Ok(content)
    }
}

impl std::fmt::Debug for SceneArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneArchive")
            .field("entries", &self.entries.len())
            .finish()
    }
}
