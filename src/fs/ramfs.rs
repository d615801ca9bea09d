// RAM-based filesystem implementation
//
// Flat namespace keyed by full path. Clones share the same storage, so a
// caller can keep one handle to inspect what a transfer wrote.

use super::vfs::{FileHandle, FileStore, FsError, OpenMode};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

struct Volume {
    files: BTreeMap<String, Vec<u8>>,
    /// Total bytes the volume may hold
    capacity: Option<usize>,
}

impl Volume {
    fn used(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

#[derive(Clone)]
pub struct RamFs {
    volume: Arc<Mutex<Volume>>,
}

impl RamFs {
    pub fn new() -> Self {
        RamFs {
            volume: Arc::new(Mutex::new(Volume {
                files: BTreeMap::new(),
                capacity: None,
            })),
        }
    }

    /// A volume that reports `DiskFull` once `capacity` bytes are stored
    pub fn with_capacity(capacity: usize) -> Self {
        let fs = Self::new();
        fs.volume.lock().capacity = Some(capacity);
        fs
    }

    fn check_path(path: &str) -> Result<(), FsError> {
        if path.is_empty() || path.ends_with('/') || path.contains('\0') {
            return Err(FsError::InvalidPath);
        }
        Ok(())
    }

    /// Store a whole file, replacing any previous contents
    pub fn insert(&self, path: &str, content: &[u8]) -> Result<(), FsError> {
        Self::check_path(path)?;
        self.volume
            .lock()
            .files
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }

    /// Copy of a file's contents
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.volume.lock().files.get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.volume.lock().files.contains_key(path)
    }

    pub fn delete(&self, path: &str) -> Result<(), FsError> {
        self.volume
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    pub fn list(&self) -> Vec<String> {
        self.volume.lock().files.keys().cloned().collect()
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStore for RamFs {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>, FsError> {
        Self::check_path(path)?;
        let mut volume = self.volume.lock();
        match mode {
            OpenMode::Read => {
                if !volume.files.contains_key(path) {
                    return Err(FsError::NotFound);
                }
            }
            OpenMode::Create => {
                volume.files.insert(path.to_string(), Vec::new());
            }
        }
        Ok(Box::new(RamFile {
            volume: self.volume.clone(),
            path: path.to_string(),
            mode,
            pos: 0,
        }))
    }
}

/// Open file on a [`RamFs`]
struct RamFile {
    volume: Arc<Mutex<Volume>>,
    path: String,
    mode: OpenMode,
    pos: usize,
}

impl FileHandle for RamFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        if self.mode != OpenMode::Read {
            return Err(FsError::BadMode);
        }
        let volume = self.volume.lock();
        let content = volume.files.get(&self.path).ok_or(FsError::NotFound)?;
        let start = self.pos.min(content.len());
        let n = buf.len().min(content.len() - start);
        buf[..n].copy_from_slice(&content[start..start + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        if self.mode != OpenMode::Create {
            return Err(FsError::BadMode);
        }
        let mut volume = self.volume.lock();
        let used = volume.used();
        let capacity = volume.capacity;
        let content = volume.files.get_mut(&self.path).ok_or(FsError::NotFound)?;

        let end = self.pos + buf.len();
        let growth = end.saturating_sub(content.len());
        if capacity.is_some_and(|cap| used + growth > cap) {
            return Err(FsError::DiskFull);
        }
        if end > content.len() {
            content.resize(end, 0);
        }
        content[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: u64) -> Result<(), FsError> {
        self.pos = usize::try_from(pos).map_err(|_| FsError::IoError)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.volume
            .lock()
            .files
            .get(&self.path)
            .map_or(0, |c| c.len() as u64)
    }

    fn close(self: Box<Self>) -> Result<(), FsError> {
        if self.volume.lock().files.contains_key(&self.path) {
            Ok(())
        } else {
            Err(FsError::NotFound)
        }
    }
}
