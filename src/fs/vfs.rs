// Virtual File System abstraction layer
//
// The boot monitor's disk driver sits behind these traits. The network core
// only ever opens one file at a time, for a TFTP transfer.

use alloc::boxed::Box;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read from the start
    Read,
    /// Create or truncate, write from the start
    Create,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    NotAFile,
    InvalidPath,
    /// Handle was opened in the other mode
    BadMode,
    DiskFull,
    IoError,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            FsError::NotFound => write!(f, "File or directory not found"),
            FsError::AlreadyExists => write!(f, "File or directory already exists"),
            FsError::NotAFile => write!(f, "Not a file"),
            FsError::InvalidPath => write!(f, "Invalid path"),
            FsError::BadMode => write!(f, "Operation not allowed in this open mode"),
            FsError::DiskFull => write!(f, "Disk full"),
            FsError::IoError => write!(f, "I/O error"),
        }
    }
}

/// An open file
pub trait FileHandle {
    /// Read at the current position; returns 0 at end of file
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError>;
    /// Write at the current position, extending the file as needed
    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError>;
    /// Move to an absolute byte offset
    fn seek(&mut self, pos: u64) -> Result<(), FsError>;
    fn size(&self) -> u64;
    /// Flush and release the handle
    fn close(self: Box<Self>) -> Result<(), FsError>;
}

/// A mounted volume
pub trait FileStore {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn FileHandle>, FsError>;
}

/// Fill `buf` from the current position, stopping early only at end of file
pub fn read_full(file: &mut dyn FileHandle, buf: &mut [u8]) -> Result<usize, FsError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write all of `buf`; a handle that accepts nothing is treated as full
pub fn write_all(file: &mut dyn FileHandle, buf: &[u8]) -> Result<(), FsError> {
    let mut written = 0;
    while written < buf.len() {
        let n = file.write(&buf[written..])?;
        if n == 0 {
            return Err(FsError::DiskFull);
        }
        written += n;
    }
    Ok(())
}
