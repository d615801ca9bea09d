// Filesystem module - storage collaborator for TFTP

pub mod ramfs;
pub mod vfs;

pub use ramfs::RamFs;
pub use vfs::{FileHandle, FileStore, FsError, OpenMode};
