//! Contract of the log-structured filesystem library this crate drives.
//!
//! The library itself is an external collaborator. It sees storage only
//! through the [`Storage`] block callbacks, and exposes its operations
//! through [`Filesystem`]: the usual synchronous entry points plus two
//! stepping entry points ([`Filesystem::mount_step`],
//! [`Filesystem::file_open_step`]) that perform a bounded slice of work
//! per call so a cooperative scheduler can interleave other tasks.

use bitflags::bitflags;
use heapless::String;

/// Longest file name (and path component) the filesystem stores.
pub const NAME_MAX: usize = 255;

/// Errors surfaced by the filesystem library and the wrappers around it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum FsError {
    /// Error during device operation
    Io,
    /// The underlying block device failed
    Device,
    /// On-disk structures are corrupted
    Corrupt,
    /// No directory entry
    NoEntry,
    /// Entry already exists
    Exists,
    /// Entry is not a dir
    NotDir,
    /// Entry is a dir
    IsDir,
    /// Dir is not empty
    NotEmpty,
    /// Bad file number
    BadFile,
    /// File too large
    TooBig,
    /// Invalid parameter
    Invalid,
    /// No space left on device
    NoSpace,
    /// No more memory available
    NoMemory,
    /// File name too long
    NameTooLong,
    /// The file is already open
    AlreadyOpen,
    /// The file is not open
    NotOpen,
    /// No filesystem is mounted
    NotMounted,
    /// An asynchronous operation is already in flight
    Busy,
    /// Caller-supplied argument out of range
    Parameter,
}

bitflags! {
    /// File open flags, POSIX-shaped.
    pub struct OpenFlags: u32 {
        /// Open for reading
        const RDONLY = 0x0001;
        /// Open for writing
        const WRONLY = 0x0002;
        /// Open for reading and writing
        const RDWR   = Self::RDONLY.bits | Self::WRONLY.bits;
        /// Create the file if it does not exist
        const CREAT  = 0x0100;
        /// Fail if the file already exists
        const EXCL   = 0x0200;
        /// Truncate the file to zero length
        const TRUNC  = 0x0400;
        /// Move to the end of the file on every write
        const APPEND = 0x0800;
    }
}

/// Origin for [`Filesystem::file_seek`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Kind of a directory entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EntryType {
    File,
    Dir,
}

/// What `stat` and `dir_read` report about an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub kind: EntryType,
    pub size: u32,
    pub name: String<NAME_MAX>,
}

/// Filesystem-wide numbers, `statvfs`-shaped.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FsInfo {
    /// Filesystem block size
    pub bsize: u32,
    /// Fragment size (same as the block size)
    pub frsize: u32,
    /// Number of blocks
    pub blocks: u64,
    /// Number of free blocks
    pub bfree: u64,
    /// Number of free blocks for unprivileged users
    pub bavail: u64,
    /// Maximum filename length
    pub namemax: u32,
}

/// Outcome of one cooperative step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Progress {
    /// More steps are needed
    Pending,
    /// The operation finished
    Complete,
}

/// The block interface the filesystem library drives during a mount.
///
/// The Rust rendition of the C callback table: four callbacks and an
/// opaque context, here the receiver. `read`/`prog` stay within a single
/// block: `off + buf.len() <= block_size`.
pub trait Storage {
    type Error: core::fmt::Debug;

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<(), Self::Error>;
    fn prog(&mut self, block: u32, off: u32, buf: &[u8]) -> Result<(), Self::Error>;
    fn erase(&mut self, block: u32) -> Result<(), Self::Error>;
    fn sync(&mut self) -> Result<(), Self::Error>;
}

/// The filesystem library proper, generic over its storage.
///
/// Every operation borrows the storage for exactly one call; the library
/// holds no reference to it in between, which is what lets a mount handle
/// own the device. File and directory state lives in caller-owned
/// handles created with `Default`.
pub trait Filesystem<S: Storage> {
    type File: Default;
    type Dir: Default;

    fn format(&mut self, storage: &mut S, config: &crate::FsConfig) -> Result<(), FsError>;
    fn mount(&mut self, storage: &mut S, config: &crate::FsConfig) -> Result<(), FsError>;
    fn unmount(&mut self, storage: &mut S) -> Result<(), FsError>;

    fn remove(&mut self, storage: &mut S, path: &str) -> Result<(), FsError>;
    fn rename(&mut self, storage: &mut S, from: &str, to: &str) -> Result<(), FsError>;
    fn stat(&mut self, storage: &mut S, path: &str) -> Result<Metadata, FsError>;
    fn mkdir(&mut self, storage: &mut S, path: &str) -> Result<(), FsError>;
    /// Blocks currently holding data, for free-space accounting.
    fn used_blocks(&mut self, storage: &mut S) -> Result<u64, FsError>;

    fn file_open(
        &mut self,
        storage: &mut S,
        file: &mut Self::File,
        path: &str,
        flags: OpenFlags,
    ) -> Result<(), FsError>;
    fn file_close(&mut self, storage: &mut S, file: &mut Self::File) -> Result<(), FsError>;
    fn file_read(
        &mut self,
        storage: &mut S,
        file: &mut Self::File,
        buf: &mut [u8],
    ) -> Result<usize, FsError>;
    fn file_write(
        &mut self,
        storage: &mut S,
        file: &mut Self::File,
        buf: &[u8],
    ) -> Result<usize, FsError>;
    fn file_sync(&mut self, storage: &mut S, file: &mut Self::File) -> Result<(), FsError>;
    fn file_seek(
        &mut self,
        storage: &mut S,
        file: &mut Self::File,
        offset: i32,
        whence: Whence,
    ) -> Result<u32, FsError>;
    fn file_tell(&mut self, storage: &mut S, file: &mut Self::File) -> Result<u32, FsError>;
    fn file_size(&mut self, storage: &mut S, file: &mut Self::File) -> Result<u32, FsError>;
    fn file_truncate(
        &mut self,
        storage: &mut S,
        file: &mut Self::File,
        len: u32,
    ) -> Result<(), FsError>;
    /// Whether the handle is attached to an open file.
    fn file_is_open(file: &Self::File) -> bool;

    fn dir_open(&mut self, storage: &mut S, dir: &mut Self::Dir, path: &str)
        -> Result<(), FsError>;
    fn dir_close(&mut self, storage: &mut S, dir: &mut Self::Dir) -> Result<(), FsError>;
    /// Next entry, or `None` at the end of the directory.
    fn dir_read(
        &mut self,
        storage: &mut S,
        dir: &mut Self::Dir,
    ) -> Result<Option<Metadata>, FsError>;
    fn dir_seek(&mut self, storage: &mut S, dir: &mut Self::Dir, offset: u32)
        -> Result<(), FsError>;
    fn dir_tell(&mut self, storage: &mut S, dir: &mut Self::Dir) -> Result<u32, FsError>;
    fn dir_rewind(&mut self, storage: &mut S, dir: &mut Self::Dir) -> Result<(), FsError>;

    /// One bounded slice of mounting. Call until `Complete`.
    fn mount_step(&mut self, storage: &mut S, config: &crate::FsConfig)
        -> Result<Progress, FsError>;
    /// One bounded slice of opening a file. Call until `Complete`.
    fn file_open_step(
        &mut self,
        storage: &mut S,
        file: &mut Self::File,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Progress, FsError>;
}
