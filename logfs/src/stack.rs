//! Synchronous filesystem wrapper: owns the library state, the geometry
//! and (while mounted) the block device.

use block_device::BlockDevice;

use crate::config::{FsConfig, Geometry};
use crate::fs::{Filesystem, FsError, FsInfo, Metadata, OpenFlags, Whence, NAME_MAX};
use crate::storage::BlockStorage;

/// A filesystem instance over one block device.
///
/// The device is handed over on [`mount`](FsStack::mount) and handed back
/// by [`unmount`](FsStack::unmount); in between, the storage belongs to
/// the filesystem and its caches.
pub struct FsStack<F, BD>
where
    BD: BlockDevice,
    F: Filesystem<BlockStorage<BD>>,
{
    pub(crate) fs: F,
    pub(crate) geometry: Geometry,
    pub(crate) config: FsConfig,
    pub(crate) storage: Option<BlockStorage<BD>>,
    pub(crate) mounted: bool,
}

impl<F, BD> FsStack<F, BD>
where
    BD: BlockDevice,
    F: Filesystem<BlockStorage<BD>>,
{
    pub fn new(fs: F) -> Self {
        Self::with_geometry(fs, Geometry::default())
    }

    pub fn with_geometry(fs: F, geometry: Geometry) -> Self {
        FsStack {
            fs,
            geometry,
            config: FsConfig::default(),
            storage: None,
            mounted: false,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Geometry of the current (or last) mount.
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn fs_ref(&self) -> &F {
        &self.fs
    }

    /// Create a filesystem on the device with an explicit geometry, then
    /// hand the device back.
    pub fn format_with(&mut self, device: BD, geometry: Geometry) -> Result<BD, FsError> {
        self.geometry = geometry;
        self.format(device)
    }

    /// Create a filesystem on the device, then hand the device back.
    pub fn format(&mut self, mut device: BD) -> Result<BD, FsError> {
        if self.mounted {
            return Err(FsError::Busy);
        }
        device.init().map_err(|_| {
            error!("device init failed");
            FsError::Device
        })?;
        self.config = FsConfig::for_device(&device, &self.geometry);
        let mut storage = BlockStorage::new(device, self.config.block_size);
        let formatted = self.fs.format(&mut storage, &self.config);
        let mut device = storage.into_inner();
        device.deinit().map_err(|_| FsError::Device)?;
        formatted?;
        Ok(device)
    }

    /// Bring the device up and mount the filesystem on it.
    pub fn mount(&mut self, device: BD) -> Result<(), FsError> {
        self.attach(device)?;
        let (fs, storage) = parts(&mut self.fs, &mut self.storage)?;
        match fs.mount(storage, &self.config) {
            Ok(()) => {
                self.mounted = true;
                Ok(())
            }
            Err(e) => {
                error!("mount failed: {:?}", e);
                self.storage = None;
                Err(e)
            }
        }
    }

    /// Unmount and hand the device back, deinitialized.
    pub fn unmount(&mut self) -> Result<BD, FsError> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        let (fs, storage) = parts(&mut self.fs, &mut self.storage)?;
        fs.unmount(storage)?;
        self.mounted = false;
        let storage = self.storage.take().ok_or(FsError::NotMounted)?;
        let mut device = storage.into_inner();
        device.deinit().map_err(|_| FsError::Device)?;
        Ok(device)
    }

    /// Initialize the device and derive the mount geometry, without
    /// touching the filesystem. The cooperative driver finishes the mount
    /// in steps.
    pub(crate) fn attach(&mut self, mut device: BD) -> Result<(), FsError> {
        if self.mounted || self.storage.is_some() {
            return Err(FsError::Busy);
        }
        device.init().map_err(|_| {
            error!("device init failed");
            FsError::Device
        })?;
        self.config = FsConfig::for_device(&device, &self.geometry);
        self.storage = Some(BlockStorage::new(device, self.config.block_size));
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.remove(storage, path)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.rename(storage, from, to)
    }

    pub fn stat(&mut self, path: &str) -> Result<Metadata, FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.stat(storage, path)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.mkdir(storage, path)
    }

    /// Filesystem-wide numbers, `statvfs`-shaped.
    pub fn statvfs(&mut self) -> Result<FsInfo, FsError> {
        let config = self.config;
        let (fs, storage) = self.mounted_parts()?;
        let used = fs.used_blocks(storage)?;
        let free = config.block_count.saturating_sub(used);
        Ok(FsInfo {
            bsize: config.block_size,
            frsize: config.block_size,
            blocks: config.block_count,
            bfree: free,
            bavail: free,
            namemax: NAME_MAX as u32,
        })
    }

    pub fn file_open(
        &mut self,
        file: &mut F::File,
        path: &str,
        flags: OpenFlags,
    ) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_open(storage, file, path, flags)
    }

    pub fn file_close(&mut self, file: &mut F::File) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_close(storage, file)
    }

    pub fn file_read(&mut self, file: &mut F::File, buf: &mut [u8]) -> Result<usize, FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_read(storage, file, buf)
    }

    pub fn file_write(&mut self, file: &mut F::File, buf: &[u8]) -> Result<usize, FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_write(storage, file, buf)
    }

    pub fn file_sync(&mut self, file: &mut F::File) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_sync(storage, file)
    }

    pub fn file_seek(
        &mut self,
        file: &mut F::File,
        offset: i32,
        whence: Whence,
    ) -> Result<u32, FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_seek(storage, file, offset, whence)
    }

    pub fn file_tell(&mut self, file: &mut F::File) -> Result<u32, FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_tell(storage, file)
    }

    pub fn file_size(&mut self, file: &mut F::File) -> Result<u32, FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_size(storage, file)
    }

    pub fn file_truncate(&mut self, file: &mut F::File, len: u32) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.file_truncate(storage, file, len)
    }

    pub fn dir_open(&mut self, dir: &mut F::Dir, path: &str) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.dir_open(storage, dir, path)
    }

    pub fn dir_close(&mut self, dir: &mut F::Dir) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.dir_close(storage, dir)
    }

    pub fn dir_read(&mut self, dir: &mut F::Dir) -> Result<Option<Metadata>, FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.dir_read(storage, dir)
    }

    pub fn dir_seek(&mut self, dir: &mut F::Dir, offset: u32) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.dir_seek(storage, dir, offset)
    }

    pub fn dir_tell(&mut self, dir: &mut F::Dir) -> Result<u32, FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.dir_tell(storage, dir)
    }

    pub fn dir_rewind(&mut self, dir: &mut F::Dir) -> Result<(), FsError> {
        let (fs, storage) = self.mounted_parts()?;
        fs.dir_rewind(storage, dir)
    }

    fn mounted_parts(&mut self) -> Result<(&mut F, &mut BlockStorage<BD>), FsError> {
        if !self.mounted {
            return Err(FsError::NotMounted);
        }
        parts(&mut self.fs, &mut self.storage)
    }
}

/// Split borrows of the library and the attached storage.
pub(crate) fn parts<'a, F, BD>(
    fs: &'a mut F,
    storage: &'a mut Option<BlockStorage<BD>>,
) -> Result<(&'a mut F, &'a mut BlockStorage<BD>), FsError>
where
    BD: BlockDevice,
    F: Filesystem<BlockStorage<BD>>,
{
    match storage {
        Some(storage) => Ok((fs, storage)),
        None => Err(FsError::NotMounted),
    }
}
