//! Test doubles: a scripted filesystem library and a RAM block device.

use block_device::BlockDevice;

use crate::fs::{
    EntryType, Filesystem, FsError, Metadata, OpenFlags, Progress, Storage, Whence,
};
use crate::FsConfig;

/// RAM-backed block device with 512-byte granules, recording every
/// access.
pub(crate) struct MemDevice {
    pub data: Vec<u8>,
    pub initialized: bool,
    pub init_fails: bool,
    pub ops: Vec<(&'static str, u64, usize)>,
}

impl MemDevice {
    pub fn new(bytes: usize) -> Self {
        MemDevice {
            data: vec![0; bytes],
            initialized: false,
            init_fails: false,
            ops: Vec::new(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MemError;

impl BlockDevice for MemDevice {
    type Error = MemError;

    fn init(&mut self) -> Result<(), Self::Error> {
        if self.init_fails {
            return Err(MemError);
        }
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), Self::Error> {
        self.initialized = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Self::Error> {
        self.ops.push(("read", addr, buf.len()));
        let addr = addr as usize;
        buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
        Ok(())
    }

    fn program(&mut self, buf: &[u8], addr: u64) -> Result<(), Self::Error> {
        self.ops.push(("program", addr, buf.len()));
        let addr = addr as usize;
        self.data[addr..addr + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&mut self, addr: u64, len: u64) -> Result<(), Self::Error> {
        self.ops.push(("erase", addr, len as usize));
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        self.ops.push(("sync", 0, 0));
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_size(&self) -> u64 {
        512
    }

    fn program_size(&self) -> u64 {
        512
    }

    fn device_type(&self) -> &'static str {
        "RAM"
    }
}

#[derive(Default)]
pub(crate) struct MockFile {
    pub open: bool,
}

#[derive(Default)]
pub(crate) struct MockDir {
    pub position: u32,
}

/// Scripted filesystem library. Step counts delay completion; the `fail_*`
/// knobs inject errors at specific operations.
#[derive(Default)]
pub(crate) struct MockFs {
    pub mount_steps: u32,
    pub open_steps: u32,
    pub fail_mount: Option<FsError>,
    pub fail_open: Option<FsError>,
    pub fail_write: Option<FsError>,
    pub fail_close: Option<FsError>,
    pub used: u64,
    pub mounted: bool,
    pub formatted: bool,
    pub written: Vec<u8>,
    pub opened_path: Option<String>,
}

impl MockFs {
    fn touch_storage<S: Storage>(storage: &mut S) -> Result<(), FsError> {
        // read the superblock area the way the real library would
        let mut probe = [0u8; 16];
        storage
            .read(0, 0, &mut probe)
            .map_err(|_| FsError::Device)?;
        Ok(())
    }
}

impl<S: Storage> Filesystem<S> for MockFs {
    type File = MockFile;
    type Dir = MockDir;

    fn format(&mut self, storage: &mut S, _config: &FsConfig) -> Result<(), FsError> {
        storage.erase(0).map_err(|_| FsError::Device)?;
        storage.sync().map_err(|_| FsError::Device)?;
        self.formatted = true;
        Ok(())
    }

    fn mount(&mut self, storage: &mut S, config: &FsConfig) -> Result<(), FsError> {
        if let Some(e) = self.fail_mount {
            return Err(e);
        }
        Self::touch_storage(storage)?;
        assert!(config.block_count > 0);
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self, _storage: &mut S) -> Result<(), FsError> {
        self.mounted = false;
        Ok(())
    }

    fn remove(&mut self, _storage: &mut S, _path: &str) -> Result<(), FsError> {
        Ok(())
    }

    fn rename(&mut self, _storage: &mut S, _from: &str, _to: &str) -> Result<(), FsError> {
        Ok(())
    }

    fn stat(&mut self, _storage: &mut S, path: &str) -> Result<Metadata, FsError> {
        Ok(Metadata {
            kind: EntryType::File,
            size: self.written.len() as u32,
            name: heapless::String::try_from(path).map_err(|_| FsError::NameTooLong)?,
        })
    }

    fn mkdir(&mut self, _storage: &mut S, _path: &str) -> Result<(), FsError> {
        Ok(())
    }

    fn used_blocks(&mut self, _storage: &mut S) -> Result<u64, FsError> {
        Ok(self.used)
    }

    fn file_open(
        &mut self,
        _storage: &mut S,
        file: &mut MockFile,
        path: &str,
        _flags: OpenFlags,
    ) -> Result<(), FsError> {
        if let Some(e) = self.fail_open {
            return Err(e);
        }
        file.open = true;
        self.opened_path = Some(path.to_string());
        Ok(())
    }

    fn file_close(&mut self, _storage: &mut S, file: &mut MockFile) -> Result<(), FsError> {
        if !file.open {
            return Err(FsError::NotOpen);
        }
        if let Some(e) = self.fail_close {
            return Err(e);
        }
        file.open = false;
        Ok(())
    }

    fn file_read(
        &mut self,
        _storage: &mut S,
        file: &mut MockFile,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        if !file.open {
            return Err(FsError::NotOpen);
        }
        let n = buf.len().min(self.written.len());
        buf[..n].copy_from_slice(&self.written[..n]);
        Ok(n)
    }

    fn file_write(
        &mut self,
        _storage: &mut S,
        file: &mut MockFile,
        buf: &[u8],
    ) -> Result<usize, FsError> {
        if !file.open {
            return Err(FsError::NotOpen);
        }
        if let Some(e) = self.fail_write {
            return Err(e);
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn file_sync(&mut self, _storage: &mut S, _file: &mut MockFile) -> Result<(), FsError> {
        Ok(())
    }

    fn file_seek(
        &mut self,
        _storage: &mut S,
        _file: &mut MockFile,
        offset: i32,
        whence: Whence,
    ) -> Result<u32, FsError> {
        match whence {
            Whence::Set | Whence::Cur => Ok(offset.max(0) as u32),
            Whence::End => Ok((self.written.len() as i32 + offset).max(0) as u32),
        }
    }

    fn file_tell(&mut self, _storage: &mut S, _file: &mut MockFile) -> Result<u32, FsError> {
        Ok(0)
    }

    fn file_size(&mut self, _storage: &mut S, _file: &mut MockFile) -> Result<u32, FsError> {
        Ok(self.written.len() as u32)
    }

    fn file_truncate(
        &mut self,
        _storage: &mut S,
        _file: &mut MockFile,
        len: u32,
    ) -> Result<(), FsError> {
        self.written.truncate(len as usize);
        Ok(())
    }

    fn file_is_open(file: &MockFile) -> bool {
        file.open
    }

    fn dir_open(&mut self, _storage: &mut S, dir: &mut MockDir, _path: &str) -> Result<(), FsError> {
        dir.position = 0;
        Ok(())
    }

    fn dir_close(&mut self, _storage: &mut S, _dir: &mut MockDir) -> Result<(), FsError> {
        Ok(())
    }

    fn dir_read(
        &mut self,
        _storage: &mut S,
        dir: &mut MockDir,
    ) -> Result<Option<Metadata>, FsError> {
        if dir.position > 0 || self.opened_path.is_none() {
            return Ok(None);
        }
        dir.position += 1;
        let path = self.opened_path.as_deref().unwrap_or("");
        Ok(Some(Metadata {
            kind: EntryType::File,
            size: self.written.len() as u32,
            name: heapless::String::try_from(path).map_err(|_| FsError::NameTooLong)?,
        }))
    }

    fn dir_seek(&mut self, _storage: &mut S, dir: &mut MockDir, offset: u32) -> Result<(), FsError> {
        dir.position = offset;
        Ok(())
    }

    fn dir_tell(&mut self, _storage: &mut S, dir: &mut MockDir) -> Result<u32, FsError> {
        Ok(dir.position)
    }

    fn dir_rewind(&mut self, _storage: &mut S, dir: &mut MockDir) -> Result<(), FsError> {
        dir.position = 0;
        Ok(())
    }

    fn mount_step(&mut self, storage: &mut S, config: &FsConfig) -> Result<Progress, FsError> {
        if let Some(e) = self.fail_mount {
            return Err(e);
        }
        if self.mount_steps > 0 {
            self.mount_steps -= 1;
            return Ok(Progress::Pending);
        }
        Self::touch_storage(storage)?;
        assert!(config.block_count > 0);
        self.mounted = true;
        Ok(Progress::Complete)
    }

    fn file_open_step(
        &mut self,
        storage: &mut S,
        file: &mut MockFile,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Progress, FsError> {
        if self.open_steps > 0 {
            self.open_steps -= 1;
            return Ok(Progress::Pending);
        }
        self.file_open(storage, file, path, flags)?;
        Ok(Progress::Complete)
    }
}
