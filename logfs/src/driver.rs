//! Cooperative filesystem driver: runs mount and file operations one
//! bounded step per scheduler tick.

use block_device::BlockDevice;
use heapless::{String, Vec};

use crate::config::FsConfig;
use crate::fs::{Filesystem, FsError, OpenFlags, Progress, NAME_MAX};
use crate::stack::{parts, FsStack};
use crate::storage::BlockStorage;
use crate::task::Task;

/// Staging buffer for open-write-close, two filesystem blocks. Larger
/// payloads must be chunked by the caller.
pub const WRITE_STAGE_SIZE: usize = 1024;

/// Numeric tags for [`AsyncFsStack::current_op`].
pub const OP_IDLE: u8 = 0;
pub const OP_MOUNT: u8 = 1;
/// Reserved; formatting has no cooperative path.
pub const OP_FORMAT: u8 = 2;
pub const OP_OPEN: u8 = 3;
pub const OP_OPEN_WRITE_CLOSE: u8 = 4;
pub const OP_WRITE_STEP: u8 = 5;
pub const OP_CLOSE_STEP: u8 = 6;

/// The in-flight operation, carrying exactly the state its next step
/// needs. `OP_FORMAT` stays a reserved tag with no variant.
enum Operation {
    Idle,
    Mount,
    Open {
        path: String<NAME_MAX>,
        flags: OpenFlags,
    },
    OwcOpen {
        path: String<NAME_MAX>,
        flags: OpenFlags,
        data: Vec<u8, WRITE_STAGE_SIZE>,
    },
    OwcWrite {
        data: Vec<u8, WRITE_STAGE_SIZE>,
    },
    OwcClose,
}

impl Operation {
    fn code(&self) -> u8 {
        match self {
            Operation::Idle => OP_IDLE,
            Operation::Mount => OP_MOUNT,
            Operation::Open { .. } => OP_OPEN,
            Operation::OwcOpen { .. } => OP_OPEN_WRITE_CLOSE,
            Operation::OwcWrite { .. } => OP_WRITE_STEP,
            Operation::OwcClose => OP_CLOSE_STEP,
        }
    }
}

/// Cooperative wrapper around [`FsStack`].
///
/// At most one operation is in flight; entry points fail with
/// [`FsError::Busy`] until it completes. Completion and failure are
/// observable through [`mounted`](AsyncFsStack::mounted),
/// [`opened`](AsyncFsStack::opened) and
/// [`last_error`](AsyncFsStack::last_error).
pub struct AsyncFsStack<F, BD>
where
    BD: BlockDevice,
    F: Filesystem<BlockStorage<BD>>,
{
    stack: FsStack<F, BD>,
    file: F::File,
    op: Operation,
    opened: bool,
    last_error: Option<FsError>,
}

impl<F, BD> AsyncFsStack<F, BD>
where
    BD: BlockDevice,
    F: Filesystem<BlockStorage<BD>>,
{
    pub fn new(stack: FsStack<F, BD>) -> Self {
        AsyncFsStack {
            stack,
            file: F::File::default(),
            op: Operation::Idle,
            opened: false,
            last_error: None,
        }
    }

    /// The synchronous wrapper underneath, for pass-through calls while
    /// no operation is in flight.
    pub fn stack(&mut self) -> &mut FsStack<F, BD> {
        &mut self.stack
    }

    /// The shared work file the open entry points operate on.
    pub fn workfile(&mut self) -> &mut F::File {
        &mut self.file
    }

    pub fn is_busy(&self) -> bool {
        self.current_op() != OP_IDLE
    }

    /// Tag of the in-flight operation, `OP_IDLE` when none.
    pub fn current_op(&self) -> u8 {
        self.op.code()
    }

    pub fn mounted(&self) -> bool {
        self.stack.is_mounted()
    }

    pub fn opened(&self) -> bool {
        self.opened
    }

    /// Failure recorded by the last completed operation, if any.
    pub fn last_error(&self) -> Option<FsError> {
        self.last_error
    }

    /// Bring the device up and start mounting. The device probe runs
    /// synchronously; the mount itself completes over later ticks.
    pub fn mount_async(&mut self, device: BD) -> Result<(), FsError> {
        if self.is_busy() {
            return Err(FsError::Busy);
        }
        self.stack.attach(device)?;
        self.last_error = None;
        self.op = Operation::Mount;
        Ok(())
    }

    /// Start opening the work file. Completes over later ticks.
    pub fn file_open_async(&mut self, path: &str, flags: OpenFlags) -> Result<(), FsError> {
        let path = self.guard_open(path)?;
        self.last_error = None;
        self.op = Operation::Open { path, flags };
        Ok(())
    }

    /// Stage up to [`WRITE_STAGE_SIZE`] bytes, then open, write and close
    /// the work file over later ticks.
    pub fn file_open_write_close_async(
        &mut self,
        path: &str,
        flags: OpenFlags,
        data: &[u8],
    ) -> Result<(), FsError> {
        let path = self.guard_open(path)?;
        let data = Vec::from_slice(data).map_err(|_| FsError::Parameter)?;
        self.last_error = None;
        self.op = Operation::OwcOpen { path, flags, data };
        Ok(())
    }

    /// Unmount and hand the device back. Refused while busy.
    pub fn unmount(&mut self) -> Result<BD, FsError> {
        if self.is_busy() {
            return Err(FsError::Busy);
        }
        self.stack.unmount()
    }

    fn guard_open(&mut self, path: &str) -> Result<String<NAME_MAX>, FsError> {
        if self.is_busy() {
            return Err(FsError::Busy);
        }
        if !self.stack.is_mounted() {
            return Err(FsError::NotMounted);
        }
        if F::file_is_open(&self.file) {
            return Err(FsError::AlreadyOpen);
        }
        String::try_from(path).map_err(|_| FsError::NameTooLong)
    }

    /// Advance the in-flight operation by one bounded step.
    fn step(&mut self) {
        match core::mem::replace(&mut self.op, Operation::Idle) {
            Operation::Idle => {}
            Operation::Mount => {
                let config = self.stack.config;
                match self.step_mount(&config) {
                    Ok(Progress::Pending) => self.op = Operation::Mount,
                    Ok(Progress::Complete) => {
                        info!("mount complete");
                        self.stack.mounted = true;
                    }
                    Err(e) => {
                        self.stack.mounted = false;
                        self.stack.storage = None;
                        self.fail(e);
                    }
                }
            }
            Operation::Open { path, flags } => match self.step_open(&path, flags) {
                Ok(Progress::Pending) => self.op = Operation::Open { path, flags },
                Ok(Progress::Complete) => {
                    info!("open complete");
                    self.opened = true;
                }
                Err(e) => self.fail(e),
            },
            Operation::OwcOpen { path, flags, data } => match self.step_open(&path, flags) {
                Ok(Progress::Pending) => self.op = Operation::OwcOpen { path, flags, data },
                Ok(Progress::Complete) => {
                    self.opened = true;
                    self.op = Operation::OwcWrite { data };
                }
                Err(e) => self.fail(e),
            },
            Operation::OwcWrite { data } => match self.write_staged(&data) {
                Ok(()) => self.op = Operation::OwcClose,
                Err(e) => self.fail(e),
            },
            Operation::OwcClose => match self.close_workfile() {
                Ok(()) => {
                    info!("open-write-close complete");
                }
                Err(e) => self.fail(e),
            },
        }
    }

    fn step_mount(&mut self, config: &FsConfig) -> Result<Progress, FsError> {
        let (fs, storage) = parts(&mut self.stack.fs, &mut self.stack.storage)?;
        fs.mount_step(storage, config)
    }

    fn step_open(&mut self, path: &str, flags: OpenFlags) -> Result<Progress, FsError> {
        let (fs, storage) = parts(&mut self.stack.fs, &mut self.stack.storage)?;
        fs.file_open_step(storage, &mut self.file, path, flags)
    }

    fn write_staged(&mut self, data: &[u8]) -> Result<(), FsError> {
        let (fs, storage) = parts(&mut self.stack.fs, &mut self.stack.storage)?;
        let mut written = 0;
        while written < data.len() {
            let n = fs.file_write(storage, &mut self.file, &data[written..])?;
            if n == 0 {
                return Err(FsError::Io);
            }
            written += n;
        }
        Ok(())
    }

    fn close_workfile(&mut self) -> Result<(), FsError> {
        let (fs, storage) = parts(&mut self.stack.fs, &mut self.stack.storage)?;
        fs.file_close(storage, &mut self.file)?;
        self.opened = false;
        Ok(())
    }

    fn fail(&mut self, e: FsError) {
        error!("filesystem operation failed: {:?}", e);
        self.last_error = Some(e);
    }
}

impl<F, BD> Task for AsyncFsStack<F, BD>
where
    BD: BlockDevice,
    F: Filesystem<BlockStorage<BD>>,
{
    fn run(&mut self) {
        self.step();
    }

    fn notified(&self) -> bool {
        self.is_busy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs::{MemDevice, MockFs};

    type Driver = AsyncFsStack<MockFs, MemDevice>;

    fn driver(fs: MockFs) -> Driver {
        let _ = env_logger::builder().is_test(true).try_init();
        AsyncFsStack::new(FsStack::new(fs))
    }

    fn tick_until_idle(drv: &mut Driver) -> std::vec::Vec<u8> {
        let mut trace = vec![drv.current_op()];
        let mut guard = 0;
        while drv.notified() {
            drv.run();
            trace.push(drv.current_op());
            guard += 1;
            assert!(guard < 32, "operation never settled");
        }
        trace
    }

    fn mounted_driver(fs: MockFs) -> Driver {
        let mut drv = driver(fs);
        drv.mount_async(MemDevice::new(64 * 1024)).unwrap();
        tick_until_idle(&mut drv);
        assert!(drv.mounted());
        drv
    }

    #[test]
    fn mount_steps_to_completion() {
        let mut drv = driver(MockFs {
            mount_steps: 2,
            ..MockFs::default()
        });
        assert!(!drv.notified());
        drv.mount_async(MemDevice::new(64 * 1024)).unwrap();
        let trace = tick_until_idle(&mut drv);
        assert_eq!(trace, vec![1, 1, 1, 0]);
        assert!(drv.mounted());
        assert_eq!(drv.last_error(), None);
    }

    #[test]
    fn mount_failure_goes_idle_with_error() {
        let mut drv = driver(MockFs {
            fail_mount: Some(FsError::Corrupt),
            ..MockFs::default()
        });
        drv.mount_async(MemDevice::new(64 * 1024)).unwrap();
        drv.run();
        assert!(!drv.notified());
        assert!(!drv.mounted());
        assert_eq!(drv.last_error(), Some(FsError::Corrupt));
    }

    #[test]
    fn mount_async_fails_fast_on_dead_device() {
        let mut drv = driver(MockFs::default());
        let dev = MemDevice {
            init_fails: true,
            ..MemDevice::new(64 * 1024)
        };
        assert_eq!(drv.mount_async(dev), Err(FsError::Device));
        assert!(!drv.notified());
    }

    #[test]
    fn busy_while_an_operation_is_in_flight() {
        let mut drv = driver(MockFs {
            mount_steps: 4,
            ..MockFs::default()
        });
        drv.mount_async(MemDevice::new(64 * 1024)).unwrap();
        assert_eq!(drv.current_op(), OP_MOUNT);
        assert_eq!(
            drv.mount_async(MemDevice::new(64 * 1024)),
            Err(FsError::Busy)
        );
        assert_eq!(
            drv.file_open_async("/a", OpenFlags::RDONLY),
            Err(FsError::Busy)
        );
        assert_eq!(
            drv.file_open_write_close_async("/a", OpenFlags::WRONLY, b"x"),
            Err(FsError::Busy)
        );
        assert!(matches!(drv.unmount(), Err(FsError::Busy)));
    }

    #[test]
    fn open_completes_and_latches() {
        let mut drv = mounted_driver(MockFs {
            open_steps: 2,
            ..MockFs::default()
        });
        drv.file_open_async("/log.txt", OpenFlags::RDWR | OpenFlags::CREAT)
            .unwrap();
        let trace = tick_until_idle(&mut drv);
        assert_eq!(trace, vec![3, 3, 3, 0]);
        assert!(drv.opened());
        assert_eq!(drv.stack().fs_ref().opened_path.as_deref(), Some("/log.txt"));
        // a second open on the same work file is refused
        assert_eq!(
            drv.file_open_async("/log.txt", OpenFlags::RDONLY),
            Err(FsError::AlreadyOpen)
        );
    }

    #[test]
    fn open_guards() {
        let mut drv = driver(MockFs::default());
        assert_eq!(
            drv.file_open_async("/x", OpenFlags::RDONLY),
            Err(FsError::NotMounted)
        );
        let mut drv = mounted_driver(MockFs::default());
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(
            drv.file_open_async(&long, OpenFlags::RDONLY),
            Err(FsError::NameTooLong)
        );
    }

    #[test]
    fn open_write_close_visits_each_step() {
        let mut drv = mounted_driver(MockFs {
            open_steps: 1,
            ..MockFs::default()
        });
        drv.file_open_write_close_async("/x", OpenFlags::WRONLY | OpenFlags::CREAT, b"hi")
            .unwrap();
        let trace = tick_until_idle(&mut drv);
        assert_eq!(trace, vec![4, 4, 5, 6, 0]);
        assert_eq!(drv.last_error(), None);
        assert!(!drv.opened());
        assert_eq!(drv.stack().fs_ref().written, b"hi");
    }

    #[test]
    fn open_write_close_write_failure() {
        let mut drv = mounted_driver(MockFs {
            fail_write: Some(FsError::NoSpace),
            ..MockFs::default()
        });
        drv.file_open_write_close_async("/x", OpenFlags::WRONLY, b"data")
            .unwrap();
        let trace = tick_until_idle(&mut drv);
        assert_eq!(trace, vec![4, 5, 0]);
        assert_eq!(drv.last_error(), Some(FsError::NoSpace));
    }

    #[test]
    fn open_write_close_open_failure() {
        let mut drv = mounted_driver(MockFs {
            fail_open: Some(FsError::NoEntry),
            ..MockFs::default()
        });
        drv.file_open_write_close_async("/x", OpenFlags::WRONLY, b"data")
            .unwrap();
        let trace = tick_until_idle(&mut drv);
        assert_eq!(trace, vec![4, 0]);
        assert_eq!(drv.last_error(), Some(FsError::NoEntry));
    }

    #[test]
    fn staged_payload_is_bounded() {
        let mut drv = mounted_driver(MockFs::default());
        let big = vec![0u8; WRITE_STAGE_SIZE + 1];
        assert_eq!(
            drv.file_open_write_close_async("/x", OpenFlags::WRONLY, &big),
            Err(FsError::Parameter)
        );
        // a full buffer is fine
        drv.file_open_write_close_async("/x", OpenFlags::WRONLY, &big[..WRITE_STAGE_SIZE])
            .unwrap();
        tick_until_idle(&mut drv);
        assert_eq!(drv.last_error(), None);
        assert_eq!(drv.stack().fs_ref().written.len(), WRITE_STAGE_SIZE);
    }

    #[test]
    fn scheduler_contract() {
        let mut drv = mounted_driver(MockFs {
            open_steps: 3,
            ..MockFs::default()
        });
        drv.file_open_async("/x", OpenFlags::RDONLY).unwrap();
        let task: &mut dyn Task = &mut drv;
        let mut ticks = 0;
        while task.notified() {
            task.run();
            ticks += 1;
        }
        assert_eq!(ticks, 4);
        assert!(drv.opened());
    }
}
