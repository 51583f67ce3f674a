#![no_std]

/// A trait for byte-addressed block devices backing a filesystem.
///
/// Addresses and sizes are in bytes, but every access must be aligned to
/// the granule the device reports: `addr` and `len` multiples of
/// [`read_size`](BlockDevice::read_size) for reads and of
/// [`program_size`](BlockDevice::program_size) for programs, and
/// `addr + len` must not exceed [`size`](BlockDevice::size). Implementations
/// reject misaligned access with their parameter error rather than rounding.
///
/// A device starts uninitialized. [`init`](BlockDevice::init) is idempotent;
/// [`deinit`](BlockDevice::deinit) returns the device to the uninitialized
/// state so a subsequent `init` re-probes the hardware.
pub trait BlockDevice {
    type Error: core::fmt::Debug;

    /// Bring the device up. Idempotent.
    fn init(&mut self) -> Result<(), Self::Error>;

    /// Tear the device down, forgetting any probed state.
    fn deinit(&mut self) -> Result<(), Self::Error>;

    /// Read `buf.len()` bytes starting at byte address `addr`.
    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Self::Error>;

    /// Program `buf.len()` bytes starting at byte address `addr`.
    ///
    /// The region must have been erased, unless the device erases
    /// implicitly on program (as managed flash does).
    fn program(&mut self, buf: &[u8], addr: u64) -> Result<(), Self::Error>;

    /// Erase the region. Devices that erase implicitly on program may
    /// treat this as a no-op and return `Ok(())`.
    fn erase(&mut self, addr: u64, len: u64) -> Result<(), Self::Error>;

    /// Flush any write-back state. Devices without a write cache return
    /// `Ok(())`.
    fn sync(&mut self) -> Result<(), Self::Error>;

    /// Total capacity in bytes.
    fn size(&self) -> u64;

    /// Minimum read granule in bytes.
    fn read_size(&self) -> u64;

    /// Minimum program granule in bytes.
    fn program_size(&self) -> u64;

    /// Erase granule in bytes. Defaults to the program granule.
    fn erase_size(&self) -> u64 {
        self.program_size()
    }

    /// Human-readable device family, e.g. `"SD"`.
    fn device_type(&self) -> &'static str;

    /// Whether `(addr, len)` is a valid aligned read.
    fn is_valid_read(&self, addr: u64, len: u64) -> bool {
        addr % self.read_size() == 0 && len % self.read_size() == 0 && addr + len <= self.size()
    }

    /// Whether `(addr, len)` is a valid aligned program.
    fn is_valid_program(&self, addr: u64, len: u64) -> bool {
        addr % self.program_size() == 0
            && len % self.program_size() == 0
            && addr + len <= self.size()
    }
}

impl<T: BlockDevice> BlockDevice for &mut T {
    type Error = T::Error;

    fn init(&mut self) -> Result<(), Self::Error> {
        (*self).init()
    }

    fn deinit(&mut self) -> Result<(), Self::Error> {
        (*self).deinit()
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Self::Error> {
        (*self).read(buf, addr)
    }

    fn program(&mut self, buf: &[u8], addr: u64) -> Result<(), Self::Error> {
        (*self).program(buf, addr)
    }

    fn erase(&mut self, addr: u64, len: u64) -> Result<(), Self::Error> {
        (*self).erase(addr, len)
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        (*self).sync()
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_size(&self) -> u64 {
        (**self).read_size()
    }

    fn program_size(&self) -> u64 {
        (**self).program_size()
    }

    fn erase_size(&self) -> u64 {
        (**self).erase_size()
    }

    fn device_type(&self) -> &'static str {
        (**self).device_type()
    }
}
