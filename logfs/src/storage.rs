//! Glue between the filesystem's block callbacks and a byte-addressed
//! block device.

use block_device::BlockDevice;

use crate::fs::Storage;

/// Adapts a [`BlockDevice`] to the filesystem's [`Storage`] interface by
/// turning `(block, offset)` pairs into byte addresses.
///
/// Doubles as the mount handle: it takes ownership of the device for the
/// lifetime of a mount, so nothing else can write to the underlying
/// storage while the filesystem's caches alias it. `unmount` consumes the
/// handle and gives the device back.
pub struct BlockStorage<BD> {
    device: BD,
    block_size: u32,
}

impl<BD: BlockDevice> BlockStorage<BD> {
    pub fn new(device: BD, block_size: u32) -> Self {
        BlockStorage { device, block_size }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn device(&self) -> &BD {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut BD {
        &mut self.device
    }

    pub fn into_inner(self) -> BD {
        self.device
    }

    fn byte_address(&self, block: u32, off: u32) -> u64 {
        u64::from(block) * u64::from(self.block_size) + u64::from(off)
    }
}

impl<BD: BlockDevice> Storage for BlockStorage<BD> {
    type Error = BD::Error;

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        debug_assert!(off as usize + buf.len() <= self.block_size as usize);
        let addr = self.byte_address(block, off);
        self.device.read(buf, addr)
    }

    fn prog(&mut self, block: u32, off: u32, buf: &[u8]) -> Result<(), Self::Error> {
        debug_assert!(off as usize + buf.len() <= self.block_size as usize);
        let addr = self.byte_address(block, off);
        self.device.program(buf, addr)
    }

    fn erase(&mut self, block: u32) -> Result<(), Self::Error> {
        let addr = self.byte_address(block, 0);
        self.device.erase(addr, u64::from(self.block_size))
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        self.device.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfs::MemDevice;

    #[test]
    fn block_offset_pairs_become_byte_addresses() {
        let mut storage = BlockStorage::new(MemDevice::new(8 * 512), 512);
        assert_eq!(storage.block_size(), 512);

        storage.prog(2, 16, &[0xAB; 8]).unwrap();
        let mut back = [0u8; 8];
        storage.read(2, 16, &mut back).unwrap();
        assert_eq!(back, [0xAB; 8]);
        storage.erase(3).unwrap();
        storage.sync().unwrap();

        let device = storage.into_inner();
        assert!(device.ops.contains(&("program", 2 * 512 + 16, 8)));
        assert!(device.ops.contains(&("read", 2 * 512 + 16, 8)));
        assert!(device.ops.contains(&("erase", 3 * 512, 512)));
        assert!(device.ops.contains(&("sync", 0, 0)));
    }
}
