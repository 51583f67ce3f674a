//! Filesystem geometry.

use block_device::BlockDevice;

pub const READ_SIZE: u32 = 512;
pub const PROG_SIZE: u32 = 512;
pub const BLOCK_SIZE: u32 = 512;
pub const CACHE_SIZE: u32 = 512;
pub const LOOKAHEAD_SIZE: u32 = 8192;
/// Dynamic wear-leveling threshold disabled; the card's FTL levels wear.
pub const BLOCK_CYCLES: i32 = -1;

/// Geometry the caller asks for. The mounted geometry never goes below
/// what the device reports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    pub read_size: u32,
    pub prog_size: u32,
    pub block_size: u32,
    pub lookahead_size: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            read_size: READ_SIZE,
            prog_size: PROG_SIZE,
            block_size: BLOCK_SIZE,
            lookahead_size: LOOKAHEAD_SIZE,
        }
    }
}

/// The geometry a filesystem is formatted and mounted with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FsConfig {
    pub read_size: u32,
    pub prog_size: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub cache_size: u32,
    pub lookahead_size: u32,
    pub block_cycles: i32,
}

impl FsConfig {
    /// Clamp the requested geometry to the device's reported minimums and
    /// derive the block count from its capacity.
    pub fn for_device<BD: BlockDevice>(device: &BD, want: &Geometry) -> FsConfig {
        let read_size = (device.read_size() as u32).max(want.read_size);
        let prog_size = (device.program_size() as u32).max(want.prog_size);
        let block_size = (device.erase_size() as u32).max(want.block_size);
        FsConfig {
            read_size,
            prog_size,
            block_size,
            block_count: device.size() / u64::from(block_size),
            cache_size: CACHE_SIZE.max(prog_size),
            lookahead_size: want.lookahead_size,
            block_cycles: BLOCK_CYCLES,
        }
    }
}
