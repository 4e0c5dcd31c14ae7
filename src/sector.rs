//! STM32F4 flash sector geometry.
//!
//! | Sector |    Start    |     End     | Size (in KiB) | use
//! |--------|-------------|-------------|---------------|----
//! |      0 | 0x0800_0000 | 0x0800_3FFF |            16 | Bootloader
//! |      1 | 0x0800_4000 | 0x0800_7FFF |            16 | Application
//! |      2 | 0x0800_8000 | 0x0800_BFFF |            16 | ...
//! |      3 | 0x0800_C000 | 0x0800_FFFF |            16 |
//! |      4 | 0x0801_0000 | 0x0801_FFFF |            64 |
//! |      5 | 0x0802_0000 | 0x0803_FFFF |           128 |
//! |      6 | 0x0804_0000 | 0x0805_FFFF |           128 | ...
//! |      7 | 0x0806_0000 | 0x0807_FFFF |           128 | Application end on 512 KiB parts

use usbd_dfuse::CMD_ERASE;

pub const FLASH_BASE: u32 = 0x0800_0000;
const SECTOR_SIZES_KIB: [u32; 8] = [16, 16, 16, 16, 64, 128, 128, 128];

/// Time the host is asked to wait after anything but a sector erase.
pub const PROGRAM_TIME_MS: u32 = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub index: u8,
    pub start: u32,
    pub length: u32,
}

impl Sector {
    pub fn containing(address: u32) -> Option<Sector> {
        let mut start = FLASH_BASE;
        for (index, size_kib) in SECTOR_SIZES_KIB.iter().enumerate() {
            let length = size_kib << 10;
            if address >= start && address - start < length {
                return Some(Sector {
                    index: index as u8,
                    start,
                    length,
                });
            }
            start += length;
        }
        None
    }

    /// Worst case erase time at x32 parallelism.
    pub fn erase_time_ms(&self) -> u32 {
        match self.length >> 10 {
            16 => 500,
            64 => 1100,
            _ => 2600,
        }
    }
}

/// Poll timeout to report once a block has been accepted.
///
/// Erasing a whole sector takes seconds, programming or setting the address does not.
pub fn poll_timeout(command: u8, address: u32, block_number: u16) -> u32 {
    match Sector::containing(address) {
        Some(sector) if block_number == 0 && command == CMD_ERASE && sector.start == address => {
            sector.erase_time_ms()
        }
        _ => PROGRAM_TIME_MS,
    }
}
