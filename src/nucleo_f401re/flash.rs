use stm32f4xx_hal::pac::{self, flash::cr::PSIZE_A};
use usbd_dfuse::{Capabilities, Detach, Error, Flash, Result};

use crate::sector::{self, Sector, FLASH_BASE};

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;
/// Flash size in KiB, factory programmed.
const FLASH_SIZE_KIB: *const u16 = 0x1FFF_7A22 as *const u16;

const SR_OPERR: u32 = 1 << 1;
const SR_WRPERR: u32 = 1 << 4;
const SR_PGAERR: u32 = 1 << 5;
const SR_PGPERR: u32 = 1 << 6;
const SR_PGSERR: u32 = 1 << 7;
const SR_ERRORS: u32 = SR_OPERR | SR_WRPERR | SR_PGAERR | SR_PGPERR | SR_PGSERR;

/// The embedded flash of the STM32F401, erased sector-wise and programmed with blocking
/// writes.
pub struct Stm32Flash {
    flash: pac::FLASH,
    limit: u32,
}

impl Stm32Flash {
    pub fn new(flash: pac::FLASH) -> Self {
        let size_kib = unsafe { core::ptr::read_volatile(FLASH_SIZE_KIB) };
        let stm = Self {
            flash,
            limit: FLASH_BASE + (u32::from(size_kib) << 10),
        };
        // a previous session may have left an operation or error flags behind
        let _ = stm.wait_idle(Error::Unknown);
        stm
    }

    fn is_locked(&self) -> bool {
        self.flash.cr.read().lock().bit_is_set()
    }

    /// Waits for the current operation and reports its outcome, `failure` for anything but a
    /// write protection error.
    fn wait_idle(&self, failure: Error) -> Result<()> {
        while self.flash.sr.read().bsy().bit_is_set() {
            cortex_m::asm::nop();
        }
        let errors = self.flash.sr.read().bits() & SR_ERRORS;
        if errors == 0 {
            return Ok(());
        }

        self.flash.sr.write(|w| unsafe { w.bits(errors) });
        log::warn!("flash: sr errors {:#04x}", errors);
        if errors & SR_WRPERR != 0 {
            Err(Error::Write)
        } else {
            Err(failure)
        }
    }

    fn is_erased(sector: &Sector) -> bool {
        let words = unsafe {
            core::slice::from_raw_parts(sector.start as *const u32, sector.length as usize / 4)
        };
        words.iter().all(|w| *w == 0xFFFF_FFFF)
    }

    fn program_unit(&mut self, address: u32, src: &[u8]) -> Result<()> {
        let psize = match src.len() {
            1 => PSIZE_A::PSIZE8,
            2 => PSIZE_A::PSIZE16,
            _ => PSIZE_A::PSIZE32,
        };
        self.flash
            .cr
            .modify(|_, w| w.pg().set_bit().psize().variant(psize));

        unsafe {
            match src {
                [b] => core::ptr::write_volatile(address as *mut u8, *b),
                [b0, b1] => core::ptr::write_volatile(address as *mut u16, u16::from_le_bytes([*b0, *b1])),
                [b0, b1, b2, b3] => core::ptr::write_volatile(
                    address as *mut u32,
                    u32::from_le_bytes([*b0, *b1, *b2, *b3]),
                ),
                _ => {}
            }
        }

        let result = self.wait_idle(Error::Programming);
        self.flash.cr.modify(|_, w| w.pg().clear_bit());
        result?;

        let written = unsafe { core::slice::from_raw_parts(address as *const u8, src.len()) };
        if written != src {
            return Err(Error::Verify);
        }
        Ok(())
    }
}

impl Capabilities for Stm32Flash {
    const WILL_DETACH: bool = true;
    const DETACH_TIMEOUT: u16 = 255;
    const TRANSFER_SIZE: u16 = 256;
    const APP_ADDRESS: u32 = super::APP_ADDRESS;
}

impl Flash for Stm32Flash {
    fn unlock(&mut self) {
        if self.is_locked() {
            self.flash.keyr.write(|w| unsafe { w.bits(KEY1) });
            self.flash.keyr.write(|w| unsafe { w.bits(KEY2) });
        }
    }

    fn lock(&mut self) {
        self.flash.cr.modify(|_, w| w.lock().set_bit());
    }

    fn erase_sector(&mut self, address: u32) -> Result<()> {
        let sector = Sector::containing(address).ok_or(Error::Address)?;
        if sector.start != address {
            // page-wise erase requests inside a sector, it was erased when its start was
            return Ok(());
        }
        if self.is_locked() {
            return Err(Error::Write);
        }

        log::debug!("flash: erasing sector {} ({:#x})", sector.index, sector.start);
        self.flash.cr.modify(|_, w| unsafe {
            w.ser()
                .set_bit()
                .psize()
                .variant(PSIZE_A::PSIZE32)
                .snb()
                .bits(sector.index)
        });
        self.flash.cr.modify(|_, w| w.strt().set_bit());
        let result = self.wait_idle(Error::Erase);
        self.flash.cr.modify(|_, w| w.ser().clear_bit());
        result?;

        if !Self::is_erased(&sector) {
            return Err(Error::CheckErased);
        }
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let end = address
            .checked_add(data.len() as u32)
            .ok_or(Error::Address)?;
        if address < Self::APP_ADDRESS || end > self.limit {
            return Err(Error::Address);
        }
        if self.is_locked() {
            return Err(Error::Write);
        }

        let mut offset = 0;
        while offset < data.len() {
            let addr = address + offset as u32;
            let rest = &data[offset..];
            let width = if addr & 1 == 1 || rest.len() == 1 {
                1
            } else if addr & 2 == 2 || rest.len() < 4 {
                2
            } else {
                4
            };
            self.program_unit(addr, &rest[..width])?;
            offset += width;
        }
        Ok(())
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn poll_timeout(&self, command: u8, address: u32, block_number: u16) -> u32 {
        sector::poll_timeout(command, address, block_number)
    }
}

impl Detach for Stm32Flash {
    fn detach(&mut self) -> ! {
        super::reset()
    }
}
