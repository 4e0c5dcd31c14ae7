//! GPIO bit-banged test access port.

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::{InputPin, OutputPin};
use raw_jtag::TapDriver;

/// Drives TCK/TMS/TDI and samples TDO, one bit per clock.
///
/// TMS and TDI are set up while TCK is low, TDO is sampled right after the rising edge.
pub struct BitBangTap<Tck, Tms, Tdi, Tdo, D> {
    tck: Tck,
    tms: Tms,
    tdi: Tdi,
    tdo: Tdo,
    delay: D,
    half_period_us: u32,
}

impl<Tck, Tms, Tdi, Tdo, D> BitBangTap<Tck, Tms, Tdi, Tdo, D>
where
    Tck: OutputPin,
    Tms: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    D: DelayUs<u32>,
{
    pub fn new(mut tck: Tck, tms: Tms, tdi: Tdi, tdo: Tdo, delay: D, half_period_us: u32) -> Self {
        let _ = tck.set_low();
        Self {
            tck,
            tms,
            tdi,
            tdo,
            delay,
            half_period_us,
        }
    }

    pub fn release(self) -> (Tck, Tms, Tdi, Tdo, D) {
        (self.tck, self.tms, self.tdi, self.tdo, self.delay)
    }

    fn half_period(&mut self) {
        if self.half_period_us != 0 {
            self.delay.delay_us(self.half_period_us);
        }
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        // pin errors are infallible on the supported boards
        let _ = if tms { self.tms.set_high() } else { self.tms.set_low() };
        let _ = if tdi { self.tdi.set_high() } else { self.tdi.set_low() };
        self.half_period();

        let _ = self.tck.set_high();
        let tdo = self.tdo.is_high().unwrap_or(false);
        self.half_period();
        let _ = self.tck.set_low();
        tdo
    }

    fn shift(&mut self, mut tdo: Option<&mut [u8]>, is_final: bool, tdi: Option<&[u8]>, ticks: u16) {
        for i in 0..usize::from(ticks) {
            let (byte, bit) = (i / 8, 1 << (i % 8));
            let tdi_bit = tdi.map_or(false, |tdi| tdi[byte] & bit != 0);
            let tms_bit = is_final && i + 1 == usize::from(ticks);

            let sampled = self.clock(tms_bit, tdi_bit);
            if let Some(tdo) = tdo.as_deref_mut() {
                if sampled {
                    tdo[byte] |= bit;
                } else {
                    tdo[byte] &= !bit;
                }
            }
        }
    }
}

impl<Tck, Tms, Tdi, Tdo, D> TapDriver for BitBangTap<Tck, Tms, Tdi, Tdo, D>
where
    Tck: OutputPin,
    Tms: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    D: DelayUs<u32>,
{
    fn init(&mut self) {
        // five clocks with TMS high reach Test-Logic-Reset from anywhere, then Run-Test/Idle
        self.tms_seq(&[0x1F], 6);
    }

    fn delay_us(&mut self, us: u16) {
        self.delay.delay_us(u32::from(us));
    }

    fn tms_seq(&mut self, tms: &[u8], ticks: u16) {
        for i in 0..usize::from(ticks) {
            self.clock(tms[i / 8] & (1 << (i % 8)) != 0, false);
        }
    }

    fn tdi_seq(&mut self, is_final: bool, tdi: &[u8], ticks: u16) {
        self.shift(None, is_final, Some(tdi), ticks);
    }

    fn tdi_tdo_seq(&mut self, tdo: &mut [u8], is_final: bool, tdi: Option<&[u8]>, ticks: u16) {
        self.shift(Some(tdo), is_final, tdi, ticks);
    }
}
