//! NUCLEO-F401RE board support: the bootloader lives in sector 0, the application starts at
//! sector 1. See [`crate::sector`] for the flash map.
//!
//! JTAG is bit-banged on PA0 (TCK), PA1 (TMS), PA4 (TDI) and PA6 (TDO). The user button (PC13)
//! held during reset keeps the device in the bootloader.

#[cfg(feature = "debug-buffer")]
use core::cell::RefCell;

#[cfg(feature = "debug-buffer")]
use cortex_m::interrupt::{self, Mutex};
use cortex_m::peripheral::{syst::SystClkSource, SYST};
use stm32f4xx_hal::dwt::{Delay, DwtExt};
use stm32f4xx_hal::gpio::gpioa::{PA0, PA1, PA4, PA5, PA6};
use stm32f4xx_hal::gpio::gpioc::PC13;
use stm32f4xx_hal::gpio::{Floating, Input, Output, PullUp, PushPull};
use stm32f4xx_hal::otg_fs::{UsbBus, USB};
use stm32f4xx_hal::prelude::*;
use stm32f4xx_hal::pac;
use usb_device::bus::UsbBusAllocator;

use crate::jtagtap::BitBangTap;
#[cfg(feature = "debug-buffer")]
use crate::trace::DebugBuffer;

mod flash;
pub use flash::Stm32Flash;

pub const APP_ADDRESS: u32 = 0x0800_4000;
const UNIQUE_ID: *const u32 = 0x1FFF_7A10 as *const u32;
const SRAM_START: u32 = 0x2000_0000;
const SRAM_END: u32 = 0x2001_8000;
/// Half a TCK period, about 250 kHz.
const TCK_HALF_PERIOD_US: u32 = 2;

static mut EP_MEMORY: [u32; 320] = [0; 320];

pub type Tap = BitBangTap<
    PA0<Output<PushPull>>,
    PA1<Output<PushPull>>,
    PA4<Output<PushPull>>,
    PA6<Input<Floating>>,
    Delay,
>;

pub struct Board {
    pub usb_bus: UsbBusAllocator<UsbBus<USB>>,
    pub flash: Stm32Flash,
    pub led: PA5<Output<PushPull>>,
    pub button: PC13<Input<PullUp>>,
    pub tap: Tap,
    /// Wraps once per millisecond.
    pub syst: SYST,
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

/// The 96-bit device unique ID.
pub fn unique_id() -> [u32; 3] {
    let mut id = [0; 3];
    for (i, word) in id.iter_mut().enumerate() {
        *word = unsafe { core::ptr::read_volatile(UNIQUE_ID.add(i)) };
    }
    id
}

/// Whether the application's initial stack pointer points into SRAM.
pub fn application_is_valid() -> bool {
    let stack_pointer = unsafe { core::ptr::read_volatile(APP_ADDRESS as *const u32) };
    (SRAM_START + 1..=SRAM_END).contains(&stack_pointer)
}

/// Brings clocks, USB and the JTAG pins up. Returns `None` if the peripherals were already
/// taken.
pub fn init() -> Option<Board> {
    let dp = pac::Peripherals::take()?;
    let mut cp = cortex_m::Peripherals::take()?;

    let rcc = dp.RCC.constrain();
    dp.FLASH.acr.modify(|_, w| {
        w.latency()
            .ws3()
            .icen()
            .set_bit()
            .dcen()
            .set_bit()
            .prften()
            .set_bit()
    });
    let clocks = rcc.cfgr.sysclk(84.mhz()).require_pll48clk().freeze();

    cp.SYST.set_clock_source(SystClkSource::External);
    cp.SYST.set_reload(clocks.sysclk().0 / (8 * 1_000));
    cp.SYST.clear_current();
    cp.SYST.enable_counter();

    let gpioa = dp.GPIOA.split();
    let gpioc = dp.GPIOC.split();

    let usb = USB {
        usb_global: dp.OTG_FS_GLOBAL,
        usb_device: dp.OTG_FS_DEVICE,
        usb_pwrclk: dp.OTG_FS_PWRCLK,
        pin_dm: gpioa.pa11.into_alternate_af10(),
        pin_dp: gpioa.pa12.into_alternate_af10(),
        hclk: clocks.hclk(),
    };

    let tap = BitBangTap::new(
        gpioa.pa0.into_push_pull_output(),
        gpioa.pa1.into_push_pull_output(),
        gpioa.pa4.into_push_pull_output(),
        gpioa.pa6.into_floating_input(),
        cp.DWT.constrain(cp.DCB, clocks).delay(),
        TCK_HALF_PERIOD_US,
    );

    #[cfg(feature = "debug-buffer")]
    logger::init();

    Some(Board {
        usb_bus: UsbBus::new(usb, unsafe { &mut EP_MEMORY }),
        flash: Stm32Flash::new(dp.FLASH),
        led: gpioa.pa5.into_push_pull_output(),
        button: gpioc.pc13.into_pull_up_input(),
        tap,
        syst: cp.SYST,
    })
}

pub fn jump_to_application() -> ! {
    unsafe {
        let mut cp = cortex_m::Peripherals::steal();
        cp.SYST.disable_interrupt();
        cp.SYST.disable_counter();

        let dp = pac::Peripherals::steal();
        dp.RCC.ahb1rstr.write_with_zero(|w| w.gpioarst().set_bit().gpiocrst().set_bit());
        dp.RCC.ahb2rstr.write_with_zero(|w| w.otgfsrst().set_bit());
        dp.RCC.ahb1rstr.write_with_zero(|w| w);
        dp.RCC.ahb2rstr.write_with_zero(|w| w);

        cp.SCB.vtor.write(APP_ADDRESS);
        cortex_m::asm::bootload(APP_ADDRESS as *const u32);
    }
}

#[cfg(feature = "debug-buffer")]
static LOG_BUFFER: Mutex<RefCell<DebugBuffer<1024>>> =
    Mutex::new(RefCell::new(DebugBuffer::new()));

/// Hands the buffered log output to `reader`, see [`DebugBuffer::consume`].
#[cfg(feature = "debug-buffer")]
pub fn consume_log(reader: impl FnOnce(&[u8]) -> usize) {
    interrupt::free(|cs| LOG_BUFFER.borrow(cs).borrow_mut().consume(reader));
}

#[cfg(feature = "debug-buffer")]
mod logger {
    use super::LOG_BUFFER;
    use cortex_m::interrupt;

    struct BufferLogger;

    static LOGGER: BufferLogger = BufferLogger;

    impl log::Log for BufferLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            interrupt::free(|cs| {
                let mut buffer = LOG_BUFFER.borrow(cs).borrow_mut();
                let _ = crate::trace::write_record(&mut *buffer, record);
            });
        }

        fn flush(&self) {}
    }

    pub fn init() {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Debug);
        }
    }
}

#[cfg(target_os = "none")]
mod trap {
    use crate::trace::DebugBuffer;
    use cortex_m_rt::exception;

    const PANIC_MAGIC: u32 = 0xDEAD_10CC;

    pub struct LastPanic {
        magic: u32,
        message: DebugBuffer<256>,
    }

    #[link_section = ".uninit"]
    static mut LAST_PANIC: core::mem::MaybeUninit<LastPanic> = core::mem::MaybeUninit::uninit();

    /// Hands the message of the panic that caused the last reset to `reader`, once.
    pub fn take_panic_message(reader: impl FnOnce(&[u8])) {
        let last = unsafe { LAST_PANIC.assume_init_mut() };
        if last.magic == PANIC_MAGIC {
            reader(last.message.as_bytes());
        }
        last.magic = 0;
    }

    #[panic_handler]
    fn on_panic(info: &core::panic::PanicInfo) -> ! {
        use core::fmt::Write;
        cortex_m::interrupt::disable();
        let last = unsafe { LAST_PANIC.assume_init_mut() };
        last.magic = PANIC_MAGIC;
        last.message.clear();
        let _ = write!(last.message, "{}", info);
        super::reset()
    }

    #[exception]
    #[allow(non_snake_case)]
    fn HardFault(_ef: &cortex_m_rt::ExceptionFrame) -> ! {
        panic!("Hardfault");
    }

    #[exception]
    #[allow(non_snake_case)]
    unsafe fn DefaultHandler(irqn: i16) {
        panic!("DefaultHandler: {}", irqn);
    }
}

#[cfg(target_os = "none")]
pub use trap::take_panic_message;
