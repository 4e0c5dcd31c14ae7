#![no_std]
#![no_main]

use embedded_hal::digital::v2::{InputPin, ToggleableOutputPin};
use usb_device::prelude::*;
use usbd_dfuse::DfuSeClass;
use usbd_serial::SerialPort;

use probe_fw::monitor::{Monitor, SerialSink};
use probe_fw::platform;
use probe_fw::serial::SerialNumber;

#[cortex_m_rt::entry]
fn main() -> ! {
    let board = match platform::init() {
        Some(board) => board,
        None => platform::reset(),
    };
    let platform::Board {
        usb_bus,
        flash,
        mut led,
        button,
        tap,
        mut syst,
    } = board;

    let stay_in_bootloader = button.is_low().unwrap_or(false);
    if platform::application_is_valid() && !stay_in_bootloader {
        platform::jump_to_application();
    }

    platform::take_panic_message(|message| {
        log::warn!(
            "previous run: {}",
            core::str::from_utf8(message).unwrap_or("<invalid panic message>")
        )
    });

    let serial_number = SerialNumber::from_unique_id(platform::unique_id());
    let mut dfu: DfuSeClass<_, _> = DfuSeClass::new(&usb_bus, flash);
    let mut serial = SerialPort::new(&usb_bus);
    let mut usb_dev = UsbDeviceBuilder::new(&usb_bus, UsbVidPid(0x1d50, 0x6017))
        .manufacturer("probe-fw")
        .product("Probe firmware upgrade")
        .serial_number(serial_number.as_str())
        .max_packet_size_0(64)
        .device_class(0xEF)
        .device_sub_class(0x02)
        .device_protocol(0x01)
        .build();

    let mut monitor: Monitor<_> = Monitor::new(tap);
    let mut rx = [0; 64];
    let mut counter: usize = 0;
    loop {
        if syst.has_wrapped() {
            dfu.poll(1);
            counter = counter.wrapping_add(1);
            if counter % 500 == 0 {
                let _ = led.toggle();
            }
        }

        if usb_dev.poll(&mut [&mut dfu, &mut serial]) {
            if let Ok(count) = serial.read(&mut rx) {
                monitor.feed(&rx[..count], &mut SerialSink(&mut serial));
            }
        }

        #[cfg(feature = "debug-buffer")]
        platform::consume_log(|bytes| serial.write(bytes).unwrap_or(0));
    }
}
