//! Raw JTAG tokens tunneled over the debug monitor.
//!
//! A token is sent as `mon raw_jtag <frame>` where the frame reads:
//!
//! | offset | content                             |
//! |--------|-------------------------------------|
//! | 0      | `0xAA`                              |
//! | 1      | `0x55`                              |
//! | 2      | `!(command \| FINAL)`               |
//! | 3      | `command \| FINAL`                  |
//! | 4..6   | tick count, big endian              |
//! | 6..    | `(ticks + 7) / 8` bytes of TDI/TMS data, only for commands that send data |
//!
//! Data bits are packed least significant bit first. One frame is handled per call.
#![no_std]

#[cfg(test)]
extern crate std;

pub mod dispatch;
pub mod frame;

pub use dispatch::{RawJtag, DEFAULT_SCRATCH};
pub use frame::{encode_frame, expected_len, pack_bits, parse_frame, tick_bytes, Frame};

/// Set on the command byte for the last chunk of a shift.
pub const FINAL: u8 = 0x80;
pub const SYNC: [u8; 2] = [0xAA, 0x55];
pub const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    Init = 1,
    Delay = 2,
    Tms = 3,
    Tdi = 4,
    Tdo = 5,
    TdiTdo = 6,
}

impl Command {
    /// Whether the frame carries `(ticks + 7) / 8` data bytes after the header.
    pub fn has_payload(self) -> bool {
        matches!(self, Command::Tms | Command::Tdi | Command::TdiTdo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, displaydoc::Display)]
pub enum Error {
    /// bad sync bytes or command complement
    FrameInvalid,
    /// frame of {0} bytes is shorter than its header and payload
    Truncated(usize),
    /// unknown command {0}
    UnknownCommand(u8),
    /// expected exactly one argument, got {0}
    Arguments(usize),
    /// {0} bytes of scratch needed, more than available
    ResourceExhausted(usize),
}

/// Shifts bits through the test access port.
///
/// Bit sequences are packed least significant bit first, only the first `ticks` bits are
/// shifted.
pub trait TapDriver {
    /// Brings the TAP back to a known state.
    fn init(&mut self);
    fn delay_us(&mut self, us: u16);
    fn tms_seq(&mut self, tms: &[u8], ticks: u16);
    /// Shifts `ticks` TDI bits with TMS low. When `is_final` is set TMS goes high with the last
    /// bit, leaving the Shift-DR/IR state.
    fn tdi_seq(&mut self, is_final: bool, tdi: &[u8], ticks: u16);
    /// Like [`TapDriver::tdi_seq`] while capturing TDO into `tdo`. A missing `tdi` shifts zeros.
    fn tdi_tdo_seq(&mut self, tdo: &mut [u8], is_final: bool, tdi: Option<&[u8]>, ticks: u16);
}

/// Where captured TDO bytes go.
pub trait OutputSink {
    fn emit(&mut self, data: &[u8]);
}

impl<O: OutputSink + ?Sized> OutputSink for &mut O {
    fn emit(&mut self, data: &[u8]) {
        (**self).emit(data)
    }
}
