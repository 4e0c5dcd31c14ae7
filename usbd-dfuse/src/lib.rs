#![no_std]

#[cfg(test)]
extern crate std;

pub mod class;
pub mod session;

pub use class::{DfuSeClass, Detach};
pub use session::{Completion, ControlRequest, DownloadSession, Handled, PendingAction, Rejected};

pub const USB_CLASS_DFU: u8 = 0xFE;
pub const USB_SUB_CLASS_DFU: u8 = 0x01;
pub const USB_DFU_MODE_PROTOCOL: u8 = 0x02;

pub const DFU_FUNCTIONAL: u8 = 0x21;

pub const DFU_VERSION: u16 = 0x011A; // bcdDFUVersion, DfuSe extension

/// `bmRequestType` of every DFU class request once the direction bit is masked off: class
/// request, interface recipient.
pub const DFU_REQUEST_TYPE: u8 = 0x21;

/// Largest control-transfer payload the download engine buffers.
pub const MAX_TRANSFER_SIZE: usize = 256;

/// DfuSe sub-commands carried in byte 0 of a command block (block number 0).
pub const CMD_SETADDR: u8 = 0x21;
pub const CMD_ERASE: u8 = 0x41;

pub trait Capabilities {
    /// If true, the device generates a detach-attach sequence on its own upon receipt of a detach
    /// request. Otherwise the device waits for a USB reset until a time out expires.
    const WILL_DETACH: bool;

    /// Time, in milliseconds, that the device will wait after receipt of the detach request.
    const DETACH_TIMEOUT: u16;

    /// Maximum number of bytes the device can accept per control-write transaction. Data block
    /// offsets are computed in units of this size.
    ///
    /// **Note:** Must be less or equal to [`MAX_TRANSFER_SIZE`] and to the control endpoint
    /// buffer's size. See the feature `control-buffer-256` of the `usb_device` crate.
    const TRANSFER_SIZE: u16;

    /// First address of the application region. Command blocks targeting anything below it are
    /// refused.
    const APP_ADDRESS: u32;
}

/// Flash controller as seen by the download engine.
///
/// Every `erase_sector`/`program` call is bracketed by `unlock`/`lock`.
pub trait Flash: Capabilities {
    fn unlock(&mut self);
    fn lock(&mut self);

    /// Erases the sector holding `address`.
    fn erase_sector(&mut self, address: u32) -> Result<()>;
    fn program(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// One past the last programmable address.
    fn limit(&self) -> u32;

    /// Advisory time, in milliseconds, the host should wait before polling again once the given
    /// block has been accepted. Only the low 24 bits are reported.
    fn poll_timeout(&self, _command: u8, _address: u32, _block_number: u16) -> u32 {
        100
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Request {
    Detach = 0,
    Dnload = 1,
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// File is not targeted for use by this device.
    Target = 0x01,
    /// File is for this device but fails some vendor-specific verification test.
    File = 0x02,
    /// Device is unable to write memory.
    Write = 0x03,
    /// Memory erase function failed
    Erase = 0x04,
    /// Memory erase check failed.
    CheckErased = 0x05,
    /// Program memory function failed.
    Programming = 0x06,
    /// Programmed memory failed verification.
    Verify = 0x07,
    /// Cannot program memory due to received address that is out of range.
    Address = 0x08,
    /// Received DFU_DNLOAD with wLength = 0, but device does not think it has all of the data yet.
    NotDone = 0x09,
    /// Device's firmware is corrupt. It cannot return to run-time (non-DFU) operations.
    Firmware = 0x0A,
    /// iString indicates a vendor-specific error.
    Vendor = 0x0B,
    /// Device detected unexpected USB reset signaling.
    UsbReset = 0x0C,
    /// Device detected unexpected power on reset.
    PowerOnReset = 0x0D,
    /// Something went wrong, but the device does not know what it was.
    Unknown = 0x0E,
    /// Device stalled an unexpected request.
    StalledPkt = 0x0F,
}
impl From<Error> for u8 {
    fn from(err: Error) -> u8 {
        err as u8
    }
}

/// DFU mode states the download engine can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    DfuIdle,
    DfuDnloadSync,
    DfuDnBusy,
    DfuDnloadIdle,
    DfuManifestSync,
    /// Terminal: the device resets once the status reply that entered it has been read.
    DfuManifest,
    DfuError(Error),
}

impl From<State> for u8 {
    fn from(state: State) -> Self {
        match state {
            State::DfuIdle => 2,
            State::DfuDnloadSync => 3,
            State::DfuDnBusy => 4,
            State::DfuDnloadIdle => 5,
            State::DfuManifestSync => 6,
            State::DfuManifest => 7,
            State::DfuError(_) => 10,
        }
    }
}

/// Reads the little-endian `u32` starting at `bytes[0]`, missing bytes read as zero.
pub(crate) fn get_le32(bytes: &[u8]) -> u32 {
    let mut word = [0; 4];
    let len = usize::min(bytes.len(), 4);
    word[..len].copy_from_slice(&bytes[..len]);
    u32::from_le_bytes(word)
}
