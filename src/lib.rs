#![no_std]

#[cfg(test)]
extern crate std;

pub mod jtagtap;
pub mod monitor;
pub mod sector;
pub mod serial;
pub mod trace;

#[cfg(feature = "nucleo-f401re")]
pub mod nucleo_f401re;
#[cfg(feature = "nucleo-f401re")]
pub use nucleo_f401re as platform;
