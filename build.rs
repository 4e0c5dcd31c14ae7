use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// (flash origin, flash length, ram length) of the bootloader image.
fn memory_layout() -> Option<(u32, u32, u32)> {
    if env::var("CARGO_FEATURE_NUCLEO_F401RE").is_ok() {
        // sector 0, the application starts at sector 1
        Some((0x0800_0000, 16 * 1024, 96 * 1024))
    } else {
        None
    }
}

fn main() -> Result<(), Box<(dyn std::error::Error + 'static)>> {
    println!("cargo:rerun-if-changed=build.rs");

    // host builds (tests, docs) have no linker script to provide
    let (origin, length, ram) = match memory_layout() {
        Some(layout) => layout,
        None => return Ok(()),
    };

    let out = &PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR not set")?);
    let mut memory = File::create(out.join("memory.x"))?;
    writeln!(memory, "MEMORY")?;
    writeln!(memory, "{{")?;
    writeln!(memory, "  FLASH : ORIGIN = {:#010x}, LENGTH = {}", origin, length)?;
    writeln!(memory, "  RAM : ORIGIN = 0x20000000, LENGTH = {}", ram)?;
    writeln!(memory, "}}")?;

    println!("cargo:rustc-link-search={}", out.display());
    Ok(())
}
