//! Debug monitor commands reachable over the CDC-ACM port.
//!
//! Text commands are terminated by CR or LF and split on whitespace. Raw JTAG frames are
//! binary: input starting with the first sync byte is collected until the frame's header says
//! it is complete, then handed to the `raw_jtag` command as its single argument.

use raw_jtag::{expected_len, OutputSink, RawJtag, TapDriver, HEADER_LEN, SYNC};
use usb_device::bus::UsbBus;
use usbd_serial::SerialPort;

/// Longest accepted input: a full-size raw JTAG frame.
pub const INPUT_SIZE: usize = HEADER_LEN + raw_jtag::DEFAULT_SCRATCH;
const MAX_ARGS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    RawJtag,
    Help,
}

pub struct CommandEntry {
    pub name: &'static str,
    pub help: &'static str,
    action: Action,
}

pub const COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: "raw_jtag",
        help: "Run one raw JTAG frame: raw_jtag <frame>",
        action: Action::RawJtag,
    },
    CommandEntry {
        name: "help",
        help: "Display help for monitor commands",
        action: Action::Help,
    },
];

/// Looks a command up by name or by an unambiguous prefix of it.
pub fn find_command(name: &[u8]) -> Option<&'static CommandEntry> {
    if name.is_empty() {
        return None;
    }
    if let Some(exact) = COMMANDS.iter().find(|c| c.name.as_bytes() == name) {
        return Some(exact);
    }
    let mut matches = COMMANDS.iter().filter(|c| c.name.as_bytes().starts_with(name));
    match (matches.next(), matches.next()) {
        (Some(command), None) => Some(command),
        _ => None,
    }
}

pub struct Monitor<T, const N: usize = INPUT_SIZE> {
    jtag: RawJtag<T>,
    input: [u8; N],
    len: usize,
}

impl<T: TapDriver, const N: usize> Monitor<T, N> {
    pub fn new(tap: T) -> Self {
        Self {
            jtag: RawJtag::new(tap),
            input: [0; N],
            len: 0,
        }
    }

    pub fn jtag(&self) -> &RawJtag<T> {
        &self.jtag
    }

    /// Runs `argv`, the command name first. Returns whether the command succeeded.
    pub fn run_command<O: OutputSink + ?Sized>(&mut self, argv: &[&[u8]], out: &mut O) -> bool {
        execute(&mut self.jtag, argv, out)
    }

    /// Accumulates received bytes, running every command completed by them.
    pub fn feed<O: OutputSink + ?Sized>(&mut self, data: &[u8], out: &mut O) {
        for &byte in data {
            if self.len == N {
                log::warn!("monitor: input overflow, {} bytes dropped", self.len);
                self.len = 0;
            }
            self.input[self.len] = byte;
            self.len += 1;

            if self.input[0] == SYNC[0] {
                self.frame_byte(out);
            } else if byte == b'\r' || byte == b'\n' {
                let line = &self.input[..self.len - 1];
                let mut argv: [&[u8]; MAX_ARGS] = [&[]; MAX_ARGS];
                let mut argc = 0;
                for word in line.split(|b| b.is_ascii_whitespace()).filter(|w| !w.is_empty()) {
                    if argc == MAX_ARGS {
                        argc += 1;
                        break;
                    }
                    argv[argc] = word;
                    argc += 1;
                }
                match argc {
                    0 => {}
                    n if n > MAX_ARGS => log::debug!("monitor: too many arguments"),
                    n => {
                        let ok = execute(&mut self.jtag, &argv[..n], out);
                        reply(ok, out);
                    }
                }
                self.len = 0;
            }
        }
    }

    fn frame_byte<O: OutputSink + ?Sized>(&mut self, out: &mut O) {
        match expected_len(&self.input[..self.len]) {
            Ok(None) => {}
            Ok(Some(total)) if total > N => {
                log::warn!("monitor: {} byte frame does not fit", total);
                self.len = 0;
                reply(false, out);
            }
            Ok(Some(total)) if total > self.len => {}
            Ok(Some(_)) => {
                let token = &self.input[..self.len];
                let ok = execute(&mut self.jtag, &[&b"raw_jtag"[..], token], out);
                self.len = 0;
                reply(ok, out);
            }
            Err(e) => {
                log::debug!("monitor: {}", e);
                self.len = 0;
                reply(false, out);
            }
        }
    }
}

/// Terminates the output of a command with its outcome.
fn reply<O: OutputSink + ?Sized>(ok: bool, out: &mut O) {
    let outcome: &[u8] = if ok { b"OK\r\n" } else { b"ERR\r\n" };
    out.emit(outcome);
}

fn execute<T: TapDriver, O: OutputSink + ?Sized>(
    jtag: &mut RawJtag<T>,
    argv: &[&[u8]],
    out: &mut O,
) -> bool {
    let (name, args) = match argv.split_first() {
        Some(split) => split,
        None => return false,
    };
    let command = match find_command(name) {
        Some(command) => command,
        None => {
            log::debug!("monitor: unknown command");
            return false;
        }
    };

    match command.action {
        Action::RawJtag => jtag.dispatch_args(args, out),
        Action::Help => {
            for command in COMMANDS {
                out.emit(command.name.as_bytes());
                out.emit(b" -- ");
                out.emit(command.help.as_bytes());
                out.emit(b"\r\n");
            }
            true
        }
    }
}

/// Writes monitor output to the CDC-ACM port, dropping what the port cannot take.
pub struct SerialSink<'p, 'a, B: UsbBus>(pub &'p mut SerialPort<'a, B>);

impl<B: UsbBus> OutputSink for SerialSink<'_, '_, B> {
    fn emit(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            match self.0.write(data) {
                Ok(0) => break,
                Ok(written) => data = &data[written..],
                Err(e) => {
                    log::warn!("monitor: {} bytes not sent: {:?}", data.len(), e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_jtag::{encode_frame, Command};
    use std::vec;
    use std::vec::Vec;
    use test_case::test_case;

    #[derive(Default)]
    struct CountingTap {
        inits: usize,
        delays: Vec<u16>,
    }

    impl TapDriver for CountingTap {
        fn init(&mut self) {
            self.inits += 1;
        }
        fn delay_us(&mut self, us: u16) {
            self.delays.push(us);
        }
        fn tms_seq(&mut self, _tms: &[u8], _ticks: u16) {}
        fn tdi_seq(&mut self, _is_final: bool, _tdi: &[u8], _ticks: u16) {}
        fn tdi_tdo_seq(&mut self, tdo: &mut [u8], _is_final: bool, _tdi: Option<&[u8]>, _ticks: u16) {
            tdo.fill(0xA5);
        }
    }

    #[derive(Default)]
    struct Output(Vec<u8>);

    impl OutputSink for Output {
        fn emit(&mut self, data: &[u8]) {
            self.0.extend_from_slice(data);
        }
    }

    fn frame(command: Command, ticks: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0; HEADER_LEN + payload.len()];
        let len = encode_frame(command, false, ticks, payload, &mut out).unwrap();
        out.truncate(len);
        out
    }

    #[test_case(b"raw_jtag", Some("raw_jtag"))]
    #[test_case(b"raw", Some("raw_jtag"))]
    #[test_case(b"h", Some("help"))]
    #[test_case(b"", None)]
    #[test_case(b"raw_jtags", None)]
    #[test_case(b"swdp_scan", None)]
    fn command_lookup(name: &[u8], expected: Option<&str>) {
        assert_eq!(find_command(name).map(|c| c.name), expected);
    }

    #[test]
    fn raw_jtag_requires_one_argument() {
        let mut monitor = Monitor::<_>::new(CountingTap::default());
        let mut out = Output::default();
        let init = frame(Command::Init, 0, &[]);

        let name = &b"raw_jtag"[..];
        assert!(!monitor.run_command(&[name], &mut out));
        assert!(!monitor.run_command(&[name, init.as_slice(), init.as_slice()], &mut out));
        assert_eq!(monitor.jtag().tap().inits, 0);

        assert!(monitor.run_command(&[name, init.as_slice()], &mut out));
        assert_eq!(monitor.jtag().tap().inits, 1);
    }

    #[test]
    fn frames_are_collected_across_reads() {
        let mut monitor = Monitor::<_>::new(CountingTap::default());
        let mut out = Output::default();
        let tdo = frame(Command::Tdo, 12, &[]);
        let delay = frame(Command::Delay, 300, &[]);

        monitor.feed(&tdo[..3], &mut out);
        assert!(out.0.is_empty());
        let mut rest = tdo[3..].to_vec();
        rest.extend_from_slice(&delay);
        monitor.feed(&rest, &mut out);

        assert_eq!(out.0, b"\xA5\xA5OK\r\nOK\r\n");
        assert_eq!(monitor.jtag().tap().delays, [300]);
    }

    #[test]
    fn corrupted_frame_is_answered_with_error() {
        let mut monitor = Monitor::<_>::new(CountingTap::default());
        let mut out = Output::default();
        let mut bad = frame(Command::Init, 0, &[]);
        bad[2] ^= 0x10;
        monitor.feed(&bad, &mut out);
        assert_eq!(out.0, b"ERR\r\n");
        assert_eq!(monitor.jtag().tap().inits, 0);

        out.0.clear();
        monitor.feed(&frame(Command::Init, 0, &[]), &mut out);
        assert_eq!(out.0, b"OK\r\n");
        assert_eq!(monitor.jtag().tap().inits, 1);
    }

    #[test]
    fn oversized_frame_is_answered_with_error() {
        let mut monitor = Monitor::<_, 16>::new(CountingTap::default());
        let mut out = Output::default();
        let tdi = frame(Command::Tdi, 200, &[0; 25]);
        monitor.feed(&tdi[..HEADER_LEN], &mut out);
        assert_eq!(out.0, b"ERR\r\n");
    }

    #[test]
    fn text_commands() {
        let mut monitor = Monitor::<_>::new(CountingTap::default());
        let mut out = Output::default();
        monitor.feed(b"hel", &mut out);
        monitor.feed(b"p\r\n", &mut out);
        let text = std::str::from_utf8(&out.0).unwrap();
        assert!(text.starts_with("raw_jtag -- "));
        assert!(text.ends_with("help -- Display help for monitor commands\r\nOK\r\n"));

        out.0.clear();
        monitor.feed(b"bogus\n", &mut out);
        assert_eq!(out.0, b"ERR\r\n");
    }
}
