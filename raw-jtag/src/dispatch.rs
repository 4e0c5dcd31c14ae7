use super::{frame::tick_bytes, parse_frame, Command, Error, OutputSink, TapDriver};

/// Default scratch size, enough for 8192 ticks.
pub const DEFAULT_SCRATCH: usize = 1024;

/// Executes raw JTAG frames on a [`TapDriver`].
///
/// TMS sequences and TDO captures go through a fixed scratch buffer of `SCRATCH` bytes; frames
/// needing more are refused before the TAP is touched.
pub struct RawJtag<T, const SCRATCH: usize = DEFAULT_SCRATCH> {
    tap: T,
    scratch: [u8; SCRATCH],
}

impl<T: TapDriver, const SCRATCH: usize> RawJtag<T, SCRATCH> {
    pub fn new(tap: T) -> Self {
        Self {
            tap,
            scratch: [0; SCRATCH],
        }
    }

    pub fn tap(&self) -> &T {
        &self.tap
    }

    pub fn tap_mut(&mut self) -> &mut T {
        &mut self.tap
    }

    pub fn into_inner(self) -> T {
        self.tap
    }

    /// Validates and runs one frame. Captured TDO bytes are written to `out`.
    pub fn try_dispatch<O: OutputSink + ?Sized>(
        &mut self,
        token: &[u8],
        out: &mut O,
    ) -> Result<(), Error> {
        let frame = parse_frame(token)?;
        let ticks = frame.ticks;
        log::trace!(
            "raw_jtag: {:?} ticks={} final={}",
            frame.command,
            ticks,
            frame.is_final
        );

        match frame.command {
            Command::Init => self.tap.init(),
            Command::Delay => self.tap.delay_us(ticks),
            Command::Tms => {
                let len = tick_bytes(ticks);
                let tms = self
                    .scratch
                    .get_mut(..len)
                    .ok_or(Error::ResourceExhausted(len))?;
                tms.copy_from_slice(frame.payload);
                if ticks % 8 != 0 {
                    tms[len - 1] &= (1 << (ticks % 8)) - 1;
                }
                self.tap.tms_seq(tms, ticks);
            }
            Command::Tdi => self.tap.tdi_seq(frame.is_final, frame.payload, ticks),
            Command::Tdo | Command::TdiTdo => {
                let len = tick_bytes(ticks);
                let tdo = self
                    .scratch
                    .get_mut(..len)
                    .ok_or(Error::ResourceExhausted(len))?;
                tdo.fill(0);
                let tdi = match frame.command {
                    Command::TdiTdo => Some(frame.payload),
                    _ => None,
                };
                self.tap.tdi_tdo_seq(tdo, frame.is_final, tdi, ticks);
                out.emit(tdo);
            }
        }
        Ok(())
    }

    /// Runs one frame, returning whether it was accepted.
    pub fn dispatch<O: OutputSink + ?Sized>(&mut self, token: &[u8], out: &mut O) -> bool {
        match self.try_dispatch(token, out) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("raw_jtag: {}", e);
                false
            }
        }
    }

    /// Runs the arguments of a `raw_jtag` monitor command, the command name excluded. Exactly one
    /// argument, the frame, is accepted.
    pub fn dispatch_args<O: OutputSink + ?Sized>(&mut self, args: &[&[u8]], out: &mut O) -> bool {
        match args {
            [token] => self.dispatch(token, out),
            _ => {
                log::debug!("raw_jtag: {}", Error::Arguments(args.len()));
                false
            }
        }
    }
}
