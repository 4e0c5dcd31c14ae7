//! Transport independent DfuSe download engine.
//!
//! The engine is driven in two phases. [`DownloadSession::handle_control_request`] reacts to a
//! class request at the time it is received and, for `DFU_GETSTATUS`, hands back a
//! [`PendingAction`]. Once the status reply has been read by the host the transport passes that
//! token to [`DownloadSession::run_pending_action`], which performs the flash access or the
//! detach the status poll acknowledged.

use core::ops::{Deref, DerefMut};

use super::{
    get_le32, Error, Flash, Request, State, CMD_ERASE, CMD_SETADDR, DFU_REQUEST_TYPE,
    MAX_TRANSFER_SIZE,
};

/// Length of a `DFU_GETSTATUS` reply.
pub const STATUS_LENGTH: usize = 6;

/// Setup packet fields the engine looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// `bmRequestType`, the direction bit is ignored.
    pub request_type: u8,
    pub request: u8,
    /// `wValue`, the block number for `DFU_DNLOAD`.
    pub value: u16,
}

impl ControlRequest {
    pub fn class(request: Request, value: u16) -> Self {
        Self {
            request_type: DFU_REQUEST_TYPE,
            request: request as u8,
            value,
        }
    }
}

/// Why a request was not handled. The transport answers it with its default stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    NotClassRequest(u8),
    Unsupported(u8),
    /// The request is not valid in the current state.
    WrongState(State),
    /// The download payload does not fit the buffer.
    Oversized(usize),
    /// The reply buffer cannot hold the answer.
    ReplyBuffer(usize),
}

/// Token for the work a `DFU_GETSTATUS` acknowledged. Only the engine creates them.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct PendingAction {
    _private: (),
}

/// Result of a request the engine accepted.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct Handled {
    /// Number of bytes of the reply buffer to send back.
    pub reply_len: usize,
    pub pending: Option<PendingAction>,
}

impl Handled {
    fn empty() -> Self {
        Self {
            reply_len: 0,
            pending: None,
        }
    }
}

/// What running a [`PendingAction`] amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Nothing was waiting on this status poll.
    Nothing,
    /// The block was consumed, the session is back in dfuDNLOAD-IDLE.
    Done,
    /// The command block named an address outside the application region. The transport must
    /// halt the control endpoint; the session stays in dfuDNBUSY until aborted.
    Stall,
    /// The flash reported an error, the session is in dfuERROR.
    Failed(Error),
    /// The download is over: the transport must detach and reset into the application.
    Detach,
}

/// Scoped flash unlock, the controller is locked again whenever this is dropped.
struct Unlocked<'a, F: Flash>(&'a mut F);
impl<'a, F: Flash> Unlocked<'a, F> {
    fn new(flash: &'a mut F) -> Self {
        flash.unlock();
        Self(flash)
    }
}
impl<F: Flash> Deref for Unlocked<'_, F> {
    type Target = F;
    fn deref(&self) -> &F {
        self.0
    }
}
impl<F: Flash> DerefMut for Unlocked<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        self.0
    }
}
impl<F: Flash> Drop for Unlocked<'_, F> {
    fn drop(&mut self) {
        self.0.lock();
    }
}

pub struct DownloadSession<const N: usize = MAX_TRANSFER_SIZE> {
    state: State,
    buffer: [u8; N],
    length: usize,
    block_number: u16,
    target_address: u32,
}

impl<const N: usize> Default for DownloadSession<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DownloadSession<N> {
    pub const fn new() -> Self {
        Self {
            state: State::DfuIdle,
            buffer: [0; N],
            length: 0,
            block_number: 0,
            target_address: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Address set by the last SETADDR or ERASE command block.
    pub fn target_address(&self) -> u32 {
        self.target_address
    }

    fn set_state(&mut self, state: State) {
        if state != self.state {
            log::trace!("dfu: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Handles one class request.
    ///
    /// `payload` is the data stage of host-to-device requests, `reply` receives the data stage of
    /// device-to-host ones.
    pub fn handle_control_request<F: Flash>(
        &mut self,
        flash: &F,
        req: &ControlRequest,
        payload: &[u8],
        reply: &mut [u8],
    ) -> Result<Handled, Rejected> {
        if req.request_type & 0x7F != DFU_REQUEST_TYPE {
            return Err(Rejected::NotClassRequest(req.request_type));
        }
        let request = match Request::try_from(req.request) {
            Ok(request) => request,
            Err(_) => return Err(Rejected::Unsupported(req.request)),
        };

        // Only a reset leaves dfuMANIFEST.
        if self.state == State::DfuManifest
            && !matches!(request, Request::GetStatus | Request::GetState)
        {
            return Err(Rejected::WrongState(self.state));
        }

        match request {
            Request::Dnload if payload.is_empty() => {
                self.set_state(State::DfuManifestSync);
                Ok(Handled::empty())
            }
            Request::Dnload => self.accept_download(req.value, payload),
            Request::GetStatus => self.accept_get_status(flash, reply),
            Request::GetState => {
                match reply.first_mut() {
                    Some(slot) => *slot = self.state.into(),
                    None => return Err(Rejected::ReplyBuffer(0)),
                }
                Ok(Handled {
                    reply_len: 1,
                    pending: None,
                })
            }
            Request::ClrStatus => {
                if let State::DfuError(_) = self.state {
                    self.set_state(State::DfuIdle);
                }
                Ok(Handled::empty())
            }
            Request::Abort => {
                self.set_state(State::DfuIdle);
                Ok(Handled::empty())
            }
            Request::Upload | Request::Detach => Err(Rejected::Unsupported(req.request)),
        }
    }

    fn accept_download(&mut self, block_number: u16, data: &[u8]) -> Result<Handled, Rejected> {
        if !matches!(self.state, State::DfuIdle | State::DfuDnloadIdle) {
            return Err(Rejected::WrongState(self.state));
        }
        if data.len() > N {
            return Err(Rejected::Oversized(data.len()));
        }

        self.buffer[..data.len()].copy_from_slice(data);
        self.length = data.len();
        self.block_number = block_number;
        log::trace!("dfu: block {} ({} bytes)", block_number, data.len());

        self.set_state(State::DfuDnloadSync);
        Ok(Handled::empty())
    }

    fn accept_get_status<F: Flash>(
        &mut self,
        flash: &F,
        reply: &mut [u8],
    ) -> Result<Handled, Rejected> {
        if reply.len() < STATUS_LENGTH {
            return Err(Rejected::ReplyBuffer(reply.len()));
        }

        let mut poll_timeout = 0;
        match self.state {
            State::DfuDnloadSync => {
                // a short block leaves stale bytes of the previous one in the buffer
                let (command, address) = if self.length >= 5 {
                    (self.buffer[0], get_le32(&self.buffer[1..5]))
                } else {
                    (0, 0)
                };
                poll_timeout = flash.poll_timeout(command, address, self.block_number);
                self.set_state(State::DfuDnBusy);
            }
            // the device resets once this reply has been read
            State::DfuManifestSync => self.set_state(State::DfuManifest),
            _ => {}
        }

        let status = match self.state {
            State::DfuError(e) => e.into(),
            _ => 0,
        };
        let poll_timeout = &poll_timeout.to_le_bytes()[..3];
        let status = [status, 0, 0, 0, self.state.into(), 0];
        reply[..STATUS_LENGTH].copy_from_slice(&status);
        reply[1..4].copy_from_slice(poll_timeout);

        Ok(Handled {
            reply_len: STATUS_LENGTH,
            pending: Some(PendingAction { _private: () }),
        })
    }

    /// Runs the work acknowledged by a status poll. Must be called once the `DFU_GETSTATUS` reply
    /// that produced `action` has been sent, and before the next request is handled.
    pub fn run_pending_action<F: Flash>(
        &mut self,
        action: PendingAction,
        flash: &mut F,
    ) -> Completion {
        let PendingAction { _private: () } = action;

        match self.state {
            State::DfuDnBusy => self.complete_download(flash),
            State::DfuManifest => {
                log::debug!("dfu: manifestation, detaching");
                Completion::Detach
            }
            _ => Completion::Nothing,
        }
    }

    fn complete_download<F: Flash>(&mut self, flash: &mut F) -> Completion {
        let mut flash = Unlocked::new(flash);

        let res = match self.block_number {
            0 => {
                let address = get_le32(&self.buffer[1..usize::max(self.length, 1)]);
                if self.length < 5 || address < F::APP_ADDRESS || address >= flash.limit() {
                    log::warn!("dfu: command address {:#010x} out of range", address);
                    return Completion::Stall;
                }
                self.run_command(&mut *flash, address)
            }
            1 => {
                log::warn!("dfu: ignoring block 1");
                Ok(())
            }
            block_number => {
                let offset = u32::from(block_number - 2).wrapping_mul(u32::from(F::TRANSFER_SIZE));
                let address = self.target_address.wrapping_add(offset);
                log::trace!("dfu: program {} bytes at {:#010x}", self.length, address);
                flash.program(address, &self.buffer[..self.length])
            }
        };
        drop(flash);

        match res {
            Ok(()) => {
                // straight to dfuDNLOAD-IDLE, dfuDNLOAD-SYNC is skipped
                self.set_state(State::DfuDnloadIdle);
                Completion::Done
            }
            Err(e) => {
                log::warn!("dfu: flash error {:?}", e);
                self.set_state(State::DfuError(e));
                Completion::Failed(e)
            }
        }
    }

    fn run_command<F: Flash>(&mut self, flash: &mut F, address: u32) -> super::Result<()> {
        match self.buffer[0] {
            CMD_ERASE => {
                log::debug!("dfu: erase {:#010x}", address);
                flash.erase_sector(address)?;
                // an erase also moves the write pointer
                self.target_address = address;
            }
            CMD_SETADDR => {
                log::debug!("dfu: set address {:#010x}", address);
                self.target_address = address;
            }
            command => log::warn!("dfu: unknown command {:#04x}", command),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Capabilities;
    use std::vec::Vec;
    use test_case::test_case;

    const APP: u32 = 0x0800_2000;
    const LIMIT: u32 = 0x0802_0000;

    #[derive(Debug, PartialEq)]
    enum Op {
        Erase(u32),
        Program(u32, Vec<u8>),
    }

    #[derive(Default)]
    struct FakeFlash {
        ops: Vec<Op>,
        locked: bool,
        unlocks: usize,
        fail_with: Option<Error>,
    }
    impl Capabilities for FakeFlash {
        const WILL_DETACH: bool = true;
        const DETACH_TIMEOUT: u16 = 255;
        const TRANSFER_SIZE: u16 = 256;
        const APP_ADDRESS: u32 = APP;
    }
    impl Flash for FakeFlash {
        fn unlock(&mut self) {
            self.locked = false;
            self.unlocks += 1;
        }
        fn lock(&mut self) {
            self.locked = true;
        }
        fn erase_sector(&mut self, address: u32) -> crate::Result<()> {
            assert!(!self.locked);
            self.ops.push(Op::Erase(address));
            self.fail_with.map_or(Ok(()), Err)
        }
        fn program(&mut self, address: u32, data: &[u8]) -> crate::Result<()> {
            assert!(!self.locked);
            self.ops.push(Op::Program(address, data.to_vec()));
            self.fail_with.map_or(Ok(()), Err)
        }
        fn limit(&self) -> u32 {
            LIMIT
        }
        fn poll_timeout(&self, command: u8, _address: u32, block_number: u16) -> u32 {
            if block_number == 0 && command == CMD_ERASE {
                0x01_0203
            } else {
                26
            }
        }
    }

    struct Bench {
        session: DownloadSession,
        flash: FakeFlash,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                session: DownloadSession::new(),
                flash: FakeFlash {
                    locked: true,
                    ..FakeFlash::default()
                },
            }
        }

        fn out(&mut self, request: Request, value: u16, payload: &[u8]) -> Result<(), Rejected> {
            let req = ControlRequest::class(request, value);
            let handled = self
                .session
                .handle_control_request(&self.flash, &req, payload, &mut [])?;
            assert_eq!(handled, Handled::empty());
            Ok(())
        }

        fn get_status(&mut self) -> ([u8; 6], PendingAction) {
            let mut reply = [0xEE; 6];
            let req = ControlRequest::class(Request::GetStatus, 0);
            let handled = self
                .session
                .handle_control_request(&self.flash, &req, &[], &mut reply)
                .unwrap();
            assert_eq!(handled.reply_len, STATUS_LENGTH);
            (reply, handled.pending.unwrap())
        }

        /// GETSTATUS followed by the completion of its reply.
        fn poll(&mut self) -> Completion {
            let (_, action) = self.get_status();
            self.session.run_pending_action(action, &mut self.flash)
        }

        fn command(&mut self, command: u8, address: u32) -> Completion {
            let mut block = [command, 0, 0, 0, 0];
            block[1..].copy_from_slice(&address.to_le_bytes());
            self.out(Request::Dnload, 0, &block).unwrap();
            self.poll()
        }
    }

    #[test]
    fn download_buffers_block_until_status_poll() {
        let mut bench = Bench::new();
        bench.out(Request::Dnload, 2, &[1, 2, 3]).unwrap();
        assert_eq!(bench.session.state(), State::DfuDnloadSync);
        assert!(bench.flash.ops.is_empty());
    }

    #[test]
    fn get_status_reports_poll_timeout_and_busy() {
        let mut bench = Bench::new();
        let mut block = [CMD_ERASE, 0, 0, 0, 0];
        block[1..].copy_from_slice(&APP.to_le_bytes());
        bench.out(Request::Dnload, 0, &block).unwrap();

        let (reply, _) = bench.get_status();
        assert_eq!(reply, [0, 0x03, 0x02, 0x01, 4, 0]);
        assert_eq!(bench.session.state(), State::DfuDnBusy);
    }

    #[test]
    fn short_block_poll_timeout_ignores_previous_block() {
        let mut bench = Bench::new();
        assert_eq!(bench.command(CMD_ERASE, APP), Completion::Done);

        bench.out(Request::Dnload, 0, &[CMD_ERASE, 0x00]).unwrap();
        let (reply, _) = bench.get_status();
        assert_eq!(reply, [0, 26, 0, 0, 4, 0]);
    }

    #[test]
    fn erase_sets_target_address() {
        let mut bench = Bench::new();
        assert_eq!(bench.command(CMD_ERASE, 0x0800_4000), Completion::Done);
        assert_eq!(bench.flash.ops, [Op::Erase(0x0800_4000)]);
        assert_eq!(bench.session.target_address(), 0x0800_4000);
        assert_eq!(bench.session.state(), State::DfuDnloadIdle);
        assert!(bench.flash.locked);
    }

    #[test]
    fn data_block_goes_to_set_address_not_erase_base() {
        let mut bench = Bench::new();
        bench.command(CMD_ERASE, APP);
        bench.command(CMD_SETADDR, 0x0800_3000);

        bench.out(Request::Dnload, 2, &[0xDE, 0xAD]).unwrap();
        assert_eq!(bench.poll(), Completion::Done);
        assert_eq!(bench.flash.ops.last(), Some(&Op::Program(0x0800_3000, [0xDE, 0xAD].to_vec())));
    }

    #[test_case(2, 0x0800_2000 ; "first block")]
    #[test_case(3, 0x0800_2100 ; "second block")]
    #[test_case(10, 0x0800_2800 ; "ninth block")]
    fn data_block_address(block_number: u16, expected: u32) {
        let mut bench = Bench::new();
        bench.command(CMD_SETADDR, APP);
        let data = [0x5A; 100];
        bench.out(Request::Dnload, block_number, &data).unwrap();
        assert_eq!(bench.poll(), Completion::Done);
        assert_eq!(bench.flash.ops, [Op::Program(expected, data.to_vec())]);
    }

    #[test_case(APP - 1 ; "below application")]
    #[test_case(LIMIT ; "at flash limit")]
    #[test_case(0xFFFF_FFFF ; "far away")]
    fn out_of_range_address_stalls(address: u32) {
        let mut bench = Bench::new();
        assert_eq!(bench.command(CMD_ERASE, address), Completion::Stall);
        assert_eq!(bench.session.state(), State::DfuDnBusy);
        assert!(bench.flash.ops.is_empty());
        assert!(bench.flash.locked);
        assert_eq!(bench.flash.unlocks, 1);

        bench.out(Request::Abort, 0, &[]).unwrap();
        assert_eq!(bench.session.state(), State::DfuIdle);
    }

    #[test]
    fn short_command_block_stalls() {
        let mut bench = Bench::new();
        bench.out(Request::Dnload, 0, &[CMD_SETADDR, 0x00, 0x20]).unwrap();
        assert_eq!(bench.poll(), Completion::Stall);
    }

    #[test]
    fn unknown_command_only_validates_address() {
        let mut bench = Bench::new();
        assert_eq!(bench.command(0x92, APP), Completion::Done);
        assert!(bench.flash.ops.is_empty());
        assert_eq!(bench.session.target_address(), 0);
    }

    #[test]
    fn block_one_is_ignored() {
        let mut bench = Bench::new();
        bench.out(Request::Dnload, 1, &[1]).unwrap();
        assert_eq!(bench.poll(), Completion::Done);
        assert!(bench.flash.ops.is_empty());
    }

    #[test]
    fn flash_error_enters_error_state() {
        let mut bench = Bench::new();
        bench.flash.fail_with = Some(Error::Erase);
        assert_eq!(bench.command(CMD_ERASE, APP), Completion::Failed(Error::Erase));
        assert_eq!(bench.session.state(), State::DfuError(Error::Erase));
        assert!(bench.flash.locked);

        let (reply, _) = bench.get_status();
        assert_eq!(reply[0], Error::Erase as u8);
        assert_eq!(reply[4], 10);

        bench.out(Request::ClrStatus, 0, &[]).unwrap();
        assert_eq!(bench.session.state(), State::DfuIdle);
    }

    #[test]
    fn clear_status_outside_error_is_noop() {
        let mut bench = Bench::new();
        bench.out(Request::Dnload, 2, &[1]).unwrap();
        bench.out(Request::ClrStatus, 0, &[]).unwrap();
        assert_eq!(bench.session.state(), State::DfuDnloadSync);
    }

    #[test]
    fn get_state_reports_without_transition() {
        let mut bench = Bench::new();
        bench.out(Request::Dnload, 2, &[1]).unwrap();
        let mut reply = [0; 1];
        let req = ControlRequest::class(Request::GetState, 0);
        let handled = bench
            .session
            .handle_control_request(&bench.flash, &req, &[], &mut reply)
            .unwrap();
        assert_eq!(handled.reply_len, 1);
        assert_eq!(reply, [3]);
        assert_eq!(bench.session.state(), State::DfuDnloadSync);
    }

    #[test]
    fn upload_and_foreign_requests_are_rejected() {
        let mut bench = Bench::new();
        assert_eq!(
            bench.out(Request::Upload, 0, &[]),
            Err(Rejected::Unsupported(2))
        );
        let vendor = ControlRequest {
            request_type: 0x41,
            request: 1,
            value: 0,
        };
        assert_eq!(
            bench
                .session
                .handle_control_request(&bench.flash, &vendor, &[1], &mut []),
            Err(Rejected::NotClassRequest(0x41))
        );
        assert_eq!(bench.session.state(), State::DfuIdle);
    }

    #[test]
    fn device_to_host_direction_bit_is_ignored() {
        let mut bench = Bench::new();
        let req = ControlRequest {
            request_type: 0xA1,
            request: Request::GetState as u8,
            value: 0,
        };
        let mut reply = [0; 1];
        assert!(bench
            .session
            .handle_control_request(&bench.flash, &req, &[], &mut reply)
            .is_ok());
        assert_eq!(reply, [2]);
    }

    #[test]
    fn download_rejected_while_busy() {
        let mut bench = Bench::new();
        bench.out(Request::Dnload, 2, &[1]).unwrap();
        assert_eq!(
            bench.out(Request::Dnload, 3, &[2]),
            Err(Rejected::WrongState(State::DfuDnloadSync))
        );
    }

    #[test]
    fn oversized_download_rejected() {
        let mut session = DownloadSession::<8>::new();
        let flash = FakeFlash::default();
        let req = ControlRequest::class(Request::Dnload, 2);
        assert_eq!(
            session.handle_control_request(&flash, &req, &[0; 9], &mut []),
            Err(Rejected::Oversized(9))
        );
        assert_eq!(session.state(), State::DfuIdle);
    }

    #[test]
    fn manifestation_detaches_after_status() {
        let mut bench = Bench::new();
        bench.out(Request::Dnload, 0, &[]).unwrap();
        assert_eq!(bench.session.state(), State::DfuManifestSync);

        let (reply, action) = bench.get_status();
        assert_eq!(reply, [0, 0, 0, 0, 7, 0]);
        assert_eq!(bench.session.state(), State::DfuManifest);
        assert_eq!(
            bench.session.run_pending_action(action, &mut bench.flash),
            Completion::Detach
        );
        assert!(bench.flash.ops.is_empty());
    }

    #[test]
    fn manifest_is_terminal() {
        let mut bench = Bench::new();
        bench.out(Request::Dnload, 0, &[]).unwrap();
        let _ = bench.get_status();
        assert_eq!(
            bench.out(Request::Abort, 0, &[]),
            Err(Rejected::WrongState(State::DfuManifest))
        );
        assert_eq!(bench.session.state(), State::DfuManifest);
    }

    #[test]
    fn status_poll_in_idle_does_nothing() {
        let mut bench = Bench::new();
        let (reply, action) = bench.get_status();
        assert_eq!(reply, [0, 0, 0, 0, 2, 0]);
        assert_eq!(
            bench.session.run_pending_action(action, &mut bench.flash),
            Completion::Nothing
        );
        assert_eq!(bench.flash.unlocks, 0);
    }
}
