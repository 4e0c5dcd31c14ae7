use usb_device::class_prelude::*;
use usb_device::Result;

use super::{
    session::{Completion, ControlRequest, DownloadSession, PendingAction, STATUS_LENGTH},
    Flash, Request, State, DFU_FUNCTIONAL, DFU_VERSION, MAX_TRANSFER_SIZE, USB_CLASS_DFU,
    USB_DFU_MODE_PROTOCOL, USB_SUB_CLASS_DFU,
};

/// Leaves DFU mode. Implementations reset the device and never return.
pub trait Detach {
    fn detach(&mut self) -> !;
}

/// DfuSe interface in DFU mode, backed by a [`DownloadSession`].
///
/// `usb_device` has no hook for the completion of a control transfer. A new SETUP packet means the
/// previous transfer is over, so the work acknowledged by a `DFU_GETSTATUS` runs right before the
/// next class request is handled. After manifestation no further request may come: the device
/// detaches once [`Capabilities::DETACH_TIMEOUT`](crate::Capabilities::DETACH_TIMEOUT)
/// milliseconds have been counted by [`DfuSeClass::poll`], or on the next bus reset.
pub struct DfuSeClass<B: UsbBus, F: Flash + Detach, const N: usize = MAX_TRANSFER_SIZE> {
    interface_number: InterfaceNumber,
    session: DownloadSession<N>,
    flash: F,
    pending: Option<PendingAction>,
    /// Milliseconds left before detaching, counted from the manifestation status reply.
    detach_in: Option<u32>,
    halted: bool,
    _bus: core::marker::PhantomData<B>,
}

impl<B: UsbBus, F: Flash + Detach, const N: usize> DfuSeClass<B, F, N> {
    const TRANSFER_FITS: () = assert!(
        F::TRANSFER_SIZE as usize <= N,
        "TRANSFER_SIZE exceeds the download buffer"
    );

    pub fn new(alloc: &UsbBusAllocator<B>, flash: F) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::TRANSFER_FITS;

        Self {
            interface_number: alloc.interface(),
            session: DownloadSession::new(),
            flash,
            pending: None,
            detach_in: None,
            halted: false,
            _bus: core::marker::PhantomData,
        }
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    /// Counts down towards the detach that follows manifestation. Call with the milliseconds
    /// elapsed since the previous call.
    pub fn poll(&mut self, elapsed_ms: u32) {
        if let Some(timeout) = self.detach_in {
            let remaining = timeout.saturating_sub(elapsed_ms);
            if remaining == 0 {
                self.detach_in = None;
                self.run_pending();
            } else {
                self.detach_in = Some(remaining);
            }
        }
    }

    fn run_pending(&mut self) {
        if let Some(action) = self.pending.take() {
            match self.session.run_pending_action(action, &mut self.flash) {
                Completion::Stall => self.halted = true,
                Completion::Detach => self.flash.detach(),
                Completion::Nothing | Completion::Done | Completion::Failed(_) => {}
            }
        }
    }

    fn is_ours(&self, req: &control::Request) -> bool {
        req.request_type == control::RequestType::Class
            && req.recipient == control::Recipient::Interface
            && req.index == u8::from(self.interface_number).into()
    }

    fn to_request(req: &control::Request) -> ControlRequest {
        ControlRequest {
            request_type: ((req.request_type as u8) << 5) | req.recipient as u8,
            request: req.request,
            value: req.value,
        }
    }

    fn accept_in(&mut self, xfer: ControlIn<B>) -> Result<()> {
        let req = Self::to_request(xfer.request());
        // the stalled command is not acknowledged until the host aborts
        if self.halted && req.request == Request::GetStatus as u8 {
            return xfer.reject();
        }

        let mut reply = [0; STATUS_LENGTH];
        match self
            .session
            .handle_control_request(&self.flash, &req, &[], &mut reply)
        {
            Ok(handled) => {
                if let Some(action) = handled.pending {
                    self.pending = Some(action);
                }
                if self.session.state() == State::DfuManifest && self.detach_in.is_none() {
                    self.detach_in = Some(u32::from(F::DETACH_TIMEOUT).max(1));
                }
                xfer.accept_with(&reply[..handled.reply_len])
            }
            Err(rejected) => {
                log::debug!("dfu: rejected {:?}", rejected);
                xfer.reject()
            }
        }
    }

    fn accept_out(&mut self, xfer: ControlOut<B>) -> Result<()> {
        let req = Self::to_request(xfer.request());
        match self
            .session
            .handle_control_request(&self.flash, &req, xfer.data(), &mut [])
        {
            Ok(handled) => {
                if req.request == Request::Abort as u8 {
                    self.halted = false;
                }
                if let Some(action) = handled.pending {
                    self.pending = Some(action);
                }
                xfer.accept()
            }
            Err(rejected) => {
                log::debug!("dfu: rejected {:?}", rejected);
                xfer.reject()
            }
        }
    }
}

impl<B: UsbBus, F: Flash + Detach, const N: usize> UsbClass<B> for DfuSeClass<B, F, N> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        writer.interface(
            self.interface_number,
            USB_CLASS_DFU,
            USB_SUB_CLASS_DFU,
            USB_DFU_MODE_PROTOCOL,
        )?;

        // bitCanDnload, upload is never offered
        let attributes = (if F::WILL_DETACH { 0b0000_1000 } else { 0 }) | 0b0000_0001;

        let mut descriptor = [attributes, 0, 0, 0, 0, 0, 0];
        descriptor[1..3].copy_from_slice(&F::DETACH_TIMEOUT.to_le_bytes());
        descriptor[3..5].copy_from_slice(&F::TRANSFER_SIZE.to_le_bytes());
        descriptor[5..7].copy_from_slice(&DFU_VERSION.to_le_bytes());
        writer.write(DFU_FUNCTIONAL, &descriptor)?;

        Ok(())
    }

    fn reset(&mut self) {
        if self.detach_in.is_some() {
            // the host is done with a manifested device
            self.run_pending();
        }
        self.pending = None;
        self.halted = false;
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        if !self.is_ours(xfer.request()) {
            return;
        }
        if self.detach_in.is_none() {
            self.run_pending();
        }
        let _ = self.accept_in(xfer);
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        if !self.is_ours(xfer.request()) {
            return;
        }
        if self.detach_in.is_none() {
            self.run_pending();
        }
        let _ = self.accept_out(xfer);
    }
}
