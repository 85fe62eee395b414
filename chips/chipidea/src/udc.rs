// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! The device controller.
//!
//! [`Udc`] owns the queue-head list, the dTD pool and the request table of one
//! controller instance. Clients use it through
//! [`UsbDeviceController`](kernel::hil::usb::UsbDeviceController); the board
//! calls [`Udc::handle_interrupt`] from its interrupt bottom half.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! static QUEUE_HEADS: QueueHeadList = QueueHeadList::new();
//! let dtds = static_init!([Dtd; 64], [const { Dtd::new() }; 64]);
//! let pool = static_init!(DtdPool<'static>, DtdPool::new(dtds, dtds_bus_address));
//! let ctrl = static_init!([u8; 64], [0; 64]);
//! let udc = static_init!(
//!     chipidea::Udc<'static, MmioHardware>,
//!     chipidea::Udc::new(hw, &QUEUE_HEADS, qh_bus_address, pool, ctrl, UdcConfig::DEFAULT)
//! );
//! udc.probe()?;
//! udc.set_client(usb_stack);
//! udc.start()?;
//! ```

use core::cell::Cell;

use kernel::hil::usb::{
    DeviceClient, DeviceSpeed, DeviceState, EndpointAddress, EndpointDescriptor, Recipient,
    RequestFlags, RequestId, SetupData, StandardRequest, TransferDirection, TransferError,
    TransferType, UsbDeviceController,
};
use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::utilities::registers::LocalRegisterCopy;
use kernel::ErrorCode;
use kernel::{debug, debug_verbose};

use crate::chain::{build_chain, free_chain, inspect_chain, ChainStatus, DtdChain, Transfer};
use crate::config::{PhyInterface, ResetPolicy, UdcConfig, CONFIG};
use crate::descriptors::{Dqh, QueueHeadList};
use crate::endpoint::{self, queue_index, Endpoint, Requests};
use crate::ep0::{self, ControlContext, Ep0State, LocalRequest, EP0_MAX_PACKET, TEST_PACKET};
use crate::pool::DtdPool;
use crate::registers::*;

pub struct Udc<'a, H: UdcHardware> {
    hw: &'a H,
    qhs: &'a QueueHeadList,
    /// Bus address of `qhs`.
    qh_dma: u32,
    pool: &'a DtdPool<'a>,
    config: UdcConfig,
    client: OptionalCell<&'a dyn DeviceClient<'a>>,
    endpoints: [Endpoint; crate::descriptors::QUEUE_HEADS],
    requests: Requests<'a>,
    /// Buffer for the transfers the controller makes on its own on endpoint
    /// 0. Empty while one of them is queued.
    ctrl_buffer: TakeCell<'a, [u8]>,
    ep0: ControlContext,
    num_endpoints: Cell<usize>,
    usb_state: Cell<DeviceState>,
    /// State to go back to when the bus resumes.
    resume_state: OptionalCell<DeviceState>,
    speed: Cell<DeviceSpeed>,
    /// Interrupts are ignored.
    stopped: Cell<bool>,
    vbus_active: Cell<bool>,
    softconnect: Cell<bool>,
}

impl<'a, H: UdcHardware> Udc<'a, H> {
    /// `qh_dma` is the bus address of `qhs`. `ctrl_buffer` must hold at
    /// least 64 bytes to carry the test packet.
    pub fn new(
        hw: &'a H,
        qhs: &'a QueueHeadList,
        qh_dma: u32,
        pool: &'a DtdPool<'a>,
        ctrl_buffer: &'a mut [u8],
        config: UdcConfig,
    ) -> Udc<'a, H> {
        Udc {
            hw,
            qhs,
            qh_dma,
            pool,
            config,
            client: OptionalCell::empty(),
            endpoints: endpoint::endpoints(),
            requests: Requests::new(),
            ctrl_buffer: TakeCell::new(ctrl_buffer),
            ep0: ControlContext::new(),
            num_endpoints: Cell::new(MAX_ENDPOINTS),
            usb_state: Cell::new(DeviceState::NotAttached),
            resume_state: OptionalCell::empty(),
            speed: Cell::new(DeviceSpeed::Unknown),
            stopped: Cell::new(true),
            vbus_active: Cell::new(true),
            softconnect: Cell::new(true),
        }
    }

    /// Checks that the controller can act as a device and reads how many
    /// endpoints it implements.
    pub fn probe(&self) -> Result<usize, ErrorCode> {
        let params = self.hw.get(DCCPARAMS);
        if !params.is_set(CapabilityParams::DC) {
            debug!("chipidea: controller is not device capable");
            return Err(ErrorCode::NODEVICE);
        }
        let endpoints = (params.read(CapabilityParams::DEN) as usize).min(MAX_ENDPOINTS);
        if endpoints == 0 {
            return Err(ErrorCode::NODEVICE);
        }
        self.num_endpoints.set(endpoints);
        Ok(endpoints)
    }

    /// Brings the controller up and connects to the bus.
    pub fn start(&self) -> Result<(), ErrorCode> {
        self.setup()?;
        self.ep0_setup();
        self.usb_state.set(DeviceState::Attached);
        self.run();
        Ok(())
    }

    /// Retires every request, tells the client and stops the controller.
    pub fn shutdown(&self) {
        self.reset_queues();
        self.stop();
        self.usb_state.set(DeviceState::NotAttached);
        self.speed.set(DeviceSpeed::Unknown);
    }

    /// Resets the controller core. On timeout the controller is left as it
    /// was and nothing else is written.
    pub fn reset(&self) -> Result<(), ErrorCode> {
        self.hw.modify(USBCMD, Command::RS::CLEAR);
        self.hw.modify(USBCMD, Command::RST::SET);
        self.poll(self.config.reset_timeout_us, "controller reset", || {
            !self.hw.get(USBCMD).is_set(Command::RST)
        })
    }

    /// Resets the core and programs it for device mode. Interrupts stay
    /// disabled and the controller is not running afterwards.
    pub fn setup(&self) -> Result<(), ErrorCode> {
        self.reset()?;

        let phy = match self.config.phy {
            PhyInterface::Utmi => PortStatus::PTS::Utmi,
            PhyInterface::Ulpi => PortStatus::PTS::Ulpi,
            PhyInterface::Serial => PortStatus::PTS::Serial,
        };
        let width = if self.config.phy_wide {
            PortStatus::PTW::Sixteen
        } else {
            PortStatus::PTW::Eight
        };
        self.hw.modify(PORTSC1, phy + width);

        self.hw.write(USBMODE, Mode::CM::Device + Mode::SLOM::SET);
        self.poll(self.config.reset_timeout_us, "device mode", || {
            matches!(
                self.hw.get(USBMODE).read_as_enum(Mode::CM),
                Some(Mode::CM::Value::Device)
            )
        })?;

        self.hw.set(USBSTS, self.hw.get(USBSTS).get());
        self.hw.set(ENDPOINTLISTADDR, self.qh_dma & !0x7ff);
        Ok(())
    }

    /// Enables interrupts and sets the controller running if the pull-up
    /// is wanted and VBUS is present.
    pub fn run(&self) {
        self.hw.write(
            USBINTR,
            Interrupt::UI::SET
                + Interrupt::UEI::SET
                + Interrupt::PCI::SET
                + Interrupt::URI::SET
                + Interrupt::SLI::SET
                + Interrupt::SEI::SET,
        );
        self.stopped.set(false);
        self.hw.modify(USBMODE, Mode::CM::Device);
        if self.can_connect() {
            self.hw.modify(USBCMD, Command::RS::SET);
            let _ = self.poll(self.config.run_timeout_us, "run", || {
                self.hw.get(USBCMD).is_set(Command::RS)
            });
        }
    }

    /// Disables interrupts and stops the controller. Safe to call twice.
    pub fn stop(&self) {
        self.hw.set(USBSTS, self.hw.get(USBSTS).get());
        self.hw.set(USBINTR, 0);
        self.stopped.set(true);
        self.hw.modify(USBCMD, Command::RS::CLEAR);
    }

    /// Programs both queue heads and the control register of endpoint 0.
    fn ep0_setup(&self) {
        self.qhs
            .get(0, false)
            .configure(EP0_MAX_PACKET, 0, true, false);
        self.qhs
            .get(0, true)
            .configure(EP0_MAX_PACKET, 0, false, false);
        self.hw.modify(
            endptctrl(0),
            EndpointControl::RXE::SET
                + EndpointControl::RXT::Control
                + EndpointControl::TXE::SET
                + EndpointControl::TXT::Control,
        );

        let ep0 = &self.endpoints[0];
        ep0.address.set(EndpointAddress::from_raw(0));
        ep0.transfer_type.set(TransferType::Control);
        ep0.max_packet.set(EP0_MAX_PACKET as usize);
        ep0.enabled.set(true);
        ep0.stopped.set(false);
        self.ep0.reset();
    }

    fn can_connect(&self) -> bool {
        self.softconnect.get() && self.vbus_active.get()
    }

    /// Waits up to `timeout_us` for `done`. A timeout is logged.
    fn poll<F: Fn() -> bool>(&self, timeout_us: u32, what: &str, done: F) -> Result<(), ErrorCode> {
        let mut waited = 0;
        while !done() {
            if waited >= timeout_us {
                debug!("chipidea: timeout waiting for {}", what);
                return Err(ErrorCode::FAIL);
            }
            self.hw.delay_us(1);
            waited += 1;
        }
        Ok(())
    }

    pub fn usb_state(&self) -> DeviceState {
        self.usb_state.get()
    }

    pub fn ep0_state(&self) -> Ep0State {
        self.ep0.state()
    }

    pub(crate) fn ep0_direction(&self) -> TransferDirection {
        self.ep0.direction()
    }

    pub(crate) fn queue_head(&self, number: usize, is_in: bool) -> &Dqh {
        self.qhs.get(number, is_in)
    }

    pub(crate) fn hw(&self) -> &H {
        self.hw
    }

    pub(crate) fn endpoint_at(&self, queue: usize) -> &Endpoint {
        &self.endpoints[queue]
    }

    pub(crate) fn requests(&self) -> &Requests<'a> {
        &self.requests
    }

    pub(crate) fn pool(&self) -> &DtdPool<'a> {
        self.pool
    }

    pub(crate) fn num_endpoints(&self) -> usize {
        self.num_endpoints.get()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    // Transfers

    fn validate_endpoint(&self, endpoint: EndpointAddress) -> Result<&Endpoint, ErrorCode> {
        if endpoint.number() >= self.num_endpoints.get() {
            return Err(ErrorCode::INVAL);
        }
        let ep = &self.endpoints[queue_index(endpoint)];
        if !ep.enabled.get() {
            return Err(ErrorCode::INVAL);
        }
        Ok(ep)
    }

    fn submit(
        &self,
        endpoint: EndpointAddress,
        buffer: &'a mut [u8],
        length: usize,
        flags: RequestFlags,
    ) -> Result<RequestId, (ErrorCode, &'a mut [u8])> {
        let ep = match self.validate_endpoint(endpoint) {
            Ok(ep) => ep,
            Err(e) => return Err((e, buffer)),
        };
        if self.speed.get() == DeviceSpeed::Unknown {
            return Err((ErrorCode::OFF, buffer));
        }
        if length > buffer.len() {
            return Err((ErrorCode::INVAL, buffer));
        }
        if ep.transfer_type.get() == TransferType::Isochronous && length > ep.max_packet.get() {
            return Err((ErrorCode::SIZE, buffer));
        }
        if ep.flushing.get() {
            return Err((ErrorCode::BUSY, buffer));
        }

        let is_in = match endpoint.number() {
            0 => self.ep0.is_in(),
            _ => endpoint.is_in(),
        };
        self.enqueue(queue_index(endpoint), is_in, buffer, length, flags, false)
    }

    /// Builds the chain for a request, hands it to the controller and
    /// appends it to the endpoint queue.
    fn enqueue(
        &self,
        queue: usize,
        is_in: bool,
        buffer: &'a mut [u8],
        length: usize,
        flags: RequestFlags,
        internal: bool,
    ) -> Result<RequestId, (ErrorCode, &'a mut [u8])> {
        let ep = &self.endpoints[queue];
        let slot = match self.requests.allocate() {
            Some(slot) => slot,
            None => return Err((ErrorCode::NOMEM, buffer)),
        };
        let direction = endpoint::direction(is_in);

        let dma = self.hw.dma_map(&buffer[..length], direction);
        let transfer = Transfer {
            address: dma,
            length,
            max_packet: ep.max_packet.get(),
            flags,
        };
        let mut built = 0;
        let chain = match build_chain(
            self.pool,
            &transfer,
            &mut built,
            self.config.max_descriptor_payload,
        ) {
            Ok(chain) => chain,
            Err(e) => {
                self.hw.dma_unmap(dma, length, direction);
                self.requests.release(slot);
                return Err((e, buffer));
            }
        };

        let number = ep.address.get().number();
        self.queue_td(ep, number, is_in, &chain);

        let request = self.requests.get(slot);
        request.buffer.replace(buffer);
        request.queue.set(queue);
        request.is_in.set(is_in);
        request.length.set(length);
        request.flags.set(flags);
        request.internal.set(internal);
        request.dma.set(dma);
        request.chain.set(chain);
        ep.push_back(&self.requests, slot);

        let id = request.id.get();
        if CONFIG.trace_transfers {
            debug_verbose!(
                "chipidea: queued {:?} on ep{}{} len {} ({} dTDs)",
                id,
                number,
                if is_in { "in" } else { "out" },
                length,
                chain.len()
            );
        }
        Ok(id)
    }

    /// Links a built chain behind the endpoint's live chain, priming the
    /// endpoint unless the controller is still executing it.
    fn queue_td(&self, ep: &Endpoint, number: usize, is_in: bool, chain: &DtdChain) {
        let bit = endpoint_bit(number, is_in);
        let head = self.pool.dma_address(chain.head());

        self.hw.write_barrier();
        let last = ep
            .tail()
            .map(|tail| self.requests.get(tail))
            .filter(|tail| tail.is_in.get() == is_in)
            .and_then(|tail| tail.chain.get());
        if let Some(last) = last {
            self.pool.get(last.tail()).set_next(head);
            self.hw.write_barrier();
            if self.hw.bits(ENDPTPRIME) & bit != 0 {
                return;
            }
            if self.hw.link_observed(bit) {
                return;
            }
        }
        self.prime(number, is_in, head);
    }

    /// Points the queue head at the dTD at `address` and primes it.
    fn prime(&self, number: usize, is_in: bool, address: u32) {
        self.qhs.get(number, is_in).load(address);
        self.hw.write_barrier();
        self.hw.set(ENDPTPRIME, endpoint_bit(number, is_in));
    }

    /// Removes a request from its queue, frees its descriptors and hands the
    /// buffer back. The client hears about it exactly once, unless the
    /// controller queued the request itself.
    fn retire(&self, slot: usize, result: Result<(), TransferError>) {
        let request = self.requests.get(slot);
        let ep = &self.endpoints[request.queue.get()];
        ep.remove(&self.requests, slot);

        if let Some(chain) = request.chain.take() {
            free_chain(self.pool, &chain);
        }
        self.hw
            .dma_unmap(request.dma.get(), request.length.get(), request.direction());

        let id = request.id.get();
        let actual = request.actual.get();
        let internal = request.internal.get();
        let address = EndpointAddress::new(ep.address.get().number(), request.direction());
        let buffer = request.buffer.take();
        self.requests.release(slot);

        if CONFIG.trace_transfers {
            debug_verbose!(
                "chipidea: retired {:?} on {:?}: {} bytes, {:?}",
                id,
                address,
                actual,
                result
            );
        }

        let buffer = match buffer {
            Some(buffer) => buffer,
            None => return,
        };
        if internal {
            self.ctrl_buffer.replace(buffer);
            return;
        }

        let stopped = ep.stopped.replace(true);
        ep.notifying.set(true);
        self.client.map(move |client| {
            client.transfer_complete(address, id, buffer, actual, result);
        });
        ep.notifying.set(false);
        ep.stopped.set(stopped);
    }

    /// Cancels a queued request, which completes with `ConnectionReset`.
    fn dequeue(&self, endpoint: EndpointAddress, id: RequestId) -> Result<(), ErrorCode> {
        let queue = queue_index(endpoint);
        let ep = self.endpoints.get(queue).ok_or(ErrorCode::INVAL)?;
        let slot = self
            .requests
            .find(id)
            .filter(|&slot| self.requests.get(slot).queue.get() == queue)
            .filter(|&slot| ep.contains(&self.requests, slot))
            .ok_or(ErrorCode::INVAL)?;
        let request = self.requests.get(slot);
        let number = ep.address.get().number();
        let is_in = request.is_in.get();

        let stopped = ep.stopped.replace(true);
        let enable = if is_in {
            (EndpointControl::TXE::SET, EndpointControl::TXE::CLEAR)
        } else {
            (EndpointControl::RXE::SET, EndpointControl::RXE::CLEAR)
        };
        self.hw.modify(endptctrl(number), enable.1);

        // On ep0 a request only follows a tail of its own direction.
        let prev = ep
            .predecessor(&self.requests, slot)
            .map(|prev| self.requests.get(prev))
            .filter(|prev| prev.is_in.get() == is_in);
        if prev.is_none() {
            let _ = self.fifo_flush(number, is_in);
            let next = request
                .next()
                .map(|next| self.requests.get(next))
                .filter(|next| next.is_in.get() == is_in)
                .and_then(|next| next.chain.get());
            if let Some(next) = next {
                self.prime(number, is_in, self.pool.dma_address(next.head()));
            }
        } else {
            let prev = prev.and_then(|prev| prev.chain.get());
            if let (Some(prev), Some(chain)) = (prev, request.chain.get()) {
                let successor = self.pool.get(chain.tail()).next_raw();
                self.pool.get(prev.tail()).set_next_raw(successor);
            }
        }

        self.retire(slot, Err(TransferError::ConnectionReset));

        self.hw.modify(endptctrl(number), enable.0);
        ep.stopped.set(stopped);
        Ok(())
    }

    /// Flushes one endpoint direction, or both for endpoint 0, out of the
    /// controller.
    fn fifo_flush(&self, number: usize, is_in: bool) -> Result<(), ErrorCode> {
        let bits = if number == 0 {
            endpoint_bit(0, false) | endpoint_bit(0, true)
        } else {
            endpoint_bit(number, is_in)
        };
        let timeout = self.config.flush_timeout_us;
        let mut waited = 0;
        loop {
            self.hw.set(ENDPTFLUSH, bits);
            while self.hw.bits(ENDPTFLUSH) != 0 {
                if waited >= timeout {
                    debug!("chipidea: timeout flushing endpoint {}", number);
                    return Err(ErrorCode::FAIL);
                }
                self.hw.delay_us(1);
                waited += 1;
            }
            if self.hw.bits(ENDPTSTATUS) & bits == 0 {
                return Ok(());
            }
            if waited >= timeout {
                debug!("chipidea: endpoint {} still primed after flush", number);
                return Err(ErrorCode::FAIL);
            }
            self.hw.delay_us(1);
            waited += 1;
        }
    }

    /// Flushes an endpoint and retires everything queued on it with
    /// `status`, oldest first.
    fn nuke(&self, queue: usize, status: TransferError) {
        let ep = &self.endpoints[queue];
        ep.flushing.set(true);
        let number = ep.address.get().number();
        let _ = self.fifo_flush(number, ep.address.get().is_in());
        while let Some(slot) = ep.head() {
            self.retire(slot, Err(status));
        }
        ep.flushing.set(false);
    }

    fn reset_queues(&self) {
        for queue in 0..self.endpoints.len() {
            if !self.endpoints[queue].is_empty() {
                self.nuke(queue, TransferError::Shutdown);
            }
        }
        self.client.map(|client| client.disconnect());
    }

    fn set_halt(&self, endpoint: EndpointAddress, halt: bool) -> Result<(), ErrorCode> {
        let ep = self.validate_endpoint(endpoint)?;
        if ep.transfer_type.get() == TransferType::Isochronous {
            return Err(ErrorCode::NOSUPPORT);
        }
        let number = endpoint.number();
        let is_in = match number {
            0 => self.ep0.is_in(),
            _ => endpoint.is_in(),
        };
        if halt && is_in && !ep.is_empty() {
            return Err(ErrorCode::BUSY);
        }

        self.change_stall(number, is_in, halt);
        if number == 0 {
            self.ep0.set_state(Ep0State::WaitForSetup);
            self.ep0.set_direction(false);
        }
        Ok(())
    }

    fn change_stall(&self, number: usize, is_in: bool, halt: bool) {
        let ctrl = endptctrl(number);
        match (is_in, halt) {
            (true, true) => self.hw.modify(ctrl, EndpointControl::TXS::SET),
            (true, false) => self
                .hw
                .modify(ctrl, EndpointControl::TXS::CLEAR + EndpointControl::TXR::SET),
            (false, true) => self.hw.modify(ctrl, EndpointControl::RXS::SET),
            (false, false) => self
                .hw
                .modify(ctrl, EndpointControl::RXS::CLEAR + EndpointControl::RXR::SET),
        }
    }

    fn is_halted(&self, number: usize, is_in: bool) -> bool {
        let ctrl = self.hw.get(endptctrl(number));
        if is_in {
            ctrl.is_set(EndpointControl::TXS)
        } else {
            ctrl.is_set(EndpointControl::RXS)
        }
    }

    // Control transfers

    fn ep0_stall(&self) {
        self.hw.modify(
            endptctrl(0),
            EndpointControl::TXS::SET + EndpointControl::RXS::SET,
        );
        self.ep0.set_state(Ep0State::Stalled);
        self.ep0.set_direction(false);
    }

    /// Queues the zero-length status stage in direction `is_in`.
    fn prime_status(&self, is_in: bool) -> Result<(), ErrorCode> {
        self.ep0.set_direction(is_in);
        self.ep0.set_state(Ep0State::WaitForOutStatus);
        let buffer = self.ctrl_buffer.take().ok_or(ErrorCode::BUSY)?;
        self.enqueue(0, is_in, buffer, 0, RequestFlags::NONE, true)
            .map(|_| ())
            .map_err(|(e, buffer)| {
                self.ctrl_buffer.replace(buffer);
                e
            })
    }

    /// Queues `length` bytes of the control buffer, filled by `fill`, as an
    /// IN data stage.
    fn ep0_reply<F: FnOnce(&mut [u8])>(&self, length: usize, fill: F) -> Result<(), ErrorCode> {
        self.ep0.set_direction(true);
        let buffer = self.ctrl_buffer.take().ok_or(ErrorCode::BUSY)?;
        if buffer.len() < length {
            self.ctrl_buffer.replace(buffer);
            return Err(ErrorCode::SIZE);
        }
        fill(&mut buffer[..length]);
        self.enqueue(0, true, buffer, length, RequestFlags::NONE, true)
            .map_err(|(e, buffer)| {
                self.ctrl_buffer.replace(buffer);
                e
            })?;
        self.ep0.set_state(Ep0State::DataXmit);
        Ok(())
    }

    fn setup_received(&self) {
        self.hw.set(ENDPTSETUPSTAT, endpoint_bit(0, false));
        let packet = self.hw.read_setup_packet(self.qhs.get(0, false));
        self.ep0.store_setup(packet);
        let setup = SetupData::from_bytes(&packet);
        if CONFIG.trace_setup {
            debug_verbose!("chipidea: SETUP {:?}", setup);
        }

        self.nuke(0, TransferError::Shutdown);

        match ep0::local_request(&setup, self.num_endpoints.get()) {
            Some(LocalRequest::GetStatus { recipient, index }) => self.get_status(recipient, index),
            Some(LocalRequest::SetAddress(address)) => {
                self.ep0.set_pending_address(address);
                if self.config.set_address_delay_us != 0 {
                    self.hw.delay_us(self.config.set_address_delay_us);
                }
                self.status_or_stall(Ok(()));
            }
            Some(LocalRequest::EndpointHalt { endpoint, halt }) => {
                let result = self.set_halt(endpoint, halt);
                self.status_or_stall(result);
            }
            Some(LocalRequest::RemoteWakeup(enabled)) => {
                self.ep0.set_remote_wakeup(enabled);
                self.status_or_stall(Ok(()));
            }
            Some(LocalRequest::TestMode(selector)) => self.test_mode(selector),
            None => self.delegate_setup(&setup),
        }
    }

    /// Acknowledges a request without data stage, or stalls if it failed.
    fn status_or_stall(&self, result: Result<(), ErrorCode>) {
        if result.and_then(|()| self.prime_status(true)).is_err() {
            self.ep0_stall();
        }
    }

    fn delegate_setup(&self, setup: &SetupData) {
        let is_in = setup.request_type.transfer_direction() == TransferDirection::DeviceToHost;
        // Without a data stage the next transfer is the IN status stage.
        self.ep0.set_direction(setup.length == 0 || is_in);

        let result = self
            .client
            .map_or(Err(ErrorCode::NOSUPPORT), |client| client.setup(setup));
        if result.is_err() {
            self.ep0_stall();
            return;
        }

        if let Some(StandardRequest::SetConfiguration {
            configuration_value,
        }) = setup.get_standard_request()
        {
            match (configuration_value, self.usb_state.get()) {
                (0, DeviceState::Configured) => self.usb_state.set(DeviceState::Address),
                (0, _) => {}
                (_, DeviceState::Address) | (_, DeviceState::Configured) => {
                    self.usb_state.set(DeviceState::Configured)
                }
                _ => {}
            }
        }

        if setup.length == 0 {
            self.status_or_stall(Ok(()));
        } else if is_in {
            self.ep0.set_state(Ep0State::DataXmit);
        } else {
            self.ep0.set_state(Ep0State::DataRecv);
        }
    }

    fn get_status(&self, recipient: Recipient, index: u16) {
        let status: u16 = match recipient {
            Recipient::Device => {
                (self.config.self_powered as u16) | ((self.ep0.remote_wakeup() as u16) << 1)
            }
            Recipient::Endpoint => {
                let target = EndpointAddress::from_raw(index as u8);
                if self.validate_endpoint(target).is_err() {
                    self.ep0_stall();
                    return;
                }
                self.is_halted(target.number(), target.is_in()) as u16
            }
            _ => 0,
        };
        let bytes = status.to_le_bytes();
        if self
            .ep0_reply(bytes.len(), |buffer| buffer.copy_from_slice(&bytes))
            .is_err()
        {
            self.ep0_stall();
        }
    }

    fn test_mode(&self, selector: u8) {
        if self.prime_status(true).is_err() {
            self.ep0_stall();
        }

        let bit = endpoint_bit(0, true);
        let _ = self.poll(self.config.test_mode_ack_timeout_us, "test mode ack", || {
            self.hw.bits(ENDPTCOMPLETE) & bit != 0
        });
        self.hw.set(ENDPTCOMPLETE, bit);
        // Take the acknowledgement back so the control buffer is free.
        self.nuke(0, TransferError::Shutdown);

        let ptc = match selector {
            1 => PortStatus::PTC::JState,
            2 => PortStatus::PTC::KState,
            3 => PortStatus::PTC::Se0Nak,
            4 => PortStatus::PTC::Packet,
            5 => PortStatus::PTC::ForceEnable,
            _ => {
                debug!("chipidea: unknown test mode {}", selector);
                self.ep0_stall();
                return;
            }
        };
        if selector == 4
            && self
                .ep0_reply(TEST_PACKET.len(), |buffer| buffer.copy_from_slice(&TEST_PACKET))
                .is_err()
        {
            self.ep0_stall();
            return;
        }

        self.hw.modify(PORTSC1, ptc);
        debug!(
            "chipidea: entering test mode {}, power cycle to exit",
            selector
        );
    }

    /// A request on endpoint 0 finished; move the control transfer along.
    fn ep0_complete(&self, slot: usize, result: Result<(), TransferError>) {
        let state = self.ep0.state();
        self.retire(slot, result);

        match state {
            Ep0State::DataXmit => {
                if self.prime_status(false).is_err() {
                    self.ep0_stall();
                }
            }
            Ep0State::DataRecv => {
                if self.prime_status(true).is_err() {
                    self.ep0_stall();
                }
            }
            Ep0State::WaitForOutStatus => {
                if let Some(address) = self.ep0.take_pending_address() {
                    self.hw
                        .write(DEVICEADDR, DeviceAddress::USBADR.val(address as u32));
                    self.usb_state.set(if address == 0 {
                        DeviceState::Default
                    } else {
                        DeviceState::Address
                    });
                }
                self.ep0.set_state(Ep0State::WaitForSetup);
            }
            Ep0State::WaitForSetup => debug!("chipidea: unexpected ep0 packet"),
            Ep0State::Stalled => self.ep0_stall(),
        }
    }

    // Interrupts

    /// Services the controller interrupt.
    pub fn handle_interrupt(&self) {
        if self.stopped.get() {
            return;
        }

        let pending = self.hw.get(USBSTS).get() & self.hw.get(USBINTR).get();
        self.hw.set(USBSTS, pending);
        let status: LocalRegisterCopy<u32, Interrupt::Register> = LocalRegisterCopy::new(pending);

        if self.usb_state.get() == DeviceState::Suspended
            && !self.hw.get(PORTSC1).is_set(PortStatus::SUSP)
        {
            self.bus_resume();
        }

        if status.is_set(Interrupt::UI) {
            if self.hw.bits(ENDPTSETUPSTAT) & endpoint_bit(0, false) != 0 {
                self.setup_received();
            }
            if self.hw.bits(ENDPTCOMPLETE) != 0 {
                self.transfers_complete();
            }
        }
        if status.is_set(Interrupt::PCI) {
            self.port_change();
        }
        if status.is_set(Interrupt::URI) {
            self.bus_reset();
        }
        if status.is_set(Interrupt::SLI) {
            self.suspend();
        }
        if status.is_set(Interrupt::UEI) || status.is_set(Interrupt::SEI) {
            debug!("chipidea: error interrupt, USBSTS {:#x}", pending);
        }
    }

    fn transfers_complete(&self) {
        let complete = self.hw.bits(ENDPTCOMPLETE);
        self.hw.set(ENDPTCOMPLETE, complete);
        if complete == 0 {
            return;
        }
        self.hw.read_barrier();

        for number in 0..self.num_endpoints.get() {
            for is_in in [false, true] {
                if complete & endpoint_bit(number, is_in) == 0 {
                    continue;
                }
                let queue = queue_index(EndpointAddress::new(number, endpoint::direction(is_in)));
                if self.endpoints[queue].notifying.get() {
                    continue;
                }
                if number == 0 {
                    self.process_ep0();
                } else {
                    self.process_queue(queue, number, is_in);
                }
            }
        }
    }

    fn check(&self, slot: usize) -> ChainStatus {
        let request = self.requests.get(slot);
        match request.chain.get() {
            Some(chain) => inspect_chain(
                self.pool,
                &chain,
                request.length.get(),
                self.config.max_descriptor_payload,
                request.is_in.get(),
            ),
            None => ChainStatus::Complete {
                actual: 0,
                trailing_active: false,
            },
        }
    }

    /// Retires the finished requests at the front of a queue.
    fn process_queue(&self, queue: usize, number: usize, is_in: bool) {
        let ep = &self.endpoints[queue];
        while let Some(slot) = ep.head() {
            match self.finish(slot, number, is_in) {
                Some(Ok(())) => self.retire(slot, Ok(())),
                Some(Err(error)) => {
                    self.retire(slot, Err(error));
                    break;
                }
                None => break,
            }
        }
    }

    /// Endpoint 0 retires at most one request per interrupt.
    fn process_ep0(&self) {
        if let Some(slot) = self.endpoints[0].head() {
            let is_in = self.requests.get(slot).is_in.get();
            if let Some(result) = self.finish(slot, 0, is_in) {
                self.ep0_complete(slot, result);
            }
        }
    }

    /// Reads back a request's chain. Returns `None` while it is still in
    /// progress, otherwise records the transferred length and the result.
    fn finish(&self, slot: usize, number: usize, is_in: bool) -> Option<Result<(), TransferError>> {
        let request = self.requests.get(slot);
        match self.check(slot) {
            ChainStatus::Active => None,
            ChainStatus::Failed { actual, error } => {
                request.actual.set(actual);
                if error == TransferError::Stalled {
                    self.qhs.get(number, is_in).clear_errors();
                }
                Some(Err(error))
            }
            ChainStatus::Complete {
                actual,
                trailing_active,
            } => {
                request.actual.set(actual);
                if trailing_active {
                    // The rest of the chain would swallow the next packets.
                    let _ = self.fifo_flush(number, is_in);
                    let next = request
                        .next()
                        .map(|next| self.requests.get(next))
                        .filter(|next| next.is_in.get() == is_in)
                        .and_then(|next| next.chain.get());
                    if let Some(next) = next {
                        self.prime(number, is_in, self.pool.dma_address(next.head()));
                    }
                }
                Some(Ok(()))
            }
        }
    }

    fn port_change(&self) {
        let portsc = self.hw.get(PORTSC1);
        if !portsc.is_set(PortStatus::PR) {
            let speed = match portsc.read_as_enum(PortStatus::PSPD) {
                Some(PortStatus::PSPD::Value::High) => DeviceSpeed::High,
                Some(PortStatus::PSPD::Value::Full) => DeviceSpeed::Full,
                Some(PortStatus::PSPD::Value::Low) => DeviceSpeed::Low,
                None => DeviceSpeed::Unknown,
            };
            self.speed.set(speed);
        }
        if self.resume_state.is_none() {
            self.usb_state.set(DeviceState::Default);
        }
    }

    fn bus_reset(&self) {
        self.hw.modify(DEVICEADDR, DeviceAddress::USBADR::CLEAR);
        self.resume_state.clear();
        self.ep0.reset();

        self.hw.set(ENDPTSETUPSTAT, self.hw.bits(ENDPTSETUPSTAT));
        self.hw.set(ENDPTCOMPLETE, self.hw.bits(ENDPTCOMPLETE));
        let _ = self.poll(self.config.prime_drain_timeout_us, "prime drain", || {
            self.hw.bits(ENDPTPRIME) == 0
        });
        self.hw.set(ENDPTFLUSH, 0xffff_ffff);

        let port_reset = self.hw.get(PORTSC1).is_set(PortStatus::PR);
        match self.config.reset_policy {
            ResetPolicy::InspectPortReset if !port_reset => {
                if CONFIG.trace_setup {
                    debug_verbose!("chipidea: controller reset");
                }
                if self.setup().is_err() {
                    return;
                }
                self.reset_queues();
                self.ep0_setup();
                self.run();
                self.usb_state.set(DeviceState::Attached);
            }
            _ => {
                if CONFIG.trace_setup {
                    debug_verbose!("chipidea: bus reset");
                }
                self.reset_queues();
                self.usb_state.set(DeviceState::Default);
            }
        }
    }

    fn suspend(&self) {
        // SLI repeats while the bus stays idle.
        if self.usb_state.get() == DeviceState::Suspended {
            return;
        }
        self.resume_state.set(self.usb_state.get());
        self.usb_state.set(DeviceState::Suspended);
        self.client.map(|client| client.suspend());
    }

    fn bus_resume(&self) {
        let state = self.resume_state.take().unwrap_or(DeviceState::Default);
        self.usb_state.set(state);
        self.client.map(|client| client.resume());
    }
}

impl<'a, H: UdcHardware> UsbDeviceController<'a> for Udc<'a, H> {
    fn set_client(&self, client: &'a dyn DeviceClient<'a>) {
        self.client.set(client);
    }

    fn endpoint_enable(&self, descriptor: &EndpointDescriptor) -> Result<(), ErrorCode> {
        let address = descriptor.endpoint_address;
        let number = address.number();
        if number == 0 || number >= self.num_endpoints.get() {
            return Err(ErrorCode::INVAL);
        }
        let ep = &self.endpoints[queue_index(address)];
        if ep.enabled.get() {
            return Err(ErrorCode::INVAL);
        }
        if self.speed.get() == DeviceSpeed::Unknown {
            return Err(ErrorCode::OFF);
        }

        let max_packet = descriptor.max_packet_size & 0x7ff;
        let mult = match descriptor.transfer_type {
            TransferType::Isochronous => 1 + ((descriptor.max_packet_size >> 11) & 0x3) as u32,
            _ => 0,
        };
        if max_packet == 0 || mult > 3 {
            return Err(ErrorCode::INVAL);
        }

        let control = descriptor.transfer_type == TransferType::Control;
        self.qhs
            .get(number, address.is_in())
            .configure(max_packet, mult, control, false);

        let kind = descriptor.transfer_type as u32;
        let ctrl = endptctrl(number);
        match (address.is_in(), control) {
            (true, false) => self.hw.modify(
                ctrl,
                EndpointControl::TXE::SET
                    + EndpointControl::TXR::SET
                    + EndpointControl::TXT.val(kind),
            ),
            (true, true) => self.hw.modify(
                ctrl,
                EndpointControl::TXE::SET + EndpointControl::TXT.val(kind),
            ),
            (false, false) => self.hw.modify(
                ctrl,
                EndpointControl::RXE::SET
                    + EndpointControl::RXR::SET
                    + EndpointControl::RXT.val(kind),
            ),
            (false, true) => self.hw.modify(
                ctrl,
                EndpointControl::RXE::SET + EndpointControl::RXT.val(kind),
            ),
        }

        ep.address.set(address);
        ep.transfer_type.set(descriptor.transfer_type);
        ep.max_packet.set(max_packet as usize);
        ep.enabled.set(true);
        ep.stopped.set(false);
        Ok(())
    }

    fn endpoint_disable(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        if endpoint.number() == 0 {
            return Err(ErrorCode::INVAL);
        }
        let ep = self.validate_endpoint(endpoint)?;
        let ctrl = endptctrl(endpoint.number());
        if endpoint.is_in() {
            self.hw.modify(ctrl, EndpointControl::TXE::CLEAR);
        } else {
            self.hw.modify(ctrl, EndpointControl::RXE::CLEAR);
        }
        self.nuke(queue_index(endpoint), TransferError::Shutdown);
        ep.reset();
        Ok(())
    }

    fn request_submit(
        &self,
        endpoint: EndpointAddress,
        buffer: &'a mut [u8],
        length: usize,
        flags: RequestFlags,
    ) -> Result<RequestId, (ErrorCode, &'a mut [u8])> {
        self.submit(endpoint, buffer, length, flags)
    }

    fn request_cancel(&self, endpoint: EndpointAddress, id: RequestId) -> Result<(), ErrorCode> {
        self.dequeue(endpoint, id)
    }

    fn endpoint_set_halt(&self, endpoint: EndpointAddress, halt: bool) -> Result<(), ErrorCode> {
        self.set_halt(endpoint, halt)
    }

    fn endpoint_fifo_flush(&self, endpoint: EndpointAddress) {
        if self.validate_endpoint(endpoint).is_ok() {
            let _ = self.fifo_flush(endpoint.number(), endpoint.is_in());
        }
    }

    fn frame_number(&self) -> u16 {
        self.hw.get(FRINDEX).read(FrameIndex::FRINDEX) as u16
    }

    fn wakeup(&self) -> Result<(), ErrorCode> {
        if !self.ep0.remote_wakeup() {
            return Err(ErrorCode::NOSUPPORT);
        }
        if self.hw.get(PORTSC1).is_set(PortStatus::SUSP) {
            self.hw.modify(PORTSC1, PortStatus::FPR::SET);
        }
        Ok(())
    }

    fn pullup(&self, on: bool) {
        self.softconnect.set(on);
        self.connect_if_allowed();
    }

    fn vbus_session(&self, active: bool) {
        self.vbus_active.set(active);
        self.connect_if_allowed();
    }

    fn speed(&self) -> DeviceSpeed {
        self.speed.get()
    }

    fn device_state(&self) -> DeviceState {
        self.usb_state.get()
    }
}

impl<'a, H: UdcHardware> Udc<'a, H> {
    fn connect_if_allowed(&self) {
        if self.can_connect() {
            self.hw.modify(USBCMD, Command::RS::SET);
        } else {
            self.hw.modify(USBCMD, Command::RS::CLEAR);
        }
    }
}
