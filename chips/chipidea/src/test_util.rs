// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Test doubles: a register-level model of the controller, a DMA engine that
//! retires dTD chains the way the controller does, and a recording client.

use core::cell::{Cell, RefCell};
use std::boxed::Box;
use std::vec::Vec;

use kernel::hil::usb::{
    DeviceClient, EndpointAddress, RequestFlags, RequestId, SetupData, TransferDirection,
    TransferError, UsbDeviceController,
};
use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::utilities::registers::RegisterLongName;
use kernel::ErrorCode;

use crate::descriptors::{Dtd, QueueHeadList};
use crate::pool::DtdPool;
use crate::registers::*;
use crate::{Udc, UdcConfig};

const REGISTER_BASE: usize = 0x100;
const REGISTER_WORDS: usize = 64;

/// Register file of one controller.
///
/// Models the behavior the driver depends on: `USBCMD.RST` self-clears,
/// `USBSTS`, `ENDPTSETUPSTAT` and `ENDPTCOMPLETE` are write-1-to-clear,
/// writing `ENDPTPRIME` marks the endpoint active in `ENDPTSTATUS` and
/// writing `ENDPTFLUSH` clears it. Both always read back zero.
pub(crate) struct FakeHardware {
    regs: RefCell<[u32; REGISTER_WORDS]>,
    /// Every register write, in order.
    pub writes: RefCell<Vec<(usize, u32)>>,
    pub primes: RefCell<Vec<u32>>,
    pub flushes: RefCell<Vec<u32>>,
    /// `USBCMD.RST` never clears.
    pub reset_sticks: Cell<bool>,
    /// `USBCMD.RS` never latches.
    pub run_sticks: Cell<bool>,
    /// `ENDPTSTATUS` keeps its bits across a flush.
    pub flush_sticks: Cell<bool>,
    /// Number of `USBCMD` reads that find ATDTW cleared by the controller.
    pub atdtw_clears: Cell<usize>,
    pub atdtw_sets: Cell<usize>,
    /// Number of `USBCMD` reads that find SUTW cleared by a new SETUP.
    pub sutw_clears: Cell<usize>,
    pub sutw_sets: Cell<usize>,
    /// `ENDPTCOMPLETE` bits raised on the next delay.
    pub complete_on_delay: Cell<u32>,
    pub elapsed_us: Cell<u64>,
    next_dma: Cell<u32>,
    pub mapped: Cell<usize>,
    pub unmapped: Cell<usize>,
    /// Contents of every buffer mapped for transmission.
    pub transmitted: RefCell<Vec<Vec<u8>>>,
}

impl FakeHardware {
    pub(crate) fn new() -> FakeHardware {
        let hw = FakeHardware {
            regs: RefCell::new([0; REGISTER_WORDS]),
            writes: RefCell::new(Vec::new()),
            primes: RefCell::new(Vec::new()),
            flushes: RefCell::new(Vec::new()),
            reset_sticks: Cell::new(false),
            run_sticks: Cell::new(false),
            flush_sticks: Cell::new(false),
            atdtw_clears: Cell::new(0),
            atdtw_sets: Cell::new(0),
            sutw_clears: Cell::new(0),
            sutw_sets: Cell::new(0),
            complete_on_delay: Cell::new(0),
            elapsed_us: Cell::new(0),
            next_dma: Cell::new(0x8000_0000),
            mapped: Cell::new(0),
            unmapped: Cell::new(0),
            transmitted: RefCell::new(Vec::new()),
        };
        // Device capable, four endpoints.
        hw.poke(DCCPARAMS, (1 << 7) | (1 << 8) | 4);
        hw
    }

    fn index(offset: usize) -> usize {
        (offset - REGISTER_BASE) / 4
    }

    fn raw(&self, offset: usize) -> u32 {
        self.regs.borrow()[Self::index(offset)]
    }

    fn store(&self, offset: usize, value: u32) {
        self.regs.borrow_mut()[Self::index(offset)] = value;
    }

    /// Sets a register without going through the write side effects.
    pub(crate) fn poke<R: RegisterLongName>(&self, reg: Register<R>, value: u32) {
        self.store(reg.offset(), value);
    }

    pub(crate) fn peek<R: RegisterLongName>(&self, reg: Register<R>) -> u32 {
        self.raw(reg.offset())
    }

    /// Raises bits the way the controller does.
    pub(crate) fn raise<R: RegisterLongName>(&self, reg: Register<R>, bits: u32) {
        self.store(reg.offset(), self.raw(reg.offset()) | bits);
    }

    pub(crate) fn lower<R: RegisterLongName>(&self, reg: Register<R>, bits: u32) {
        self.store(reg.offset(), self.raw(reg.offset()) & !bits);
    }

    pub(crate) fn writes_to<R: RegisterLongName>(&self, reg: Register<R>) -> usize {
        self.writes
            .borrow()
            .iter()
            .filter(|(offset, _)| *offset == reg.offset())
            .count()
    }
}

impl UdcHardware for FakeHardware {
    fn read32(&self, offset: usize) -> u32 {
        let value = self.raw(offset);
        if offset == USBCMD.offset() {
            if value & (1 << 14) != 0 && self.atdtw_clears.get() > 0 {
                self.atdtw_clears.set(self.atdtw_clears.get() - 1);
                self.store(offset, value & !(1 << 14));
                return value & !(1 << 14);
            }
            if value & (1 << 13) != 0 && self.sutw_clears.get() > 0 {
                self.sutw_clears.set(self.sutw_clears.get() - 1);
                self.store(offset, value & !(1 << 13));
                return value & !(1 << 13);
            }
        }
        value
    }

    fn write32(&self, offset: usize, value: u32) {
        self.writes.borrow_mut().push((offset, value));
        if offset == USBCMD.offset() {
            if value & (1 << 14) != 0 {
                self.atdtw_sets.set(self.atdtw_sets.get() + 1);
            }
            if value & (1 << 13) != 0 {
                self.sutw_sets.set(self.sutw_sets.get() + 1);
            }
            let value = if self.reset_sticks.get() {
                value
            } else {
                value & !(1 << 1)
            };
            let value = if self.run_sticks.get() {
                value & !1
            } else {
                value
            };
            self.store(offset, value);
        } else if offset == USBSTS.offset()
            || offset == ENDPTSETUPSTAT.offset()
            || offset == ENDPTCOMPLETE.offset()
        {
            self.store(offset, self.raw(offset) & !value);
        } else if offset == ENDPTPRIME.offset() {
            self.primes.borrow_mut().push(value);
            self.raise(ENDPTSTATUS, value);
        } else if offset == ENDPTFLUSH.offset() {
            self.flushes.borrow_mut().push(value);
            if !self.flush_sticks.get() {
                self.lower(ENDPTSTATUS, value);
            }
        } else {
            self.store(offset, value);
        }
    }

    fn dma_map(&self, buffer: &[u8], direction: TransferDirection) -> u32 {
        let address = self.next_dma.get();
        let span = (buffer.len() as u32 + 0xfff) & !0xfff;
        self.next_dma.set(address + span + 0x1000);
        self.mapped.set(self.mapped.get() + 1);
        if direction == TransferDirection::DeviceToHost {
            self.transmitted.borrow_mut().push(buffer.to_vec());
        }
        address
    }

    fn dma_unmap(&self, _address: u32, _length: usize, _direction: TransferDirection) {
        self.unmapped.set(self.unmapped.get() + 1);
    }

    fn delay_us(&self, us: u32) {
        self.elapsed_us.set(self.elapsed_us.get() + us as u64);
        let bits = self.complete_on_delay.replace(0);
        if bits != 0 {
            self.raise(ENDPTCOMPLETE, bits);
        }
    }
}

/// Executes dTD chains out of the queue heads.
pub(crate) struct DmaEngine<'a> {
    hw: &'a FakeHardware,
    qhs: &'a QueueHeadList,
    pool: &'a DtdPool<'a>,
}

impl<'a> DmaEngine<'a> {
    pub(crate) fn new(
        hw: &'a FakeHardware,
        qhs: &'a QueueHeadList,
        pool: &'a DtdPool<'a>,
    ) -> DmaEngine<'a> {
        DmaEngine { hw, qhs, pool }
    }

    /// Retires the next dTD of a primed endpoint direction, leaving
    /// `remaining` bytes untransferred and raising `errors` in its token.
    /// Returns whether a dTD was retired.
    pub(crate) fn step(&self, endpoint: usize, is_in: bool, remaining: usize, errors: u32) -> bool {
        let bit = endpoint_bit(endpoint, is_in);
        if self.hw.peek(ENDPTSTATUS) & bit == 0 {
            return false;
        }
        let qh = self.qhs.get(endpoint, is_in);
        let next = qh.next_raw();
        if next & 1 != 0 {
            self.hw.lower(ENDPTSTATUS, bit);
            return false;
        }
        let dtd = match self.pool.index_of(next & !0x1f) {
            Some(index) => self.pool.get(index),
            None => return false,
        };
        if !dtd.is_active() {
            return false;
        }

        let interrupt = dtd.interrupt_on_complete();
        dtd.retire(remaining, errors);
        qh.advance(next, dtd.next_raw());

        if errors != 0 || dtd.is_terminated() {
            self.hw.lower(ENDPTSTATUS, bit);
        }
        if errors != 0 {
            self.hw.raise(ENDPTCOMPLETE, bit);
            self.hw.raise(USBSTS, 0b11);
        } else if interrupt || remaining != 0 {
            self.hw.raise(ENDPTCOMPLETE, bit);
            self.hw.raise(USBSTS, 0b1);
        }
        true
    }

    /// Runs an endpoint direction until its chain is exhausted. Returns the
    /// number of dTDs retired.
    pub(crate) fn run(&self, endpoint: usize, is_in: bool) -> usize {
        let mut retired = 0;
        while self.step(endpoint, is_in, 0, 0) {
            retired += 1;
        }
        retired
    }

    /// Lands a SETUP packet in the ep0 OUT queue head.
    pub(crate) fn deliver_setup(&self, packet: [u8; 8]) {
        self.qhs.get(0, false).store_setup_packet(&packet);
        self.hw.raise(ENDPTSETUPSTAT, 1);
        self.hw.raise(USBSTS, 0b1);
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum Event {
    Setup(SetupData),
    Complete {
        endpoint: EndpointAddress,
        id: RequestId,
        actual: usize,
        result: Result<(), TransferError>,
    },
    Disconnect,
    Suspend,
    Resume,
}

/// Client that records everything it is told and keeps returned buffers.
pub(crate) struct RecordingClient<'a> {
    pub events: RefCell<Vec<Event>>,
    pub buffers: RefCell<Vec<&'a mut [u8]>>,
    pub setup_result: Cell<Result<(), ErrorCode>>,
    controller: OptionalCell<&'a dyn UsbDeviceController<'a>>,
    /// Answer for the next SETUP with a data stage: buffer and length.
    reply: TakeCell<'a, [u8]>,
    reply_length: Cell<usize>,
    /// Resubmit every completed buffer on this endpoint with this length.
    pub resubmit: Cell<Option<(EndpointAddress, usize)>>,
    pub resubmitted: RefCell<Vec<Result<RequestId, ErrorCode>>>,
}

impl<'a> RecordingClient<'a> {
    pub(crate) fn new() -> RecordingClient<'a> {
        RecordingClient {
            events: RefCell::new(Vec::new()),
            buffers: RefCell::new(Vec::new()),
            setup_result: Cell::new(Ok(())),
            controller: OptionalCell::empty(),
            reply: TakeCell::empty(),
            reply_length: Cell::new(0),
            resubmit: Cell::new(None),
            resubmitted: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn set_controller(&self, controller: &'a dyn UsbDeviceController<'a>) {
        self.controller.set(controller);
    }

    pub(crate) fn reply_with(&self, buffer: &'a mut [u8], length: usize) {
        self.reply.replace(buffer);
        self.reply_length.set(length);
    }

    pub(crate) fn completions(&self) -> Vec<(RequestId, usize, Result<(), TransferError>)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Complete {
                    id, actual, result, ..
                } => Some((*id, *actual, *result)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, wanted: &Event) -> usize {
        self.events.borrow().iter().filter(|e| *e == wanted).count()
    }
}

impl<'a> DeviceClient<'a> for RecordingClient<'a> {
    fn setup(&self, setup: &SetupData) -> Result<(), ErrorCode> {
        self.events.borrow_mut().push(Event::Setup(*setup));
        let result = self.setup_result.get();
        if result.is_ok() && setup.length != 0 {
            if let Some(buffer) = self.reply.take() {
                self.controller.map(|controller| {
                    let endpoint = EndpointAddress::new(0, setup.request_type.transfer_direction());
                    match controller.request_submit(
                        endpoint,
                        buffer,
                        self.reply_length.get(),
                        RequestFlags::NONE,
                    ) {
                        Ok(_) => {}
                        Err((_, buffer)) => self.buffers.borrow_mut().push(buffer),
                    }
                });
            }
        }
        result
    }

    fn transfer_complete(
        &self,
        endpoint: EndpointAddress,
        id: RequestId,
        buffer: &'a mut [u8],
        actual: usize,
        result: Result<(), TransferError>,
    ) {
        self.events.borrow_mut().push(Event::Complete {
            endpoint,
            id,
            actual,
            result,
        });
        match (self.resubmit.get(), self.controller.get()) {
            (Some((target, length)), Some(controller)) if target == endpoint => {
                match controller.request_submit(endpoint, buffer, length, RequestFlags::NONE) {
                    Ok(id) => self.resubmitted.borrow_mut().push(Ok(id)),
                    Err((e, buffer)) => {
                        self.resubmitted.borrow_mut().push(Err(e));
                        self.buffers.borrow_mut().push(buffer);
                    }
                }
            }
            _ => self.buffers.borrow_mut().push(buffer),
        }
    }

    fn disconnect(&self) {
        self.events.borrow_mut().push(Event::Disconnect);
    }

    fn suspend(&self) {
        self.events.borrow_mut().push(Event::Suspend);
    }

    fn resume(&self) {
        self.events.borrow_mut().push(Event::Resume);
    }
}

pub(crate) const QH_DMA: u32 = 0x1000_0000;
pub(crate) const DTD_DMA: u32 = 0x2000_0000;

/// A started controller wired to the fakes, everything leaked to `'static`.
pub(crate) struct Fixture {
    pub hw: &'static FakeHardware,
    pub qhs: &'static QueueHeadList,
    pub pool: &'static DtdPool<'static>,
    pub udc: &'static Udc<'static, FakeHardware>,
    pub client: &'static RecordingClient<'static>,
    pub dma: DmaEngine<'static>,
}

/// Builds a controller without starting it.
pub(crate) fn controller(config: UdcConfig, descriptors: usize) -> Fixture {
    let hw: &'static FakeHardware = Box::leak(Box::new(FakeHardware::new()));
    let qhs: &'static QueueHeadList = Box::leak(Box::new(QueueHeadList::new()));
    let dtds: &'static [Dtd] = Box::leak(
        (0..descriptors)
            .map(|_| Dtd::new())
            .collect::<Vec<Dtd>>()
            .into_boxed_slice(),
    );
    let pool: &'static DtdPool<'static> = Box::leak(Box::new(DtdPool::new(dtds, DTD_DMA)));
    let ctrl: &'static mut [u8] = Box::leak(Box::new([0u8; 64]));
    let udc: &'static Udc<'static, FakeHardware> =
        Box::leak(Box::new(Udc::new(hw, qhs, QH_DMA, pool, ctrl, config)));
    let client: &'static RecordingClient<'static> = Box::leak(Box::new(RecordingClient::new()));
    client.set_controller(udc);
    udc.set_client(client);
    Fixture {
        hw,
        qhs,
        pool,
        udc,
        client,
        dma: DmaEngine::new(hw, qhs, pool),
    }
}

/// A controller that has been started and has seen the host attach at high
/// speed.
pub(crate) fn started() -> Fixture {
    started_with(UdcConfig::DEFAULT, 32)
}

pub(crate) fn started_with(config: UdcConfig, descriptors: usize) -> Fixture {
    let fixture = controller(config, descriptors);
    fixture.udc.probe().unwrap();
    fixture.udc.start().unwrap();
    fixture.hw.poke(PORTSC1, 2 << 26);
    fixture.hw.raise(USBSTS, 1 << 2);
    fixture.udc.handle_interrupt();
    fixture
}

/// A buffer owned by the test for the rest of the process.
pub(crate) fn buffer(length: usize) -> &'static mut [u8] {
    Box::leak(std::vec![0u8; length].into_boxed_slice())
}

pub(crate) fn ep(number: usize, is_in: bool) -> EndpointAddress {
    EndpointAddress::new(
        number,
        if is_in {
            TransferDirection::DeviceToHost
        } else {
            TransferDirection::HostToDevice
        },
    )
}
