// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Endpoint transfer descriptors (dTD) and queue heads (dQH).
//!
//! Both live in memory the controller reads and writes by DMA, so every word
//! is an `InMemoryRegister` and accessed with volatile loads and stores.

use core::cell::Cell;

use kernel::utilities::registers::interfaces::{ReadWriteable, Readable, Writeable};
use kernel::utilities::registers::{register_bitfields, InMemoryRegister};

use crate::registers::MAX_ENDPOINTS;

/// Bytes a single dTD can move: five 4 KiB pages, less the worst-case start
/// offset, rounded down.
pub const DTD_MAX_PAYLOAD: usize = 0x4000;

const PAGE_SIZE: u32 = 0x1000;
const DTD_PAGES: usize = 5;

/// Queue heads per controller: one per endpoint and direction.
pub const QUEUE_HEADS: usize = 2 * MAX_ENDPOINTS;

register_bitfields![u32,
    pub LinkPointer [
        POINTER OFFSET(5) NUMBITS(27) [],
        TERMINATE OFFSET(0) NUMBITS(1) []
    ],
    pub Token [
        TOTAL_BYTES OFFSET(16) NUMBITS(15) [],
        /// Interrupt on completion
        IOC OFFSET(15) NUMBITS(1) [],
        MULTO OFFSET(10) NUMBITS(2) [],
        ACTIVE OFFSET(7) NUMBITS(1) [],
        HALTED OFFSET(6) NUMBITS(1) [],
        DATA_BUFFER_ERROR OFFSET(5) NUMBITS(1) [],
        TRANSACTION_ERROR OFFSET(3) NUMBITS(1) []
    ],
    pub Capabilities [
        MULT OFFSET(30) NUMBITS(2) [],
        /// Zero length termination disable
        ZLT OFFSET(29) NUMBITS(1) [],
        MAX_PACKET_LENGTH OFFSET(16) NUMBITS(11) [],
        /// Interrupt on setup
        IOS OFFSET(15) NUMBITS(1) []
    ]
];

/// Status bits a dTD carries after the controller retired it with an error.
pub const TOKEN_ERRORS: u32 = 0x68;

/// Device transfer descriptor.
#[repr(C, align(32))]
pub struct Dtd {
    next: InMemoryRegister<u32, LinkPointer::Register>,
    token: InMemoryRegister<u32, Token::Register>,
    buffer: [InMemoryRegister<u32>; DTD_PAGES],
    /// Not read by the controller. The pool keeps its free list here and
    /// chains link their dTDs by pool index.
    link: Cell<u32>,
}

const _: () = assert!(core::mem::size_of::<Dtd>() == 32);

impl Dtd {
    pub const fn new() -> Dtd {
        Dtd {
            next: InMemoryRegister::new(1),
            token: InMemoryRegister::new(0),
            buffer: [
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
            ],
            link: Cell::new(0),
        }
    }

    /// Programs the descriptor for `length` bytes at bus address `address`
    /// and arms it. The next pointer is left terminated.
    pub(crate) fn prepare(&self, address: u32, length: usize, interrupt: bool) {
        self.next.write(LinkPointer::TERMINATE::SET);
        let first_page = address & !(PAGE_SIZE - 1);
        for (i, page) in self.buffer.iter().enumerate() {
            if i == 0 {
                page.set(address);
            } else {
                page.set(first_page.wrapping_add(PAGE_SIZE * i as u32));
            }
        }
        let ioc = if interrupt {
            Token::IOC::SET
        } else {
            Token::IOC::CLEAR
        };
        self.token
            .write(Token::TOTAL_BYTES.val(length as u32) + ioc + Token::ACTIVE::SET);
    }

    pub(crate) fn set_next(&self, address: u32) {
        self.next.set(address & !0x1f);
    }

    pub(crate) fn terminate(&self) {
        self.next.write(LinkPointer::TERMINATE::SET);
    }

    pub(crate) fn next_raw(&self) -> u32 {
        self.next.get()
    }

    pub(crate) fn set_next_raw(&self, value: u32) {
        self.next.set(value);
    }

    pub fn is_terminated(&self) -> bool {
        self.next.is_set(LinkPointer::TERMINATE)
    }

    /// Bus address of the next descriptor, ignoring the terminate bit.
    pub fn next_address(&self) -> u32 {
        self.next.get() & !0x1f
    }

    pub fn token(&self) -> u32 {
        self.token.get()
    }

    pub fn is_active(&self) -> bool {
        self.token.is_set(Token::ACTIVE)
    }

    pub fn interrupt_on_complete(&self) -> bool {
        self.token.is_set(Token::IOC)
    }

    /// Bytes still to be transferred.
    pub fn remaining(&self) -> usize {
        self.token.read(Token::TOTAL_BYTES) as usize
    }

    pub fn buffer_pointer(&self, page: usize) -> u32 {
        self.buffer[page].get()
    }

    /// Retires the descriptor the way the controller does: clears ACTIVE,
    /// leaves `remaining` bytes untransferred and raises `errors`.
    #[cfg(test)]
    pub(crate) fn retire(&self, remaining: usize, errors: u32) {
        let token = self.token.get();
        let cleared = token & !(0x7fff_0000 | 0xff);
        self.token
            .set(cleared | ((remaining as u32) << 16) | (errors & 0x7f));
    }

    pub(crate) fn link(&self) -> u32 {
        self.link.get()
    }

    pub(crate) fn set_link(&self, link: u32) {
        self.link.set(link);
    }
}

/// Device queue head.
#[repr(C, align(64))]
pub struct Dqh {
    capabilities: InMemoryRegister<u32, Capabilities::Register>,
    current: InMemoryRegister<u32>,
    next: InMemoryRegister<u32, LinkPointer::Register>,
    token: InMemoryRegister<u32, Token::Register>,
    buffer: [InMemoryRegister<u32>; DTD_PAGES],
    _reserved: InMemoryRegister<u32>,
    setup: [InMemoryRegister<u32>; 2],
    _padding: [InMemoryRegister<u32>; 4],
}

const _: () = assert!(core::mem::size_of::<Dqh>() == 64);

impl Dqh {
    pub const fn new() -> Dqh {
        Dqh {
            capabilities: InMemoryRegister::new(0),
            current: InMemoryRegister::new(0),
            next: InMemoryRegister::new(1),
            token: InMemoryRegister::new(0),
            buffer: [
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
            ],
            _reserved: InMemoryRegister::new(0),
            setup: [InMemoryRegister::new(0), InMemoryRegister::new(0)],
            _padding: [
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
                InMemoryRegister::new(0),
            ],
        }
    }

    /// Resets the queue head for an endpoint with the given max packet size.
    /// `zlt` leaves the controller's automatic zero-length termination on;
    /// the driver disables it and appends zero-length dTDs itself.
    pub(crate) fn configure(&self, max_packet: u16, mult: u32, setup_interrupt: bool, zlt: bool) {
        let mut caps = Capabilities::MAX_PACKET_LENGTH.val(max_packet as u32 & 0x7ff)
            + Capabilities::MULT.val(mult);
        if setup_interrupt {
            caps += Capabilities::IOS::SET;
        }
        if !zlt {
            caps += Capabilities::ZLT::SET;
        }
        self.capabilities.write(caps);
        self.current.set(0);
        self.next.write(LinkPointer::TERMINATE::SET);
        self.token.set(0);
    }

    /// Points the overlay at the first dTD of a chain and clears a stale
    /// ACTIVE or HALTED status so the next prime starts from it.
    pub(crate) fn load(&self, address: u32) {
        self.next.set(address & !0x1f);
        self.token.modify(Token::ACTIVE::CLEAR + Token::HALTED::CLEAR);
    }

    /// Clears the error and halt bits the controller left in the overlay.
    pub(crate) fn clear_errors(&self) {
        let token = self.token.get();
        self.token.set(token & !TOKEN_ERRORS);
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities.get()
    }

    pub fn max_packet(&self) -> usize {
        self.capabilities.read(Capabilities::MAX_PACKET_LENGTH) as usize
    }

    pub fn current(&self) -> u32 {
        self.current.get()
    }

    pub fn next_raw(&self) -> u32 {
        self.next.get()
    }

    pub fn token(&self) -> u32 {
        self.token.get()
    }

    /// Advances the overlay the way the controller does after retiring the
    /// dTD at `current`.
    #[cfg(test)]
    pub(crate) fn advance(&self, current: u32, next: u32) {
        self.current.set(current);
        self.next.set(next);
    }

    #[cfg(test)]
    pub(crate) fn set_token(&self, token: u32) {
        self.token.set(token);
    }

    /// The 8 SETUP bytes, in wire order.
    pub fn setup_packet(&self) -> [u8; 8] {
        let low = self.setup[0].get().to_le_bytes();
        let high = self.setup[1].get().to_le_bytes();
        [
            low[0], low[1], low[2], low[3], high[0], high[1], high[2], high[3],
        ]
    }

    #[cfg(test)]
    pub(crate) fn store_setup_packet(&self, packet: &[u8; 8]) {
        self.setup[0].set(u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]));
        self.setup[1].set(u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]));
    }
}

/// The endpoint list `ENDPOINTLISTADDR` points at.
#[repr(C, align(2048))]
pub struct QueueHeadList {
    heads: [Dqh; QUEUE_HEADS],
}

impl QueueHeadList {
    pub const fn new() -> QueueHeadList {
        QueueHeadList {
            heads: [const { Dqh::new() }; QUEUE_HEADS],
        }
    }

    /// Queue head of an endpoint direction.
    pub fn get(&self, endpoint: usize, is_in: bool) -> &Dqh {
        &self.heads[2 * endpoint + is_in as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prepare_fills_page_pointers() {
        let dtd = Dtd::new();
        dtd.prepare(0x8000_0f00, 0x3000, true);
        assert_eq!(dtd.buffer_pointer(0), 0x8000_0f00);
        assert_eq!(dtd.buffer_pointer(1), 0x8000_1000);
        assert_eq!(dtd.buffer_pointer(4), 0x8000_4000);
        assert_eq!(dtd.remaining(), 0x3000);
        assert!(dtd.is_active());
        assert!(dtd.interrupt_on_complete());
        assert!(dtd.is_terminated());
    }

    #[test]
    fn queue_head_layout() {
        assert_eq!(core::mem::align_of::<QueueHeadList>(), 2048);
        let qh = Dqh::new();
        qh.configure(512, 0, false, false);
        assert_eq!(qh.max_packet(), 512);
        assert_eq!(qh.capabilities() & (1 << 29), 1 << 29);

        qh.store_setup_packet(&[0x80, 6, 0, 1, 0, 0, 0x12, 0]);
        assert_eq!(qh.setup_packet(), [0x80, 6, 0, 1, 0, 0, 0x12, 0]);
    }

    #[test]
    fn load_clears_stale_status() {
        let qh = Dqh::new();
        qh.set_token(0xc0);
        qh.load(0x2000_0040);
        assert_eq!(qh.next_raw(), 0x2000_0040);
        assert_eq!(qh.token() & 0xc0, 0);
    }
}
