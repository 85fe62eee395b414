// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Device-mode register map and the hardware access trait.
//!
//! Offsets are relative to the start of the controller block, so the
//! capability registers begin at `0x100` and the operational registers at
//! `0x140`, as in the i.MX and Tegra reference manuals.

use core::marker::PhantomData;
use core::sync::atomic::{fence, Ordering};

use kernel::hil::usb::TransferDirection;
use kernel::utilities::registers::{register_bitfields, FieldValue, LocalRegisterCopy, RegisterLongName};

use crate::descriptors::Dqh;

/// A 32-bit register at a fixed offset, typed with its bitfields.
pub struct Register<R: RegisterLongName = ()> {
    offset: usize,
    name: &'static str,
    associated_register: PhantomData<R>,
}

impl<R: RegisterLongName> Register<R> {
    pub const fn new(offset: usize, name: &'static str) -> Self {
        Register {
            offset,
            name,
            associated_register: PhantomData,
        }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<R: RegisterLongName> Clone for Register<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: RegisterLongName> Copy for Register<R> {}

pub const DCIVERSION: Register = Register::new(0x120, "DCIVERSION");
pub const DCCPARAMS: Register<CapabilityParams::Register> = Register::new(0x124, "DCCPARAMS");
pub const USBCMD: Register<Command::Register> = Register::new(0x140, "USBCMD");
pub const USBSTS: Register<Interrupt::Register> = Register::new(0x144, "USBSTS");
pub const USBINTR: Register<Interrupt::Register> = Register::new(0x148, "USBINTR");
pub const FRINDEX: Register<FrameIndex::Register> = Register::new(0x14c, "FRINDEX");
pub const DEVICEADDR: Register<DeviceAddress::Register> = Register::new(0x154, "DEVICEADDR");
pub const ENDPOINTLISTADDR: Register = Register::new(0x158, "ENDPOINTLISTADDR");
pub const PORTSC1: Register<PortStatus::Register> = Register::new(0x184, "PORTSC1");
pub const OTGSC: Register = Register::new(0x1a4, "OTGSC");
pub const USBMODE: Register<Mode::Register> = Register::new(0x1a8, "USBMODE");
pub const ENDPTSETUPSTAT: Register = Register::new(0x1ac, "ENDPTSETUPSTAT");
pub const ENDPTPRIME: Register = Register::new(0x1b0, "ENDPTPRIME");
pub const ENDPTFLUSH: Register = Register::new(0x1b4, "ENDPTFLUSH");
pub const ENDPTSTATUS: Register = Register::new(0x1b8, "ENDPTSTATUS");
pub const ENDPTCOMPLETE: Register = Register::new(0x1bc, "ENDPTCOMPLETE");

const ENDPTCTRL_BASE: usize = 0x1c0;

/// Endpoints the register map has room for.
pub const MAX_ENDPOINTS: usize = 16;

pub const fn endptctrl(endpoint: usize) -> Register<EndpointControl::Register> {
    Register::new(ENDPTCTRL_BASE + 4 * endpoint, "ENDPTCTRL")
}

/// Bit of one endpoint direction in `ENDPTSETUPSTAT`, `ENDPTPRIME`,
/// `ENDPTFLUSH`, `ENDPTSTATUS` and `ENDPTCOMPLETE`.
pub const fn endpoint_bit(endpoint: usize, is_in: bool) -> u32 {
    if is_in {
        1 << (endpoint + 16)
    } else {
        1 << endpoint
    }
}

register_bitfields![u32,
    pub CapabilityParams [
        /// Number of endpoints
        DEN OFFSET(0) NUMBITS(5) [],
        /// Device capable
        DC OFFSET(7) NUMBITS(1) [],
        /// Host capable
        HC OFFSET(8) NUMBITS(1) []
    ],
    pub Command [
        /// Interrupt threshold, in microframes
        ITC OFFSET(16) NUMBITS(8) [],
        /// Add dTD tripwire
        ATDTW OFFSET(14) NUMBITS(1) [],
        /// Setup tripwire
        SUTW OFFSET(13) NUMBITS(1) [],
        RST OFFSET(1) NUMBITS(1) [],
        /// Run/stop
        RS OFFSET(0) NUMBITS(1) []
    ],
    // Layout shared by `USBSTS` (status) and `USBINTR` (enables).
    pub Interrupt [
        /// DCSuspend
        SLI OFFSET(8) NUMBITS(1) [],
        /// SOF received
        SRI OFFSET(7) NUMBITS(1) [],
        /// USB reset received
        URI OFFSET(6) NUMBITS(1) [],
        /// System error
        SEI OFFSET(4) NUMBITS(1) [],
        /// Frame list rollover
        FRI OFFSET(3) NUMBITS(1) [],
        /// Port change detect
        PCI OFFSET(2) NUMBITS(1) [],
        /// USB error
        UEI OFFSET(1) NUMBITS(1) [],
        /// USB transaction complete or setup
        UI OFFSET(0) NUMBITS(1) []
    ],
    pub FrameIndex [
        FRINDEX OFFSET(0) NUMBITS(14) []
    ],
    pub DeviceAddress [
        USBADR OFFSET(25) NUMBITS(7) [],
        /// Address advance
        USBADRA OFFSET(24) NUMBITS(1) []
    ],
    pub PortStatus [
        /// Transceiver select
        PTS OFFSET(30) NUMBITS(2) [
            Utmi = 0,
            Phillips = 1,
            Ulpi = 2,
            Serial = 3
        ],
        /// Transceiver width
        PTW OFFSET(28) NUMBITS(1) [
            Eight = 0,
            Sixteen = 1
        ],
        /// Port speed
        PSPD OFFSET(26) NUMBITS(2) [
            Full = 0,
            Low = 1,
            High = 2
        ],
        /// Port test control
        PTC OFFSET(16) NUMBITS(4) [
            Disabled = 0,
            JState = 1,
            KState = 2,
            Se0Nak = 3,
            Packet = 4,
            ForceEnable = 5
        ],
        /// High-speed port
        HSP OFFSET(9) NUMBITS(1) [],
        /// Port reset
        PR OFFSET(8) NUMBITS(1) [],
        SUSP OFFSET(7) NUMBITS(1) [],
        /// Force port resume
        FPR OFFSET(6) NUMBITS(1) [],
        /// Port enabled
        PE OFFSET(2) NUMBITS(1) [],
        /// Current connect status
        CCS OFFSET(0) NUMBITS(1) []
    ],
    pub Mode [
        /// Stream disable
        SDIS OFFSET(4) NUMBITS(1) [],
        /// Setup lockout off
        SLOM OFFSET(3) NUMBITS(1) [],
        /// Big-endian descriptors
        ES OFFSET(2) NUMBITS(1) [],
        /// Controller mode
        CM OFFSET(0) NUMBITS(2) [
            Idle = 0,
            Device = 2,
            Host = 3
        ]
    ],
    pub EndpointControl [
        TXE OFFSET(23) NUMBITS(1) [],
        /// TX data toggle reset
        TXR OFFSET(22) NUMBITS(1) [],
        TXT OFFSET(18) NUMBITS(2) [
            Control = 0,
            Isochronous = 1,
            Bulk = 2,
            Interrupt = 3
        ],
        TXS OFFSET(16) NUMBITS(1) [],
        RXE OFFSET(7) NUMBITS(1) [],
        RXR OFFSET(6) NUMBITS(1) [],
        RXT OFFSET(2) NUMBITS(2) [
            Control = 0,
            Isochronous = 1,
            Bulk = 2,
            Interrupt = 3
        ],
        RXS OFFSET(0) NUMBITS(1) []
    ]
];

/// Retry bound for the ATDTW and SUTW handshakes. Each try is a handful of
/// register accesses, so this only trips on a wedged controller.
pub const HANDSHAKE_RETRIES: usize = 1000;

/// Access to one controller instance.
///
/// The controller core never touches memory-mapped registers directly; it
/// reads and writes 32-bit values at the offsets above through this trait,
/// asks the platform to make buffers visible to the DMA engine and waits
/// through [`UdcHardware::delay_us`], which doubles as the timeout clock for
/// every polling loop.
pub trait UdcHardware {
    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);

    /// Makes `buffer` visible to the controller and returns its bus address.
    fn dma_map(&self, buffer: &[u8], direction: TransferDirection) -> u32;

    fn dma_unmap(&self, address: u32, length: usize, direction: TransferDirection);

    fn delay_us(&self, us: u32);

    /// Orders descriptor memory writes before subsequent register writes.
    fn write_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Orders a read of hardware-written descriptor memory before the reads
    /// that depend on it.
    fn read_barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Called after a dTD was linked behind the tail of an endpoint chain
    /// that the controller is not known to be priming. Returns whether the
    /// controller is still executing the chain, in which case it will pick
    /// the new dTD up by itself. When this returns `false` the caller primes
    /// the endpoint again.
    ///
    /// The answer must come from a stable snapshot: the controller may
    /// retire the old tail while it is being sampled.
    fn link_observed(&self, mask: u32) -> bool {
        add_dtd_tripwire(self, mask)
    }

    /// Copies the SETUP packet of endpoint 0 out of its queue head. The copy
    /// must not mix two packets if a new SETUP lands while copying.
    fn read_setup_packet(&self, qh: &Dqh) -> [u8; 8] {
        setup_tripwire(self, qh)
    }
}

/// Typed register access on top of [`UdcHardware`].
pub trait RegisterAccess {
    fn get<R: RegisterLongName>(&self, reg: Register<R>) -> LocalRegisterCopy<u32, R>;

    fn set<R: RegisterLongName>(&self, reg: Register<R>, value: u32);

    fn write<R: RegisterLongName>(&self, reg: Register<R>, field: FieldValue<u32, R>) {
        let mut value = LocalRegisterCopy::new(0);
        value.write(field);
        self.set(reg, value.get());
    }

    fn modify<R: RegisterLongName>(&self, reg: Register<R>, field: FieldValue<u32, R>) {
        let mut current = self.get(reg);
        current.modify(field);
        self.set(reg, current.get());
    }

    /// Raw value of an endpoint bitmask register.
    fn bits(&self, reg: Register) -> u32 {
        self.get(reg).get()
    }
}

impl<H: UdcHardware + ?Sized> RegisterAccess for H {
    fn get<R: RegisterLongName>(&self, reg: Register<R>) -> LocalRegisterCopy<u32, R> {
        LocalRegisterCopy::new(self.read32(reg.offset))
    }

    fn set<R: RegisterLongName>(&self, reg: Register<R>, value: u32) {
        self.write32(reg.offset, value);
    }
}

/// `link_observed` for controllers with the ATDTW semaphore bit.
///
/// Setting ATDTW and sampling `ENDPTSTATUS` is repeated until ATDTW reads
/// back set: the controller clears it whenever it touches the endpoint
/// queues, which would make the sample stale.
pub fn add_dtd_tripwire<H: UdcHardware + ?Sized>(hw: &H, mask: u32) -> bool {
    let mut status = 0;
    for _ in 0..HANDSHAKE_RETRIES {
        hw.modify(USBCMD, Command::ATDTW::SET);
        status = hw.bits(ENDPTSTATUS) & mask;
        if hw.get(USBCMD).is_set(Command::ATDTW) {
            break;
        }
    }
    hw.modify(USBCMD, Command::ATDTW::CLEAR);
    status != 0
}

/// `read_setup_packet` for controllers with the SUTW semaphore bit.
///
/// The controller clears SUTW when a new SETUP packet lands in the queue
/// head, so the copy is repeated until SUTW survives it.
pub fn setup_tripwire<H: UdcHardware + ?Sized>(hw: &H, qh: &Dqh) -> [u8; 8] {
    let mut packet = [0; 8];
    for _ in 0..HANDSHAKE_RETRIES {
        hw.modify(USBCMD, Command::SUTW::SET);
        hw.read_barrier();
        packet = qh.setup_packet();
        if hw.get(USBCMD).is_set(Command::SUTW) {
            break;
        }
    }
    hw.modify(USBCMD, Command::SUTW::CLEAR);
    packet
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::FakeHardware;

    #[test]
    fn endpoint_bits_split_directions() {
        assert_eq!(endpoint_bit(0, false), 0x0000_0001);
        assert_eq!(endpoint_bit(0, true), 0x0001_0000);
        assert_eq!(endpoint_bit(3, true), 0x0008_0000);
        assert_eq!(endptctrl(2).offset(), 0x1c8);
    }

    #[test]
    fn modify_preserves_other_fields() {
        let hw = FakeHardware::new();
        hw.write(USBCMD, Command::RS::SET + Command::ITC.val(8));
        hw.modify(USBCMD, Command::SUTW::SET);
        let cmd = hw.get(USBCMD);
        assert!(cmd.is_set(Command::RS));
        assert!(cmd.is_set(Command::SUTW));
        assert_eq!(cmd.read(Command::ITC), 8);
    }

    #[test]
    fn add_dtd_tripwire_retries_until_stable() {
        let hw = FakeHardware::new();
        hw.poke(ENDPTSTATUS, endpoint_bit(1, true));
        hw.atdtw_clears.set(2);
        assert!(add_dtd_tripwire(&hw, endpoint_bit(1, true)));
        assert_eq!(hw.atdtw_sets.get(), 3);
        assert!(!hw.get(USBCMD).is_set(Command::ATDTW));
        assert!(!add_dtd_tripwire(&hw, endpoint_bit(2, false)));
    }
}
