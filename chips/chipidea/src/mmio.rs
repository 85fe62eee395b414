// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! [`UdcHardware`] for a controller mapped into the physical address space
//! of a core without an IOMMU or data cache in front of the DMA engine.
//!
//! Chips with caches or address translation wrap the controller in their own
//! `UdcHardware` and do the maintenance in `dma_map` and `dma_unmap`.

use kernel::debug;
use kernel::hil::usb::TransferDirection;

use crate::registers::UdcHardware;

/// The controller's DMA engine takes 32-bit bus addresses. Buffers are
/// handed over at their CPU address, so they must live below 4 GiB.
pub struct MmioHardware {
    base: usize,
    cycles_per_us: u32,
}

impl MmioHardware {
    /// # Safety
    ///
    /// `base` must be the address of a ChipIdea controller block, valid for
    /// volatile 32-bit accesses for as long as the returned value is used,
    /// and no other code may drive the same controller.
    pub const unsafe fn new(base: usize, cycles_per_us: u32) -> MmioHardware {
        MmioHardware {
            base,
            cycles_per_us,
        }
    }

    fn register(&self, offset: usize) -> *mut u32 {
        (self.base + offset) as *mut u32
    }
}

impl UdcHardware for MmioHardware {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `new` guarantees the block is mapped and offsets come from
        // the register map.
        unsafe { core::ptr::read_volatile(self.register(offset)) }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: as for `read32`.
        unsafe { core::ptr::write_volatile(self.register(offset), value) }
    }

    fn dma_map(&self, buffer: &[u8], _direction: TransferDirection) -> u32 {
        let address = buffer.as_ptr() as usize;
        bus_address(address).unwrap_or_else(|| {
            debug!("chipidea: buffer at {:#x} is out of DMA reach", address);
            address as u32
        })
    }

    fn dma_unmap(&self, _address: u32, _length: usize, _direction: TransferDirection) {}

    fn delay_us(&self, us: u32) {
        for _ in 0..us.saturating_mul(self.cycles_per_us) {
            core::hint::spin_loop();
        }
    }
}

fn bus_address(address: usize) -> Option<u32> {
    u32::try_from(address).ok()
}
