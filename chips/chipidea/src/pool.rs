// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Fixed pool of transfer descriptors.
//!
//! The board hands the driver a slice of [`Dtd`]s in DMA-capable memory
//! together with the bus address of its first element. Free descriptors are
//! threaded through their software link word, so allocation and release are
//! O(1) and need no extra storage.

use core::cell::Cell;

use kernel::debug;
use kernel::utilities::cells::OptionalCell;
use kernel::ErrorCode;

use crate::descriptors::Dtd;

/// Position of a descriptor in its pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DtdIndex(u16);

impl DtdIndex {
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

const LINK_NONE: u32 = 0xffff;
const LINK_INDEX: u32 = 0xffff;
const LINK_FREE: u32 = 1 << 31;

pub struct DtdPool<'a> {
    dtds: &'a [Dtd],
    dma_base: u32,
    free_head: OptionalCell<DtdIndex>,
    available: Cell<usize>,
}

impl<'a> DtdPool<'a> {
    /// `dma_base` is the bus address of `dtds[0]`; it must be 32-byte
    /// aligned. At most 65535 descriptors are used.
    pub fn new(dtds: &'a [Dtd], dma_base: u32) -> DtdPool<'a> {
        let dtds = &dtds[..dtds.len().min(LINK_NONE as usize)];
        let pool = DtdPool {
            dtds,
            dma_base,
            free_head: OptionalCell::empty(),
            available: Cell::new(0),
        };
        for i in (0..dtds.len()).rev() {
            pool.release(DtdIndex(i as u16));
        }
        pool
    }

    pub fn capacity(&self) -> usize {
        self.dtds.len()
    }

    /// Free descriptors left.
    pub fn available(&self) -> usize {
        self.available.get()
    }

    /// Takes a descriptor off the free list. Its chain link is cleared.
    pub fn allocate(&self) -> Result<DtdIndex, ErrorCode> {
        let index = self.free_head.get().ok_or(ErrorCode::NOMEM)?;
        let dtd = &self.dtds[index.get()];
        self.free_head.insert(link_index(dtd.link()));
        dtd.set_link(LINK_NONE);
        self.available.set(self.available.get() - 1);
        Ok(index)
    }

    /// Returns a descriptor to the pool. Releasing a descriptor that is
    /// already free is reported and otherwise ignored.
    pub fn free(&self, index: DtdIndex) {
        if self.dtds[index.get()].link() & LINK_FREE != 0 {
            debug!("chipidea: dTD {} freed twice", index.get());
            return;
        }
        self.release(index);
    }

    fn release(&self, index: DtdIndex) {
        let dtd = &self.dtds[index.get()];
        dtd.terminate();
        let next = self.free_head.get().map_or(LINK_NONE, |i| i.0 as u32);
        dtd.set_link(LINK_FREE | next);
        self.free_head.set(index);
        self.available.set(self.available.get() + 1);
    }

    pub fn get(&self, index: DtdIndex) -> &Dtd {
        &self.dtds[index.get()]
    }

    /// Bus address of a descriptor.
    pub fn dma_address(&self, index: DtdIndex) -> u32 {
        self.dma_base + 32 * index.0 as u32
    }

    /// Inverse of [`DtdPool::dma_address`].
    pub fn index_of(&self, address: u32) -> Option<DtdIndex> {
        let offset = address.checked_sub(self.dma_base)?;
        let index = (offset / 32) as usize;
        if offset % 32 != 0 || index >= self.dtds.len() {
            return None;
        }
        Some(DtdIndex(index as u16))
    }

    /// Software successor of an allocated descriptor within its chain.
    pub fn chain_next(&self, index: DtdIndex) -> Option<DtdIndex> {
        link_index(self.dtds[index.get()].link())
    }

    pub(crate) fn set_chain_next(&self, index: DtdIndex, next: DtdIndex) {
        self.dtds[index.get()].set_link(next.0 as u32);
    }
}

fn link_index(link: u32) -> Option<DtdIndex> {
    match link & LINK_INDEX {
        LINK_NONE => None,
        i => Some(DtdIndex(i as u16)),
    }
}
