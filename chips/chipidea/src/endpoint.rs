// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Request slots and endpoint queues.
//!
//! Requests live in a fixed table owned by the controller. Each endpoint keeps
//! a singly linked FIFO of slot indices, so queueing, cancelling and retiring
//! never allocate. Endpoint 0 owns one queue for both directions; every
//! request records the hardware direction it was queued on.

use core::cell::Cell;

use kernel::hil::usb::{EndpointAddress, RequestFlags, RequestId, TransferDirection, TransferType};
use kernel::utilities::cells::{OptionalCell, TakeCell};

use crate::chain::DtdChain;
use crate::descriptors::QUEUE_HEADS;

/// Requests that can be outstanding across all endpoints.
pub const MAX_REQUESTS: usize = 32;

const SLOT_BITS: u32 = 8;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;

/// Queue of an endpoint address. Both directions of endpoint 0 share queue 0.
pub fn queue_index(endpoint: EndpointAddress) -> usize {
    match endpoint.number() {
        0 => 0,
        n => 2 * n + endpoint.is_in() as usize,
    }
}

pub(crate) fn direction(is_in: bool) -> TransferDirection {
    if is_in {
        TransferDirection::DeviceToHost
    } else {
        TransferDirection::HostToDevice
    }
}

/// One queued transfer.
pub(crate) struct Request<'a> {
    pub(crate) buffer: TakeCell<'a, [u8]>,
    pub(crate) id: Cell<RequestId>,
    in_use: Cell<bool>,
    /// Queue the request sits on.
    pub(crate) queue: Cell<usize>,
    /// Hardware direction the chain was primed on.
    pub(crate) is_in: Cell<bool>,
    pub(crate) length: Cell<usize>,
    pub(crate) actual: Cell<usize>,
    pub(crate) flags: Cell<RequestFlags>,
    /// Queued by the controller itself (status stages, GET_STATUS replies,
    /// test packets). Retired without notifying the client.
    pub(crate) internal: Cell<bool>,
    pub(crate) dma: Cell<u32>,
    pub(crate) chain: OptionalCell<DtdChain>,
    next: OptionalCell<usize>,
}

impl<'a> Request<'a> {
    const fn new() -> Request<'a> {
        Request {
            buffer: TakeCell::empty(),
            id: Cell::new(RequestId::new(0)),
            in_use: Cell::new(false),
            queue: Cell::new(0),
            is_in: Cell::new(false),
            length: Cell::new(0),
            actual: Cell::new(0),
            flags: Cell::new(RequestFlags::NONE),
            internal: Cell::new(false),
            dma: Cell::new(0),
            chain: OptionalCell::empty(),
            next: OptionalCell::empty(),
        }
    }

    /// Request following this one on its queue.
    pub(crate) fn next(&self) -> Option<usize> {
        self.next.get()
    }

    pub(crate) fn direction(&self) -> TransferDirection {
        direction(self.is_in.get())
    }
}

/// The request table.
pub(crate) struct Requests<'a> {
    slots: [Request<'a>; MAX_REQUESTS],
    generation: Cell<u32>,
}

impl<'a> Requests<'a> {
    pub(crate) fn new() -> Requests<'a> {
        Requests {
            slots: core::array::from_fn(|_| Request::new()),
            generation: Cell::new(0),
        }
    }

    /// Claims a free slot and gives it a fresh id.
    pub(crate) fn allocate(&self) -> Option<usize> {
        let slot = self.slots.iter().position(|r| !r.in_use.get())?;
        let generation = self.generation.get().wrapping_add(1) & (u32::MAX >> SLOT_BITS);
        self.generation.set(generation);

        let request = &self.slots[slot];
        request.in_use.set(true);
        request
            .id
            .set(RequestId::new((generation << SLOT_BITS) | slot as u32));
        request.actual.set(0);
        request.internal.set(false);
        request.chain.clear();
        request.next.clear();
        Some(slot)
    }

    pub(crate) fn release(&self, slot: usize) {
        let request = &self.slots[slot];
        request.in_use.set(false);
        request.chain.clear();
        request.next.clear();
    }

    pub(crate) fn get(&self, slot: usize) -> &Request<'a> {
        &self.slots[slot]
    }

    /// Slot of a request that is still outstanding.
    pub(crate) fn find(&self, id: RequestId) -> Option<usize> {
        let slot = (id.raw() & SLOT_MASK) as usize;
        let request = self.slots.get(slot)?;
        if request.in_use.get() && request.id.get() == id {
            Some(slot)
        } else {
            None
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.slots.iter().filter(|r| r.in_use.get()).count()
    }
}

/// Software state of one endpoint direction.
pub(crate) struct Endpoint {
    pub(crate) address: Cell<EndpointAddress>,
    pub(crate) enabled: Cell<bool>,
    pub(crate) transfer_type: Cell<TransferType>,
    pub(crate) max_packet: Cell<usize>,
    /// Set while the endpoint is disabled, while a request is cancelled
    /// and around completion callbacks. Only reported by `Udc::dump`.
    pub(crate) stopped: Cell<bool>,
    /// A completion callback for this endpoint is running.
    pub(crate) notifying: Cell<bool>,
    /// The queue is being flushed; submissions are refused.
    pub(crate) flushing: Cell<bool>,
    head: OptionalCell<usize>,
    tail: OptionalCell<usize>,
}

impl Endpoint {
    const fn new() -> Endpoint {
        Endpoint {
            address: Cell::new(EndpointAddress::from_raw(0)),
            enabled: Cell::new(false),
            transfer_type: Cell::new(TransferType::Bulk),
            max_packet: Cell::new(0),
            stopped: Cell::new(true),
            notifying: Cell::new(false),
            flushing: Cell::new(false),
            head: OptionalCell::empty(),
            tail: OptionalCell::empty(),
        }
    }

    pub(crate) fn head(&self) -> Option<usize> {
        self.head.get()
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.tail.get()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn push_back(&self, requests: &Requests, slot: usize) {
        requests.get(slot).next.clear();
        match self.tail.get() {
            Some(tail) => requests.get(tail).next.set(slot),
            None => self.head.set(slot),
        }
        self.tail.set(slot);
    }

    /// Request queued directly before `slot`, if any.
    pub(crate) fn predecessor(&self, requests: &Requests, slot: usize) -> Option<usize> {
        let mut current = self.head.get()?;
        loop {
            let next = requests.get(current).next.get()?;
            if next == slot {
                return Some(current);
            }
            current = next;
        }
    }

    pub(crate) fn contains(&self, requests: &Requests, slot: usize) -> bool {
        self.iter(requests).any(|queued| queued == slot)
    }

    /// Unlinks `slot`. Returns `false` if it was not queued here.
    pub(crate) fn remove(&self, requests: &Requests, slot: usize) -> bool {
        let next = requests.get(slot).next.get();
        if self.head.get() == Some(slot) {
            self.head.insert(next);
        } else {
            match self.predecessor(requests, slot) {
                Some(prev) => requests.get(prev).next.insert(next),
                None => return false,
            }
        }
        if self.tail.get() == Some(slot) {
            self.tail.insert(self.predecessor_or_last(requests));
        }
        requests.get(slot).next.clear();
        true
    }

    fn predecessor_or_last(&self, requests: &Requests) -> Option<usize> {
        self.iter(requests).last()
    }

    pub(crate) fn iter<'r, 'a>(&self, requests: &'r Requests<'a>) -> QueueIter<'r, 'a> {
        QueueIter {
            requests,
            next: self.head.get(),
        }
    }

    /// Forgets the configuration. The queue must already be empty.
    pub(crate) fn reset(&self) {
        self.enabled.set(false);
        self.stopped.set(true);
        self.max_packet.set(0);
    }
}

pub(crate) struct QueueIter<'r, 'a> {
    requests: &'r Requests<'a>,
    next: Option<usize>,
}

impl Iterator for QueueIter<'_, '_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = self.requests.get(current).next.get();
        Some(current)
    }
}

pub(crate) fn endpoints() -> [Endpoint; QUEUE_HEADS] {
    [const { Endpoint::new() }; QUEUE_HEADS]
}
