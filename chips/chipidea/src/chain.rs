// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! dTD chains.
//!
//! A request is carved into descriptors of at most `max_payload` bytes each.
//! The controller follows the hardware `next` pointers; the driver follows the
//! software links the pool keeps in each descriptor, so a chain can be walked
//! and freed without translating bus addresses back.

use kernel::hil::usb::{RequestFlags, TransferError};
use kernel::utilities::registers::LocalRegisterCopy;
use kernel::ErrorCode;

use crate::descriptors::Token;
use crate::pool::{DtdIndex, DtdPool};

/// The part of a request the chain builder needs.
#[derive(Copy, Clone, Debug)]
pub struct Transfer {
    /// Bus address of the first byte.
    pub address: u32,
    pub length: usize,
    /// Max packet size of the endpoint, for zero-length termination.
    pub max_packet: usize,
    pub flags: RequestFlags,
}

/// Descriptors built for one request, in execution order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DtdChain {
    head: DtdIndex,
    tail: DtdIndex,
    len: usize,
}

impl DtdChain {
    pub fn head(&self) -> DtdIndex {
        self.head
    }

    pub fn tail(&self) -> DtdIndex {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// Where a chain stands after the controller worked on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainStatus {
    /// The controller has not finished the chain yet.
    Active,
    /// The request is done. `trailing_active` is set when a short OUT packet
    /// ended the transfer before later descriptors of the chain ran; those
    /// are still armed in the controller.
    Complete { actual: usize, trailing_active: bool },
    Failed {
        actual: usize,
        error: TransferError,
    },
}

/// Builds the descriptor chain for `transfer`, starting `*actual` bytes in
/// and advancing `*actual` past every byte placed in a descriptor.
///
/// On failure every descriptor allocated so far is returned to the pool.
pub fn build_chain(
    pool: &DtdPool,
    transfer: &Transfer,
    actual: &mut usize,
    max_payload: usize,
) -> Result<DtdChain, ErrorCode> {
    let mut chain: Option<DtdChain> = None;

    loop {
        let index = match pool.allocate() {
            Ok(index) => index,
            Err(e) => {
                if let Some(partial) = chain {
                    free_chain(pool, &partial);
                }
                return Err(e);
            }
        };

        let chunk = (transfer.length - *actual).min(max_payload);
        *actual += chunk;

        let last = if transfer.flags.zero && transfer.max_packet != 0 {
            chunk == 0 || chunk % transfer.max_packet != 0
        } else {
            *actual == transfer.length
        };

        pool.get(index).prepare(
            transfer.address.wrapping_add((*actual - chunk) as u32),
            chunk,
            last && !transfer.flags.no_interrupt,
        );

        chain = Some(match chain {
            None => DtdChain {
                head: index,
                tail: index,
                len: 1,
            },
            Some(built) => {
                pool.get(built.tail).set_next(pool.dma_address(index));
                pool.set_chain_next(built.tail, index);
                DtdChain {
                    head: built.head,
                    tail: index,
                    len: built.len + 1,
                }
            }
        });

        if last {
            break;
        }
    }

    chain.ok_or(ErrorCode::FAIL)
}

/// Returns every descriptor of `chain` to the pool.
pub fn free_chain(pool: &DtdPool, chain: &DtdChain) {
    let mut next = Some(chain.head);
    for _ in 0..chain.len {
        match next {
            Some(index) => {
                next = pool.chain_next(index);
                pool.free(index);
            }
            None => break,
        }
    }
}

/// Iterator over the descriptors of a chain, in execution order.
pub struct ChainIter<'c, 'a> {
    pool: &'c DtdPool<'a>,
    next: Option<DtdIndex>,
    left: usize,
}

impl Iterator for ChainIter<'_, '_> {
    type Item = DtdIndex;

    fn next(&mut self) -> Option<DtdIndex> {
        if self.left == 0 {
            return None;
        }
        self.left -= 1;
        let current = self.next?;
        self.next = self.pool.chain_next(current);
        Some(current)
    }
}

pub fn chain_indices<'c, 'a>(pool: &'c DtdPool<'a>, chain: &DtdChain) -> ChainIter<'c, 'a> {
    ChainIter {
        pool,
        next: Some(chain.head),
        left: chain.len,
    }
}

/// Reads back a chain built by [`build_chain`] for `length` bytes.
///
/// Descriptors are examined in order. The first one still active means the
/// request is not finished. An error bit fails the request. A descriptor
/// retired with bytes left over ends the request early: that is a short
/// packet for OUT endpoints and a protocol error for IN endpoints.
pub fn inspect_chain(
    pool: &DtdPool,
    chain: &DtdChain,
    length: usize,
    max_payload: usize,
    is_in: bool,
) -> ChainStatus {
    let mut actual = 0;

    for (n, index) in chain_indices(pool, chain).enumerate() {
        let dtd = pool.get(index);
        let token = dtd.token();
        let programmed = length.saturating_sub(n * max_payload).min(max_payload);
        let remaining = dtd.remaining();

        if let Some(error) = token_error(token) {
            actual += programmed.saturating_sub(remaining);
            return ChainStatus::Failed { actual, error };
        }
        if dtd.is_active() {
            return ChainStatus::Active;
        }

        actual += programmed.saturating_sub(remaining);
        if remaining != 0 {
            if is_in {
                return ChainStatus::Failed {
                    actual,
                    error: TransferError::Protocol,
                };
            }
            let trailing_active = chain_indices(pool, chain)
                .skip(n + 1)
                .any(|i| pool.get(i).is_active());
            return ChainStatus::Complete {
                actual,
                trailing_active,
            };
        }
    }

    ChainStatus::Complete {
        actual,
        trailing_active: false,
    }
}

fn token_error(token: u32) -> Option<TransferError> {
    let token: LocalRegisterCopy<u32, Token::Register> = LocalRegisterCopy::new(token);
    if token.is_set(Token::HALTED) {
        Some(TransferError::Stalled)
    } else if token.is_set(Token::DATA_BUFFER_ERROR) {
        Some(TransferError::Protocol)
    } else if token.is_set(Token::TRANSACTION_ERROR) {
        Some(TransferError::Transaction)
    } else {
        None
    }
}
