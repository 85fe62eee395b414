// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Driver for the ChipIdea/ARC high-speed USB device controller.
//!
//! This controller block ships in many SoCs (Tegra, i.MX, LPC, ...). In
//! device mode it executes chains of 32-byte transfer descriptors (dTDs)
//! hanging off a table of 64-byte endpoint queue heads (dQHs) in memory.
//!
//! The driver is split into:
//!
//! - [`registers`]: the register map and the [`registers::UdcHardware`]
//!   access trait platforms implement, plus [`mmio::MmioHardware`].
//! - [`descriptors`] and [`pool`]: the DMA records and their allocator.
//! - [`chain`]: turns requests into dTD chains and interprets retired chains.
//! - [`endpoint`]: request slots and per-endpoint queues.
//! - [`ep0`]: the control transfer state machine.
//! - [`udc`]: the controller itself, its lifecycle and interrupt handling.
//! - [`debug`]: register decoding and state dumps.

#![no_std]

#[cfg(test)]
extern crate std;

mod config;

pub mod chain;
pub mod debug;
pub mod descriptors;
pub mod endpoint;
pub mod ep0;
pub mod mmio;
pub mod pool;
pub mod registers;
pub mod udc;

#[cfg(test)]
mod test_util;

pub use crate::config::{PhyInterface, ResetPolicy, UdcConfig};
pub use crate::udc::Udc;
