// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Core Tock Kernel
//!
//! The kernel crate holds the code that chips and boards share: the Hardware
//! Interface Layer (HIL) definitions, the standard error enum, in-kernel debug
//! output and the cell and register utilities drivers are written with.

#![warn(unreachable_pub)]
#![no_std]

#[cfg(test)]
extern crate std;

pub mod debug;
pub mod errorcode;
pub mod hil;
pub mod utilities;

pub use crate::errorcode::ErrorCode;
