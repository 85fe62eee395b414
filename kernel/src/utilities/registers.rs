// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Implementation of registers and bitfields.
//!
//! Chip crates import these re-exports instead of depending on
//! `tock-registers` themselves.

pub use tock_registers::fields::{Field, FieldValue};
pub use tock_registers::interfaces;
pub use tock_registers::registers::InMemoryRegister;
pub use tock_registers::{register_bitfields, LocalRegisterCopy, RegisterLongName};
