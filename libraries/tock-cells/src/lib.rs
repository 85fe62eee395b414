// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Tock Cell types shared by the kernel and chip crates.

#![forbid(unsafe_code)]
#![no_std]

pub mod optional_cell;
pub mod take_cell;
