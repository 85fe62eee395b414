// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Tock specific `Cell` types.

pub use tock_cells::optional_cell::OptionalCell;
pub use tock_cells::take_cell::TakeCell;
