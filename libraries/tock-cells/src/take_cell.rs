// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! `TakeCell`: shared ownership of a `&mut` that only one holder can use at a
//! time.

use core::cell::Cell;

/// Holds a mutable reference, typically a buffer lent to a driver.
///
/// The reference is moved out with [`TakeCell::take`] and handed back with
/// [`TakeCell::replace`]; while it is out, the cell is empty and `take`
/// returns `None`.
pub struct TakeCell<'a, T: 'a + ?Sized> {
    value: Cell<Option<&'a mut T>>,
}

impl<'a, T: ?Sized> TakeCell<'a, T> {
    pub const fn empty() -> TakeCell<'a, T> {
        TakeCell {
            value: Cell::new(None),
        }
    }

    pub const fn new(value: &'a mut T) -> TakeCell<'a, T> {
        TakeCell {
            value: Cell::new(Some(value)),
        }
    }

    pub fn take(&self) -> Option<&'a mut T> {
        self.value.take()
    }

    /// Puts `value` in the cell and returns the reference it held, if any.
    pub fn replace(&self, value: &'a mut T) -> Option<&'a mut T> {
        self.value.replace(Some(value))
    }

    pub fn is_some(&self) -> bool {
        let value = self.value.take();
        let present = value.is_some();
        self.value.set(value);
        present
    }

    pub fn is_none(&self) -> bool {
        !self.is_some()
    }

    /// Lends the contents to `closure` without emptying the cell.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let value = self.value.take()?;
        let result = closure(&mut *value);
        self.value.set(Some(value));
        Some(result)
    }
}

#[cfg(test)]
mod test {
    use super::TakeCell;

    #[test]
    fn only_one_holder() {
        let mut buffer = [0u8; 4];
        let cell = TakeCell::new(&mut buffer[..]);
        let taken = cell.take();
        assert!(taken.is_some());
        assert!(cell.is_none());
        assert!(cell.take().is_none());

        if let Some(taken) = taken {
            taken[0] = 9;
            assert!(cell.replace(taken).is_none());
        }
        assert_eq!(cell.map(|b| b[0]), Some(9));
        assert!(cell.is_some());
    }

    #[test]
    fn empty_cell_lends_nothing() {
        let cell: TakeCell<[u8]> = TakeCell::empty();
        assert_eq!(cell.map(|b| b.len()), None);
    }
}
