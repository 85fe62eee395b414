// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! `OptionalCell`: a `Cell<Option<T>>` with the accessors drivers reach for.

use core::cell::Cell;

/// Interior-mutable optional value of a `Copy` type.
///
/// Drivers hold their clients, queue links and deferred state in these so
/// every method can take `&self`.
pub struct OptionalCell<T: Copy> {
    value: Cell<Option<T>>,
}

impl<T: Copy> OptionalCell<T> {
    pub const fn new(value: T) -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(Some(value)),
        }
    }

    pub const fn empty() -> OptionalCell<T> {
        OptionalCell {
            value: Cell::new(None),
        }
    }

    pub fn set(&self, value: T) {
        self.value.set(Some(value));
    }

    /// Stores `value`, clearing the cell when it is `None`.
    pub fn insert(&self, value: Option<T>) {
        self.value.set(value);
    }

    /// Stores `value` and returns what was there before.
    pub fn replace(&self, value: T) -> Option<T> {
        self.value.replace(Some(value))
    }

    pub fn clear(&self) {
        self.value.set(None);
    }

    pub fn take(&self) -> Option<T> {
        self.value.take()
    }

    pub fn is_some(&self) -> bool {
        self.value.get().is_some()
    }

    pub fn is_none(&self) -> bool {
        self.value.get().is_none()
    }

    /// A copy of the contents.
    pub fn get(&self) -> Option<T> {
        self.value.get()
    }

    pub fn unwrap_or(&self, default: T) -> T {
        self.value.get().unwrap_or(default)
    }

    // No `unwrap`.

    /// Runs `closure` on a copy of the contents, if any.
    pub fn map<F, R>(&self, closure: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        self.value.get().map(|mut value| closure(&mut value))
    }

    /// Like [`OptionalCell::map`], returning `default` when the cell is
    /// empty.
    pub fn map_or<F, R>(&self, default: R, closure: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        self.value
            .get()
            .map_or(default, |mut value| closure(&mut value))
    }
}

#[cfg(test)]
mod test {
    use super::OptionalCell;

    #[test]
    fn insert_none_clears() {
        let cell = OptionalCell::new(3u8);
        cell.insert(None);
        assert!(cell.is_none());
        cell.insert(Some(4));
        assert_eq!(cell.get(), Some(4));
    }

    #[test]
    fn take_and_replace() {
        let cell = OptionalCell::empty();
        assert_eq!(cell.replace(1u16), None);
        assert_eq!(cell.replace(2), Some(1));
        assert_eq!(cell.take(), Some(2));
        assert_eq!(cell.take(), None);
        assert_eq!(cell.unwrap_or(7), 7);
    }

    #[test]
    fn map_works_on_a_copy() {
        let cell = OptionalCell::new(10u32);
        assert_eq!(
            cell.map(|v| {
                *v += 1;
                *v
            }),
            Some(11)
        );
        assert_eq!(cell.get(), Some(10));
        cell.clear();
        assert_eq!(cell.map_or(0, |v| *v), 0);
    }
}
