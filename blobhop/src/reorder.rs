//! Bounded buffer which turns out-of-order completions back into an in-order sequence.
use crate::Result;
use snafu::prelude::*;
use std::collections::VecDeque;

/// Arena of slots indexed by sequence number, covering the window `[base, base + capacity)`.
///
/// Items may be inserted in any order as long as they fall within the window; they come out of
/// [`Self::pop_ready`] strictly in sequence order, and each pop slides the window forward by one.
#[derive(Debug)]
pub(crate) struct ReorderBuffer<T> {
    base: usize,
    capacity: usize,
    slots: VecDeque<Option<T>>,
    buffered: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BUG: reorder buffer capacity must be non-zero");

        Self {
            base: 0,
            capacity,
            slots: VecDeque::with_capacity(capacity),
            buffered: 0,
        }
    }

    /// The sequence number of the next item to come out of the buffer
    pub fn next_index(&self) -> usize {
        self.base
    }

    /// Can an item with this sequence number be accepted right now?
    pub fn accepts(&self, index: usize) -> bool {
        index >= self.base && index < self.base + self.capacity
    }

    /// Number of items currently held, waiting for an earlier item
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn insert(&mut self, index: usize, item: T) -> Result<()> {
        ensure!(
            self.accepts(index),
            crate::error::ReorderOverflowSnafu {
                index,
                base: self.base,
                capacity: self.capacity,
            }
        );

        let offset = index - self.base;
        if self.slots.len() <= offset {
            self.slots.resize_with(offset + 1, || None);
        }

        let slot = &mut self.slots[offset];
        assert!(slot.is_none(), "BUG: item {index} inserted twice");
        *slot = Some(item);
        self.buffered += 1;

        Ok(())
    }

    /// Take the next item in sequence, if it has arrived
    pub fn pop_ready(&mut self) -> Option<(usize, T)> {
        match self.slots.front_mut().and_then(Option::take) {
            Some(item) => {
                self.slots.pop_front();
                let index = self.base;
                self.base += 1;
                self.buffered -= 1;

                Some((index, item))
            }
            None => None,
        }
    }
}
