//! Per-board pending queue with coalescing of continuous actuations.

use std::collections::VecDeque;

use crate::mapping::Actuation;

/// FIFO of actuations waiting for one board.
///
/// A continuous actuation (PWM level, stepper move) replaces a queued one
/// from the same `(input_id, mapping_id)`: the old entry is dropped and the
/// new one goes to the back. Discrete actuations are never dropped.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<Actuation>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an actuation, returning the one it superseded, if any
    pub fn push(&mut self, actuation: Actuation) -> Option<Actuation> {
        let superseded = if actuation.command.is_continuous() {
            self.items
                .iter()
                .position(|queued| {
                    queued.command.is_continuous()
                        && queued.mapping_id == actuation.mapping_id
                        && queued.input_id == actuation.input_id
                })
                .and_then(|pos| self.items.remove(pos))
        } else {
            None
        };

        self.items.push_back(actuation);
        superseded
    }

    pub fn pop(&mut self) -> Option<Actuation> {
        self.items.pop_front()
    }

    /// Drop everything queued, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let discarded = self.items.len();
        self.items.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
