use std::collections::VecDeque;

use bytes::Bytes;

/// Encoded tiles released in token order and not yet delivered.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    items: VecDeque<Bytes>,
}

impl ReadyQueue {
    pub fn push(&mut self, item: Bytes) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Outstanding downstream demand that the ready queue could not satisfy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DemandCounter {
    outstanding: u64,
}

impl DemandCounter {
    pub fn get(&self) -> u64 {
        self.outstanding
    }

    pub fn add(&mut self, n: u64) {
        self.outstanding = self.outstanding.saturating_add(n);
    }

    /// Consume one unit of demand if any is outstanding.
    pub fn take_one(&mut self) -> bool {
        if self.outstanding == 0 {
            return false;
        }
        self.outstanding -= 1;
        true
    }
}

/// Pairs the ready queue with the demand counter.
///
/// Demand is only ever recorded after the queue has been drained, so a
/// positive counter implies an empty queue.
#[derive(Debug, Default)]
pub struct Outlet {
    ready: ReadyQueue,
    demand: DemandCounter,
}

impl Outlet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take up to `n` queued items for delivery; any shortfall becomes
    /// outstanding demand.
    pub fn request(&mut self, n: u64) -> Vec<Bytes> {
        let mut delivered = Vec::new();
        let mut wanted = n;
        while wanted > 0 {
            let Some(item) = self.ready.pop() else {
                break;
            };
            delivered.push(item);
            wanted -= 1;
        }
        self.demand.add(wanted);
        delivered
    }

    /// Returns the item when it should be delivered right away, otherwise
    /// queues it until the next `request`.
    pub fn offer(&mut self, item: Bytes) -> Option<Bytes> {
        debug_assert!(self.demand.get() == 0 || self.ready.is_empty());
        if self.demand.take_one() {
            Some(item)
        } else {
            self.ready.push(item);
            None
        }
    }

    pub fn demand(&self) -> u64 {
        self.demand.get()
    }

    pub fn queued(&self) -> usize {
        self.ready.len()
    }

    pub fn is_drained(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
    }
}
