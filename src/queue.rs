//! Per-instrument order queue

use crate::order::Order;
use crate::types::Instrument;

/// Insertion-ordered orders for one instrument.
///
/// There is no removal: filled orders stay in place and are skipped by
/// status. Slot indices are therefore stable for the life of the queue.
/// The queue has no locking of its own; the broker's event loop is its
/// only user.
#[derive(Debug, Clone)]
pub struct OrderQueue {
    instrument: Instrument,
    orders: Vec<Order>,
}

impl OrderQueue {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            orders: Vec::new(),
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Append an order, returning its slot index
    pub fn add(&mut self, order: Order) -> usize {
        self.orders.push(order);
        self.orders.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&Order> {
        self.orders.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Order> {
        self.orders.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Order> {
        self.orders.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

impl<'a> IntoIterator for &'a OrderQueue {
    type Item = &'a Order;
    type IntoIter = std::slice::Iter<'a, Order>;

    fn into_iter(self) -> Self::IntoIter {
        self.orders.iter()
    }
}
