//! Market data feed seam

use tokio::sync::mpsc;

use crate::types::{BookTop, Instrument};

/// Items on a per-instrument book stream
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(BookTop),
    Error(String),
}

/// Source of top-of-book changes.
///
/// Implementations own their reconnection; a subscription ends
/// when the receiver is dropped.
pub trait MarketDataFeed: Send + Sync {
    fn subscribe(&self, instrument: &Instrument) -> mpsc::UnboundedReceiver<FeedEvent>;
}
