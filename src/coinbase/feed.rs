//! Top-of-book feed over the websocket `level2_batch` channel
//!
//! Each subscription keeps a local level-2 book: the `snapshot` loads it and
//! every `l2update` patches it. The current top is forwarded after every
//! update and again on every `heartbeat`, so a quiet book still produces
//! a tick roughly once a second. The broker relies on that to retry
//! orders left in `Created` by a rejected or failed placement.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use tokio::sync::mpsc;

use super::websocket::{run_stream, FeedMessage, StreamConfig, StreamError, StreamHandler, Subscribe};
use crate::feed::{FeedEvent, MarketDataFeed};
use crate::types::{BookTop, Instrument, Side};

const BOOK_CHANNELS: [&str; 2] = ["level2_batch", "heartbeat"];

pub struct CoinbaseBookFeed {
    config: StreamConfig,
}

impl CoinbaseBookFeed {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }
}

impl MarketDataFeed for CoinbaseBookFeed {
    fn subscribe(&self, instrument: &Instrument) -> mpsc::UnboundedReceiver<FeedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribe = Subscribe::new(vec![instrument.clone()], &BOOK_CHANNELS);
        let handler = BookStream::new(instrument.clone(), tx);
        tokio::spawn(run_stream(self.config.clone(), subscribe, handler));
        rx
    }
}

/// Price levels of one product, keyed by price
#[derive(Debug, Default)]
pub struct LocalBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    loaded: bool,
}

impl LocalBook {
    /// Replace the book with a snapshot
    pub fn load(&mut self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) {
        self.clear();
        for &(price, size) in bids {
            set_level(&mut self.bids, price, size);
        }
        for &(price, size) in asks {
            set_level(&mut self.asks, price, size);
        }
        self.loaded = true;
    }

    /// Apply `[side, price, size]` changes. Updates before the first
    /// snapshot are dropped and reported as `false`.
    pub fn apply(&mut self, changes: &[(Side, Decimal, Decimal)]) -> bool {
        if !self.loaded {
            return false;
        }
        for &(side, price, size) in changes {
            let levels = match side {
                Side::Buy => &mut self.bids,
                Side::Sell => &mut self.asks,
            };
            set_level(levels, price, size);
        }
        true
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.loaded = false;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn top(&self) -> BookTop {
        BookTop::new(
            self.bids.keys().next_back().copied(),
            self.asks.keys().next().copied(),
        )
    }
}

fn set_level(levels: &mut BTreeMap<Decimal, Decimal>, price: Decimal, size: Decimal) {
    if price <= Decimal::ZERO {
        return;
    }
    if size <= Decimal::ZERO {
        levels.remove(&price);
    } else {
        levels.insert(price, size);
    }
}

/// Turns websocket messages for one product into [`FeedEvent`]s
struct BookStream {
    instrument: Instrument,
    book: LocalBook,
    updates: mpsc::UnboundedSender<FeedEvent>,
}

impl BookStream {
    fn new(instrument: Instrument, updates: mpsc::UnboundedSender<FeedEvent>) -> Self {
        Self {
            instrument,
            book: LocalBook::default(),
            updates,
        }
    }

    fn emit(&self, event: FeedEvent) -> ControlFlow<()> {
        match self.updates.send(event) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

impl StreamHandler for BookStream {
    fn on_message(&mut self, message: FeedMessage) -> ControlFlow<()> {
        let tick = match message {
            FeedMessage::Snapshot { product_id, bids, asks } if product_id == self.instrument => {
                self.book.load(&bids, &asks);
                true
            }
            FeedMessage::L2Update { product_id, changes } if product_id == self.instrument => {
                self.book.apply(&changes)
            }
            FeedMessage::Heartbeat { product_id } if product_id == self.instrument => {
                self.book.is_loaded()
            }
            _ => false,
        };

        if !tick {
            // Notice a dropped receiver even while nothing is forwarded
            if self.updates.is_closed() {
                return ControlFlow::Break(());
            }
            return ControlFlow::Continue(());
        }
        self.emit(FeedEvent::Change(self.book.top()))
    }

    fn on_disconnect(&mut self, error: &StreamError) -> ControlFlow<()> {
        self.book.clear();
        self.emit(FeedEvent::Error(format!(
            "book stream for {} interrupted: {}",
            self.instrument, error
        )))
    }
}
