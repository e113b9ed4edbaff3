//! Broker: keeps queued orders at the best price
//!
//! The broker owns one [`OrderQueue`] per instrument and runs as a single
//! event loop. Book changes, fill notifications and the completions of
//! place/cancel calls all arrive on one inbox and are handled one at a
//! time, so handlers never interleave their mutations of a queue. Gateway
//! calls run in spawned tasks and post their result back to the inbox,
//! which means a slow call only holds up the order that issued it.
//!
//! Two guards sit on top of that:
//! - `Ready` status locks a single order while one of its calls is in
//!   flight; book changes skip it until the call resolves.
//! - the `active` flag gates requoting as a whole. The fill handler clears
//!   it for its duration and restores the previous value on exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::feed::{FeedEvent, MarketDataFeed};
use crate::gateway::{
    ExchangeGateway, FillNotification, GatewayEvent, GatewayResult, PlaceAck, PlaceRequest,
};
use crate::order::{Order, OrderError, OrderStatus};
use crate::queue::OrderQueue;
use crate::types::{BookTop, Instrument};

/// Errors surfaced by broker operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Lifecycle events published to broker observers
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Placed(Order),
    Rejected(Order),
    Cancelled(Order),
    Fill(Order),
    Error(String),
}

impl BrokerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerEvent::Placed(_) => "placed",
            BrokerEvent::Rejected(_) => "rejected",
            BrokerEvent::Cancelled(_) => "cancelled",
            BrokerEvent::Fill(_) => "fill",
            BrokerEvent::Error(_) => "error",
        }
    }

    pub fn order(&self) -> Option<&Order> {
        match self {
            BrokerEvent::Placed(order)
            | BrokerEvent::Rejected(order)
            | BrokerEvent::Cancelled(order)
            | BrokerEvent::Fill(order) => Some(order),
            BrokerEvent::Error(_) => None,
        }
    }
}

/// Handle to a queued order: its instrument and slot in that queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderRef {
    instrument: Instrument,
    index: usize,
}

impl OrderRef {
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

enum Inbox {
    Feed {
        instrument: Instrument,
        event: FeedEvent,
    },
    Gateway(GatewayEvent),
    Placed {
        slot: OrderRef,
        result: GatewayResult<PlaceAck>,
    },
    Cancelled {
        slot: OrderRef,
        reprice: Decimal,
        result: GatewayResult<()>,
    },
    /// Cancel of a venue order whose placement resolved after its order filled
    OrphanCancelled {
        order_id: String,
        result: GatewayResult<()>,
    },
}

enum Work {
    Place(OrderRef, PlaceRequest),
    Cancel(OrderRef, String, Decimal),
}

/// Clears the `active` flag and puts the previous value back on drop,
/// including when the guarded body bails out early.
struct Suspend {
    flag: Arc<AtomicBool>,
    prior: bool,
}

impl Suspend {
    fn engage(flag: &Arc<AtomicBool>) -> Self {
        let prior = flag.swap(false, Ordering::SeqCst);
        Self {
            flag: Arc::clone(flag),
            prior,
        }
    }
}

impl Drop for Suspend {
    fn drop(&mut self) {
        self.flag.store(self.prior, Ordering::SeqCst);
    }
}

pub struct Broker {
    gateway: Arc<dyn ExchangeGateway>,
    feed: Arc<dyn MarketDataFeed>,
    config: BrokerConfig,
    queues: HashMap<Instrument, OrderQueue>,
    active: Arc<AtomicBool>,
    fills_armed: bool,
    events: broadcast::Sender<BrokerEvent>,
    inbox_tx: mpsc::UnboundedSender<Inbox>,
    inbox_rx: mpsc::UnboundedReceiver<Inbox>,
}

impl Broker {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        feed: Arc<dyn MarketDataFeed>,
        config: BrokerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            gateway,
            feed,
            config,
            queues: HashMap::new(),
            active: Arc::new(AtomicBool::new(false)),
            fills_armed: false,
            events,
            inbox_tx,
            inbox_rx,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn order(&self, slot: &OrderRef) -> Option<&Order> {
        self.queues.get(&slot.instrument)?.get(slot.index)
    }

    pub fn queue(&self, instrument: &Instrument) -> Option<&OrderQueue> {
        self.queues.get(instrument)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.queues.keys()
    }

    /// Hand an order to the broker.
    ///
    /// The first order for an instrument opens its queue and its market
    /// data subscription; later orders only join the queue. Must be called
    /// from within a tokio runtime.
    pub fn queue_order(&mut self, order: Order) -> Result<OrderRef, BrokerError> {
        if order.status() != OrderStatus::Created {
            return Err(BrokerError::InvalidOrder(format!(
                "expected a created order, got status {}",
                order.status()
            )));
        }
        if order.remaining() <= Decimal::ZERO {
            return Err(BrokerError::InvalidOrder(format!(
                "nothing left to trade on {}",
                order
            )));
        }

        let instrument = order.instrument().clone();
        let index = match self.queues.get_mut(&instrument) {
            Some(queue) => queue.add(order),
            None => {
                let mut queue = OrderQueue::new(instrument.clone());
                let index = queue.add(order);
                self.queues.insert(instrument.clone(), queue);
                self.watch_instrument(&instrument);
                index
            }
        };

        info!(instrument = %instrument, slot = index, "Order queued");
        Ok(OrderRef { instrument, index })
    }

    /// Enable requoting and arm the fill subscription (once).
    pub fn run(&mut self) {
        self.active.store(true, Ordering::SeqCst);
        if self.fills_armed {
            return;
        }
        self.fills_armed = true;

        let mut fills = self.gateway.subscribe_fills();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = fills.recv().await {
                if inbox.send(Inbox::Gateway(event)).is_err() {
                    break;
                }
            }
            debug!("Fill stream closed");
        });
        info!("Broker running");
    }

    /// Wait for the next inbox message and handle it.
    ///
    /// Returns `false` once the inbox is closed.
    pub async fn dispatch_next(&mut self) -> bool {
        match self.inbox_rx.recv().await {
            Some(message) => {
                self.handle(message);
                true
            }
            None => false,
        }
    }

    /// Drive the event loop until the inbox closes
    pub async fn serve(mut self) {
        while self.dispatch_next().await {}
    }

    fn watch_instrument(&self, instrument: &Instrument) {
        let mut updates = self.feed.subscribe(instrument);
        let inbox = self.inbox_tx.clone();
        let instrument = instrument.clone();
        debug!(instrument = %instrument, "Subscribed to market data");
        tokio::spawn(async move {
            while let Some(event) = updates.recv().await {
                let message = Inbox::Feed {
                    instrument: instrument.clone(),
                    event,
                };
                if inbox.send(message).is_err() {
                    break;
                }
            }
            debug!(instrument = %instrument, "Market data subscription closed");
        });
    }

    fn handle(&mut self, message: Inbox) {
        match message {
            Inbox::Feed {
                instrument,
                event: FeedEvent::Change(top),
            } => self.on_book_change(&instrument, top),
            Inbox::Feed {
                instrument,
                event: FeedEvent::Error(message),
            } => self.publish_error(format!("market data error on {}: {}", instrument, message)),
            Inbox::Gateway(GatewayEvent::Match(fill)) => {
                if let Err(e) = self.on_fill(&fill) {
                    self.publish_error(format!(
                        "failed to apply fill for order {}: {}",
                        fill.maker_order_id, e
                    ));
                }
            }
            Inbox::Gateway(GatewayEvent::Error(message)) => {
                self.publish_error(format!("fill stream error: {}", message))
            }
            Inbox::Placed { slot, result } => self.on_placed(slot, result),
            Inbox::Cancelled {
                slot,
                reprice,
                result,
            } => self.on_cancelled(slot, reprice, result),
            Inbox::OrphanCancelled { order_id, result } => match result {
                Ok(()) => info!(order_id = %order_id, "Orphaned venue order cancelled"),
                Err(e) => self.publish_error(format!(
                    "cancel of orphaned order {} failed: {}; it may still rest on the book",
                    order_id, e
                )),
            },
        }
    }

    fn on_book_change(&mut self, instrument: &Instrument, top: BookTop) {
        if !self.is_active() {
            debug!(instrument = %instrument, "Broker inactive, book change dropped");
            return;
        }
        let Some(queue) = self.queues.get_mut(instrument) else {
            return;
        };

        let mut work = Vec::new();
        let mut failures = Vec::new();
        for (index, order) in queue.iter_mut().enumerate() {
            let Some(best_limit) = top.best_limit(order.side()) else {
                continue;
            };
            let slot = OrderRef {
                instrument: instrument.clone(),
                index,
            };

            match order.status() {
                OrderStatus::Created => {
                    if let Err(e) = order.set_price(best_limit) {
                        failures.push(format!("cannot quote {}: {}", order, e));
                        continue;
                    }
                    order.set_status(OrderStatus::Ready);
                    work.push(Work::Place(slot, order.place_request()));
                }
                OrderStatus::Placed if order.price() != best_limit => {
                    let Some(order_id) = order.id().map(str::to_string) else {
                        failures.push(format!("placed order without venue id: {}", order));
                        continue;
                    };
                    debug!(
                        order_id = %order_id,
                        from = %order.price(),
                        to = %best_limit,
                        "Best price moved, replacing order"
                    );
                    order.set_status(OrderStatus::Ready);
                    work.push(Work::Cancel(slot, order_id, best_limit));
                }
                _ => {}
            }
        }

        for message in failures {
            self.publish_error(message);
        }
        for item in work {
            match item {
                Work::Place(slot, request) => self.spawn_place(slot, request),
                Work::Cancel(slot, order_id, reprice) => self.spawn_cancel(slot, order_id, reprice),
            }
        }
    }

    fn on_fill(&mut self, fill: &FillNotification) -> Result<(), BrokerError> {
        let _suspended = Suspend::engage(&self.active);

        let min_size = self.config.min_size(&fill.instrument);
        let Some(queue) = self.queues.get_mut(&fill.instrument) else {
            debug!(instrument = %fill.instrument, "Fill for unknown instrument ignored");
            return Ok(());
        };

        let mut updated = Vec::new();
        let mut failure = None;
        for order in queue
            .iter_mut()
            .filter(|order| order.id() == Some(fill.maker_order_id.as_str()))
        {
            let remaining = match order.reduce_remaining(fill.size) {
                Ok(remaining) => remaining,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if let Some(fee) = fill.fee {
                order.add_fee(fee);
            }
            let status = if remaining < min_size {
                OrderStatus::Filled
            } else if order.status().is_locked() {
                OrderStatus::Ready
            } else {
                OrderStatus::Placed
            };
            order.set_status(status);
            info!(
                order_id = %fill.maker_order_id,
                matched = %fill.size,
                remaining = %remaining,
                status = %status,
                "Fill applied"
            );
            updated.push(order.clone());
        }

        // Orders already updated are reported even when a later one fails
        for order in updated {
            self.publish(BrokerEvent::Fill(order));
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn on_placed(&mut self, slot: OrderRef, result: GatewayResult<PlaceAck>) {
        let Some(order) = self.order_mut(&slot) else {
            return;
        };

        if order.status().is_terminal() {
            let order = order.to_string();
            self.on_orphaned_placement(order, result);
            return;
        }

        let event = match result {
            Ok(ack) if ack.is_rejected() => {
                order.set_status(OrderStatus::Rejected);
                let rejected = order.clone();
                order.set_status(OrderStatus::Created);
                warn!(
                    order = %rejected,
                    reason = ack.reject_reason.as_deref().unwrap_or("unspecified"),
                    "Order rejected by venue, will retry on next book change"
                );
                BrokerEvent::Rejected(rejected)
            }
            Ok(ack) => match order.set_id(ack.id) {
                Ok(()) => {
                    order.set_status(OrderStatus::Placed);
                    info!(order = %order, "Order placed");
                    BrokerEvent::Placed(order.clone())
                }
                Err(e) => {
                    order.set_status(OrderStatus::Created);
                    BrokerEvent::Error(format!("placement of {} returned no usable id: {}", order, e))
                }
            },
            Err(e) => {
                order.set_status(OrderStatus::Created);
                BrokerEvent::Error(format!("place failed for {}: {}", order, e))
            }
        };

        match event {
            BrokerEvent::Error(message) => self.publish_error(message),
            event => self.publish(event),
        }
    }

    /// A placement that resolves after its order filled leaves a live venue
    /// order nothing tracks. Cancel it and report the id.
    fn on_orphaned_placement(&mut self, order: String, result: GatewayResult<PlaceAck>) {
        match result {
            Ok(ack) if !ack.is_rejected() && !ack.id.is_empty() => {
                self.publish_error(format!(
                    "{} filled while its replacement was being placed; cancelling orphaned order {}",
                    order, ack.id
                ));
                self.spawn_orphan_cancel(ack.id);
            }
            Ok(ack) => debug!(
                order = %order,
                venue_id = %ack.id,
                "Late placement was rejected, nothing to clean up"
            ),
            Err(e) => warn!(
                order = %order,
                error = %e,
                "Late placement failed after the order was already filled"
            ),
        }
    }

    fn on_cancelled(&mut self, slot: OrderRef, reprice: Decimal, result: GatewayResult<()>) {
        let min_size = self.config.min_size(&slot.instrument);
        let Some(order) = self.order_mut(&slot) else {
            return;
        };

        match result {
            Ok(()) => {
                let already_filled = order.status().is_terminal();
                order.set_status(OrderStatus::Cancelled);
                let cancelled = order.clone();
                info!(order = %cancelled, "Order cancelled");

                let next = if already_filled || order.remaining() < min_size {
                    order.set_status(OrderStatus::Filled);
                    None
                } else {
                    match order.set_price(reprice) {
                        Ok(()) => {
                            order.set_status(OrderStatus::Ready);
                            Some(Ok(order.place_request()))
                        }
                        Err(e) => {
                            order.set_status(OrderStatus::Created);
                            Some(Err(format!("cannot reprice {}: {}", order, e)))
                        }
                    }
                };

                self.publish(BrokerEvent::Cancelled(cancelled));
                match next {
                    Some(Ok(request)) => self.spawn_place(slot, request),
                    Some(Err(message)) => self.publish_error(message),
                    None => {}
                }
            }
            Err(e) => {
                let keep_resting = order.remaining() >= min_size
                    && !e.is_bad_request()
                    && !order.status().is_terminal();
                let status = if keep_resting {
                    OrderStatus::Placed
                } else {
                    OrderStatus::Filled
                };
                order.set_status(status);
                let message = format!(
                    "cancel of order {} failed: {}; order is now {}",
                    order.id().unwrap_or("-"),
                    e,
                    status
                );
                self.publish_error(message);
            }
        }
    }

    fn spawn_place(&self, slot: OrderRef, request: PlaceRequest) {
        debug!(
            instrument = %request.instrument,
            side = %request.side,
            price = %request.price,
            size = %request.size,
            "Placing order"
        );
        let gateway = Arc::clone(&self.gateway);
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = gateway.place_order(&request).await;
            let _ = inbox.send(Inbox::Placed { slot, result });
        });
    }

    fn spawn_cancel(&self, slot: OrderRef, order_id: String, reprice: Decimal) {
        let gateway = Arc::clone(&self.gateway);
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = gateway.cancel_order(&order_id).await;
            let _ = inbox.send(Inbox::Cancelled {
                slot,
                reprice,
                result,
            });
        });
    }

    fn spawn_orphan_cancel(&self, order_id: String) {
        let gateway = Arc::clone(&self.gateway);
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = gateway.cancel_order(&order_id).await;
            let _ = inbox.send(Inbox::OrphanCancelled { order_id, result });
        });
    }

    fn order_mut(&mut self, slot: &OrderRef) -> Option<&mut Order> {
        self.queues.get_mut(&slot.instrument)?.get_mut(slot.index)
    }

    fn publish(&self, event: BrokerEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn publish_error(&self, message: String) {
        error!("{}", message);
        self.publish(BrokerEvent::Error(message));
    }
}
