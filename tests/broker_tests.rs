//! Integration tests for the broker
//!
//! The broker is driven one inbox message at a time against scripted
//! in-memory gateway and feed fakes.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::timeout;

use price_chaser::{
    BookTop, Broker, BrokerConfig, BrokerError, BrokerEvent, ExchangeGateway, FeedEvent,
    FillNotification, GatewayError, GatewayEvent, Instrument, MarketDataFeed, Order, OrderRef,
    OrderStatus, PlaceAck, PlaceRequest, Side,
};

type GatewayResult<T> = Result<T, GatewayError>;

// =============================================================================
// Test Utilities
// =============================================================================

#[derive(Default)]
struct FakeGateway {
    place_script: Mutex<VecDeque<GatewayResult<PlaceAck>>>,
    cancel_script: Mutex<VecDeque<GatewayResult<()>>>,
    placed: Mutex<Vec<PlaceRequest>>,
    cancelled: Mutex<Vec<String>>,
    fill_streams: Mutex<Vec<mpsc::UnboundedSender<GatewayEvent>>>,
    next_id: AtomicUsize,
    cancel_gate: Option<Arc<Semaphore>>,
    place_gate: Option<Arc<Semaphore>>,
}

impl FakeGateway {
    fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let gateway = Self {
            cancel_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (gateway, gate)
    }

    /// Placements after the first wait for a permit
    fn place_gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(1));
        let gateway = Self {
            place_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (gateway, gate)
    }

    fn script_place(&self, result: GatewayResult<PlaceAck>) {
        self.place_script.lock().unwrap().push_back(result);
    }

    fn script_cancel(&self, result: GatewayResult<()>) {
        self.cancel_script.lock().unwrap().push_back(result);
    }

    fn placed(&self) -> Vec<PlaceRequest> {
        self.placed.lock().unwrap().clone()
    }

    fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    fn fill_subscriptions(&self) -> usize {
        self.fill_streams.lock().unwrap().len()
    }

    fn push(&self, event: GatewayEvent) {
        for stream in self.fill_streams.lock().unwrap().iter() {
            let _ = stream.send(event.clone());
        }
    }

    fn fill(&self, order_id: &str, size: Decimal, fee: Option<Decimal>) {
        self.push(GatewayEvent::Match(FillNotification {
            maker_order_id: order_id.to_string(),
            instrument: btc(),
            size,
            price: None,
            fee,
        }));
    }
}

#[async_trait]
impl ExchangeGateway for FakeGateway {
    async fn place_order(&self, request: &PlaceRequest) -> GatewayResult<PlaceAck> {
        self.placed.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.place_gate {
            gate.acquire().await.unwrap().forget();
        }
        let scripted = self.place_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(PlaceAck::accepted(format!("venue-{}", n)))
        })
    }

    async fn cancel_order(&self, order_id: &str) -> GatewayResult<()> {
        self.cancelled.lock().unwrap().push(order_id.to_string());
        if let Some(gate) = &self.cancel_gate {
            gate.acquire().await.unwrap().forget();
        }
        let scripted = self.cancel_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))
    }

    fn subscribe_fills(&self) -> mpsc::UnboundedReceiver<GatewayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.fill_streams.lock().unwrap().push(tx);
        rx
    }
}

#[derive(Default)]
struct FakeFeed {
    streams: Mutex<HashMap<Instrument, Vec<mpsc::UnboundedSender<FeedEvent>>>>,
    subscriptions: AtomicUsize,
}

impl FakeFeed {
    fn send(&self, instrument: &Instrument, event: FeedEvent) {
        if let Some(streams) = self.streams.lock().unwrap().get(instrument) {
            for stream in streams {
                let _ = stream.send(event.clone());
            }
        }
    }

    fn tick(&self, instrument: &Instrument, bid: Option<Decimal>, ask: Option<Decimal>) {
        self.send(instrument, FeedEvent::Change(BookTop::new(bid, ask)));
    }

    fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl MarketDataFeed for FakeFeed {
    fn subscribe(&self, instrument: &Instrument) -> mpsc::UnboundedReceiver<FeedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .unwrap()
            .entry(instrument.clone())
            .or_default()
            .push(tx);
        rx
    }
}

struct Harness {
    broker: Broker,
    gateway: Arc<FakeGateway>,
    feed: Arc<FakeFeed>,
    events: broadcast::Receiver<BrokerEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_gateway(FakeGateway::default())
    }

    fn with_gateway(gateway: FakeGateway) -> Self {
        let gateway = Arc::new(gateway);
        let feed = Arc::new(FakeFeed::default());
        let config = BrokerConfig::default().with_min_size(btc(), dec!(0.01));
        let broker = Broker::new(
            Arc::clone(&gateway) as Arc<dyn ExchangeGateway>,
            Arc::clone(&feed) as Arc<dyn MarketDataFeed>,
            config,
        );
        let events = broker.subscribe();
        Self {
            broker,
            gateway,
            feed,
            events,
        }
    }

    fn queue_sell(&mut self, size: Decimal) -> OrderRef {
        let order = Order::new(btc(), Side::Sell, size).unwrap();
        self.broker.queue_order(order).unwrap()
    }

    /// Handle exactly one inbox message
    async fn step(&mut self) {
        let handled = timeout(Duration::from_secs(1), self.broker.dispatch_next())
            .await
            .expect("broker inbox stayed empty");
        assert!(handled, "broker inbox closed");
    }

    /// True when no inbox message arrives within a short window
    async fn idle(&mut self) -> bool {
        timeout(Duration::from_millis(50), self.broker.dispatch_next())
            .await
            .is_err()
    }

    fn order(&self, slot: &OrderRef) -> &Order {
        self.broker.order(slot).expect("queued order")
    }

    fn drain(&mut self) -> Vec<BrokerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Queue a sell of `size`, run, and rest it at 100 as `venue-1`
    async fn placed_sell(&mut self, size: Decimal) -> OrderRef {
        let slot = self.queue_sell(size);
        self.broker.run();
        self.feed.tick(&btc(), Some(dec!(99)), Some(dec!(100)));
        self.step().await;
        self.step().await;
        assert_eq!(self.order(&slot).status(), OrderStatus::Placed);
        self.drain();
        slot
    }
}

fn btc() -> Instrument {
    Instrument::new("BTC-USD")
}

fn kinds(events: &[BrokerEvent]) -> Vec<&'static str> {
    events.iter().map(BrokerEvent::kind).collect()
}

// =============================================================================
// Requoting
// =============================================================================

#[tokio::test]
async fn test_first_tick_places_at_best_ask() {
    let mut h = Harness::new();
    let slot = h.queue_sell(dec!(1));
    h.broker.run();

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(100)));
    h.step().await;

    let order = h.order(&slot);
    assert_eq!(order.price(), dec!(100));
    assert_eq!(order.status(), OrderStatus::Ready);

    h.step().await;
    let order = h.order(&slot);
    assert_eq!(order.status(), OrderStatus::Placed);
    assert_eq!(order.id(), Some("venue-1"));

    let events = h.drain();
    assert_eq!(kinds(&events), vec!["placed"]);
    assert_eq!(events[0].order().and_then(|o| o.id()), Some("venue-1"));

    let placed = h.gateway.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].price, dec!(100));
    assert_eq!(placed[0].size, dec!(1));
    assert_eq!(placed[0].side, Side::Sell);
}

#[tokio::test]
async fn test_buy_order_quotes_best_bid() {
    let mut h = Harness::new();
    let order = Order::new(btc(), Side::Buy, dec!(2)).unwrap();
    let slot = h.broker.queue_order(order).unwrap();
    h.broker.run();

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(100)));
    h.step().await;
    assert_eq!(h.order(&slot).price(), dec!(99));
}

#[tokio::test]
async fn test_price_move_cancels_then_replaces() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;
    assert_eq!(h.order(&slot).status(), OrderStatus::Ready);

    // Cancel completion, then the new placement
    h.step().await;
    assert_eq!(h.order(&slot).status(), OrderStatus::Ready);
    assert_eq!(h.order(&slot).price(), dec!(101));
    h.step().await;

    let order = h.order(&slot);
    assert_eq!(order.status(), OrderStatus::Placed);
    assert_eq!(order.id(), Some("venue-2"));
    assert_eq!(h.gateway.cancelled(), vec!["venue-1".to_string()]);

    let events = h.drain();
    assert_eq!(kinds(&events), vec!["cancelled", "placed"]);
    assert_eq!(events[0].order().map(|o| o.price()), Some(dec!(100)));
    assert_eq!(events[1].order().map(|o| o.price()), Some(dec!(101)));
}

#[tokio::test]
async fn test_unchanged_price_is_a_no_op() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;

    // Bid moves, ask stays
    h.feed.tick(&btc(), Some(dec!(98)), Some(dec!(100)));
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Placed);
    assert!(h.idle().await);
    assert!(h.gateway.cancelled().is_empty());
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_missing_side_skips_order() {
    let mut h = Harness::new();
    let slot = h.queue_sell(dec!(1));
    h.broker.run();

    h.feed.tick(&btc(), Some(dec!(99)), None);
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Created);
    assert!(h.idle().await);
}

#[tokio::test]
async fn test_transient_cancel_failure_keeps_order_resting() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;
    h.gateway
        .script_cancel(Err(GatewayError::Network("connection reset".into())));

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;
    h.step().await;

    let order = h.order(&slot);
    assert_eq!(order.status(), OrderStatus::Placed);
    assert_eq!(order.price(), dec!(100));
    assert!(h.idle().await);

    let events = h.drain();
    assert_eq!(kinds(&events), vec!["error"]);
    match &events[0] {
        BrokerEvent::Error(message) => {
            assert!(message.contains("venue-1"));
            assert!(message.contains("placed"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.gateway.placed().len(), 1);
}

#[tokio::test]
async fn test_bad_request_cancel_failure_marks_filled() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;
    h.gateway
        .script_cancel(Err(GatewayError::BadRequest("Order already done".into())));

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Filled);
    assert_eq!(kinds(&h.drain()), vec!["error"]);

    // Filled orders are never requoted
    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(102)));
    h.step().await;
    assert!(h.idle().await);
    assert_eq!(h.gateway.cancelled().len(), 1);
}

#[tokio::test]
async fn test_cancel_failure_below_min_size_marks_filled() {
    let (gateway, gate) = FakeGateway::gated();
    let mut h = Harness::with_gateway(gateway);
    let slot = h.placed_sell(dec!(1)).await;
    h.gateway
        .script_cancel(Err(GatewayError::Network("timed out".into())));

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;

    // Dust left while the cancel is in flight
    h.gateway.fill("venue-1", dec!(0.995), None);
    h.step().await;
    assert_eq!(h.order(&slot).remaining(), dec!(0.005));

    gate.add_permits(1);
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Filled);
    assert_eq!(kinds(&h.drain()), vec!["fill", "error"]);
    assert!(h.idle().await);
}

#[tokio::test]
async fn test_cancel_after_full_fill_is_not_replaced() {
    let (gateway, gate) = FakeGateway::gated();
    let mut h = Harness::with_gateway(gateway);
    let slot = h.placed_sell(dec!(1)).await;

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;
    h.gateway.fill("venue-1", dec!(1), None);
    h.step().await;

    gate.add_permits(1);
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Filled);
    assert_eq!(kinds(&h.drain()), vec!["fill", "cancelled"]);
    assert!(h.idle().await);
    assert_eq!(h.gateway.placed().len(), 1);
}

#[tokio::test]
async fn test_rejected_placement_retries_on_next_tick() {
    let mut h = Harness::new();
    let slot = h.queue_sell(dec!(1));
    h.gateway
        .script_place(Ok(PlaceAck::rejected("venue-x", "post only")));
    h.broker.run();

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(100)));
    h.step().await;
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Created);
    assert_eq!(h.order(&slot).id(), None);
    let events = h.drain();
    assert_eq!(kinds(&events), vec!["rejected"]);
    assert_eq!(
        events[0].order().map(|o| o.status()),
        Some(OrderStatus::Rejected)
    );

    h.feed.tick(&btc(), Some(dec!(98.5)), Some(dec!(99.5)));
    h.step().await;
    h.step().await;

    let order = h.order(&slot);
    assert_eq!(order.status(), OrderStatus::Placed);
    assert_eq!(order.price(), dec!(99.5));
    assert_eq!(h.gateway.placed().len(), 2);
}

#[tokio::test]
async fn test_rejected_placement_retries_on_unchanged_tick() {
    let mut h = Harness::new();
    let slot = h.queue_sell(dec!(1));
    h.gateway
        .script_place(Ok(PlaceAck::rejected("venue-x", "post only")));
    h.broker.run();

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(100)));
    h.step().await;
    h.step().await;
    assert_eq!(h.order(&slot).status(), OrderStatus::Created);

    // Same top of book again, as re-sent on a heartbeat
    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(100)));
    h.step().await;
    h.step().await;

    let order = h.order(&slot);
    assert_eq!(order.status(), OrderStatus::Placed);
    assert_eq!(order.price(), dec!(100));
    assert_eq!(kinds(&h.drain()), vec!["rejected", "placed"]);
    assert_eq!(h.gateway.placed().len(), 2);
}

#[tokio::test]
async fn test_place_failure_resets_to_created() {
    let mut h = Harness::new();
    let slot = h.queue_sell(dec!(1));
    h.gateway.script_place(Err(GatewayError::Api {
        status: 503,
        message: "unavailable".into(),
    }));
    h.broker.run();

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(100)));
    h.step().await;
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Created);
    assert_eq!(kinds(&h.drain()), vec!["error"]);
}

#[tokio::test]
async fn test_placement_landing_after_fill_is_cancelled() {
    let (gateway, gate) = FakeGateway::place_gated();
    let mut h = Harness::with_gateway(gateway);
    let slot = h.placed_sell(dec!(1)).await;

    // Cancel of venue-1 succeeds and the replacement placement hangs
    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;
    h.step().await;
    assert_eq!(h.order(&slot).status(), OrderStatus::Ready);

    h.gateway.fill("venue-1", dec!(1.0), None);
    h.step().await;
    assert_eq!(h.order(&slot).status(), OrderStatus::Filled);

    // venue-2 rests on the book for an order that is already done
    gate.add_permits(1);
    h.step().await;
    h.step().await;

    let order = h.order(&slot);
    assert_eq!(order.status(), OrderStatus::Filled);
    assert_eq!(order.id(), Some("venue-1"));
    assert_eq!(
        h.gateway.cancelled(),
        vec!["venue-1".to_string(), "venue-2".to_string()]
    );

    let events = h.drain();
    assert_eq!(kinds(&events), vec!["cancelled", "fill", "error"]);
    match &events[2] {
        BrokerEvent::Error(message) => assert!(message.contains("venue-2")),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(h.idle().await);
}

#[tokio::test]
async fn test_failed_orphan_cancel_is_reported() {
    let (gateway, gate) = FakeGateway::place_gated();
    let mut h = Harness::with_gateway(gateway);
    let slot = h.placed_sell(dec!(1)).await;

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;
    h.step().await;
    h.gateway.fill("venue-1", dec!(1.0), None);
    h.step().await;

    h.gateway
        .script_cancel(Err(GatewayError::Network("connection reset".into())));
    gate.add_permits(1);
    h.step().await;
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Filled);
    let events = h.drain();
    assert_eq!(kinds(&events), vec!["cancelled", "fill", "error", "error"]);
    match &events[3] {
        BrokerEvent::Error(message) => {
            assert!(message.contains("venue-2"));
            assert!(message.contains("connection reset"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_second_tick_while_ready_is_ignored() {
    let (gateway, gate) = FakeGateway::gated();
    let mut h = Harness::with_gateway(gateway);
    let slot = h.placed_sell(dec!(1)).await;

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;
    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(102)));
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Ready);
    assert!(h.idle().await);

    gate.add_permits(1);
    h.step().await;
    h.step().await;

    // Repriced to the level known when the cancel was issued
    assert_eq!(h.order(&slot).price(), dec!(101));
    assert_eq!(h.order(&slot).status(), OrderStatus::Placed);
    assert_eq!(h.gateway.cancelled().len(), 1);
}

// =============================================================================
// Fills
// =============================================================================

#[tokio::test]
async fn test_partial_fill_keeps_order_placed() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;

    h.gateway.fill("venue-1", dec!(0.4), Some(dec!(0.02)));
    h.step().await;

    let order = h.order(&slot);
    assert_eq!(order.remaining(), dec!(0.6));
    assert_eq!(order.status(), OrderStatus::Placed);
    assert_eq!(order.fee(), dec!(0.02));

    let events = h.drain();
    assert_eq!(kinds(&events), vec!["fill"]);
    assert_eq!(events[0].order().map(|o| o.remaining()), Some(dec!(0.6)));
    assert!(h.broker.is_active());
}

#[tokio::test]
async fn test_full_fill_marks_filled_and_stops_requoting() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;

    h.gateway.fill("venue-1", dec!(1.0), None);
    h.step().await;

    let order = h.order(&slot);
    assert_eq!(order.remaining(), Decimal::ZERO);
    assert_eq!(order.status(), OrderStatus::Filled);
    assert_eq!(kinds(&h.drain()), vec!["fill"]);

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(105)));
    h.step().await;
    assert!(h.idle().await);
    assert_eq!(h.order(&slot).status(), OrderStatus::Filled);
    assert!(h.gateway.cancelled().is_empty());
}

#[tokio::test]
async fn test_fill_for_unknown_order_is_ignored() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;

    h.gateway.fill("someone-else", dec!(0.5), None);
    h.step().await;

    assert_eq!(h.order(&slot).remaining(), dec!(1));
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn test_overfill_reports_error_and_restores_active() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;

    h.gateway.fill("venue-1", dec!(2), None);
    h.step().await;

    assert_eq!(h.order(&slot).remaining(), dec!(1));
    assert_eq!(kinds(&h.drain()), vec!["error"]);
    assert!(h.broker.is_active());
}

#[tokio::test]
async fn test_fill_applied_before_an_overfill_is_still_published() {
    let mut h = Harness::new();
    let mut first = Order::new(btc(), Side::Sell, dec!(1)).unwrap();
    first.set_id("venue-shared").unwrap();
    let mut second = Order::new(btc(), Side::Sell, dec!(0.25)).unwrap();
    second.set_id("venue-shared").unwrap();
    let first = h.broker.queue_order(first).unwrap();
    let second = h.broker.queue_order(second).unwrap();
    h.broker.run();

    h.gateway.fill("venue-shared", dec!(0.5), None);
    h.step().await;

    assert_eq!(h.order(&first).remaining(), dec!(0.5));
    assert_eq!(h.order(&second).remaining(), dec!(0.25));

    let events = h.drain();
    assert_eq!(kinds(&events), vec!["fill", "error"]);
    assert_eq!(events[0].order().map(|o| o.remaining()), Some(dec!(0.5)));
    assert!(h.broker.is_active());
}

#[tokio::test]
async fn test_fill_during_cancel_reprices_remaining_size() {
    let (gateway, gate) = FakeGateway::gated();
    let mut h = Harness::with_gateway(gateway);
    let slot = h.placed_sell(dec!(1)).await;

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(101)));
    h.step().await;

    // Fill lands while the cancel is still in flight
    h.gateway.fill("venue-1", dec!(0.4), None);
    h.step().await;
    assert_eq!(h.order(&slot).status(), OrderStatus::Ready);
    assert_eq!(h.order(&slot).remaining(), dec!(0.6));

    gate.add_permits(1);
    h.step().await;
    h.step().await;

    let placed = h.gateway.placed();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[1].size, dec!(0.6));
    assert_eq!(placed[1].price, dec!(101));
    assert_eq!(kinds(&h.drain()), vec!["fill", "cancelled", "placed"]);
}

#[tokio::test]
async fn test_repeated_partial_fills_round_to_eight_places() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;

    for _ in 0..3 {
        h.gateway.fill("venue-1", dec!(0.1111111111), None);
        h.step().await;
    }
    assert_eq!(h.order(&slot).remaining(), dec!(0.66666667));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_ticks_before_run_are_ignored() {
    let mut h = Harness::new();
    let slot = h.queue_sell(dec!(1));

    h.feed.tick(&btc(), Some(dec!(99)), Some(dec!(100)));
    h.step().await;

    assert_eq!(h.order(&slot).status(), OrderStatus::Created);
    assert!(h.idle().await);
    assert!(h.gateway.placed().is_empty());
    assert!(!h.broker.is_active());
}

#[tokio::test]
async fn test_run_is_idempotent() {
    let mut h = Harness::new();
    let slot = h.placed_sell(dec!(1)).await;
    h.broker.run();
    h.broker.run();

    assert_eq!(h.gateway.fill_subscriptions(), 1);

    h.gateway.fill("venue-1", dec!(0.25), None);
    h.step().await;
    assert!(h.idle().await);
    assert_eq!(h.order(&slot).remaining(), dec!(0.75));
    assert_eq!(kinds(&h.drain()), vec!["fill"]);
}

#[tokio::test]
async fn test_one_feed_subscription_per_instrument() {
    let mut h = Harness::new();
    let first = h.queue_sell(dec!(1));
    let second = h.queue_sell(dec!(2));
    let eth = Order::new(Instrument::new("ETH-USD"), Side::Buy, dec!(1)).unwrap();
    h.broker.queue_order(eth).unwrap();

    assert_eq!(h.feed.subscriptions(), 2);
    assert_eq!(first.index(), 0);
    assert_eq!(second.index(), 1);
    assert_eq!(h.broker.queue(&btc()).map(|q| q.len()), Some(2));
    assert_eq!(h.broker.instruments().count(), 2);
}

#[tokio::test]
async fn test_queue_rejects_non_created_order() {
    let mut h = Harness::new();
    let mut order = Order::new(btc(), Side::Sell, dec!(1)).unwrap();
    order.set_status(OrderStatus::Placed);

    let err = h.broker.queue_order(order).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidOrder(_)));
    assert_eq!(h.feed.subscriptions(), 0);
}

#[tokio::test]
async fn test_queue_rejects_exhausted_order() {
    let mut h = Harness::new();
    let mut order = Order::new(btc(), Side::Sell, dec!(1)).unwrap();
    order.set_remaining(Decimal::ZERO).unwrap();

    assert!(h.broker.queue_order(order).is_err());
}

#[tokio::test]
async fn test_feed_and_gateway_errors_are_republished() {
    let mut h = Harness::new();
    h.queue_sell(dec!(1));
    h.broker.run();

    h.feed.send(&btc(), FeedEvent::Error("socket closed".into()));
    h.step().await;
    h.gateway.push(GatewayEvent::Error("fills unavailable".into()));
    h.step().await;

    let events = h.drain();
    assert_eq!(kinds(&events), vec!["error", "error"]);
    let messages: Vec<String> = events
        .into_iter()
        .filter_map(|e| match e {
            BrokerEvent::Error(message) => Some(message),
            _ => None,
        })
        .collect();
    assert!(messages[0].contains("socket closed"));
    assert!(messages[0].contains("BTC-USD"));
    assert!(messages[1].contains("fills unavailable"));
}
