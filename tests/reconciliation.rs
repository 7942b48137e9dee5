//! End-to-end scenarios over the in-memory store, the scriptable gateway and a
//! recording notification channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use codevault::config::EngineConfig;
use codevault::models::Role;
use codevault::notify::{NotificationChannel, NotificationDispatcher, RecordingChannel};
use codevault::payment::{GatewayError, GatewayStatus, MockGateway};
use codevault::{
    CreateDepositRequest, CreateOrderRequest, DepositStatus, EngineError, MemoryStore, Money,
    OrderStatus, ProductId, ReconcileOutcome, ResourceStore, ShopEngine,
};

struct World {
    engine: Arc<ShopEngine>,
    store: Arc<MemoryStore>,
    gateway: Arc<MockGateway>,
    channel: Arc<RecordingChannel>,
}

fn world(config: EngineConfig) -> World {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new());
    let channel = Arc::new(RecordingChannel::new("buyer"));
    let notifier = Arc::new(NotificationDispatcher::new(vec![
        channel.clone() as Arc<dyn NotificationChannel>,
    ]));
    let engine = Arc::new(ShopEngine::new(
        store.clone(),
        gateway.clone(),
        notifier,
        config,
    ));
    World {
        engine,
        store,
        gateway,
        channel,
    }
}

async fn stocked_product(w: &World, units: usize) -> ProductId {
    let product = w
        .store
        .create_product("Steam Wallet 60k", Money::from(60_000))
        .await
        .unwrap();
    let codes: Vec<String> = (0..units).map(|i| format!("SW-{i:04}")).collect();
    assert_eq!(
        w.engine.import_stock(product.id, &codes).await.unwrap(),
        units as u64
    );
    product.id
}

fn guest_order(product_id: ProductId, quantity: i32) -> CreateOrderRequest {
    CreateOrderRequest {
        product_id,
        quantity,
        payment_method: "QRIS".to_string(),
        user_id: None,
        start_poller: false,
    }
}

#[tokio::test]
async fn reserve_three_of_five_then_paid() {
    let w = world(EngineConfig::default());
    let product_id = stocked_product(&w, 5).await;

    let order = w.engine.create_order(guest_order(product_id, 3)).await.unwrap();
    let counts = w.engine.stock_counts(product_id).await.unwrap();
    assert_eq!((counts.ready, counts.reserved, counts.sold), (2, 3, 0));

    w.gateway.set_status(&order.order_ref, GatewayStatus::Paid);
    let report = w.engine.sweeper().sweep_once().await;
    assert_eq!(report.orders_settled, 1);

    let paid = w.engine.get_order_status(&order.order_ref).await.unwrap();
    assert_eq!(paid.status, OrderStatus::Success);
    assert_eq!(paid.assigned_codes, vec!["SW-0000", "SW-0001", "SW-0002"]);
    assert!(paid.is_notified);

    let counts = w.engine.stock_counts(product_id).await.unwrap();
    assert_eq!((counts.ready, counts.reserved, counts.sold), (2, 0, 3));

    let delivered = w.channel.delivered_for(&order.order_ref);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].status, "SUCCESS");
    assert_eq!(delivered[0].codes, paid.assigned_codes);
}

#[tokio::test]
async fn deadline_passes_stock_released() {
    let w = world(EngineConfig {
        order_window_secs: 0,
        ..EngineConfig::default()
    });
    let product_id = stocked_product(&w, 5).await;
    let order = w.engine.create_order(guest_order(product_id, 3)).await.unwrap();

    let report = w.engine.sweeper().sweep_once().await;
    assert_eq!(report.expiry.expired, 1);

    let expired = w.engine.get_order_status(&order.order_ref).await.unwrap();
    assert_eq!(expired.status, OrderStatus::Expired);
    assert!(expired.assigned_codes.is_empty());
    assert_eq!(w.engine.stock_counts(product_id).await.unwrap().ready, 5);
    assert_eq!(w.channel.delivered_for(&order.order_ref)[0].status, "EXPIRED");
}

#[tokio::test]
async fn gateway_outage_at_deadline_still_expires() {
    let w = world(EngineConfig {
        order_window_secs: 0,
        ..EngineConfig::default()
    });
    let product_id = stocked_product(&w, 2).await;
    let order = w.engine.create_order(guest_order(product_id, 2)).await.unwrap();
    w.gateway
        .push_response(&order.order_ref, Err(GatewayError::Timeout));

    w.engine.sweeper().sweep_once().await;
    let expired = w.engine.get_order_status(&order.order_ref).await.unwrap();
    assert_eq!(expired.status, OrderStatus::Expired);
    assert_eq!(w.engine.stock_counts(product_id).await.unwrap().ready, 2);
}

#[tokio::test]
async fn late_payment_after_expiry_is_ignored() {
    let w = world(EngineConfig {
        order_window_secs: 0,
        ..EngineConfig::default()
    });
    let product_id = stocked_product(&w, 3).await;
    let order = w.engine.create_order(guest_order(product_id, 3)).await.unwrap();
    w.engine.sweeper().sweep_once().await;

    w.gateway.set_status(&order.order_ref, GatewayStatus::Paid);
    let outcome = w
        .engine
        .handle_payment_callback(&order.order_ref)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyTerminal);

    let order = w.engine.get_order_status(&order.order_ref).await.unwrap();
    assert_eq!(order.status, OrderStatus::Expired);
    assert!(order.assigned_codes.is_empty());
    let counts = w.engine.stock_counts(product_id).await.unwrap();
    assert_eq!((counts.ready, counts.sold), (3, 0));
}

#[tokio::test]
async fn concurrent_paid_deposit_credited_once() {
    let w = world(EngineConfig::default());
    let user = w.store.create_user(Role::Member, Money::ZERO).await.unwrap();
    let deposit = w
        .engine
        .create_deposit(CreateDepositRequest {
            user_id: user.id,
            amount: Money::from(50_000),
            channel: "QRIS".to_string(),
            start_poller: false,
        })
        .await
        .unwrap();
    w.gateway.set_status(&deposit.deposit_ref, GatewayStatus::Paid);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = w.engine.clone();
        let reference = deposit.deposit_ref.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                engine.handle_payment_callback(&reference).await.map(|o| o == ReconcileOutcome::Paid)
            } else {
                let report = engine.sweeper().sweep_once().await;
                Ok(report.deposits_settled == 1)
            }
        }));
    }
    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let user = w.store.get_user(user.id).await.unwrap().unwrap();
    assert_eq!(user.balance, Money::from(50_000));
    let deposit = w.engine.get_deposit_status(&deposit.deposit_ref).await.unwrap();
    assert_eq!(deposit.status, DepositStatus::Success);
    assert!(deposit.is_notified);
    // delivery is at-least-once; the acknowledgement flag flips once
    assert!(!w.channel.delivered_for(&deposit.deposit_ref).is_empty());
}

#[tokio::test]
async fn concurrent_checkout_never_double_sells() {
    let w = world(EngineConfig::default());
    let product_id = stocked_product(&w, 12).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let engine = w.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.create_order(guest_order(product_id, 2)).await
        }));
    }

    let mut refs = Vec::new();
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(order) => refs.push(order.order_ref),
            Err(EngineError::InsufficientStock { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(refs.len(), 6);
    assert_eq!(rejected, 4);

    w.gateway.set_default_status(GatewayStatus::Paid);
    w.engine.sweeper().sweep_once().await;

    let mut seen = HashSet::new();
    for reference in &refs {
        let order = w.engine.get_order_status(reference).await.unwrap();
        assert_eq!(order.status, OrderStatus::Success);
        for code in order.assigned_codes {
            assert!(seen.insert(code), "code sold twice");
        }
    }
    assert_eq!(seen.len(), 12);

    let counts = w.engine.stock_counts(product_id).await.unwrap();
    assert_eq!((counts.ready, counts.reserved, counts.sold), (0, 0, 12));
}

#[tokio::test]
async fn notification_retried_until_acknowledged() {
    let w = world(EngineConfig::default());
    let product_id = stocked_product(&w, 1).await;
    let order = w.engine.create_order(guest_order(product_id, 1)).await.unwrap();

    w.channel.set_failing(true);
    w.gateway.set_status(&order.order_ref, GatewayStatus::Paid);
    let sweeper = w.engine.sweeper();
    sweeper.sweep_once().await;
    sweeper.sweep_once().await;

    let pending = w.engine.get_order_status(&order.order_ref).await.unwrap();
    assert_eq!(pending.status, OrderStatus::Success);
    assert!(!pending.is_notified);
    assert!(w.channel.attempts() >= 2);

    w.channel.set_failing(false);
    let report = sweeper.sweep_once().await;
    assert_eq!(report.notified, 1);
    sweeper.sweep_once().await;

    assert!(w.engine.get_order_status(&order.order_ref).await.unwrap().is_notified);
    assert_eq!(w.channel.delivered_for(&order.order_ref).len(), 1);
}

#[tokio::test]
async fn poller_settles_gateway_order() {
    let w = world(EngineConfig {
        poll_interval_ms: 20,
        ..EngineConfig::default()
    });
    let product_id = stocked_product(&w, 2).await;
    let order = w
        .engine
        .create_order(CreateOrderRequest {
            start_poller: true,
            ..guest_order(product_id, 1)
        })
        .await
        .unwrap();
    assert!(w.engine.pollers().is_active(&order.order_ref));

    w.gateway.set_status(&order.order_ref, GatewayStatus::Paid);
    for _ in 0..200 {
        if !w.engine.pollers().is_active(&order.order_ref) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let order = w.engine.get_order_status(&order.order_ref).await.unwrap();
    assert_eq!(order.status, OrderStatus::Success);
    assert_eq!(order.assigned_codes.len(), 1);
}

#[tokio::test]
async fn stock_total_is_conserved() {
    let w = world(EngineConfig {
        order_window_secs: 0,
        ..EngineConfig::default()
    });
    let product_id = stocked_product(&w, 10).await;
    let buyer = w
        .store
        .create_user(Role::Member, Money::from(120_000))
        .await
        .unwrap();

    let paid = w.engine.create_order(guest_order(product_id, 3)).await.unwrap();
    let _lapsed = w.engine.create_order(guest_order(product_id, 2)).await.unwrap();
    let cancelled = w.engine.create_order(guest_order(product_id, 1)).await.unwrap();
    let balance = w
        .engine
        .create_order(CreateOrderRequest {
            payment_method: "BALANCE".to_string(),
            user_id: Some(buyer.id),
            ..guest_order(product_id, 2)
        })
        .await
        .unwrap();
    assert_eq!(balance.status, OrderStatus::Success);
    assert_eq!(w.engine.stock_counts(product_id).await.unwrap().total(), 10);

    w.engine.cancel_reservation(&cancelled.order_ref).await.unwrap();
    w.gateway.set_status(&paid.order_ref, GatewayStatus::Paid);
    w.engine.sweeper().sweep_once().await;

    let counts = w.engine.stock_counts(product_id).await.unwrap();
    assert_eq!(counts.total(), 10);
    assert_eq!((counts.ready, counts.reserved, counts.sold), (5, 0, 5));
    assert_eq!(
        w.store.get_user(buyer.id).await.unwrap().unwrap().balance,
        Money::ZERO
    );
}
