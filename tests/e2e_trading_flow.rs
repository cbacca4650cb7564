//! End-to-end happy path: scan through execution, entry fill, take-profit
//! fill, OCO cancel, aggregates.

mod common;

use catalyst_trader::domain::trading::cycle::CycleState;
use catalyst_trader::domain::trading::scoring::ScanStatus;
use catalyst_trader::domain::trading::types::{
    OrderPurpose, OrderStatus, PositionStatus, TimeInForce,
};
use catalyst_trader::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqliteScanResultRepository,
};
use chrono::Utc;
use common::{harness, trading_date};
use rust_decimal_macros::dec;

#[tokio::test]
async fn scan_to_closed_trade() {
    let h = harness().await;
    h.seed_market();
    h.news
        .add_headline("AAPL", "AAPL beats estimates and raises guidance", "");

    // Pipeline runs to monitoring and executes the top candidate.
    let cycle_id = h.runner.run(trading_date()).await.unwrap();
    let cycles = SqliteCycleRepository::new(h.db.pool.clone());
    let cycle = cycles.get(cycle_id).await.unwrap();
    assert_eq!(cycle.state, CycleState::Monitoring);
    assert!(cycle.trades_executed >= 1);

    let results = SqliteScanResultRepository::new(h.db.pool.clone())
        .list_for_cycle(cycle_id)
        .await
        .unwrap();
    let selected: Vec<_> = results
        .iter()
        .filter(|r| r.status == ScanStatus::Selected)
        .collect();
    assert!(!selected.is_empty());

    // The bracket landed: one entry plus two GTC children per position.
    let positions = h.engine.positions_repo().list_live(Some(cycle_id)).await.unwrap();
    assert!(!positions.is_empty());
    let position = &positions[0];
    let orders = h.engine.orders_repo().list_for_position(position.id).await.unwrap();
    assert_eq!(orders.len(), 3);
    let entry = orders
        .iter()
        .find(|o| o.purpose == OrderPurpose::Entry)
        .unwrap();
    for leg in orders.iter().filter(|o| o.purpose.is_bracket_leg()) {
        assert_eq!(leg.time_in_force, TimeInForce::Gtc);
        assert_eq!(leg.parent_order_id, Some(entry.id));
    }

    // Entry fills; position opens with a seeded watermark.
    let entry_broker_id = entry.broker_order_id.clone().unwrap();
    let fill_price = entry.limit_price.unwrap();
    h.broker.fill_order(&entry_broker_id, fill_price, Utc::now());
    h.engine
        .on_fill(&entry_broker_id, entry.qty, fill_price, Utc::now())
        .await
        .unwrap();
    let position = h.engine.positions_repo().get(position.id).await.unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.entry_price, Some(fill_price));
    assert_eq!(position.high_watermark, Some(fill_price));

    // Take-profit fills; position closes, sibling stop cancels, P&L lands
    // in the cycle aggregates.
    let orders = h.engine.orders_repo().list_for_position(position.id).await.unwrap();
    let target = orders
        .iter()
        .find(|o| o.purpose == OrderPurpose::TakeProfit)
        .unwrap();
    let target_broker_id = target.broker_order_id.clone().unwrap();
    let target_price = target.limit_price.unwrap();
    h.broker.fill_order(&target_broker_id, target_price, Utc::now());
    h.engine
        .on_fill(&target_broker_id, target.qty, target_price, Utc::now())
        .await
        .unwrap();

    let position = h.engine.positions_repo().get(position.id).await.unwrap();
    assert_eq!(position.status, PositionStatus::Closed);
    assert!(position.realized_pnl > dec!(0));

    let stop = h
        .engine
        .orders_repo()
        .list_for_position(position.id)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.purpose == OrderPurpose::StopLoss)
        .unwrap();
    assert_eq!(stop.status, OrderStatus::Cancelled);

    let cycle = cycles.get(cycle_id).await.unwrap();
    assert_eq!(cycle.trades_won, 1);
    assert!(cycle.daily_pnl > dec!(0));
}

#[tokio::test]
async fn filled_qty_never_exceeds_qty_and_transitions_are_monotone() {
    let h = harness().await;
    let cycle_id = h.seed_cycle().await;
    let position_id = h.open_filled(cycle_id, "AAPL", dec!(100)).await;

    let orders = h.engine.orders_repo().list_for_position(position_id).await.unwrap();
    for order in &orders {
        assert!(order.filled_qty <= order.qty);
    }
    let entry = orders
        .iter()
        .find(|o| o.purpose == OrderPurpose::Entry)
        .unwrap();
    assert_eq!(entry.status, OrderStatus::Filled);

    // A terminal order accepts no further fills.
    let err = h
        .engine
        .on_fill(
            entry.broker_order_id.as_deref().unwrap(),
            dec!(20),
            dec!(100),
            Utc::now(),
        )
        .await;
    assert!(err.is_err());
}
