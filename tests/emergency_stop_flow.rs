//! Daily-loss breach: atomic stop, liquidation, and the post-stop veto on
//! further trades.

mod common;

use catalyst_trader::application::engine::TradeCandidate;
use catalyst_trader::application::risk::{RiskMonitor, RiskTickOutcome};
use catalyst_trader::domain::ports::AccountSnapshot;
use catalyst_trader::domain::trading::cycle::CycleState;
use catalyst_trader::domain::trading::types::PositionSide;
use catalyst_trader::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqliteRiskEventRepository,
};
use chrono::Utc;
use common::harness;
use rust_decimal_macros::dec;

#[tokio::test]
async fn breach_stops_liquidates_and_vetoes() {
    let h = harness().await;
    let cycle_id = h.seed_cycle().await;

    // Two open positions; realized -1800 and unrealized -250 push the total
    // to -2050 against the 2000 limit.
    let a = h.open_filled(cycle_id, "AAPL", dec!(150)).await;
    let b = h.open_filled(cycle_id, "MSFT", dec!(300)).await;

    h.engine
        .mark_position_price(a, dec!(125))
        .await
        .unwrap(); // (125-150)*10 = -250
    let positions = h.engine.positions_repo();
    let msft = positions.get(b).await.unwrap();
    let stamp = msft.updated_at;
    let mut msft = msft.clone();
    msft.realized_pnl = dec!(-1800);
    assert!(positions.update(&msft, stamp).await.unwrap());

    let monitor = RiskMonitor::new(
        h.engine.clone(),
        h.settings.clone(),
        h.alerts.clone(),
        h.metrics.clone(),
    );
    let outcome = monitor.tick_once(cycle_id).await.unwrap();
    let RiskTickOutcome::Stopped { pnl, report } = outcome else {
        panic!("expected Stopped, got {outcome:?}");
    };
    assert_eq!(pnl, dec!(-2050));
    assert_eq!(report.attempted, 2);
    assert_eq!(report.submitted, 2);
    assert!(report.failures.is_empty());

    // Both positions were closed at the broker.
    let mut closed = h.broker.close_requests();
    closed.sort();
    assert_eq!(closed, vec!["AAPL".to_string(), "MSFT".to_string()]);

    // The flip is single-entry.
    let again = monitor.tick_once(cycle_id).await.unwrap();
    assert!(matches!(again, RiskTickOutcome::AlreadyStopped));

    let cycles = SqliteCycleRepository::new(h.db.pool.clone());
    let cycle = cycles.get(cycle_id).await.unwrap();
    assert_eq!(cycle.state, CycleState::Stopped);
    assert!(cycle.stopped_at.is_some());

    // A CRITICAL risk event documents the stop.
    let events = SqliteRiskEventRepository::new(h.db.pool.clone())
        .list_for_cycle(cycle_id)
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.event_type == "emergency_stop"));

    // Further validation in this cycle is refused with cycle_stopped.
    let account = AccountSnapshot {
        cash: dec!(50000),
        buying_power: dec!(100000),
        equity: dec!(50000),
        day_trade_count: 0,
    };
    let candidate = TradeCandidate {
        symbol: "NVDA".to_string(),
        side: PositionSide::Long,
        qty: dec!(10),
        entry_price: dec!(120),
        stop_loss: dec!(114),
        take_profit: dec!(132),
        risk_amount: dec!(60),
        pattern: None,
        catalyst: None,
        entry_volume: None,
    };
    let verdict = h
        .validator
        .validate(cycle_id, &candidate, &account)
        .await
        .unwrap();
    assert!(!verdict.approved);
    assert_eq!(verdict.reason.as_deref(), Some("cycle_stopped"));
}

#[tokio::test]
async fn warning_level_does_not_liquidate() {
    let h = harness().await;
    let cycle_id = h.seed_cycle().await;
    let a = h.open_filled(cycle_id, "AAPL", dec!(150)).await;

    // -1600 of 2000: warning territory, not a breach.
    let positions = h.engine.positions_repo();
    let p = positions.get(a).await.unwrap();
    let stamp = p.updated_at;
    let mut p = p.clone();
    p.realized_pnl = dec!(-1600);
    p.unrealized_pnl = dec!(0);
    positions.update(&p, stamp).await.unwrap();

    let monitor = RiskMonitor::new(
        h.engine.clone(),
        h.settings.clone(),
        h.alerts.clone(),
        h.metrics.clone(),
    );
    let outcome = monitor.tick_once(cycle_id).await.unwrap();
    assert!(matches!(outcome, RiskTickOutcome::Warned { .. }));
    assert!(h.broker.close_requests().is_empty());

    let cycles = SqliteCycleRepository::new(h.db.pool.clone());
    assert_eq!(cycles.get(cycle_id).await.unwrap().state, CycleState::Created);
}
