//! Shared fixture for the integration tests: in-memory store, mock broker,
//! mock news, a fixed mid-session clock, and the full component set wired
//! the way the application wires them.
#![allow(dead_code)]

use catalyst_trader::application::alerts::AlertMailbox;
use catalyst_trader::application::engine::{OrderEngine, TradeCandidate};
use catalyst_trader::application::orchestrator::CycleRunner;
use catalyst_trader::application::risk::RiskValidator;
use catalyst_trader::config::{Settings, SettingsStore};
use catalyst_trader::domain::clock::{FixedClock, SessionSpec};
use catalyst_trader::domain::ports::{AssetInfo, BarSnapshot};
use catalyst_trader::domain::trading::cycle::{CycleMode, TradingCycle};
use catalyst_trader::domain::trading::types::PositionSide;
use catalyst_trader::infrastructure::mock::MockBroker;
use catalyst_trader::infrastructure::news::mock_news::MockNewsService;
use catalyst_trader::infrastructure::observability::Metrics;
use catalyst_trader::infrastructure::persistence::database::Database;
use catalyst_trader::infrastructure::persistence::repositories::SqliteCycleRepository;
use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct Harness {
    pub db: Database,
    pub broker: Arc<MockBroker>,
    pub news: Arc<MockNewsService>,
    pub clock: Arc<FixedClock>,
    pub settings: Arc<SettingsStore>,
    pub alerts: Arc<AlertMailbox>,
    pub metrics: Metrics,
    pub engine: Arc<OrderEngine>,
    pub validator: Arc<RiskValidator>,
    pub runner: CycleRunner,
}

pub fn trading_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
}

pub async fn harness() -> Harness {
    harness_with(Settings::default()).await
}

pub async fn harness_with(settings: Settings) -> Harness {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let broker = Arc::new(MockBroker::new());
    let news = Arc::new(MockNewsService::new());
    // Mid-session on the cycle date.
    let clock = Arc::new(FixedClock::at(
        Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap(),
        SessionSpec::us_equities(),
    ));
    let settings = SettingsStore::new(settings, None);
    let alerts = AlertMailbox::new(256);
    let metrics = Metrics::new().unwrap();
    let engine = Arc::new(OrderEngine::new(
        broker.clone(),
        db.clone(),
        alerts.clone(),
        metrics.clone(),
        Duration::from_secs(10),
    ));
    let validator = Arc::new(RiskValidator::new(&db, settings.clone()));
    let runner = CycleRunner::new(
        broker.clone(),
        &db,
        clock.clone(),
        news.clone(),
        validator.clone(),
        engine.clone(),
        settings.clone(),
        alerts.clone(),
        metrics.clone(),
    );

    Harness {
        db,
        broker,
        news,
        clock,
        settings,
        alerts,
        metrics,
        engine,
        validator,
        runner,
    }
}

impl Harness {
    pub async fn seed_cycle(&self) -> Uuid {
        let cycles = SqliteCycleRepository::new(self.db.pool.clone());
        let cycle = TradingCycle::new(trading_date(), CycleMode::Paper, serde_json::Value::Null);
        cycles.create(&cycle).await.unwrap();
        cycle.id
    }

    /// Open and fill a long position through the engine.
    pub async fn open_filled(&self, cycle_id: Uuid, symbol: &str, entry: Decimal) -> Uuid {
        let candidate = TradeCandidate {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            qty: dec!(10),
            entry_price: entry,
            stop_loss: entry * dec!(0.95),
            take_profit: entry * dec!(1.10),
            risk_amount: entry * dec!(0.05) * dec!(10),
            pattern: None,
            catalyst: None,
            entry_volume: Some(dec!(2000000)),
        };
        let opened = self.engine.open_position(cycle_id, &candidate).await.unwrap();
        let order = self.engine.orders_repo().get(opened.entry_order_id).await.unwrap();
        let broker_id = order.broker_order_id.unwrap();
        self.broker.fill_order(&broker_id, entry, Utc::now());
        self.engine
            .on_fill(&broker_id, dec!(10), entry, Utc::now())
            .await
            .unwrap();
        opened.position_id
    }

    pub fn seed_market(&self) {
        self.broker.set_assets(vec![
            asset("AAPL"),
            asset("MSFT"),
            asset("NVDA"),
        ]);
        self.broker.set_bars(vec![
            bar("AAPL", dec!(150), dec!(143), dec!(2000000), dec!(700000)),
            bar("MSFT", dec!(300), dec!(298), dec!(1500000), dec!(1400000)),
            bar("NVDA", dec!(120), dec!(114), dec!(3000000), dec!(1100000)),
        ]);
    }
}

pub fn asset(symbol: &str) -> AssetInfo {
    AssetInfo {
        symbol: symbol.to_string(),
        exchange: "NASDAQ".to_string(),
        tradable: true,
        fractionable: true,
        shortable: true,
    }
}

pub fn bar(
    symbol: &str,
    close: Decimal,
    prev_close: Decimal,
    volume: Decimal,
    avg_volume: Decimal,
) -> BarSnapshot {
    BarSnapshot {
        symbol: symbol.to_string(),
        open: close,
        close,
        prev_close: Some(prev_close),
        volume,
        avg_volume: Some(avg_volume),
        ts: Utc::now(),
    }
}
