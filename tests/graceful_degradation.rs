//! Stage-policy degradation: a dead news service must not block the
//! pipeline unless the stage is required.

mod common;

use catalyst_trader::config::Settings;
use catalyst_trader::domain::trading::cycle::CycleState;
use catalyst_trader::domain::trading::scoring::ScanStatus;
use catalyst_trader::infrastructure::persistence::repositories::{
    SqliteCycleRepository, SqliteScanResultRepository,
};
use common::{harness, harness_with, trading_date};

#[tokio::test]
async fn news_down_not_required_passes_with_fallback() {
    let h = harness().await;
    h.seed_market();
    h.news.set_down(true); // 503 for every symbol

    let cycle_id = h.runner.run(trading_date()).await.unwrap();

    let results = SqliteScanResultRepository::new(h.db.pool.clone())
        .list_for_cycle(cycle_id)
        .await
        .unwrap();
    assert!(!results.is_empty());
    // Every candidate carries the fallback catalyst score and the pipeline
    // still ran to execution.
    assert!(results.iter().all(|r| r.scores.catalyst == 0.5));
    assert!(
        results
            .iter()
            .any(|r| r.status == ScanStatus::Selected)
    );
    assert!(!h.broker.submitted_brackets().is_empty());

    let cycles = SqliteCycleRepository::new(h.db.pool.clone());
    assert_eq!(cycles.get(cycle_id).await.unwrap().state, CycleState::Monitoring);
}

#[tokio::test]
async fn news_down_required_drops_all_candidates() {
    let mut settings = Settings::default();
    settings.filters.news.required = true;
    let h = harness_with(settings).await;
    h.seed_market();
    h.news.set_down(true);

    let cycle_id = h.runner.run(trading_date()).await.unwrap();

    // Nothing survives the required stage; the cycle still completes.
    assert!(h.broker.submitted_brackets().is_empty());
    let cycles = SqliteCycleRepository::new(h.db.pool.clone());
    let cycle = cycles.get(cycle_id).await.unwrap();
    assert_eq!(cycle.state, CycleState::Monitoring);
    assert_eq!(cycle.trades_executed, 0);

    let results = SqliteScanResultRepository::new(h.db.pool.clone())
        .list_for_cycle(cycle_id)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.status == ScanStatus::Rejected));
}

#[tokio::test]
async fn disabled_stage_is_skipped_entirely() {
    let mut settings = Settings::default();
    settings.filters.news.enabled = false;
    let h = harness_with(settings).await;
    h.seed_market();
    h.news.set_down(true); // irrelevant when the stage is off

    let cycle_id = h.runner.run(trading_date()).await.unwrap();

    let results = SqliteScanResultRepository::new(h.db.pool.clone())
        .list_for_cycle(cycle_id)
        .await
        .unwrap();
    // Catalyst scores stay at their scan-time default.
    assert!(results.iter().all(|r| r.scores.catalyst == 0.0));
    assert!(!h.broker.submitted_brackets().is_empty());
}
