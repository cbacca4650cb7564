//! One-shot cycle runner: build the application, run a single trading cycle
//! for a date, print the funnel, exit. Useful from cron and for supervised
//! sessions.

use anyhow::Result;
use catalyst_trader::application::system::Application;
use catalyst_trader::config::BrokerConfig;
use catalyst_trader::infrastructure::persistence::repositories::SqliteScanResultRepository;
use chrono::{NaiveDate, Utc};
use clap::Parser;
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "run-cycle", about = "Run one trading cycle and exit")]
struct Args {
    /// Cycle date (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Settings file path.
    #[arg(long, default_value = "settings.toml")]
    settings: PathBuf,

    /// Print the scan funnel after the run.
    #[arg(long, default_value_t = false)]
    show_funnel: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = BrokerConfig::from_env()?;
    let app = Application::build(config, Some(args.settings)).await?;

    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    info!("Running one cycle for {date}");
    let cycle_id = app.runner.run(date).await?;
    info!("Cycle {cycle_id} completed");

    if args.show_funnel {
        let results = SqliteScanResultRepository::new(app.db.pool.clone())
            .list_for_cycle(cycle_id)
            .await?;
        for result in results {
            println!(
                "{:>4}  {:<6} {:>10} {:>12}  composite {:.3}  {}",
                result.rank,
                result.symbol,
                result.price,
                result.volume,
                result.composite_score,
                result.status.as_str()
            );
        }
    }
    Ok(())
}
