use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use som_sync::{PollOutcome, RateOutcome};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "som-cli")]
#[command(about = "Spreadsheet order mirror command-line interface")]
struct Cli {
    /// Debug-level logging regardless of RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the sheet and the rate feed on their intervals until Ctrl+C
    Run,
    /// One change check and, if needed, one full sync
    Sync,
    /// Fetch the current rate and recompute amount_rub
    Rate,
    /// Create or upgrade the orders table
    Migrate,
    /// Print the persisted sync state
    Status,
    /// Print stored orders in a row-position range
    Show {
        #[arg(long, default_value_t = 2)]
        from: u32,
        #[arg(long, default_value_t = u32::MAX)]
        to: u32,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => som_sync::run_daemon_from_env().await?,
        Commands::Sync => match som_sync::run_sync_once_from_env().await? {
            PollOutcome::Synced(report) => println!(
                "sync complete: run_id={} windows={} seen={} written={} rejected={} cursor={}",
                report.run_id,
                report.windows_read,
                report.rows_seen,
                report.rows_written,
                report.rows_rejected,
                report.cursor_after.unwrap_or(report.cursor_before),
            ),
            PollOutcome::Unchanged => println!("no changes since last sync"),
            PollOutcome::Busy => println!("another sync is running"),
            PollOutcome::Skipped { reason } => bail!("sync skipped: {reason}"),
            PollOutcome::Incomplete { report, reason } => bail!(
                "sync incomplete after {} windows ({} rows written, {} failed): {reason:?}",
                report.windows_read,
                report.rows_written,
                report.rows_failed()
            ),
        },
        Commands::Rate => match som_sync::refresh_rate_once_from_env().await? {
            RateOutcome::Updated { rate, rows } => {
                println!("rate {rate} applied to {rows} rows")
            }
            RateOutcome::Busy => println!("another rate refresh is running"),
            RateOutcome::FeedFailed(reason) => bail!("rate feed unavailable: {reason}"),
            RateOutcome::StoreFailed(reason) => bail!("recompute failed: {reason}"),
        },
        Commands::Migrate => {
            som_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Status => match som_sync::load_state_from_env().await? {
            Some(state) => {
                println!("spreadsheet: {}", som_core::spreadsheet_link(&state.spreadsheet_id));
                if let Some(sheet_id) = state.sheet_id {
                    println!("sheet id:    {sheet_id}");
                }
                println!("cursor:      {}", state.change_cursor);
                match state.last_sync {
                    Some(at) => println!("last sync:   {}", at.to_rfc3339()),
                    None => println!("last sync:   never"),
                }
            }
            None => println!("no sync state yet"),
        },
        Commands::Show { from, to } => {
            if from > to {
                bail!("--from {from} is after --to {to}");
            }
            let orders = som_sync::read_range_from_env(from, to).await?;
            for order in &orders {
                println!(
                    "{:>6}  {:<8} {:<16} {:>14} {:>16}  {}",
                    order.row_position,
                    order.sequence_number,
                    order.order_identifier,
                    order.amount_usd,
                    order.amount_rub,
                    order.delivery_date
                );
            }
            println!("{} rows", orders.len());
        }
    }

    Ok(())
}
