use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use stock_ledger::config::{self, AppConfig};
use stock_ledger::db;
use stock_ledger::entities::inventory_transaction::TransactionType;
use stock_ledger::repositories::TransactionFilter;
use stock_ledger::services::{BulkOperationResult, BulkStockInItem, InventoryStatus};
use stock_ledger::InventoryEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => handle_migrate(&context).await?,
        Commands::Status(args) => handle_status(&context, args, cli.json).await?,
        Commands::LowStock(args) => handle_low_stock(&context, args, cli.json).await?,
        Commands::History(args) => handle_history(&context, args, cli.json).await?,
        Commands::Adjust(args) => handle_adjust(&context, args, cli.json).await?,
        Commands::Damage(args) => handle_damage(&context, args, cli.json).await?,
        Commands::StockIn(args) => handle_stock_in(&context, args, cli.json).await?,
        Commands::Reconcile(args) => handle_reconcile(&context, args, cli.json).await?,
        Commands::SweepExpired => handle_sweep(&context, cli.json).await?,
        Commands::DrainOutbox => handle_drain_outbox(&context, cli.json).await?,
        Commands::Worker(args) => handle_worker(&context, args).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "stock-ledger",
    about = "Inventory ledger administration and background workers",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Show on-hand, reserved and available stock for a variant
    Status(StatusArgs),
    /// List active variants at or below a low-stock threshold
    LowStock(LowStockArgs),
    /// Page through the transaction ledger, newest first
    History(HistoryArgs),
    /// Apply a signed manual correction
    Adjust(AdjustArgs),
    /// Write off damaged units
    Damage(DamageArgs),
    /// Receive supplier stock for one variant or a JSON batch
    StockIn(StockInArgs),
    /// Heal drift between the on-hand counter and the ledger total
    Reconcile(ReconcileArgs),
    /// Release reservations of unpaid orders past their TTL
    SweepExpired,
    /// Publish pending outbox events once and exit
    DrainOutbox,
    /// Run the outbox publisher and expiry sweeper until interrupted
    Worker(WorkerArgs),
}

#[derive(Args)]
struct StatusArgs {
    #[arg(help = "Variant identifier", value_parser = clap::value_parser!(Uuid))]
    variant_id: Uuid,
}

#[derive(Args)]
struct LowStockArgs {
    #[arg(long, help = "Available quantity at or below which a variant is reported")]
    threshold: Option<i32>,
}

#[derive(Args)]
struct HistoryArgs {
    #[arg(long, help = "Only entries for this variant", value_parser = clap::value_parser!(Uuid))]
    variant_id: Option<Uuid>,
    #[arg(long = "type", help = "Only entries of this type, e.g. stock_in or commit")]
    transaction_type: Option<TransactionType>,
    #[arg(long, help = "Only entries for this order item", value_parser = clap::value_parser!(Uuid))]
    order_item_id: Option<Uuid>,
    #[arg(long, default_value_t = 1, help = "Page number (1-based)")]
    page: u64,
    #[arg(long, default_value_t = 50, help = "Entries per page (max 200)")]
    per_page: u64,
}

#[derive(Args)]
struct AdjustArgs {
    #[arg(value_parser = clap::value_parser!(Uuid))]
    variant_id: Uuid,
    #[arg(allow_negative_numbers = true, help = "Signed change to on-hand stock")]
    delta: i32,
    #[arg(long, help = "Reason recorded on the ledger entry")]
    notes: String,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    user_id: Option<Uuid>,
}

#[derive(Args)]
struct DamageArgs {
    #[arg(value_parser = clap::value_parser!(Uuid))]
    variant_id: Uuid,
    quantity: i32,
    #[arg(long, help = "Description of the damage")]
    notes: String,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    user_id: Option<Uuid>,
}

#[derive(Args)]
struct StockInArgs {
    #[arg(long, value_parser = clap::value_parser!(Uuid), conflicts_with = "file")]
    variant_id: Option<Uuid>,
    #[arg(long, requires = "variant_id")]
    quantity: Option<i32>,
    #[arg(long, help = "JSON array of {variant_id, quantity, notes?} items")]
    file: Option<PathBuf>,
    #[arg(long, help = "Supplier reference stored on every ledger entry")]
    supplier_ref: Option<String>,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    user_id: Option<Uuid>,
}

#[derive(Args)]
struct ReconcileArgs {
    #[arg(value_parser = clap::value_parser!(Uuid))]
    variant_id: Uuid,
    #[arg(long, value_parser = clap::value_parser!(Uuid))]
    user_id: Option<Uuid>,
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long, default_value_t = 60, help = "Seconds between expiry sweeps")]
    sweep_interval_secs: u64,
}

struct CliContext {
    config: AppConfig,
    engine: InventoryEngine,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let engine = InventoryEngine::connect(config.clone())
            .await
            .context("failed to connect to database")?;

        Ok(Self { config, engine })
    }
}

async fn handle_migrate(context: &CliContext) -> Result<()> {
    if context.config.auto_migrate {
        println!("Schema is up to date (auto_migrate ran on connect)");
        return Ok(());
    }
    db::run_migrations(&context.engine.db)
        .await
        .context("failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

async fn handle_status(context: &CliContext, args: StatusArgs, json: bool) -> Result<()> {
    let status = context
        .engine
        .queries
        .get_inventory_status(args.variant_id)
        .await
        .context("failed to load inventory status")?;

    if json {
        print_json(&status)?;
    } else {
        render_status(&status);
    }
    Ok(())
}

async fn handle_low_stock(context: &CliContext, args: LowStockArgs, json: bool) -> Result<()> {
    let rows = context
        .engine
        .queries
        .get_low_stock_products(args.threshold)
        .await
        .context("failed to load low-stock report")?;

    if json {
        print_json(&rows)?;
    } else if rows.is_empty() {
        println!("No variants below threshold");
    } else {
        for status in &rows {
            render_status(status);
        }
    }
    Ok(())
}

async fn handle_history(context: &CliContext, args: HistoryArgs, json: bool) -> Result<()> {
    let filter = TransactionFilter {
        variant_id: args.variant_id,
        transaction_type: args.transaction_type,
        order_item_id: args.order_item_id,
        page: args.page,
        per_page: args.per_page,
        ..Default::default()
    };
    let page = context
        .engine
        .queries
        .get_transactions(&filter)
        .await
        .context("failed to query ledger")?;

    if json {
        print_json(&page)?;
        return Ok(());
    }

    println!(
        "Page {} ({} per page, {} entries total)",
        page.page, page.per_page, page.total
    );
    for entry in &page.items {
        println!(
            "- #{} {} • variant {} • qty {:+} • reserved {:+} • {} -> {} • {}",
            entry.id,
            entry.transaction_type,
            entry.variant_id,
            entry.quantity_delta,
            entry.reserved_delta,
            entry.stock_before,
            entry.stock_after,
            entry.notes
        );
    }
    Ok(())
}

async fn handle_adjust(context: &CliContext, args: AdjustArgs, json: bool) -> Result<()> {
    let change = context
        .engine
        .inventory
        .adjust_stock(args.variant_id, args.delta, args.user_id, &args.notes)
        .await
        .context("adjustment rejected")?;

    if json {
        print_json(&change)?;
    } else {
        println!(
            "Variant {} adjusted by {:+}: on-hand {}, reserved {}, available {} (entry #{})",
            change.variant_id,
            change.quantity_delta,
            change.on_hand,
            change.reserved,
            change.available,
            change.ledger_entry_id
        );
    }
    Ok(())
}

async fn handle_damage(context: &CliContext, args: DamageArgs, json: bool) -> Result<()> {
    let change = context
        .engine
        .inventory
        .record_damage(args.variant_id, args.quantity, args.user_id, &args.notes)
        .await
        .context("damage record rejected")?;

    if json {
        print_json(&change)?;
    } else {
        println!(
            "Variant {} wrote off {} damaged: on-hand {}, available {} (entry #{})",
            change.variant_id,
            args.quantity,
            change.on_hand,
            change.available,
            change.ledger_entry_id
        );
    }
    Ok(())
}

async fn handle_stock_in(context: &CliContext, args: StockInArgs, json: bool) -> Result<()> {
    let items = match (args.file, args.variant_id, args.quantity) {
        (Some(path), _, _) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<Vec<BulkStockInItem>>(&raw)
                .with_context(|| format!("{} is not a list of stock-in items", path.display()))?
        }
        (None, Some(variant_id), Some(quantity)) => vec![BulkStockInItem {
            variant_id,
            quantity,
            notes: None,
        }],
        _ => bail!("pass either --file or both --variant-id and --quantity"),
    };

    let result = context
        .engine
        .bulk
        .bulk_stock_in(items, args.user_id, args.supplier_ref)
        .await
        .context("stock-in rejected")?;

    if json {
        print_json(&result)?;
    } else {
        render_bulk(&result);
    }
    if result.failed_count > 0 {
        warn!(failed = result.failed_count, "some stock-in items failed");
    }
    Ok(())
}

async fn handle_reconcile(context: &CliContext, args: ReconcileArgs, json: bool) -> Result<()> {
    let report = context
        .engine
        .reconciliation
        .reconcile_stock(args.variant_id, args.user_id)
        .await
        .context("reconciliation failed")?;

    if json {
        print_json(&report)?;
    } else if report.has_discrepancy {
        println!(
            "Variant {}: on-hand {} corrected to ledger total {} ({:+})",
            report.variant_id, report.previous_on_hand, report.expected, report.difference
        );
    } else {
        println!(
            "Variant {}: on-hand {} matches the ledger",
            report.variant_id, report.final_stock
        );
    }
    Ok(())
}

async fn handle_sweep(context: &CliContext, json: bool) -> Result<()> {
    let result = context
        .engine
        .sweeper
        .sweep_once(Utc::now())
        .await
        .context("expiry sweep failed")?;

    if json {
        print_json(&result)?;
    } else {
        println!(
            "Scanned {} expired orders: {} released, {} already settled, {} failed",
            result.scanned, result.released, result.skipped, result.failed
        );
    }
    Ok(())
}

async fn handle_drain_outbox(context: &CliContext, json: bool) -> Result<()> {
    let engine = &context.engine;
    let report = engine
        .outbox_worker_with_handlers(engine.event_handlers())
        .drain_once()
        .await
        .context("failed to drain outbox")?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "Outbox: {} claimed, {} delivered, {} retried, {} failed",
            report.claimed, report.delivered, report.retried, report.failed
        );
    }
    Ok(())
}

async fn handle_worker(context: &CliContext, args: WorkerArgs) -> Result<()> {
    let engine = &context.engine;
    let outbox = engine
        .outbox_worker_with_handlers(engine.event_handlers())
        .start();
    let sweeper = engine
        .sweeper
        .clone()
        .start(Duration::from_secs(args.sweep_interval_secs.max(1)));

    info!("worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down worker");

    outbox.abort();
    sweeper.abort();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_status(status: &InventoryStatus) {
    let availability = if status.is_unlimited {
        "unlimited".to_string()
    } else {
        status.available.to_string()
    };
    println!(
        "- {} ({}) • on-hand {} • reserved {} • available {}{}{}",
        status.sku,
        status.variant_id,
        status.on_hand,
        status.reserved,
        availability,
        if status.is_low_stock { " • LOW" } else { "" },
        if status.is_active { "" } else { " • inactive" }
    );
}

fn render_bulk(result: &BulkOperationResult) {
    println!(
        "{} of {} items applied, {} failed",
        result.success_count, result.total_requested, result.failed_count
    );
    for item in &result.results {
        match (&item.error, item.new_on_hand) {
            (Some(error), _) => println!("  [{}] {} failed: {}", item.index, item.variant_id, error),
            (None, Some(on_hand)) => {
                println!("  [{}] {} on-hand {}", item.index, item.variant_id, on_hand)
            }
            (None, None) => println!("  [{}] {} applied", item.index, item.variant_id),
        }
    }
}
