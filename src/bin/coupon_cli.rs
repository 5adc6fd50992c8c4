use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use storefront_coupons::{
    config::{self, AppConfig},
    db::{self, DbPool},
    entities::{coupon, order},
    events::{process_events, EventHandler, EventSender, LoggingEventHandler},
    services::{
        coupon_recommendation::CouponRecommendation,
        coupons::{CouponDetails, CouponPage, CouponQuery},
        factory::{ServiceContainer, ServiceFactory},
    },
};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    let outcome = match cli.command {
        Commands::Migrate => handle_migrate(&context).await,
        Commands::Apply(args) => handle_apply(&context, args, cli.json).await,
        Commands::Remove(args) => handle_remove(&context, args, cli.json).await,
        Commands::Recommend(args) => handle_recommend(&context, args, cli.json).await,
        Commands::Coupons(command) => handle_coupons_command(&context, command, cli.json).await,
    };

    context.shutdown().await;
    outcome
}

#[derive(Parser)]
#[command(name = "coupon-cli", about = "Apply, recommend and administer storefront coupons", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the embedded schema migrations
    Migrate,
    /// Apply a coupon code to an order
    Apply(ApplyArgs),
    /// Remove the coupon from an order
    Remove(OrderArgs),
    /// List coupons applicable to an order, best savings first
    Recommend(OrderArgs),
    #[command(subcommand)]
    Coupons(CouponCommands),
}

#[derive(Args)]
struct ApplyArgs {
    #[arg(long, help = "Order to apply the coupon to")]
    order_id: Uuid,
    #[arg(long, help = "Coupon code, case-sensitive")]
    code: String,
}

#[derive(Args)]
struct OrderArgs {
    #[arg(long, help = "Order identifier")]
    order_id: Uuid,
}

#[derive(Subcommand)]
enum CouponCommands {
    List(ListCouponsArgs),
    Show(ShowCouponArgs),
    Disable(CouponIdArgs),
}

#[derive(Args)]
struct ListCouponsArgs {
    #[arg(long, help = "Only coupons whose code contains this text")]
    code: Option<String>,
    #[arg(long = "category", help = "Only coupons linked to this category name")]
    categories: Vec<String>,
    #[arg(
        long = "sort",
        allow_hyphen_values = true,
        help = "Sort field, prefix with '-' for descending; repeatable"
    )]
    sort: Vec<String>,
    #[arg(long, default_value_t = 1)]
    page: u64,
    #[arg(long, default_value_t = 5)]
    size: u64,
}

#[derive(Args)]
struct ShowCouponArgs {
    #[arg(long)]
    id: Uuid,
    #[arg(
        long,
        action = ArgAction::SetTrue,
        help = "Include linked products and categories"
    )]
    associated: bool,
}

#[derive(Args)]
struct CouponIdArgs {
    #[arg(long)]
    id: Uuid,
}

struct CliContext {
    db: Arc<DbPool>,
    services: ServiceContainer,
    events: Option<(EventSender, JoinHandle<()>)>,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config: AppConfig = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);

        if config.auto_migrate {
            db::run_migrations(&db).await.context("failed to run migrations")?;
        }

        let (event_sender, event_rx) = EventSender::channel(config.event_channel_capacity);
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(LoggingEventHandler)];
        let worker = tokio::spawn(process_events(event_rx, handlers));

        let factory = ServiceFactory::from_config(db.clone(), Some(event_sender.clone()), &config);
        let services = ServiceContainer::new(&factory);

        Ok(Self {
            db,
            services,
            events: Some((event_sender, worker)),
        })
    }

    /// Drops every sender, waits for queued events to be handled and closes the pool
    async fn shutdown(self) {
        let CliContext {
            db,
            services,
            events,
        } = self;
        drop(services);
        if let Some((sender, worker)) = events {
            drop(sender);
            let _ = worker.await;
        }
        if let Ok(pool) = Arc::try_unwrap(db) {
            if let Err(e) = db::close_pool(pool).await {
                warn!(error = %e, "Failed to close database pool");
            }
        }
    }
}

async fn handle_migrate(context: &CliContext) -> Result<()> {
    db::run_migrations(&context.db)
        .await
        .context("failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

async fn handle_apply(context: &CliContext, args: ApplyArgs, json: bool) -> Result<()> {
    let order = context
        .services
        .orders
        .find_with_items(args.order_id)
        .await
        .context("failed to load order")?;

    let updated = context
        .services
        .application
        .apply_coupon(&order, &args.code)
        .await
        .map_err(|e| anyhow::anyhow!(e.response_message()))
        .with_context(|| format!("could not apply coupon {}", args.code))?;

    if json {
        print_json(&updated)?;
    } else {
        render_order(&updated);
    }
    Ok(())
}

async fn handle_remove(context: &CliContext, args: OrderArgs, json: bool) -> Result<()> {
    let order = context
        .services
        .orders
        .find_by_id(args.order_id)
        .await
        .context("failed to load order")?
        .with_context(|| format!("order {} not found", args.order_id))?;

    let updated = context
        .services
        .application
        .remove_coupon(&order)
        .await
        .map_err(|e| anyhow::anyhow!(e.response_message()))
        .context("could not remove coupon")?;

    if json {
        print_json(&updated)?;
    } else {
        render_order(&updated);
    }
    Ok(())
}

async fn handle_recommend(context: &CliContext, args: OrderArgs, json: bool) -> Result<()> {
    let order = context
        .services
        .orders
        .find_with_items(args.order_id)
        .await
        .context("failed to load order")?;

    let recommendations = context
        .services
        .recommendation
        .recommend(&order)
        .await
        .context("failed to compute recommendations")?;

    if json {
        print_json(&recommendations)?;
    } else if recommendations.is_empty() {
        println!("No coupons apply to order {}", args.order_id);
    } else {
        for recommendation in &recommendations {
            render_recommendation(recommendation);
        }
    }
    Ok(())
}

async fn handle_coupons_command(context: &CliContext, command: CouponCommands, json: bool) -> Result<()> {
    let admin = &context.services.admin;
    match command {
        CouponCommands::List(args) => {
            let page = admin
                .list_coupons(CouponQuery {
                    code: args.code,
                    categories: args.categories,
                    sort: args.sort,
                    page: Some(args.page),
                    size: Some(args.size),
                    ..Default::default()
                })
                .await
                .context("failed to list coupons")?;
            if json {
                print_json(&page)?;
            } else {
                render_page(&page);
            }
        }
        CouponCommands::Show(args) => {
            let details = admin
                .get_coupon(args.id, args.associated)
                .await
                .context("failed to load coupon")?;
            if json {
                print_json(&details)?;
            } else {
                render_details(&details);
            }
        }
        CouponCommands::Disable(args) => {
            let coupon = admin
                .disable_coupon(args.id)
                .await
                .context("failed to disable coupon")?;
            if json {
                print_json(&coupon)?;
            } else {
                println!("Coupon {} disabled after {} uses", coupon.code, coupon.times_used);
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_order(order: &order::Model) {
    let coupon = order
        .coupon_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "none".to_string());
    println!(
        "- Order {} • subtotal {} {} • total {} • coupon {} • version {}",
        order.id, order.sub_total, order.currency, order.final_total, coupon, order.version
    );
}

fn render_coupon(coupon: &coupon::Model) {
    let usage = match coupon.max_usage {
        Some(max) => format!("{}/{}", coupon.times_used, max),
        None => format!("{}/unlimited", coupon.times_used),
    };
    let ends = coupon
        .end_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "never".to_string());
    let status = if coupon.is_available_on(Utc::now().date_naive()) {
        "available"
    } else {
        "unavailable"
    };
    println!(
        "- {} • {} {} on {} • used {} • ends {} • {}",
        coupon.code, coupon.discount_value, coupon.discount_type, coupon.target, usage, ends, status
    );
}

fn render_recommendation(recommendation: &CouponRecommendation) {
    println!(
        "- {} • total {} (saves {})",
        recommendation.coupon.code,
        recommendation.final_total,
        recommendation.savings()
    );
}

fn render_page(page: &CouponPage) {
    println!(
        "Page {}/{} • {} coupon(s)",
        page.current_page, page.total_pages, page.total_items
    );
    for coupon in &page.coupons {
        render_coupon(coupon);
    }
}

fn render_details(details: &CouponDetails) {
    render_coupon(&details.coupon);
    if let Some(products) = &details.products {
        for product in products {
            println!("    product {} ({})", product.name, product.id);
        }
    }
    if let Some(categories) = &details.categories {
        for category in categories {
            println!("    category {}", category.name);
        }
    }
}
