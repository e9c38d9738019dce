use anyhow::{bail, Context, Result};
use std::env;
use std::sync::Arc;

use widget_entitlements::{
    logging, AppConfig, Database, EntitlementServices, UnlockState,
};

const COMMANDS: &[&str] = &[
    "catalog", "status", "check", "purchase", "restore", "revoke", "clear", "history",
];

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let command = args.get(1).map(String::as_str).unwrap_or("status");
    let argument = args.get(2).map(String::as_str);

    // Nothing is opened or created for help / unknown commands
    match command {
        "help" | "--help" | "-h" => {
            print_usage();
            return Ok(());
        }
        other if !COMMANDS.contains(&other) => {
            eprintln!("❌ Unknown command: {}", other);
            print_usage();
            std::process::exit(2);
        }
        _ => {}
    }

    let config = AppConfig::load()?;
    logging::init(&config.log_filter);

    let (services, db) = EntitlementServices::from_config(&config)?;

    match command {
        "catalog" => run_catalog(&services),
        "status" => run_status(&services, &config),
        "check" => run_check(&services, require(argument, "check <content_id>")?).await,
        "purchase" => run_purchase(&services, require(argument, "purchase <content_id>")?).await,
        "restore" => run_restore(&services).await,
        "revoke" => run_revoke(&services, &db, require(argument, "revoke <product_id>")?),
        "clear" => run_clear(&services),
        _ => run_history(&db, require(argument, "history <product_id>")?),
    }
}

fn require<'a>(argument: Option<&'a str>, usage: &str) -> Result<&'a str> {
    match argument {
        Some(value) => Ok(value),
        None => bail!("Missing argument. Usage: widget-entitlements {}", usage),
    }
}

fn print_usage() {
    println!("Usage: widget-entitlements <command> [argument]");
    println!();
    println!("  catalog                 List premium content");
    println!("  status                  Show cached entitlements");
    println!("  check <content_id>      Locked or unlocked?");
    println!("  purchase <content_id>   Buy premium content (sandbox store)");
    println!("  restore                 Restore purchases from the store");
    println!("  revoke <product_id>     Remove a local entitlement");
    println!("  clear                   Remove all local entitlements");
    println!("  history <product_id>    Payment and event history");
}

fn run_catalog(services: &EntitlementServices) -> Result<()> {
    println!("📚 Premium Content Catalog");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for content in services.catalog.premium_contents() {
        let owned = if services.cache.is_purchased(&content.product_id) {
            "✓ owned"
        } else {
            "🔒 locked"
        };
        println!(
            "  {:<28} {:<40} ¥{:<6} {}",
            content.content_id, content.product_id, content.price, owned
        );
    }

    println!("\n✓ {} premium items", services.catalog.len());
    Ok(())
}

fn run_status(services: &EntitlementServices, config: &AppConfig) -> Result<()> {
    println!("🔐 Entitlement Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  Container: {}", config.database_path.display());
    println!("  Key:       {}", services.cache.key());

    let items = services.cache.purchased_items();
    if items.is_empty() {
        println!("\n  (no purchased items)");
    } else {
        println!();
        for product_id in &items {
            println!("  ✓ {}", product_id);
        }
    }

    println!("\n✓ {} purchased items", items.len());
    Ok(())
}

async fn run_check(services: &EntitlementServices, content_id: &str) -> Result<()> {
    println!("🔍 Checking {}...", content_id);

    match services.gate.unlock_state(content_id).await {
        UnlockState::Free => println!("✓ Free content - always unlocked"),
        UnlockState::Unlocked => println!("✅ Unlocked"),
        UnlockState::Locked { item } => {
            println!("🔒 Locked");
            println!("   {} - ¥{}", item.title, item.price);
            println!("   Run: widget-entitlements purchase {}", content_id);
        }
    }
    Ok(())
}

async fn run_purchase(services: &EntitlementServices, content_id: &str) -> Result<()> {
    let Some(item) = services.gate.to_purchasable_item(content_id) else {
        println!("✓ {} is free content - nothing to buy", content_id);
        return Ok(());
    };

    println!("💳 Purchasing {} (¥{})...", item.title, item.price);

    match services.purchases.purchase(&item).await {
        Ok(receipt) => {
            println!("✅ Purchased {}", receipt.product_id);
            println!("   Transaction: {}", receipt.transaction_id);
        }
        Err(e) => match e.user_message() {
            Some(message) => {
                eprintln!("❌ {}", message);
                std::process::exit(1);
            }
            None => println!("⏸  Purchase not completed: {}", e),
        },
    }

    println!("   Status: {}", services.purchases.status().display_name());
    Ok(())
}

async fn run_restore(services: &EntitlementServices) -> Result<()> {
    println!("♻️  Restoring purchases...");

    match services.purchases.restore().await {
        Ok(restored) => {
            for product_id in &restored {
                println!("  ✓ {}", product_id);
            }
            println!("✅ Restored {} purchases", restored.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ {}", e.user_message().unwrap_or("Restore failed"));
            std::process::exit(1);
        }
    }
}

fn run_revoke(services: &EntitlementServices, db: &Arc<Database>, product_id: &str) -> Result<()> {
    let removed = services.cache.remove(product_id)?;

    if removed {
        db.record_event(&widget_entitlements::Event::new(
            "entitlement_removed",
            "product",
            product_id,
            serde_json::json!({ "source": "cli" }),
            "cli",
        ))?;
        println!("✓ Removed {}", product_id);
    } else {
        println!("  {} was not in the purchased items", product_id);
    }
    Ok(())
}

fn run_clear(services: &EntitlementServices) -> Result<()> {
    let count = services.cache.purchased_items().len();
    services.cache.clear().context("Failed to clear purchased items")?;
    println!("✓ Cleared {} purchased items", count);
    Ok(())
}

fn run_history(db: &Database, product_id: &str) -> Result<()> {
    println!("📜 History for {}", product_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let payments = db.payments_for_product(product_id)?;
    println!("\n💳 Payments ({})", payments.len());
    for payment in &payments {
        println!(
            "  {}  {:<14} {} {}",
            payment.created_at.format("%Y-%m-%d %H:%M:%S"),
            payment.status.display_name(),
            payment.amount,
            payment.currency
        );
    }

    let events = db.events_for("product", product_id)?;
    println!("\n📝 Events ({})", events.len());
    for event in &events {
        println!(
            "  {}  {:<22} by {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type,
            event.actor
        );
    }

    Ok(())
}
