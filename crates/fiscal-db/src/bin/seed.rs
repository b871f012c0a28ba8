//! # Demo Store Seeder
//!
//! Creates a compliance profile for a demo store and prints a fresh pairing
//! code, so a connector agent can be paired against a local server.
//!
//! ## Usage
//! ```bash
//! cargo run -p fiscal-db --bin seed
//! cargo run -p fiscal-db --bin seed -- --db ./data/fiscal.db --mode adapter --provider mock
//! ```

use chrono::{Duration, Utc};
use std::env;

use fiscal_core::validation::generate_pairing_code;
use fiscal_core::{ComplianceProfile, KkmMode};
use fiscal_db::{Database, DbConfig};

const DEMO_ORGANIZATION_ID: &str = "00000000-0000-0000-0000-000000000001";
const DEMO_STORE_ID: &str = "00000000-0000-0000-0000-000000000101";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args: Vec<String> = env::args().collect();

    let mut db_path = String::from("./fiscal_dev.db");
    let mut mode = KkmMode::Connector;
    let mut provider: Option<String> = None;
    let mut ttl_minutes: i64 = 10;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--mode" | "-m" => {
                if i + 1 < args.len() {
                    mode = match args[i + 1].as_str() {
                        "adapter" => KkmMode::Adapter,
                        _ => KkmMode::Connector,
                    };
                    i += 1;
                }
            }
            "--provider" | "-p" => {
                if i + 1 < args.len() {
                    provider = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--ttl" => {
                if i + 1 < args.len() {
                    ttl_minutes = args[i + 1].parse().unwrap_or(10);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Fiscal pipeline demo seeder");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>        Database file path (default: ./fiscal_dev.db)");
                println!("  -m, --mode <MODE>      adapter | connector (default: connector)");
                println!("  -p, --provider <KEY>   Adapter provider key (adapter mode)");
                println!("      --ttl <MINUTES>    Pairing code lifetime (default: 10)");
                println!("  -h, --help             Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Fiscal pipeline demo seeder");
    println!("===========================");
    println!("Database: {}", db_path);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected, migrations applied");

    let profile = ComplianceProfile {
        store_id: DEMO_STORE_ID.to_string(),
        organization_id: DEMO_ORGANIZATION_ID.to_string(),
        enable_kkm: true,
        kkm_mode: mode,
        kkm_provider_key: provider,
        legal_name: Some("Demo Trading LLC".to_string()),
        tax_id: Some("301234567".to_string()),
    };
    db.compliance().upsert(&profile).await?;
    println!("✓ Compliance profile for store {} ({:?})", DEMO_STORE_ID, profile.kkm_mode);

    let code = generate_pairing_code();
    let expires_at = Utc::now() + Duration::minutes(ttl_minutes);
    db.pairing_codes()
        .insert(&code, DEMO_ORGANIZATION_ID, DEMO_STORE_ID, expires_at)
        .await?;

    println!();
    println!("Pairing code: {}", code);
    println!("  Expires at: {}", expires_at.to_rfc3339());

    db.close().await;
    Ok(())
}
