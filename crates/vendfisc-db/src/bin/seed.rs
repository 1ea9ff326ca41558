//! # Seed Data Generator
//!
//! Registers sandbox fiscal devices for local development.
//!
//! ## Usage
//! ```bash
//! # Register 3 devices for org-dev (default)
//! cargo run -p vendfisc-db --bin seed
//!
//! # Custom amount, organization and database
//! cargo run -p vendfisc-db --bin seed -- --count 10 --org acme --db ./data/fiscal.db
//! ```
//!
//! Every device is ACTIVE, in sandbox mode, with automatic shifts opening
//! at 06:00 UTC and closing at 23:00 UTC.

use chrono::{NaiveTime, Utc};
use std::env;
use vendfisc_db::{Database, DbConfig, NewDevice};

/// Vending machine locations used for device names.
const LOCATIONS: &[&str] = &[
    "Central Station",
    "Airport T1",
    "Airport T2",
    "City Hospital",
    "University Library",
    "Business Center North",
    "Shopping Mall Level 2",
    "Fitness Club",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 3;
    let mut organization = String::from("org-dev");
    let mut db_path = String::from("./fiscal_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(3);
                    i += 1;
                }
            }
            "--org" | "-o" => {
                if i + 1 < args.len() {
                    organization = args[i + 1].clone();
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Vendfisc Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of devices to register (default: 3)");
                println!("  -o, --org <ID>     Organization id (default: org-dev)");
                println!("  -d, --db <PATH>    Database file path (default: ./fiscal_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Vendfisc Seed Data Generator");
    println!("============================");
    println!("Database:     {}", db_path);
    println!("Organization: {}", organization);
    println!("Devices:      {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.devices().list_by_organization(&organization).await?;
    if !existing.is_empty() {
        println!("⚠ Organization already has {} devices", existing.len());
        println!("  Skipping seed to avoid duplicates.");
        return Ok(());
    }

    let open_at = NaiveTime::from_hms_opt(6, 0, 0);
    let close_at = NaiveTime::from_hms_opt(23, 0, 0);
    let now = Utc::now();

    for n in 0..count {
        let location = LOCATIONS[n % LOCATIONS.len()];
        let name = format!("{} #{}", location, n / LOCATIONS.len() + 1);
        let new = NewDevice::sandbox(&organization, &name).with_auto_shifts(open_at, close_at);

        match db.devices().register(new, now).await {
            Ok(device) => println!("  ✓ {}  {}", device.id, device.name),
            Err(e) => eprintln!("  Failed to register {}: {}", name, e),
        }
    }

    println!();
    println!("✓ Seed complete! {} devices registered", db.devices().count().await?);
    Ok(())
}
