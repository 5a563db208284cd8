//! CLI tool for managing tenant domains
//!
//! Usage:
//!   edgemux-domains add <hostname> <origin>... [options]
//!   edgemux-domains remove <hostname>
//!   edgemux-domains list [--json]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use edgemux::store::SharedStore;
use edgemux::{DomainRegistry, OriginSet, SqliteStore, UpsertOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// CLI tool for managing edge tenant domains
#[derive(Parser, Debug)]
#[command(name = "edgemux-domains")]
#[command(author = "Edgemux Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage tenant domains for edgemux")]
struct Args {
    /// Domain snapshot file
    #[arg(long, env = "DOMAINS_FILE", default_value = "./data/domains.json")]
    domains_file: PathBuf,

    /// Shared store (SQLite path) used by the fleet
    #[arg(long, env = "SHARED_STORE")]
    shared_store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add or update a domain
    Add {
        /// Hostname (e.g., shop.example.com)
        hostname: String,

        /// Origin URLs, in failover order
        #[arg(required = true)]
        origins: Vec<String>,

        /// Plan name
        #[arg(short = 'p', long)]
        plan: Option<String>,

        /// Cache TTL override in seconds
        #[arg(long)]
        cache_ttl: Option<u64>,

        /// Blocked client IP or CIDR (repeatable)
        #[arg(long = "block")]
        blocked_ips: Vec<String>,

        /// Register the domain as inactive
        #[arg(long)]
        inactive: bool,
    },

    /// Remove a domain
    Remove {
        /// Hostname
        hostname: String,
    },

    /// List all domains
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let store: Option<Arc<dyn SharedStore>> = match &args.shared_store {
        Some(path) => Some(Arc::new(SqliteStore::open(path)?)),
        None => None,
    };
    let registry = DomainRegistry::open(&args.domains_file, store, Duration::from_secs(5));
    registry.reconcile().await;

    match args.command {
        Commands::Add {
            hostname,
            origins,
            plan,
            cache_ttl,
            blocked_ips,
            inactive,
        } => {
            let options = UpsertOptions {
                plan,
                active: Some(!inactive),
                cache_ttl,
                blocked_ips,
                ..Default::default()
            };
            let entry = registry
                .upsert(&hostname, OriginSet::from(origins), options)
                .await?;

            println!("Added domain:");
            println!("  Hostname:   {}", entry.hostname);
            for origin in entry.origin.as_slice() {
                println!("  Origin:     {}", origin);
            }
            println!("  Plan:       {}", entry.plan);
            println!("  Active:     {}", entry.active);
            println!("  Created:    {}", entry.created_at.to_rfc3339());
        }

        Commands::Remove { hostname } => {
            if registry.remove(&hostname).await {
                println!("Removed {}", hostname);
            } else {
                bail!("No domain registered for {}", hostname);
            }
        }

        Commands::List { json } => {
            let domains = registry.list_all();

            if json {
                println!("{}", serde_json::to_string_pretty(&domains)?);
                return Ok(());
            }

            if domains.is_empty() {
                println!("No domains found");
                return Ok(());
            }

            println!("{:<40} {:<8} {:<8} {:<40}", "HOSTNAME", "PLAN", "ACTIVE", "ORIGINS");
            println!("{}", "-".repeat(96));

            for (hostname, entry) in &domains {
                println!(
                    "{:<40} {:<8} {:<8} {:<40}",
                    hostname,
                    entry.plan,
                    if entry.active { "yes" } else { "no" },
                    entry.origin.as_slice().join(", ")
                );
            }

            println!("\nTotal: {} domain(s)", domains.len());
        }
    }

    Ok(())
}
