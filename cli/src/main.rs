// versus-cli — Desktop CLI for peer-to-peer vote battles
//
// Cross-platform (macOS, Linux, Windows) command-line interface for Versus.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use versus_core::{
    device_fingerprint, room_id, BrokerConnector, BrokerServer, ConnectionManager,
    ConnectionStatus, Outcome, SyncDelegate, SyncError, Vote, VoteLedger,
};

#[derive(Parser)]
#[command(name = "versus")]
#[command(about = "Versus — serverless head-to-head voting", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a rendezvous broker for peers to meet through
    Broker {
        #[arg(short, long, default_value = "0.0.0.0:7271")]
        listen: String,
    },
    /// Join a battle between two items and sync votes with peers
    Vote {
        item_a: String,
        item_b: String,
        /// Cast a vote for this item after joining
        #[arg(long = "for", value_name = "ITEM")]
        choice: Option<String>,
        /// Broker address, overriding the config file
        #[arg(short, long)]
        broker: Option<String>,
        /// Keep running and print the tally as votes arrive
        #[arg(short, long)]
        watch: bool,
    },
    /// Show the votes this device recorded in the last 24 hours
    Ledger,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Broker { listen } => cmd_broker(listen).await,
        Commands::Vote {
            item_a,
            item_b,
            choice,
            broker,
            watch,
        } => cmd_vote(item_a, item_b, choice, broker, watch).await,
        Commands::Ledger => cmd_ledger().await,
    }
}

async fn cmd_broker(listen: String) -> Result<()> {
    let server = BrokerServer::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;

    println!("{}", "Versus broker".bold());
    println!(
        "  Listening on {}",
        server.local_addr()?.to_string().bright_cyan()
    );
    println!("  {}", "Ctrl-C to stop".dimmed());

    server.run().await;
    Ok(())
}

async fn cmd_vote(
    item_a: String,
    item_b: String,
    choice: Option<String>,
    broker: Option<String>,
    watch: bool,
) -> Result<()> {
    let config = config::Config::load()?;
    let broker_addr = broker.unwrap_or_else(|| config.broker_addr.clone());
    let data_dir = config.data_dir()?;
    let user_id = device_fingerprint();

    println!("{}", format!("{item_a} vs {item_b}").bold());
    println!("  Battle: {}", room_id(&item_a, &item_b).bright_cyan());
    println!("  Broker: {}", broker_addr.as_str().dimmed());
    println!();

    let connector = BrokerConnector::new(&broker_addr);
    let manager = ConnectionManager::new(
        Arc::new(connector),
        config.sync_config(),
        &user_id,
        &data_dir,
    )?;
    let events = Arc::new(EventPrinter::default());
    manager.add_delegate(events.clone());

    manager.initialize(&item_a, &item_b).await?;
    match manager.status() {
        ConnectionStatus::Connected => {
            let peers = manager.peers().len();
            if peers == 0 {
                println!("  {} First peer in the room", "✓".green());
            } else {
                println!("  {} Connected to {} peer(s)", "✓".green(), peers);
            }
        }
        ConnectionStatus::LocalOnly => {
            println!(
                "  {} Broker unreachable; votes stay on this device",
                "!".yellow()
            );
        }
        status => println!("  status: {status}"),
    }

    // Let a freshly joined battle finish pulling existing votes.
    tokio::time::sleep(Duration::from_millis(500)).await;

    if let Some(raw) = choice {
        let item = if raw.eq_ignore_ascii_case(&item_a) {
            item_a.clone()
        } else if raw.eq_ignore_ascii_case(&item_b) {
            item_b.clone()
        } else {
            manager.disconnect().await;
            anyhow::bail!("'{raw}' is not one of the battle items");
        };
        match manager.cast_vote(&item).await {
            Ok(vote) => println!("  {} Voted for {}", "✓".green(), vote.item.bright_green()),
            Err(SyncError::AlreadyVoted(_)) => {
                println!(
                    "  {} This device already voted in this battle",
                    "!".yellow()
                );
            }
            Err(e) => {
                manager.disconnect().await;
                return Err(e.into());
            }
        }
    }

    println!();
    print_tally(&manager)?;

    if watch {
        println!();
        println!("{}", "Watching for votes (Ctrl-C to leave)".dimmed());
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if events.take_dirty() {
                        println!();
                        print_tally(&manager)?;
                    }
                }
            }
        }
    }

    manager.disconnect().await;
    println!("{}", "Left the battle.".dimmed());
    Ok(())
}

async fn cmd_ledger() -> Result<()> {
    let config = config::Config::load()?;
    let mut ledger = VoteLedger::load(&config.data_dir()?)?;
    let entries = ledger.entries();

    if entries.is_empty() {
        println!("{}", "No recorded votes in the last 24 hours.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Recorded votes".bold(), entries.len());
    println!();
    for record in entries {
        println!("  {} {}", "•".bright_green(), record.battle_id.bright_cyan());
        println!(
            "    voted {} at {}",
            record.item.bright_yellow(),
            format_timestamp(record.timestamp)
        );
    }
    Ok(())
}

fn print_tally(manager: &ConnectionManager) -> Result<()> {
    let tally = manager.tally()?;
    println!("{} ({} votes)", "Tally".bold(), tally.total);

    let mut items: Vec<_> = tally.counts.iter().collect();
    items.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (item, count) in items {
        let pct = tally.percentages.get(item).copied().unwrap_or(0.0);
        let bar = "█".repeat((pct / 5.0).round() as usize);
        println!(
            "  {:<20} {:>3}  {:>5.1}%  {}",
            item.bright_cyan(),
            count,
            pct,
            bar.bright_green()
        );
    }

    match manager.outcome()? {
        Outcome::Winner(item) => println!("  {} {} leads", "★".bright_yellow(), item.bold()),
        Outcome::Tie => println!("  {}", "Dead even.".dimmed()),
        Outcome::Undecided => println!("  {}", "No votes yet.".dimmed()),
    }
    Ok(())
}

fn format_timestamp(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Prints live sync events and remembers whether the tally went stale.
#[derive(Default)]
struct EventPrinter {
    dirty: AtomicBool,
}

impl EventPrinter {
    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

impl SyncDelegate for EventPrinter {
    fn on_vote_received(&self, vote: &Vote) {
        let voter: String = vote.user_id.chars().take(8).collect();
        println!(
            "  {} {} voted {}",
            "•".bright_green(),
            voter.dimmed(),
            vote.item.bright_cyan()
        );
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn on_peer_connected(&self, peer_id: &str) {
        println!("  {} {} joined", "+".green(), peer_id.dimmed());
    }

    fn on_peer_disconnected(&self, peer_id: &str) {
        println!("  {} {} left", "-".yellow(), peer_id.dimmed());
    }

    fn on_sync_received(&self, merged: usize) {
        println!("  {} Pulled {} existing vote(s)", "✓".green(), merged);
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn on_status_changed(&self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                println!("  {} {}", "!".yellow(), status.to_string().yellow());
            }
            ConnectionStatus::Error => {
                println!("  {} lost the broker for good", "✗".red());
            }
            _ => {}
        }
    }
}
