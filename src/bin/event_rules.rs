use std::path::PathBuf;

use anyhow::{Context, Result};
use apricot_sync::client::ApiClient;
use apricot_sync::config;
use apricot_sync::recurrence::rule_from_sessions;
use apricot_sync::roster::event_roster;
use chrono::Utc;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "List upcoming events with the recurrence rule the calendar export would use")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Also print each event's registrations with invoice payment status
    #[arg(long)]
    registrations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let client = ApiClient::from_config(&cfg)?;

    let filter = format!("'StartDate' ge '{}'", Utc::now().to_rfc3339());
    let events = client
        .list_events(Some(&filter), Some("StartDate asc"))
        .await
        .context("failed to list upcoming events")?;

    for mut event in events {
        if event.sessions.is_none() {
            event = client
                .get_event(event.id)
                .await
                .with_context(|| format!("failed to fetch event {}", event.id))?;
        }
        let sessions = event.sessions.as_deref().unwrap_or(&[]);
        let rule = rule_from_sessions(sessions);
        println!(
            "{}\t{}\t{}\t{}",
            event.id,
            event.start_date.to_rfc3339(),
            event.name,
            rule.as_deref().unwrap_or("-")
        );
        if args.registrations {
            let roster = event_roster(&client, event.id)
                .await
                .with_context(|| format!("failed to list registrations for event {}", event.id))?;
            for line in roster {
                println!("\t{}", line);
            }
        }
    }
    Ok(())
}
