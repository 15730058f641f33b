use std::path::PathBuf;

use anyhow::Result;
use apricot_sync::client::ApiClient;
use apricot_sync::config;
use clap::Parser;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Contact ID to inspect
    #[arg(long)]
    contact_id: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(Some(&args.config))?;
    let client = ApiClient::from_config(&cfg)?;

    let contact = client.get_contact(args.contact_id).await?;
    println!("Contact ID: {} ({})", contact.id, contact.display_name());
    if let Some(level) = &contact.membership_level {
        println!(
            "Membership level: {} ({})",
            level.name.as_deref().unwrap_or("?"),
            level.id
        );
    }
    println!("Fields:");
    for (name, field) in &contact.fields {
        println!(
            "  {} -> {{ system_code: {}, value: {} }}",
            name, field.system_code, field.value
        );
    }
    Ok(())
}
