use anyhow::{bail, Context, Result};
use apricot_sync::actions::{Action, ActionContext};
use apricot_sync::client::ApiClient;
use apricot_sync::config::{self, Config, Query};
use apricot_sync::filter::Eligibility;
use apricot_sync::pipeline::{Pacing, RecordPipeline};
use apricot_sync::report::{self, SummaryReporter};
use apricot_sync::search::{PollSettings, SearchPoller, SearchRequest};
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run only the named query (repeatable). Runs every configured query by default.
    #[arg(long = "query")]
    queries: Vec<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    let selected = select_queries(&cfg, &args.queries)?;
    if selected.is_empty() {
        warn!("no queries configured; nothing to do");
        return Ok(());
    }

    let api = ApiClient::from_config(&cfg)?;
    let reporter = report::from_config(&cfg.report)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current step");
            on_signal.cancel();
        }
    });

    let poller = SearchPoller::new(&api, PollSettings::from(&cfg.poll), cancel.clone());

    for query in selected {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(err) = run_query(&cfg, &api, reporter.as_ref(), &poller, query, &cancel).await {
            error!(query = %query.name, error = ?err, "query aborted");
            return Err(err);
        }
    }

    info!("all queries finished");
    Ok(())
}

fn select_queries<'c>(cfg: &'c Config, names: &[String]) -> Result<Vec<&'c Query>> {
    if names.is_empty() {
        return Ok(cfg.queries.iter().collect());
    }
    let mut picked = Vec::with_capacity(names.len());
    for name in names {
        match cfg.query(name) {
            Some(q) => picked.push(q),
            None => bail!("no query named '{}' in config", name),
        }
    }
    Ok(picked)
}

async fn run_query(
    cfg: &Config,
    api: &ApiClient,
    reporter: &dyn SummaryReporter,
    poller: &SearchPoller<'_, ApiClient>,
    query: &Query,
    cancel: &CancellationToken,
) -> Result<()> {
    let action: Action = query.action.parse()?;
    let today = Local::now().date_naive();

    let mut context = ActionContext::new(today);
    if let Some(level_name) = &query.target_level {
        let level = api
            .lookup_membership_level(level_name)
            .await
            .with_context(|| format!("failed to resolve membership level '{}'", level_name))?;
        context = context.with_target_level(level);
    }

    let eligibility = Eligibility::parse_all(&query.eligibility)?;
    let pipeline = RecordPipeline::new(api, reporter, cfg.report.clone())
        .supporting(&[action])
        .with_eligibility(eligibility)
        .with_context(context)
        .with_pacing(Pacing::from(&cfg.pacing))
        .with_cancel(cancel.clone());

    let mut request = SearchRequest::new(query.render_filter(today));
    if let Some(select) = &query.select {
        request = request.with_select(select.clone());
    }

    info!(query = %query.name, action = %action, "starting query");
    match pipeline.run_search(poller, request, action.as_str()).await? {
        Some(tally) => info!(
            query = %query.name,
            processed = tally.processed,
            updated = tally.updated,
            skipped = tally.skipped,
            errors = tally.errors,
            invalid = tally.invalid,
            "query finished"
        ),
        None => warn!(query = %query.name, "search returned no records; nothing processed"),
    }
    Ok(())
}
