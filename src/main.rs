use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use mailsync::accounts::AccountRegistry;
use mailsync::auth::{HttpTokenRefresher, TokenManager, https_client};
use mailsync::config::Config;
use mailsync::db::Database;
use mailsync::error::SyncError;
use mailsync::gmail::GmailProvider;
use mailsync::models::{Account, PageSummary, Provider, SyncKind, SyncRun};
use mailsync::provider::ProviderRouter;
use mailsync::status::StatusReporter;
use mailsync::sync::{SyncHook, SyncOrchestrator};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: mailsync [--debug] <command>

commands:
  sync <account-id> [full|incremental|folder]
  sync-all [full|incremental|folder]
  status <account-id>
  history <account-id> [limit]
  daemon";

/// Prints page progress for interactive `sync` runs.
struct ProgressPrinter;

impl SyncHook for ProgressPrinter {
    fn page_reconciled(&self, account: &Account, _run_id: i64, summary: &PageSummary) {
        println!(
            "{}: page {} processed={} added={} updated={} deleted={} skipped={}",
            account.email_address,
            summary.page,
            summary.processed,
            summary.added,
            summary.updated,
            summary.deleted,
            summary.skipped
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let debug_logging = std::env::args().any(|arg| arg == "--debug");
    init_tracing(debug_logging);

    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--debug")
        .collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        return Ok(());
    };

    let config = Config::load();
    let db = Database::new(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    db.run_migrations().await.context("applying schema")?;

    match command.as_str() {
        "status" => {
            let account_id = parse_account(args.get(1))?;
            let view = StatusReporter::new(db).status_view(account_id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        "history" => {
            let account_id = parse_account(args.get(1))?;
            let limit = match args.get(2) {
                Some(raw) => raw.parse().with_context(|| format!("invalid limit `{raw}`"))?,
                None => 10,
            };
            for run in StatusReporter::new(db).get_recent_runs(account_id, limit).await? {
                print_run(&run);
            }
        }
        "sync" => {
            let account_id = parse_account(args.get(1))?;
            let kind = parse_kind(args.get(2))?;
            let orchestrator = build_orchestrator(&config, db, true)?;
            let run = orchestrator.run_sync(account_id, kind).await?;
            print_run(&run);
        }
        "sync-all" => {
            let kind = parse_kind(args.get(1))?;
            let orchestrator = build_orchestrator(&config, db, false)?;
            sync_all(&orchestrator, kind).await?;
        }
        "daemon" => {
            let orchestrator = build_orchestrator(&config, db, false)?;
            let recovered = orchestrator.recover_interrupted().await?;
            info!(recovered = recovered.len(), "startup recovery finished");

            let mut ticker = tokio::time::interval(config.sync.poll_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => sync_all(&orchestrator, SyncKind::Incremental).await?,
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down");
                        break;
                    }
                }
            }
        }
        other => bail!("unknown command `{other}`\n\n{USAGE}"),
    }

    Ok(())
}

fn init_tracing(debug_logging: bool) {
    let filter = if debug_logging {
        EnvFilter::new("mailsync=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailsync=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_orchestrator(
    config: &Config,
    db: Database,
    show_progress: bool,
) -> anyhow::Result<Arc<SyncOrchestrator>> {
    let client = https_client().context("loading native TLS roots")?;
    let accounts: Arc<dyn AccountRegistry> = Arc::new(db.clone());
    let refresher = Arc::new(HttpTokenRefresher::new(client.clone(), config.oauth.clone()));
    let tokens = Arc::new(TokenManager::new(
        db.clone(),
        accounts.clone(),
        refresher,
        config.sync.token_refresh_margin(),
        config.sync.token_refresh_timeout(),
    ));
    let provider = ProviderRouter::new().with(Provider::Google, Arc::new(GmailProvider::new(client)));

    let mut orchestrator =
        SyncOrchestrator::new(db, accounts, tokens, Arc::new(provider), config.sync.clone());
    if show_progress {
        orchestrator = orchestrator.with_hook(Arc::new(ProgressPrinter));
    }
    Ok(Arc::new(orchestrator))
}

async fn sync_all(orchestrator: &SyncOrchestrator, kind: SyncKind) -> anyhow::Result<()> {
    for (account_id, outcome) in orchestrator.sync_all_active(kind).await? {
        match outcome {
            Ok(run) => debug!(account_id, run_id = run.id, status = %run.status, "account sync finished"),
            Err(SyncError::Conflict { .. }) => debug!(account_id, "account already syncing, skipped"),
            Err(e) => warn!(account_id, error = %e, "account sync could not run"),
        }
    }
    Ok(())
}

fn parse_account(arg: Option<&String>) -> anyhow::Result<i64> {
    let raw = arg.ok_or_else(|| anyhow!("missing account id\n\n{USAGE}"))?;
    raw.parse()
        .with_context(|| format!("invalid account id `{raw}`"))
}

fn parse_kind(arg: Option<&String>) -> anyhow::Result<SyncKind> {
    match arg {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("{e}, expected full, incremental or folder")),
        None => Ok(SyncKind::Incremental),
    }
}

fn print_run(run: &SyncRun) {
    let finished = run
        .completed_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "#{} {} {} started={} finished={} processed={} added={} updated={} deleted={} skipped={}{}",
        run.id,
        run.kind,
        run.status,
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        finished,
        run.messages_processed,
        run.messages_added,
        run.messages_updated,
        run.messages_deleted,
        run.messages_skipped,
        run.error_message
            .as_deref()
            .map(|e| format!(" error={e}"))
            .unwrap_or_default()
    );
}
