//! mailkeep - back up a Gmail account over IMAP and restore it elsewhere

mod config;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use config::FileConfig;
use mailkeep_auth::{CommandCredentials, CredentialProvider, StaticCredentials};
use mailkeep_core::{
    format_bytes, CoreError, GmailConnector, Interrupt, Purpose, Session, SyncEvent,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mailkeep", version, about = "Back up and restore Gmail over IMAP")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Gmail address to work on
    #[arg(long, short, global = true)]
    email: Option<String>,

    /// Backup directory (default: GYB-GMail-Backup-<email>)
    #[arg(long, global = true)]
    local_folder: Option<PathBuf>,

    /// Command printing a fresh OAuth access token; run before every connection
    #[arg(long, global = true)]
    token_command: Option<String>,

    /// Use this access token for every connection
    #[arg(long, global = true, conflicts_with = "token_command")]
    access_token: Option<String>,

    /// Messages per fetch
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Do not negotiate COMPRESS=DEFLATE
    #[arg(long, global = true)]
    no_compression: bool,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Download messages not yet in the backup
    Backup {
        /// Gmail search; `*7d*` style tokens become dates
        #[arg(long, short)]
        search: Option<String>,

        /// Skip refreshing labels and flags of messages already backed up
        #[arg(long)]
        no_refresh: bool,
    },
    /// Upload the backup into the account
    Restore {
        /// Only restore messages with this label (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,

        /// Continue an interrupted restore
        #[arg(long)]
        resume: bool,

        /// Add this label to every restored message
        #[arg(long)]
        label_restored: Option<String>,
    },
    /// Report how much a backup would download
    Estimate {
        #[arg(long, short)]
        search: Option<String>,

        /// Count messages already backed up too
        #[arg(long)]
        all: bool,
    },
    /// Rebuild the mapping between server UIDs and backed up messages
    Reindex,
}

impl Action {
    fn purpose(&self) -> Purpose {
        match self {
            Action::Backup { .. } => Purpose::Backup,
            Action::Restore { .. } => Purpose::Restore,
            Action::Estimate { .. } => Purpose::Estimate,
            Action::Reindex => Purpose::Reindex,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "mailkeep=debug" } else { "mailkeep=info" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<CoreError>()
                .map(CoreError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

/// Merge the config file with command-line overrides
fn resolve(cli: &Cli) -> Result<FileConfig> {
    let mut config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    if let Some(email) = &cli.email {
        config.set_email(email);
    }
    if config.account.email.is_empty() {
        bail!("No account given; use --email or set account.email in the config file");
    }
    if let Some(dir) = &cli.local_folder {
        config.account.backup_dir = dir.display().to_string();
    }
    if let Some(command) = &cli.token_command {
        config.account.token_command = Some(command.clone());
    }
    if let Some(batch_size) = cli.batch_size {
        config.sync.batch_size = batch_size;
    }
    if cli.no_compression {
        config.sync.compress = false;
    }

    let sync = &mut config.sync;
    match &cli.action {
        Action::Backup { search, no_refresh } => {
            if search.is_some() {
                sync.search = search.clone();
            }
            if *no_refresh {
                sync.refresh = false;
            }
        }
        Action::Restore {
            labels,
            resume,
            label_restored,
        } => {
            if !labels.is_empty() {
                sync.labels = labels.clone();
            }
            sync.resume |= *resume;
            if label_restored.is_some() {
                sync.restore_label = label_restored.clone();
            }
        }
        Action::Estimate { search, all } => {
            if search.is_some() {
                sync.search = search.clone();
            }
            if *all {
                sync.skip_captured = false;
            }
        }
        Action::Reindex => {}
    }

    Ok(config)
}

fn credentials(cli: &Cli, config: &FileConfig) -> Result<Arc<dyn CredentialProvider>> {
    let email = config.account.email.clone();
    if let Some(token) = &cli.access_token {
        return Ok(Arc::new(StaticCredentials::new(email, token.clone())));
    }
    match &config.account.token_command {
        Some(command) => Ok(Arc::new(CommandCredentials::new(email, command.clone())?)),
        None => bail!("No credentials; use --token-command, --access-token or account.token_command"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = resolve(&cli)?;
    let credentials = credentials(&cli, &config)?;
    let connector = GmailConnector::new(&config.account, credentials, config.sync.compress);

    let (tx, rx) = mpsc::channel(256);
    let interrupt = Interrupt::new();
    let mut session = Session::open(
        &config.account.backup_dir,
        &config.account.email,
        cli.action.purpose(),
        connector,
        config.sync.clone(),
    )
    .await?
    .with_events(tx)
    .with_interrupt(interrupt.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current message");
            interrupt.trigger();
        }
    });
    let progress = tokio::spawn(report_progress(rx));

    let result = perform(&mut session, &cli.action).await;
    session.close().await;
    drop(session);
    let _ = progress.await;
    result
}

async fn perform(session: &mut Session, action: &Action) -> Result<()> {
    match action {
        Action::Backup { .. } => {
            let report = session.backup().await?;
            if let Some(rebuilt) = &report.rebuilt {
                println!(
                    "Rebuilt UID index: {} matched, {} ambiguous, {} unmatched",
                    rebuilt.matched, rebuilt.ambiguous, rebuilt.unmatched
                );
            }
            println!(
                "{} messages matched, {} backed up, {} skipped, {} refreshed",
                report.matched, report.captured, report.skipped, report.refreshed
            );
        }
        Action::Restore { .. } => {
            let report = session.restore().await?;
            println!(
                "{} of {} messages restored, {} missing from the backup, {} without labels",
                report.restored, report.pending, report.missing, report.unlabeled
            );
        }
        Action::Estimate { .. } => {
            let report = session.estimate().await?;
            println!(
                "{} messages, {} to back up",
                report.messages,
                format_bytes(report.bytes)
            );
        }
        Action::Reindex => {
            let report = session.reindex().await?;
            println!(
                "{} messages mapped, {} ambiguous, {} not in the backup",
                report.matched, report.ambiguous, report.unmatched
            );
        }
    }
    Ok(())
}

async fn report_progress(mut rx: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::Connected {
                folder,
                uidvalidity,
                messages,
            } => info!("Selected {} ({} messages, UIDVALIDITY {})", folder, messages, uidvalidity),
            SyncEvent::BackupProgress { done, total } => info!("Backed up {}/{}", done, total),
            SyncEvent::RefreshProgress { done, total } => {
                info!("Refreshed labels of {}/{}", done, total)
            }
            SyncEvent::RestoreProgress { done, total } => info!("Restored {}/{}", done, total),
            SyncEvent::EstimateProgress { done, total, bytes } => {
                info!("Sized {}/{} ({})", done, total, format_bytes(bytes))
            }
            SyncEvent::ReindexProgress { done, total } => info!("Indexed {}/{}", done, total),
            // the engine already logs these
            SyncEvent::Searched { .. }
            | SyncEvent::Retrying { .. }
            | SyncEvent::Reconnecting { .. }
            | SyncEvent::Warning { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mailkeep").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_backup_flags_override_config() {
        let cli = parse(&[
            "--email",
            "a@gmail.com",
            "--batch-size",
            "10",
            "--no-compression",
            "backup",
            "--search",
            "after:*7d*",
            "--no-refresh",
        ]);
        let config = resolve(&cli).unwrap();
        assert_eq!(config.account.backup_dir, "GYB-GMail-Backup-a@gmail.com");
        assert_eq!(config.sync.batch_size, 10);
        assert!(!config.sync.compress);
        assert!(!config.sync.refresh);
        assert_eq!(config.sync.search.as_deref(), Some("after:*7d*"));
        assert_eq!(cli.action.purpose(), Purpose::Backup);
    }

    #[test]
    fn test_restore_flags() {
        let cli = parse(&[
            "restore",
            "-e",
            "b@gmail.com",
            "--label",
            "inbox",
            "--label",
            "work",
            "--resume",
            "--label-restored",
            "from-backup",
        ]);
        let config = resolve(&cli).unwrap();
        assert_eq!(config.sync.labels, vec!["inbox", "work"]);
        assert!(config.sync.resume);
        assert_eq!(config.sync.restore_label.as_deref(), Some("from-backup"));
        assert_eq!(cli.action.purpose(), Purpose::Restore);
    }

    #[test]
    fn test_missing_email_is_an_error() {
        let cli = parse(&["reindex"]);
        assert!(resolve(&cli).is_err());
    }

    #[test]
    fn test_credentials_require_a_source() {
        let cli = parse(&["-e", "a@gmail.com", "estimate", "--all"]);
        let config = resolve(&cli).unwrap();
        assert!(!config.sync.skip_captured);
        assert!(credentials(&cli, &config).is_err());

        let cli = parse(&["-e", "a@gmail.com", "--access-token", "tok", "estimate"]);
        let config = resolve(&cli).unwrap();
        assert_eq!(credentials(&cli, &config).unwrap().email(), "a@gmail.com");
    }

    #[test]
    fn test_token_flags_conflict() {
        let result = Cli::try_parse_from([
            "mailkeep",
            "--token-command",
            "x",
            "--access-token",
            "y",
            "reindex",
        ]);
        assert!(result.is_err());
    }
}
