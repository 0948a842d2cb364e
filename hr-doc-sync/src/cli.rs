///
/// This module implements the CLI interface for hr-doc-sync: command parsing, argument
/// validation and the async entrypoint.
///
/// All engine logic (fetching, dispatch, delivery, ledger) lives in the
/// [`hr-doc-sync-core`] crate. This module only wires config and vendor clients into it.
///
/// ## Commands
/// - `sync`: one batch synchronisation run; the process exit code is the run's.
/// - `classify`: print the classification a title would receive.
/// - `page-count`: sum destination page counts for a CSV list of document UIDs.
///
/// ## How To Use
/// - From the shell: `hr-doc-sync --help`.
/// - From tests: call [`run`] with a constructed [`Cli`]; it returns the exit code.
///
/// [`hr-doc-sync-core`]: ../../hr-doc-sync-core/
use crate::destination::SpringCmClient;
use crate::load_config::{load_config, load_destination, load_taxonomy};
use crate::source::TaleoClient;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hr_doc_sync_core::classify::Taxonomy;
use hr_doc_sync_core::ledger::SqliteLedger;
use hr_doc_sync_core::pages::{read_uids, tally_pages, DEFAULT_LOOKUP_CONCURRENCY};
use hr_doc_sync_core::synchronise::synchronise;
use std::path::PathBuf;
use std::sync::Arc;

/// CLI for hr-doc-sync: deliver HR documents to the document store exactly once.
#[derive(Parser)]
#[clap(
    name = "hr-doc-sync",
    version,
    about = "Synchronise HR source-of-record documents into a document-management store"
)]
pub struct Cli {
    /// Directory for daily-rolling log files (falls back to HR_DOC_SYNC_LOG_DIR)
    #[clap(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one synchronisation batch using the given config file
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
    /// Print the classification for a document title
    Classify {
        /// Optional YAML config whose `classification` section overrides the built-in rules
        #[clap(long)]
        config: Option<PathBuf>,
        /// Activity title or attachment description
        title: String,
        /// Classify as an attachment of this type
        #[clap(long)]
        attachment_type: Option<String>,
    },
    /// Sum page counts of delivered documents listed by UID
    PageCount {
        /// Path to the YAML config file (only `destination` is read)
        #[clap(long)]
        config: PathBuf,
        /// CSV file with a `Uid` column
        #[clap(long)]
        uids: PathBuf,
        /// Concurrent lookups
        #[clap(long, default_value_t = DEFAULT_LOOKUP_CONCURRENCY)]
        concurrency: usize,
    },
}

/// Async CLI entrypoint for main() and integration tests. Returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config } => {
            let config = load_config(&config)?;
            tracing::info!(command = "sync", "Starting synchronisation run");

            let source = Arc::new(
                TaleoClient::new(config.source.clone())
                    .map_err(|e| anyhow::anyhow!("failed to build source client: {e}"))?,
            );
            let destination = Arc::new(
                SpringCmClient::new(config.destination.clone())
                    .map_err(|e| anyhow::anyhow!("failed to build destination client: {e}"))?,
            );
            let ledger = Arc::new(
                SqliteLedger::connect_lazy(&config.ledger.url)
                    .context("invalid ledger database URL")?,
            );

            let report = synchronise(&config.sync_settings(), source, destination, ledger).await;
            for fatal in &report.fatal {
                tracing::error!(command = "sync", error = %fatal, "Fatal condition");
            }
            tracing::info!(
                command = "sync",
                run_id = %report.run_id,
                counters = ?report.counters,
                exit_code = report.exit_code(),
                "Synchronisation complete"
            );
            Ok(report.exit_code())
        }
        Commands::Classify {
            config,
            title,
            attachment_type,
        } => {
            let taxonomy = match config {
                Some(path) => load_taxonomy(&path)?,
                None => Taxonomy::default(),
            };
            let classification = match attachment_type.as_deref() {
                Some(kind) => taxonomy.classify_attachment(Some(kind), &title),
                None => taxonomy.classify(&title),
            };
            println!(
                "{}\t{}\t{}",
                classification.document_name, classification.subcategory, classification.category
            );
            Ok(0)
        }
        Commands::PageCount {
            config,
            uids,
            concurrency,
        } => {
            let settings = load_destination(&config)?;
            let uids = read_uids(&uids)?;
            let destination = SpringCmClient::new(settings)
                .map_err(|e| anyhow::anyhow!("failed to build destination client: {e}"))?;
            hr_doc_sync_core::contract::DestinationClient::authenticate(&destination)
                .await
                .map_err(|e| anyhow::anyhow!("destination authentication failed: {e}"))?;

            let tally = tally_pages(&destination, uids, concurrency).await;
            println!("docs: {} pages: {}", tally.documents, tally.pages);
            Ok(if tally.failures.is_empty() { 0 } else { 1 })
        }
    }
}
