/// `load_config` module: loads a static YAML config, injects secrets from the
/// environment, and maps it onto the core's [`SyncSettings`].
///
/// This module is the only place where untrusted YAML is parsed.
///
/// # Responsibilities
/// - Parse the YAML file into typed sections (`source`, `destination`, `ledger`, `sync`,
///   `classification`, `report`)
/// - Inject secrets that never live in the file: `SOURCE_PASSWORD`,
///   `DESTINATION_CLIENT_SECRET`, and the optional `LEDGER_DATABASE_URL` override
/// - Validate what serde cannot: at least one location route, a positive page size
///
/// # Errors
/// Failures are returned as [`ConfigError`] and surfaced through `anyhow` at the CLI
/// boundary.
use hr_doc_sync_core::classify::Taxonomy;
use hr_doc_sync_core::contract::SubjectStatus;
use hr_doc_sync_core::dispatch::ConcurrencyBudget;
use hr_doc_sync_core::fetch::{FetchOptions, KeyRule};
use hr_doc_sync_core::routing::LocationRoute;
use hr_doc_sync_core::synchronise::{ReferenceSettings, ReportSettings, SyncSettings};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::destination::DestinationSettings;
use crate::source::SourceSettings;

pub const SOURCE_PASSWORD_ENV: &str = "SOURCE_PASSWORD";
pub const DESTINATION_SECRET_ENV: &str = "DESTINATION_CLIENT_SECRET";
pub const LEDGER_URL_ENV: &str = "LEDGER_DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to parse config YAML: {0}")]
    Parse(String),
    #[error("missing environment variable {0}")]
    MissingSecret(&'static str),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerSection {
    #[serde(default = "default_ledger_url")]
    pub url: String,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            url: default_ledger_url(),
        }
    }
}

fn default_ledger_url() -> String {
    "sqlite://hr-doc-sync.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub page_size: usize,
    pub max_offset: Option<u64>,
    pub locations: Vec<LocationRoute>,
    pub key_rule: KeyRule,
    pub required_statuses: Vec<SubjectStatus>,
    pub require_start_date: bool,
    pub reference: ReferenceSettings,
    pub attribute_group: String,
    pub concurrency: ConcurrencyBudget,
    pub temp_dir: Option<PathBuf>,
    pub fail_on_exceptions: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncSettings::default();
        Self {
            page_size: defaults.fetch.page_size,
            max_offset: defaults.fetch.max_offset,
            locations: Vec::new(),
            key_rule: defaults.key_rule,
            required_statuses: defaults.required_statuses,
            require_start_date: defaults.require_start_date,
            reference: defaults.reference,
            attribute_group: defaults.attribute_group,
            concurrency: defaults.budget,
            temp_dir: None,
            fail_on_exceptions: false,
        }
    }
}

/// Fully loaded configuration, secrets included.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source: SourceSettings,
    pub destination: DestinationSettings,
    pub ledger: LedgerSection,
    pub sync: SyncSection,
    pub classification: Taxonomy,
    pub report: ReportSettings,
}

impl AppConfig {
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            fetch: FetchOptions {
                page_size: self.sync.page_size,
                max_offset: self.sync.max_offset,
                ..FetchOptions::default()
            },
            routes: self.sync.locations.clone(),
            key_rule: self.sync.key_rule.clone(),
            required_statuses: self.sync.required_statuses.clone(),
            require_start_date: self.sync.require_start_date,
            taxonomy: self.classification.clone(),
            reference: self.sync.reference.clone(),
            attribute_group: self.sync.attribute_group.clone(),
            budget: self.sync.concurrency.clone(),
            temp_dir: self.sync.temp_dir.clone(),
            report: self.report.clone(),
            fail_on_exceptions: self.sync.fail_on_exceptions,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    source: SourceSettings,
    destination: DestinationSettings,
    #[serde(default)]
    ledger: LedgerSection,
    #[serde(default)]
    sync: SyncSection,
    #[serde(default)]
    classification: Taxonomy,
    #[serde(default)]
    report: ReportSettings,
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    info!(config_path = ?path, "Loading configuration from file");
    let content = fs::read_to_string(path).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to read config file");
        ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        }
    })?;

    serde_yaml::from_str(&content).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to parse config YAML");
        ConfigError::Parse(e.to_string())
    })
}

fn secret(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => {
            error!(variable = name, "Secret missing from environment");
            Err(ConfigError::MissingSecret(name))
        }
    }
}

/// Loads the full sync configuration and injects secrets from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let raw: RawConfig = read_yaml(path)?;

    if raw.sync.locations.is_empty() {
        return Err(ConfigError::Invalid(
            "sync.locations must list at least one location route".to_string(),
        ));
    }
    if raw.sync.page_size == 0 {
        return Err(ConfigError::Invalid(
            "sync.page_size must be positive".to_string(),
        ));
    }

    let mut source = raw.source;
    source.password = secret(SOURCE_PASSWORD_ENV)?;
    let mut destination = raw.destination;
    destination.client_secret = secret(DESTINATION_SECRET_ENV)?;

    let mut ledger = raw.ledger;
    if let Ok(url) = env::var(LEDGER_URL_ENV) {
        if !url.is_empty() {
            warn!(
                variable = LEDGER_URL_ENV,
                "Ledger URL overridden from environment"
            );
            ledger.url = url;
        }
    }

    info!(
        config_path = ?path,
        locations = raw.sync.locations.len(),
        "Parsed config YAML successfully"
    );
    Ok(AppConfig {
        source,
        destination,
        ledger,
        sync: raw.sync,
        classification: raw.classification,
        report: raw.report,
    })
}

/// Only the classification section; other sections are ignored and no secrets are needed.
pub fn load_taxonomy<P: AsRef<Path>>(path: P) -> Result<Taxonomy, ConfigError> {
    #[derive(Deserialize)]
    struct ClassificationOnly {
        #[serde(default)]
        classification: Taxonomy,
    }

    let raw: ClassificationOnly = read_yaml(path.as_ref())?;
    Ok(raw.classification)
}

/// Only the destination section, with its secret. Used by the page-count command.
pub fn load_destination<P: AsRef<Path>>(path: P) -> Result<DestinationSettings, ConfigError> {
    #[derive(Deserialize)]
    struct DestinationOnly {
        destination: DestinationSettings,
    }

    let raw: DestinationOnly = read_yaml(path.as_ref())?;
    let mut destination = raw.destination;
    destination.client_secret = secret(DESTINATION_SECRET_ENV)?;
    Ok(destination)
}
