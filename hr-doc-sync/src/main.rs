use clap::Parser;
use hr_doc_sync::cli::{run, Cli};
use hr_doc_sync::telemetry;
use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| std::env::var_os(telemetry::LOG_DIR_ENV).map(PathBuf::from));
    let _log_guard = telemetry::init(log_dir.as_deref());
    tracing::info!("CLI application startup: tracing initialised, environment loaded");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "CLI exited with error");
            1
        }
    };

    let span = tracing::info_span!("exit", code);
    span.in_scope(|| tracing::info!(code, "exit"));
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
