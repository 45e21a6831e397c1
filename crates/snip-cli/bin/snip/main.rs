mod cli;
mod commands;

use crate::cli::{LogFormatArg, CLI};
use clap::Parser;
use snip_storage::{DeletionSettings, Storage, StorageSettings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CLI::parse();
    init_tracing(config.log_format);

    let settings = StorageSettings::builder()
        .database_dsn(config.database_dsn.clone())
        .base_url(config.base_url.clone())
        .deletion(
            DeletionSettings::builder()
                .max_concurrency(config.max_delete_concurrency)
                .build(),
        )
        .build();

    let storage = Storage::open(settings).await;
    info!(
        backend = %storage.backend_kind(),
        file_storage_path = %config.file_storage_path.display(),
        "storage ready"
    );

    storage.restore_from_file(&config.file_storage_path).await?;
    let outcome = commands::run(&storage, config.command).await;
    storage.save_to_file(&config.file_storage_path).await?;

    outcome
}

fn init_tracing(format: LogFormatArg) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormatArg::Text => builder.init(),
        LogFormatArg::Json => builder.json().init(),
    }
}
