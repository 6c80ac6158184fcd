use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use tracing::{error, info};

mod auth;
mod backup;
mod config;
mod db;
mod logging;
mod scheduler;

use backup::archive::ZipArchiveWriter;
use backup::naming::BackupName;
use backup::orchestrator::{BackupContext, BackupOrchestrator};
use backup::storage::create_storage_stack;
use config::BackupConfig;
use db::{BackupStore, SqliteBackupStore};
use scheduler::TickSchedule;

#[tokio::main]
async fn main() -> backup::Result<()> {
    // Load .env file
    dotenv().ok();

    let config = match BackupConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not set up yet
            eprintln!("{}", e);
            return Err(e);
        }
    };
    logging::init_logging(&config.log_file)?;

    if let Err(e) = start(config).await {
        error!("Fatal: {}", e);
        return Err(e);
    }
    Ok(())
}

async fn start(config: BackupConfig) -> backup::Result<()> {
    config.validate()?;
    config.ensure_work_dir()?;
    let config = Arc::new(config);
    info!(
        "Backing up {} to '{}' every {} days",
        config.source_directory.display(),
        config.drive_folder_name,
        config.interval_days
    );

    // Initialize the database
    let pool = db::init_db(&config.database_url).await?;
    let store = Arc::new(SqliteBackupStore::new(pool));
    if let Some(last) = store.recent(1).await?.into_iter().next() {
        match BackupName::parse(&last.backup_name) {
            Some(name) => info!(
                "Last recorded backup: {} of '{}' taken at {} ({})",
                last.backup_name,
                name.label(),
                name.timestamp(),
                last.status
            ),
            None => info!("Last recorded check at {} ({})", last.timestamp, last.status),
        }
    }

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(config.upload_timeout)
        .build()?;
    let stack = create_storage_stack(&config, http)?;

    // First run needs the operator to complete the OAuth consent
    if let Some(auth) = &stack.google_auth {
        auth.authorize_interactive().await?;
        info!("Google Drive credentials ready");
    }

    let orchestrator = Arc::new(BackupOrchestrator::new(BackupContext {
        config: config.clone(),
        store,
        archiver: Arc::new(ZipArchiveWriter::new()),
        sessions: stack.sessions,
        storage: stack.storage,
    }));

    scheduler::run(orchestrator, TickSchedule::from_config(&config)).await
}
