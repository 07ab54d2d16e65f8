use std::io;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use odm::config::{Action, Cli, Destination, Settings};
use odm::snapshot::Snapshot;
use odm::sync::engine::{EngineError, RunReport, TransferEngine, UploadMode};
use odm::sync::permissions::PermissionReplicator;
use odm::sync::transfer::TransferClient;
use odm_core::{LocalDriveClient, RemoteDriveClient, UploadTarget};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Downloads get far more headroom than metadata calls.
const DOWNLOAD_TIMEOUT_FACTOR: u32 = 20;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "odm=warn,odm_core=warn",
        1 => "odm=info,odm_core=info",
        2 => "odm=debug,odm_core=debug",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<RunReport> {
    let settings = Settings::from_env();
    let snapshot = Snapshot::load(&cli.snapshot)
        .await
        .with_context(|| format!("failed to load snapshot {}", cli.snapshot.display()))?;
    info!(items = snapshot.len(), "loaded snapshot");

    let engine = TransferEngine::new(&snapshot, cli.run_options()?);

    match cli.action {
        Action::ListFilenames => Ok(engine.list_filenames(&mut io::stdout().lock())?),
        Action::DownloadEstimate => Ok(engine.estimate()),
        Action::Verify => Ok(engine.verify().await),
        Action::CleanFiletree => Ok(engine.clean_filetree()),
        Action::Download => {
            let source = settings.graph_client()?;
            let transfer = TransferClient::with_timeout(settings.timeout * DOWNLOAD_TIMEOUT_FACTOR)?;
            Ok(engine.download(&source, &transfer).await)
        }
        Action::Upload | Action::VerifyUpload => {
            let mode = cli.action.upload_mode().unwrap_or(UploadMode::VerifyUpload);
            let target = cli
                .upload_target(&settings)
                .ok_or(EngineError::MissingUploadTarget)?;
            let replicator = PermissionReplicator::new(cli.domain_map.clone().unwrap_or_default());

            match cli.destination {
                Destination::Google => {
                    let client = settings.google_client()?;
                    upload_with(&engine, &client, &target, cli, mode, &replicator).await
                }
                Destination::Local => {
                    let root = cli
                        .upload_root
                        .clone()
                        .context("--upload-root is required for the local destination")?;
                    let client = LocalDriveClient::new(root);
                    upload_with(&engine, &client, &target, cli, mode, &replicator).await
                }
            }
        }
        Action::ConvertNotebooks => {
            info!(notebooks = snapshot.notebooks.len(), "captured notebooks");
            Err(EngineError::UnsupportedAction(cli.action.name()).into())
        }
    }
}

async fn upload_with<C: RemoteDriveClient>(
    engine: &TransferEngine<'_>,
    client: &C,
    target: &UploadTarget,
    cli: &Cli,
    mode: UploadMode,
    replicator: &PermissionReplicator,
) -> anyhow::Result<RunReport> {
    let root =
        TransferEngine::resolve_destination(client, target, cli.upload_path.as_deref(), mode)
            .await?;
    info!(%target, "resolved destination");
    Ok(engine.upload(client, root, mode, replicator).await)
}
