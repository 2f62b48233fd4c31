use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chunklift::config::Config;
use chunklift::http::ApiClient;
use chunklift::logging;
use chunklift::pacer::{Pacer, PacerConfig};
use chunklift::progress::{Aggregator, ProgressConfig};
use chunklift::upload::{fetch_session, EngineConfig, UploadEngine};

#[derive(Parser, Debug)]
#[command(
    name = "chunklift",
    version,
    about = "Concurrent resumable chunked uploader for remote HTTP storage"
)]
struct Args {
    /// File or directory path to upload
    #[arg(long)]
    path: PathBuf,

    /// Remote directory for uploaded files
    #[arg(long)]
    dest: String,

    /// Parts in flight per file (overrides WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Files in flight globally (overrides TRANSFERS)
    #[arg(long)]
    transfers: Option<usize>,

    /// Resolve fingerprints and validate configuration without transferring
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load().context("loading configuration")?;

    let aggregator = Arc::new(Aggregator::new(ProgressConfig::default()));
    let _log_guard = logging::init(config.debug, aggregator.log_writer());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let api = Arc::new(ApiClient::new(&config.api_url, &config.session_token)?);
    let pacer = Arc::new(Pacer::new(PacerConfig::default(), cancel));

    let session = fetch_session(&api, &pacer)
        .await
        .context("resolving session")?;

    let engine_config = EngineConfig {
        part_size: config.part_size.bytes() as i64,
        workers: args.workers.unwrap_or(config.workers),
        transfers: args.transfers.unwrap_or(config.transfers),
        channel_id: config.channel_id,
        encrypt_files: config.encrypt_files,
        randomise_part: config.randomise_part,
        delete_after_upload: config.delete_after_upload,
        dry_run: args.dry_run,
    };
    let engine = Arc::new(UploadEngine::new(
        api,
        pacer,
        aggregator.clone(),
        engine_config,
        session.user_id,
    ));

    let source_meta = tokio::fs::metadata(&args.path)
        .await
        .with_context(|| format!("cannot stat {}", args.path.display()))?;

    engine
        .create_remote_dir(&args.dest)
        .await
        .context("creating root remote directory")?;

    let summary = engine
        .summarise(&args.path)
        .await
        .context("summarising source")?;
    aggregator.add_transfer(summary.total_files, summary.total_bytes);

    let progress = aggregator.start_progress();

    if source_meta.is_dir() {
        if let Err(e) = engine.upload_directory(&args.path, &args.dest).await {
            error!("upload failed: {e}");
        }
        engine.wait().await;
    } else {
        match engine.resolve_dir_id(&args.dest).await {
            Ok(dir_id) => {
                if let Err(e) = engine.upload_file(&args.path, &args.dest, &dir_id).await {
                    error!("upload failed: {e}");
                }
            }
            Err(e) => error!("upload failed: {e}"),
        }
    }

    info!("Uploads complete!");
    progress.stop().await;
    Ok(())
}
