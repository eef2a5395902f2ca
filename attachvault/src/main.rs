//! main.rs — attachvaultd entry point: a clap-driven CLI around the
//! upload/download/healthcheck/serve operations in `attachvault_core`.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use attachvault_core::config::Config;
use attachvault_core::download::DownloadOptions;
use attachvault_core::upload::UploadOptions;
use attachvault_core::AppState;

#[derive(Parser)]
#[command(name = "attachvaultd", version, about = "Chunked encrypted file storage over a chat attachment API")]
struct Cli {
    /// Directory holding config.json, bot.env, and the sqlite database.
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (healthz + range-capable file serving).
    Serve,
    /// Upload a file from disk.
    Upload {
        path: PathBuf,
        #[arg(long)]
        no_encrypt: bool,
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Download a file by id to disk.
    Download {
        file_id: i64,
        out_path: PathBuf,
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Run a healthcheck sweep over every part currently indexed.
    Healthcheck,
    /// Delete a file: remove its chat messages, then its index entry.
    Delete { file_id: i64 },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let base_dir = cli.base_dir.unwrap_or_else(|| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    info!("base_dir = {}", base_dir.display());

    let cfg = Config::load(&base_dir);
    if let Err(e) = cfg.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(1);
    }
    cfg.print_summary();

    let state = match AppState::build(cfg, base_dir).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to initialise attachvault: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Serve => run_server(state).await,
        Command::Upload { path, no_encrypt, passphrase } => run_upload(state, path, !no_encrypt, passphrase).await,
        Command::Download { file_id, out_path, passphrase } => run_download(state, file_id, out_path, passphrase).await,
        Command::Healthcheck => run_healthcheck(state).await,
        Command::Delete { file_id } => run_delete(state, file_id).await,
    };

    if let Err(e) = result {
        error!("command failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server(state: AppState) -> anyhow::Result<()> {
    let cfg = state.cfg.clone();
    let router = attachvault_core::http::router(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{addr}");

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    ctrlc::set_handler(move || shutdown_for_signal.cancel())?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn run_upload(state: AppState, path: PathBuf, encrypt: bool, passphrase: Option<String>) -> anyhow::Result<()> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.bin".to_string());
    let total_bytes_hint = tokio::fs::metadata(&path).await.ok().map(|m| m.len());

    let source = tokio::fs::File::open(&path).await?;
    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    ctrlc::set_handler(move || cancel_for_signal.cancel())?;

    let mut opts = UploadOptions::new(filename, cancel);
    opts.encrypt = encrypt;
    opts.encryption_key = passphrase.or_else(|| state.cfg.encryption_key.clone());
    opts.total_bytes_hint = total_bytes_hint;

    let outcome = state.uploader.upload(source, opts).await?;
    info!(
        "uploaded file_id={} parts={} size={} encrypted={}",
        outcome.file_id, outcome.total_parts, outcome.size, outcome.encrypted
    );
    Ok(())
}

async fn run_download(state: AppState, file_id: i64, out_path: PathBuf, passphrase: Option<String>) -> anyhow::Result<()> {
    use futures::StreamExt;

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    ctrlc::set_handler(move || cancel_for_signal.cancel())?;

    let opts = DownloadOptions { encryption_key: passphrase.or_else(|| state.cfg.encryption_key.clone()), cancel };
    let mut stream = Box::pin(state.downloader.download_stream(file_id, opts).await?);

    let mut out = tokio::fs::File::create(&out_path).await?;
    while let Some(chunk) = stream.next().await {
        out.write_all(&chunk?).await?;
    }
    out.flush().await?;
    info!("downloaded file_id={file_id} -> {}", out_path.display());
    Ok(())
}

async fn run_delete(state: AppState, file_id: i64) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    ctrlc::set_handler(move || cancel_for_signal.cancel())?;

    state.deleter.delete_file(file_id, &cancel).await?;
    info!("deleted file_id={file_id}");
    Ok(())
}

async fn run_healthcheck(state: AppState) -> anyhow::Result<()> {
    let files = state.index.list_files(None, None).await?;
    let mut all_parts = Vec::new();
    for f in &files {
        if let Some(full) = state.index.get_file_by_id(f.id).await? {
            all_parts.extend(full.parts);
        }
    }
    info!("healthcheck sweep: {} part(s) across {} file(s)", all_parts.len(), files.len());

    let cancel = CancellationToken::new();
    let (counts, _results) = state.health.sweep(&all_parts, true, &cancel, None).await?;
    info!(
        "healthcheck complete: healthy={} url_refreshed={} unhealthy={} error={}",
        counts.healthy, counts.url_refreshed, counts.unhealthy, counts.error
    );
    Ok(())
}
