use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use gantry_core::{AppBuilder, Console};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const PROMPT: &[u8] = b"gantry> ";

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Policy-gated tool workbench for agent runs", long_about = None)]
struct Cli {
    /// Config file (default: $GANTRY_CONFIG, then ./gantry.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber(cli.log_file.as_deref())?;

    let app = AppBuilder::load(cli.config.as_deref())?;
    tracing::info!(config = %app.config_path().display(), "config loaded");
    let engine = app.build_engine().await?;
    let mut console = Console::new(engine.clone(), app.reports_dir());

    let shutdown = engine.cancel_token().clone();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {e:#}");
                return;
            }
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
    let mut jobs = JoinSet::new();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let greeting = console.handle("run status").await;
    write_out(&mut stdout, &greeting.text).await?;

    loop {
        stdout.write_all(PROMPT).await?;
        stdout.flush().await?;
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let response = console.handle(&line).await;
                write_out(&mut stdout, &response.text).await?;
                if response.exit {
                    break;
                }
                if let Some(job) = response.job {
                    let engine = engine.clone();
                    let done_tx = done_tx.clone();
                    jobs.spawn(async move {
                        let summary = job.run(&engine).await;
                        let _ = done_tx.send(summary);
                    });
                }
            }
            Some(summary) = done_rx.recv() => {
                stdout.write_all(b"\n").await?;
                write_out(&mut stdout, &summary).await?;
            }
            () = shutdown.cancelled() => break,
        }
    }

    shutdown.cancel();
    while jobs.join_next().await.is_some() {}
    drop(done_tx);
    while let Some(summary) = done_rx.recv().await {
        write_out(&mut stdout, &summary).await?;
    }
    tracing::info!("gantry stopped");
    Ok(())
}

async fn write_out(stdout: &mut tokio::io::Stdout, text: &str) -> std::io::Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    stdout.write_all(text.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

fn init_subscriber(log_file: Option<&Path>) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}
