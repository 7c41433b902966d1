//! `threadscope watch` - the long-running daemon.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use threadscope_core::analysis::AnalysisCache;
use threadscope_core::pipeline::Coordinator;
use threadscope_core::sink::ws::{self, ServerState};
use threadscope_core::sink::FanoutSink;
use threadscope_core::store::StoreHandle;
use threadscope_core::watcher::DirectoryWatcher;
use threadscope_core::{Config, Database};
use tokio::sync::{mpsc, watch};

#[derive(Args)]
pub struct WatchArgs {
    /// Root directory holding one folder per project
    #[arg(long)]
    root: Option<PathBuf>,

    /// Address for the WebSocket and health endpoints
    #[arg(long)]
    bind: Option<String>,

    /// Use the polling watcher instead of native notifications
    #[arg(long)]
    polling: bool,

    /// SQLite database path (defaults to the XDG data path)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Mirror logs to stderr
    #[arg(short, long)]
    verbose: bool,
}

pub fn run(mut config: Config, args: WatchArgs) -> Result<()> {
    if let Some(root) = args.root {
        config.watcher.root = root;
    }
    if let Some(bind) = args.bind {
        config.sink.bind = bind;
    }
    config.watcher.force_polling |= args.polling;
    config.logging.stderr |= args.verbose;
    config.validate().context("invalid configuration")?;

    let _log_guard = threadscope_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    let db_path = args.database.unwrap_or_else(Config::database_path);
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(serve(config, db))
}

async fn serve(config: Config, db: Database) -> Result<()> {
    let (store, writer) = StoreHandle::spawn(db);
    let sink = FanoutSink::new(&config.sink);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = sink.spawn_reaper(shutdown_rx.clone());

    let listener = tokio::net::TcpListener::bind(&config.sink.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.sink.bind))?;

    let (events_tx, events_rx) = mpsc::channel(config.pipeline.queue_capacity.max(1));
    let watcher =
        DirectoryWatcher::watch(&config.watcher, events_tx).context("failed to watch root")?;

    let cache = AnalysisCache::from_config(&config.analysis);
    let coordinator = Coordinator::new(&config, store.clone(), sink.clone(), cache);
    let state = ServerState {
        sink: sink.clone(),
        files: coordinator.registry(),
    };
    let pipeline = tokio::spawn(coordinator.run(events_rx, shutdown_rx.clone()));

    let mut server_shutdown = shutdown_rx.clone();
    let mut server = tokio::spawn(ws::serve(listener, state, async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    }));

    println!(
        "Watching {} ({} watcher), streaming on ws://{}/ws. Press Ctrl+C to stop.",
        watcher.root().display(),
        if watcher.is_polling() { "polling" } else { "native" },
        config.sink.bind
    );

    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            eprintln!("\nShutting down...");
            None
        }
        result = &mut server => Some(result),
    };

    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    let watcher_stats = watcher.stats();
    watcher.stop().await;

    let counters = pipeline
        .await
        .context("pipeline task failed")?
        .context("pipeline failed")?;
    store.shutdown().await.context("failed to stop store writer")?;
    writer.await.context("store writer failed")?;
    let _ = reaper.await;

    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    server_result
        .context("server task failed")?
        .context("server failed")?;

    println!("Stopped.");
    println!("  Files tracked:  {}", counters.files_tracked);
    println!("  Batches:        {}", counters.batches);
    println!("  Messages:       {}", counters.messages);
    println!("  Parse errors:   {}", counters.parse_errors);
    println!("  Timeouts:       {}", counters.timeouts);
    println!("  Errors:         {}", counters.errors);
    tracing::info!(
        raw_events = watcher_stats.raw_events,
        emitted = watcher_stats.emitted,
        dropped = watcher_stats.dropped,
        batches = counters.batches,
        "threadscope stopped"
    );
    Ok(())
}
