//! Entry point (spec section 4.1/4.9). CLI surface, process wiring, and the
//! signal-driven shutdown sequence are grounded in `rqbit::main` — the
//! signal-hook thread, `CancellationToken`, and tokio runtime builder below
//! are that file's shutdown path generalized from "one `Session`" to "one
//! `Session` plus the coordinator/dispatcher/server stack wrapped around it."

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use librqbit::tracing_subscriber_config_utils::{init_logging, InitLoggingOptions};
use librqbit::{Session, SessionOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tinytorrentd::config::ConfigurationService;
use tinytorrentd::engine::EngineCoordinator;
use tinytorrentd::events::{DaemonEvent, EventBus};
use tinytorrentd::handover::{self, ConnectionInfo};
use tinytorrentd::http_server::{self, AppState};
use tinytorrentd::persistence::SqlitePersistenceRepository;

#[derive(Parser)]
#[command(version, author, about = "TinyTorrent daemon")]
struct Opts {
    /// Directory for the state database, resume data, and the
    /// connection handover file.
    #[arg(long = "data-dir", env = "TINYTORRENT_DATA_DIR")]
    data_dir: PathBuf,

    /// Console log level.
    #[arg(long = "log-level", default_value = "info", env = "TINYTORRENT_LOG_LEVEL")]
    log_level: String,

    /// Loopback address to listen on for the HTTP/WebSocket API. Port 0
    /// picks an ephemeral port, which is the default for unattended runs.
    #[arg(long = "listen-addr", env = "TINYTORRENT_LISTEN_ADDR")]
    listen_addr: Option<SocketAddr>,

    /// Run for this many seconds, then shut down cleanly. Intended for
    /// scripted/CI invocations; omit to run until signaled.
    #[arg(long = "run-seconds", env = "TINYTORRENT_RUN_SECONDS")]
    run_seconds: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let shutdown = CancellationToken::new();
    #[cfg(not(target_os = "windows"))]
    {
        let shutdown = shutdown.clone();
        use signal_hook::{consts::SIGINT, consts::SIGTERM, iterator::Signals};
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        thread::spawn(move || {
            let mut cancel_triggered = false;
            for sig in signals.forever() {
                if cancel_triggered {
                    warn!("received signal {:?} again, forcing shutdown", sig);
                    std::process::exit(1);
                }
                warn!("received signal {:?}, shutting down gracefully", sig);
                shutdown.cancel();
                cancel_triggered = true;
                thread::spawn(|| {
                    thread::sleep(Duration::from_secs(5));
                    warn!("graceful shutdown exceeded 5s, killing myself");
                    std::process::exit(1);
                });
            }
        });
    }

    let result = rt.block_on(async_main(opts, shutdown));
    if let Err(e) = result.as_ref() {
        error!("error running tinytorrentd: {e:?}");
    }
    rt.shutdown_timeout(Duration::from_secs(1));
    match result {
        Ok(()) => std::process::exit(0),
        Err(_) => std::process::exit(1),
    }
}

async fn async_main(opts: Opts, shutdown: CancellationToken) -> anyhow::Result<()> {
    let _logging = init_logging(InitLoggingOptions {
        default_rust_log_value: Some(&opts.log_level),
        log_file: None,
        log_file_rust_log: None,
        log_file_json: false,
        log_json: false,
    })?;

    tokio::fs::create_dir_all(&opts.data_dir).await?;

    let repo = Arc::new(SqlitePersistenceRepository::open(&opts.data_dir).await?);
    let events = EventBus::new();
    let mut config = ConfigurationService::load(repo.as_ref(), events.clone()).await?;
    if let Some(addr) = opts.listen_addr {
        let mut settings = config.get();
        settings.listen_addr = addr;
        config = ConfigurationService::new(settings, events.clone());
    }
    let config = Arc::new(config);

    let settings = config.get();
    let session = Session::new_with_opts(
        settings.download_dir.clone(),
        SessionOptions {
            disable_dht: !settings.dht_enabled,
            persistence: true,
            ..Default::default()
        },
    )
    .await?;

    if let Some(watch_dir) = &settings.watch_dir {
        tokio::fs::create_dir_all(watch_dir).await?;
        session.watch_folder(watch_dir);
    }

    let (coordinator, engine_handle) =
        EngineCoordinator::new(session.clone(), repo.clone(), config.clone(), events.clone())
            .await?;

    let engine_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(coordinator.run(shutdown))
    };

    let token = handover::generate_token();
    let session_id = handover::generate_token();
    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    let bound_addr = listener.local_addr()?;

    let connection_info = ConnectionInfo {
        port: bound_addr.port(),
        token: token.clone(),
        pid: std::process::id(),
    };
    let connection_path = handover::write_connection_file(&opts.data_dir, &connection_info).await?;
    info!(path = %connection_path.display(), port = bound_addr.port(), "wrote connection handover file");

    let app_state = AppState {
        engine: engine_handle,
        events: events.clone(),
        token: Arc::from(token.as_str()),
        session_id: Arc::from(session_id.as_str()),
    };

    let server_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = http_server::run(listener, app_state) => {
                    if let Err(e) = result {
                        error!(error = %e, "http server exited with error");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        })
    };

    if let Some(run_seconds) = opts.run_seconds {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(run_seconds)).await;
            shutdown.cancel();
        });
    }

    shutdown.cancelled().await;
    events.publish(DaemonEvent::Shutdown);

    let _ = server_task.await;
    engine_task.await?;
    config.persist_if_dirty(repo.as_ref()).await?;

    info!("tinytorrentd shut down cleanly");
    Ok(())
}
