//! The long-running worker: acquire leases, resync changed handlers,
//! then poll and process notifications until drained (or forever).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info};

use qvarn_client::{QvarnClient, Store};

use crate::config::{EngineSettings, Settings};
use crate::engine::{EngineEvents, MapReduceEngine};
use crate::error::{Error, Result};
use crate::listeners::{
    check_and_update_listeners_state, clear_listener_owners, get_or_create_listeners,
    worker_signature, Listener, LISTENERS_TYPE,
};
use crate::notifications::get_changes;
use crate::resync::{ResyncRun, HANDLERS_TYPE};
use crate::topology::{Topology, TopologyRegistry};

/// Default keep-alive refresh interval, seconds.
pub const LISTENER_UPDATE_INTERVAL: f64 = 10.0;
/// Default lease timeout, seconds.
pub const LISTENER_TIMEOUT: f64 = 60.0;

/// How long to sleep when a polling round processed nothing.
const IDLE_SLEEP: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "qvarnmr-worker", about = "Incremental map/reduce worker for a Qvarn store")]
pub struct WorkerArgs {
    /// Name of a registered map/reduce handler topology
    pub handlers: String,

    /// Path to the INI config file
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Keep processing changes forever instead of draining once
    #[arg(short = 'f', long)]
    pub forever: bool,
}

/// Keeps the listener leases alive. Subscribed to engine events so the
/// lease is refreshed while long batches are in progress; the refresh is
/// cheap when the stamp is younger than the interval.
pub struct KeepAlive {
    store: Arc<dyn Store>,
    listeners: Mutex<Vec<Listener>>,
    interval: f64,
    timeout: f64,
}

impl KeepAlive {
    pub async fn refresh(&self) -> Result<()> {
        let mut guard = self.listeners.lock().await;
        let updated =
            check_and_update_listeners_state(self.store.as_ref(), &guard, self.interval, self.timeout)
                .await?;
        *guard = updated;
        Ok(())
    }

    async fn snapshot(&self) -> Vec<Listener> {
        self.listeners.lock().await.clone()
    }
}

#[async_trait]
impl EngineEvents for KeepAlive {
    async fn map_handler_processed(&self) -> Result<()> {
        self.refresh().await
    }

    async fn reduce_handler_processed(&self) -> Result<()> {
        self.refresh().await
    }
}

/// Parse CLI arguments, load everything, run. Returns the process exit
/// code. Deployments wrap this in a thin `main` that carries their
/// topology registry.
pub async fn cli_main(registry: &TopologyRegistry) -> Result<i32> {
    let args = WorkerArgs::parse();
    run(&args, registry).await
}

pub async fn run(args: &WorkerArgs, registry: &TopologyRegistry) -> Result<i32> {
    let settings = Settings::load(&args.config)?;
    let config = registry.resolve(&args.handlers)?.clone();
    let topology = Topology::new(config)?;
    let store: Arc<dyn Store> = Arc::new(QvarnClient::new(settings.store.client_config())?);
    run_with_store(store, topology, &settings.engine, args.forever).await
}

/// The worker proper, independent of CLI and HTTP concerns. Returns the
/// exit code: 0 after a clean run, 1 when another worker holds the lease.
pub async fn run_with_store(
    store: Arc<dyn Store>,
    topology: Topology,
    settings: &EngineSettings,
    forever: bool,
) -> Result<i32> {
    info!(
        worker = %worker_signature(),
        started_at = %Utc::now().to_rfc3339(),
        instance = %settings.instance,
        "starting map/reduce worker"
    );

    // The engine-owned state types must exist in the store schema.
    store.status_check(&[LISTENERS_TYPE, HANDLERS_TYPE]).await?;

    let listeners = get_or_create_listeners(store.as_ref(), &settings.instance, &topology).await?;
    let keep_alive = Arc::new(KeepAlive {
        store: Arc::clone(&store),
        listeners: Mutex::new(listeners),
        interval: settings.keep_alive_update_interval,
        timeout: settings.keep_alive_timeout,
    });

    // Immediately check that no other worker is processing these sources.
    if let Err(err) = keep_alive.refresh().await {
        return match err {
            Error::Busy { owner } => {
                println!("map/reduce engine is already running on {owner}");
                Ok(1)
            }
            other => {
                // Some leases may already carry our signature.
                let listeners = keep_alive.snapshot().await;
                if let Err(clear_err) = clear_listener_owners(store.as_ref(), &listeners).await {
                    error!(error = %clear_err, "failed to release listener leases");
                }
                Err(other)
            }
        };
    }

    let mut engine = MapReduceEngine::new(Arc::clone(&store), topology);
    engine.add_callback(Arc::clone(&keep_alive) as Arc<dyn EngineEvents>);

    let outcome = drive(store.as_ref(), &mut engine, &keep_alive, settings, forever).await;

    match outcome {
        Err(Error::Busy { owner }) => {
            // The lease changed hands mid-run; nothing of ours to release.
            println!("map/reduce engine is already running on {owner}");
            Ok(1)
        }
        Err(err) => {
            let listeners = keep_alive.snapshot().await;
            if let Err(clear_err) = clear_listener_owners(store.as_ref(), &listeners).await {
                error!(error = %clear_err, "failed to release listener leases");
            }
            Err(err)
        }
        Ok(()) => {
            let listeners = keep_alive.snapshot().await;
            clear_listener_owners(store.as_ref(), &listeners).await?;
            Ok(0)
        }
    }
}

async fn drive(
    store: &dyn Store,
    engine: &mut MapReduceEngine,
    keep_alive: &KeepAlive,
    settings: &EngineSettings,
    forever: bool,
) -> Result<()> {
    // Automatic full resync for new or changed handlers, interleaved with
    // live notification processing so the engine keeps up while a long
    // resync is in progress. The reduce stage checks mapped-row versions
    // unconditionally, so interleaving cannot bypass the skew safeguard.
    let mut resync = ResyncRun::plan(store, engine.topology(), &settings.instance).await?;
    while resync.step(engine).await? {
        let changes = get_changes(store, &keep_alive.snapshot().await).await?;
        engine.process_changes(changes, false).await?;
    }

    // Cancellation is honored between processing rounds; a round in
    // flight finishes first.
    let shutdown = Arc::new(AtomicBool::new(false));
    if forever {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => shutdown.store(true, Ordering::SeqCst),
                Err(err) => error!(error = %err, "cannot listen for the shutdown signal"),
            }
        });
    }

    info!("entering the main loop");
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("shutdown signal received");
            return Ok(());
        }

        let changes = get_changes(store, &keep_alive.snapshot().await).await?;
        let changes_processed = engine.process_changes(changes, false).await?;

        if forever {
            if changes_processed == 0 {
                tokio::time::sleep(IDLE_SLEEP).await;
                keep_alive.refresh().await?;
            }
        } else if changes_processed == 0 {
            // Drain mode: everything pending has been processed.
            return Ok(());
        }
    }
}
