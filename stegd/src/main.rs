//! The canonical service binary for running steganography analysis.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]
#![deny(clippy::unwrap_used)]

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use pngfix::IhdrIndex;
use registry::Registry;
use stable_eyre::{eyre::Context, Result};
use stegd::{config, http, queue, store::Store, sweep, worker::Worker, Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cmd {
    /// What the service should do.
    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the service: HTTP surface, queue, and worker.
    Serve(CmdServe),

    /// Materialize the IHDR CRC index.
    ///
    /// The index is read-only at serve time, so it is built once here
    /// rather than lazily on the request path (which would race across
    /// workers).
    InitIndex(CmdInitIndex),

    /// Run one retention sweep and exit.
    Sweep(CmdSweep),
}

#[derive(Parser, Debug)]
struct CmdServe {
    #[clap(flatten)]
    settings: config::Settings,
}

#[derive(Parser, Debug)]
struct CmdInitIndex {
    /// Where to write the index.
    #[clap(long, env = "IHDR_DB_PATH", default_value = "./ihdr_crcs.db")]
    path: PathBuf,
}

#[derive(Parser, Debug)]
struct CmdSweep {
    #[clap(flatten)]
    settings: config::Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    stable_eyre::install()?;
    init_logging();

    let cmd = Cmd::parse();
    match cmd.mode {
        Mode::Serve(opts) => main_serve(opts).await,
        Mode::InitIndex(opts) => main_init_index(opts),
        Mode::Sweep(opts) => main_sweep(opts),
    }
}

async fn main_serve(CmdServe { settings }: CmdServe) -> Result<()> {
    let settings = settings.validate()?;
    let registry = Arc::new(Registry::open(settings.registry_db()).context("open registry")?);
    let store = Store::new(settings.result_root().clone(), settings.removed_root().clone());
    let index = Arc::new(
        IhdrIndex::open(settings.ihdr_db())
            .context("open ihdr index (run `stegd init-index` first)")?,
    );

    if settings.clear_at_restart() {
        info!("clearing stored results and records at restart");
        registry.clear().context("clear registry")?;
        store.clear().context("clear result store")?;
    }

    let worker = Worker::new(
        Arc::clone(&registry),
        store.clone(),
        index,
        settings.max_pending_time(),
        settings.job_timeout(),
    );
    let (submissions, drain) = queue::InProcess::start(worker);

    let runtime = Arc::new(Runtime::new(
        settings.clone(),
        registry,
        store,
        Arc::new(submissions),
    ));

    let app = http::router(Arc::clone(&runtime));
    let bind = settings.bind();
    info!(%bind, "service listening");
    axum::Server::bind(&bind)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("serve http")?;

    drain.await.context("join queue drain task")?;
    Ok(())
}

fn main_init_index(CmdInitIndex { path }: CmdInitIndex) -> Result<()> {
    info!(path = %path.display(), "building ihdr index");
    let index = IhdrIndex::create(&path).context("create ihdr index")?;
    let rows = index.len().context("count index rows")?;
    println!("ihdr index ready at {} ({rows} rows)", path.display());
    Ok(())
}

fn main_sweep(CmdSweep { settings }: CmdSweep) -> Result<()> {
    let settings = settings.validate()?;
    let registry = Arc::new(Registry::open(settings.registry_db()).context("open registry")?);
    let store = Store::new(settings.result_root().clone(), settings.removed_root().clone());
    let runtime = Runtime::new(
        settings,
        registry,
        store,
        Arc::new(queue::Devnull::default()),
    );

    let report = sweep::run(&runtime, stegd::now()).context("sweep")?;
    println!(
        "swept: {} stalled, {} broken, {} expired, {} orphaned",
        report.stalled_submissions,
        report.broken_submissions,
        report.expired_images,
        report.orphaned_images,
    );
    Ok(())
}

/// Configures the global tracing subscriber; `RUST_LOG` overrides the
/// default level.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
