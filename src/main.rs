use alloy_primitives::Address;
use clap::{
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use futures::StreamExt;
use rps_mirror::{
    actions::PersonalSummary,
    alerts::{
        AlertSink,
        HttpReminderRelay,
    },
    availability::availability,
    chain::ReadOnlySender,
    clock::{
        Clock,
        SystemClock,
    },
    config::EngineConfig,
    engine::{
        EngineDeps,
        GameEngine,
    },
    room::Room,
    rpc::JsonRpcChain,
    storage::sled_store::SledStore,
};
use std::{
    io::Write,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};
use tokio_stream::wrappers::WatchStream;
use tracing::info;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};
use url::Url;

type CliEngine = GameEngine<JsonRpcChain, ReadOnlySender, TerminalAlerts, Option<HttpReminderRelay>>;

#[derive(Parser)]
#[command(name = "rps-mirror", version, about = "Off-chain mirror of a rock-paper-scissors room contract")]
struct Args {
    /// JSON-RPC endpoint of the chain
    #[arg(long)]
    rpc_url: Url,
    /// room contract, overrides the config file
    #[arg(long)]
    contract: Option<Address>,
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// state directory, overrides the config file
    #[arg(long)]
    data_dir: Option<String>,
    /// write daily rolling logs here instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// wallet to follow for summaries and alerts
    #[arg(long)]
    viewer: Option<Address>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll and follow contract events until interrupted
    Watch,
    /// Poll once and print the room list
    Rooms,
    /// Print the final outcome of a room
    Outcome { room_id: u64 },
}

/// Rings the terminal bell and logs each alert pulse.
struct TerminalAlerts;

impl AlertSink for TerminalAlerts {
    fn alert(&self, key: &str, pattern: &[u64]) {
        info!(key, ?pattern, "alert");
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(b"\x07");
        let _ = stderr.flush();
    }

    fn all_clear(&self) {
        info!("all alerts cleared");
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(rolling::daily(dir, "rps-mirror.log"));
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn build_engine(args: &Args) -> Result<Arc<CliEngine>> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|err| eyre!("{err:#}"))?,
        None => EngineConfig::default(),
    };
    if let Some(contract) = args.contract {
        config.contract = Some(contract);
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    let contract = config
        .contract
        .ok_or_else(|| eyre!("no contract address, pass --contract or set it in the config"))?;

    let data_dir = config.expanded_data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let store = SledStore::open(&data_dir).map_err(|err| eyre!("{err:#}"))?;
    let chain = JsonRpcChain::new(args.rpc_url.clone(), contract)
        .map_err(|err| eyre!("{err:#}"))?;
    let relay = config
        .relay_url
        .clone()
        .map(HttpReminderRelay::new)
        .transpose()
        .map_err(|err| eyre!("{err:#}"))?;
    let sender = match args.viewer {
        Some(viewer) => ReadOnlySender::watching(viewer),
        None => ReadOnlySender::default(),
    };
    info!(%contract, %data_dir, viewer = ?args.viewer, "starting mirror");

    GameEngine::new(config, EngineDeps {
        chain: Arc::new(chain),
        sender: Arc::new(sender),
        sink: Arc::new(TerminalAlerts),
        relay,
        store: Arc::new(store),
        clock: Arc::new(SystemClock),
    })
    .map_err(|err| eyre!("{err:#}"))
}

fn print_rooms(rooms: &[Room], summaries: &[PersonalSummary]) {
    let now = SystemClock.now_secs();
    for room in rooms {
        let avail = availability(room, now);
        let mine = summaries
            .iter()
            .find(|summary| summary.room_id == room.id)
            .map(|summary| format!("  you: {:?} {:?}", summary.status, summary.action))
            .unwrap_or_default();
        println!(
            "#{:<5} {:<10} stake {:<24} {}{}",
            room.id, avail.label.to_string(), room.stake, room.creator, mine
        );
    }
}

async fn watch(engine: Arc<CliEngine>) -> Result<()> {
    let from_block = engine.block_number().await.map_err(|err| eyre!("{err:#}"))?;
    let runner = Arc::clone(&engine);
    let events = engine.event_stream(from_block);
    let run = tokio::spawn(async move { runner.run(events).await });

    let mut snapshots = WatchStream::from_changes(engine.subscribe());
    loop {
        tokio::select! {
            rooms = snapshots.next() => match rooms {
                Some(rooms) => print_rooms(&rooms, &engine.summaries()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
    engine.dispose();
    run.await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let _guard = init_tracing(args.log_dir.as_deref());
    let engine = build_engine(&args)?;

    match args.command {
        Command::Watch => watch(Arc::clone(&engine)).await?,
        Command::Rooms => {
            let report = engine.poll_once().await.map_err(|err| eyre!("{err:#}"))?;
            info!(tracked = report.tracked, failures = report.failures, "polled rooms");
            print_rooms(&engine.views(), &engine.summaries());
            if let Some(stats) = engine.stats() {
                println!(
                    "wins {} losses {} draws {} won {} lost {}",
                    stats.wins, stats.losses, stats.draws, stats.total_winnings, stats.total_losses
                );
            }
        }
        Command::Outcome { room_id } => {
            let (room, outcome) = engine
                .resolve_outcome(room_id)
                .await
                .map_err(|err| eyre!("{err:#}"))?;
            let winner = outcome
                .winner
                .map(|winner| format!("{winner:?}"))
                .unwrap_or_else(|| "pending".to_string());
            println!("room #{} {:?}: {winner} via {}", room.id, room.state, outcome.via);
            if let Some(viewer) = args.viewer
                && let Some(result) = outcome.result_for(&room, &viewer)
            {
                println!("you: {result:?}");
            }
        }
    }
    engine.dispose();
    Ok(())
}
