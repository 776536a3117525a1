mod config;
mod sim;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::EngineConfig;
use saga_archive::{inject_archive_to_prompt, ArchiveDb, Tier, TurnArchive};
use saga_common::{SessionId, Turn};
use saga_persist::TieredStateStore;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "saga-cli", about = "Inspect and exercise saga state stores and turn archives")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML config with `store` and `archive` sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and effective configuration
    Info,
    /// Load a state file and describe it
    Inspect {
        /// Main state JSON file
        #[arg(short, long)]
        state: PathBuf,
    },
    /// Run a synthetic campaign through the store and the archive
    Simulate {
        /// Main state JSON file
        #[arg(short, long)]
        state: PathBuf,
        /// Archive database
        #[arg(short, long)]
        db: PathBuf,
        /// Session id
        #[arg(long, default_value = "default")]
        session: String,
        /// Number of turns to run
        #[arg(short, long, default_value = "30")]
        turns: u64,
    },
    /// Print the archive context scheduled for a turn
    Context {
        /// Archive database
        #[arg(short, long)]
        db: PathBuf,
        /// Session id
        #[arg(long, default_value = "default")]
        session: String,
        /// Turn to query
        #[arg(short, long)]
        turn: Turn,
    },
    /// Compact a saved archive if it exceeds a size budget
    Compact {
        /// Archive database
        #[arg(short, long)]
        db: PathBuf,
        /// Session id
        #[arg(long, default_value = "default")]
        session: String,
        /// Size budget in bytes
        #[arg(short, long)]
        max_bytes: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            println!("saga-cli v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "schema version: {}",
                saga_kernel::MigrationRegistry::standard().target_version()
            );
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Commands::Inspect { state } => inspect(&config, &state)?,
        Commands::Simulate {
            state,
            db,
            session,
            turns,
        } => simulate(&config, &state, &db, SessionId::from(session), turns)?,
        Commands::Context { db, session, turn } => {
            let db = open_db(&db)?;
            let mut archive =
                TurnArchive::load_from_db(&db, SessionId::from(session), config.archive)?;
            match archive.get_context_for_prompt(turn) {
                Some(text) => println!("{text}"),
                None => println!("no archive context scheduled for turn {turn}"),
            }
        }
        Commands::Compact {
            db,
            session,
            max_bytes,
        } => {
            let mut db = open_db(&db)?;
            let session = SessionId::from(session);
            let mut archive = TurnArchive::load_from_db(&db, session.clone(), config.archive)?;
            let before = archive.estimated_size();
            if archive.compact(max_bytes) {
                archive.save_to_db(&mut db)?;
                println!(
                    "compacted {session}: {before} -> {} bytes",
                    archive.estimated_size()
                );
            } else {
                println!("{session} is within budget ({before} <= {max_bytes} bytes)");
            }
            for tier in Tier::ALL {
                println!("  {}: {} rows", tier.as_str(), db.tier_row_count(&session, tier)?);
            }
        }
    }

    Ok(())
}

fn open_db(path: &Path) -> anyhow::Result<ArchiveDb> {
    ArchiveDb::open(path).with_context(|| format!("opening archive db {}", path.display()))
}

fn inspect(config: &EngineConfig, state: &Path) -> anyhow::Result<()> {
    let store = TieredStateStore::open(config.store_at(state))
        .with_context(|| format!("opening state {}", state.display()))?;
    let tree = store.snapshot();
    println!("state: {}", store.path().display());
    println!("turn: {}", store.turn());
    println!("history: {}", store.history_dir().display());
    println!("keys ({}):", tree.len());
    for (key, value) in &tree {
        let cold = if store.config().is_cold(key) { " [cold]" } else { "" };
        println!("  {key}: {}{cold}", value.type_name());
    }
    match store.cold_refs() {
        Some(refs) => println!(
            "cold refs: snapshot={} latest_turn={} latest_diff={}",
            refs.snapshot,
            refs.latest_turn,
            refs.latest_diff.as_deref().unwrap_or("-")
        ),
        None => println!("cold refs: none"),
    }
    Ok(())
}

fn simulate(
    config: &EngineConfig,
    state: &Path,
    db_path: &Path,
    session: SessionId,
    turns: u64,
) -> anyhow::Result<()> {
    let mut store = TieredStateStore::open(config.store_at(state))
        .with_context(|| format!("opening state {}", state.display()))?;
    let mut db = open_db(db_path)?;
    let mut archive = TurnArchive::load_from_db(&db, session.clone(), config.archive.clone())?;

    let start = store.turn().max(archive.last_turn()) + 1;
    let mut tree = store.snapshot();
    println!("simulating {turns} turns for {session} from turn {start}");

    for turn in start..start + turns {
        let step = sim::advance(&tree, turn);
        store
            .persist(&step.state)
            .with_context(|| format!("persisting turn {turn}"))?;
        archive.record_turn(turn, &step.state, &step.delta);

        let base = format!("Narrate turn {turn}.");
        let prompt = inject_archive_to_prompt(&mut archive, turn, &base);
        if prompt != base {
            tracing::debug!(turn, bytes = prompt.len(), "prompt carries archive context");
            println!("{prompt}\n");
        }
        tree = step.state;
    }

    archive.save_to_db(&mut db)?;
    tracing::info!(%session, turns, "simulation saved");
    println!(
        "done: turn={} current={} recent={} summaries={} archive_bytes={}",
        store.turn(),
        archive.current_states().len(),
        archive.recent_deltas().len(),
        archive.archive_summaries().len(),
        archive.estimated_size()
    );
    Ok(())
}
