mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, RecvTimeoutError};
use lumen_engine::error::ConfigError;
use lumen_engine::loader::DiskCache;
use lumen_engine::persistence::{JournalStore, StateStore};
use lumen_engine::{Engine, LoadRequest, RuntimeState, StateSource};
use lumen_events::{EventKind, PostedEvent};
use lumen_runner::{init_logging, ChatChannel, DirectoryAssets, Region, RegionFaults};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use config::{create_example_config, LumenConfig};

/// How long to wait for every initial load to report back
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rez every script in the scripts directory and run them
    Run {
        /// Directory of script sources, overriding the config
        #[arg(short, long)]
        scripts: Option<PathBuf>,

        /// Objects rezzed per script
        #[arg(short = 'n', long)]
        instances: Option<usize>,

        /// Seconds to run before stopping
        #[arg(short, long, default_value_t = 10)]
        duration: u64,

        /// Start every script fresh instead of resuming saved state
        #[arg(long)]
        fresh: bool,
    },
    /// List the compiled unit cache and saved script states
    Inspect,
    /// Write an example config file
    Init,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(LumenConfig::config_path);

    match cli.command {
        Command::Init => {
            if config_path.exists() {
                bail!("Config already exists at {}", config_path.display());
            }
            create_example_config(&config_path)?;
            eprintln!("Edit the [region] scripts_dir entry to point at your scripts.");
            Ok(())
        }
        Command::Run {
            scripts,
            instances,
            duration,
            fresh,
        } => {
            let mut config = load_config(&config_path)?;
            let _guard = init_logging("cli", config.logging.file_logging)?;
            if let Some(dir) = scripts {
                config.region.scripts_dir = dir;
            }
            if let Some(count) = instances {
                config.region.instances_per_script = count;
            }
            if fresh {
                config.region.restore_state = false;
            }
            run(config, Duration::from_secs(duration))
        }
        Command::Inspect => {
            let config = load_config(&config_path)?;
            let _guard = init_logging("cli", config.logging.file_logging)?;
            inspect(&config)
        }
    }
}

fn load_config(path: &Path) -> Result<LumenConfig> {
    match LumenConfig::load_from(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::NotFound(_)) => {
            eprintln!(
                "No config at {}, using defaults. Run `lumen init` to create one.",
                path.display()
            );
            Ok(LumenConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("loading {}", path.display())),
    }
}

fn run(config: LumenConfig, duration: Duration) -> Result<()> {
    let region_config = config.region;
    let assets = DirectoryAssets::scan(&region_config.scripts_dir).with_context(|| {
        format!(
            "scanning scripts directory {}",
            region_config.scripts_dir.display()
        )
    })?;
    if assets.is_empty() {
        bail!(
            "No scripts found in {}",
            region_config.scripts_dir.display()
        );
    }
    let assets = Arc::new(assets);

    let region = Arc::new(Region::new());
    let placements = region.populate(&assets, region_config.instances_per_script);
    info!(
        "Rezzed {} objects from {} scripts",
        placements.len(),
        assets.len()
    );

    let said = Arc::new(AtomicU64::new(0));
    let faults = Arc::new(RegionFaults::default());
    let mut engine = Engine::builder()
        .with_config(config.engine)
        .with_host(region.clone())
        .with_assets(assets)
        .with_comm(Box::new(ChatChannel::new(said.clone())))
        .with_fault_sink(faults.clone())
        .build()?;
    engine.start()?;

    let (tx, rx) = bounded(placements.len());
    for placement in &placements {
        let source = if region_config.restore_state {
            StateSource::LocalStore
        } else {
            StateSource::None
        };
        let tx = tx.clone();
        let request = LoadRequest::load(placement.item_id, placement.object_id)
            .with_state_source(source)
            .post_on_rez()
            .on_complete(move |item_id, result| {
                let _ = tx.send((item_id, result));
            });
        engine.post_load_unload_request(request);
    }
    drop(tx);

    let deadline = Instant::now() + LOAD_TIMEOUT;
    let mut loaded = 0;
    let mut failed = 0;
    while loaded + failed < placements.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((_, Ok(()))) => loaded += 1,
            Ok((item_id, Err(e))) => {
                warn!("Script {} failed to load: {}", item_id, e);
                failed += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Timed out with {} loads outstanding",
                    placements.len() - loaded - failed
                );
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("{} scripts loaded, {} failed", loaded, failed);

    let touch_every = Duration::from_millis(region_config.touch_interval_ms);
    let started = Instant::now();
    let mut last_touch = started;
    while started.elapsed() < duration {
        if engine.is_terminated() {
            bail!("Script engine terminated unexpectedly");
        }
        if !touch_every.is_zero() && last_touch.elapsed() >= touch_every {
            for object_id in region.objects() {
                engine.post_object_event(object_id, PostedEvent::new(EventKind::TouchStart));
            }
            last_touch = Instant::now();
        }
        thread::sleep(Duration::from_millis(50));
    }

    for placement in &placements {
        match engine.script_running(placement.item_id) {
            Some(info) => println!(
                "{:<24} {}  {:?} state {} ({} queued, {:.1?} runtime)",
                placement.name,
                placement.item_id,
                info.run_state,
                info.state_index,
                info.queued_events,
                info.total_runtime
            ),
            None => println!(
                "{:<24} {}  not running",
                placement.name, placement.item_id
            ),
        }
    }

    let stats = engine.stop()?;
    println!();
    println!("Resident instances: {}", stats.resident_instances);
    println!("Loaded units:       {}", stats.loaded_units);
    println!("Compilations:       {}", stats.compilations);
    println!("Asset fetches:      {}", stats.fetches);
    println!("States saved:       {}", stats.persistence.saves);
    println!("Messages said:      {}", said.load(Ordering::Relaxed));
    println!("Faults:             {}", faults.count());
    Ok(())
}

fn inspect(config: &LumenConfig) -> Result<()> {
    let cache = DiskCache::new(config.engine.cache_dir(), config.engine.cache_prefix_len);
    println!("Compiled cache: {}", cache.root().display());
    let shards = cache
        .shards()
        .with_context(|| format!("reading {}", cache.root().display()))?;
    if shards.is_empty() {
        println!("  (empty)");
    }
    for (prefix, count) in shards {
        println!("  {}  {} units", prefix, count);
    }

    let state_dir = config.engine.state_dir();
    println!("Script states: {}", state_dir.display());
    let mut store = JournalStore::open(&state_dir)?;
    let items = store.items()?;
    if items.is_empty() {
        println!("  (empty)");
    }
    for item_id in items {
        let Some(blob) = store.load(item_id)? else {
            continue;
        };
        match RuntimeState::from_bytes(&blob) {
            Ok(state) => println!(
                "  {}  {:?} state {} ({} queued, enabled: {})",
                item_id,
                state.run_state,
                state.state_index,
                state.event_queue.len(),
                state.is_enabled()
            ),
            Err(e) => println!("  {}  unreadable ({} bytes): {}", item_id, blob.len(), e),
        }
    }
    Ok(())
}
