use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use affect_core::{AffectVector, ClassicalBridge, ClassicalState};
use affect_store::{
    AutoCheckpointer, BackupManager, CURRENT_VERSION, CheckpointManager, DataLayout,
    EnginePersistence, Settings, VersionManager,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "affect", about = "Affective-state memory engine")]
struct Cli {
    /// Data directory (default: $AFFECT_DATA_DIR, then ~/.affect-memory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Settings file (default: <data-dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode an affect, sample the state and print the decoded result
    Encode {
        #[arg(allow_negative_numbers = true)]
        pleasure: f64,
        arousal: f64,
        dominance: f64,

        /// Measurement shots (default from settings)
        #[arg(long)]
        shots: Option<usize>,

        /// Also file the encoded state in memory
        #[arg(long)]
        store: bool,
    },

    /// Sample an interpolated path between two affects
    Trajectory {
        /// Start as P,A,D
        #[arg(long, value_parser = parse_affect, allow_hyphen_values = true)]
        from: AffectVector,

        /// End as P,A,D
        #[arg(long, value_parser = parse_affect, allow_hyphen_values = true)]
        to: AffectVector,

        #[arg(long, default_value_t = 5)]
        steps: usize,
    },

    /// Distances between the encodings of two affects
    Distance {
        #[arg(long, value_parser = parse_affect, allow_hyphen_values = true)]
        a: AffectVector,

        #[arg(long, value_parser = parse_affect, allow_hyphen_values = true)]
        b: AffectVector,
    },

    /// Retrieve the stored memories closest to an affect
    Recall {
        #[arg(allow_negative_numbers = true)]
        pleasure: f64,
        arousal: f64,
        dominance: f64,

        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },

    /// Manage engine checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Manage file backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Migrate a persisted document in place (a backup is taken first)
    Migrate {
        file: PathBuf,

        #[arg(long, default_value = CURRENT_VERSION)]
        target: String,
    },

    /// Show engine statistics
    Stats,

    /// Take automatic checkpoints until Ctrl-C
    Watch {
        /// Seconds between checkpoints (default from settings)
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    Create {
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "")]
        description: String,
    },
    List,
    Restore {
        id: String,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Back up a file (default: the engine document)
    Create {
        file: Option<PathBuf>,

        #[arg(long)]
        name: Option<String>,
    },
    List,
    Verify {
        backup: PathBuf,
    },
    Restore {
        backup: PathBuf,

        /// Write here instead of the recorded source path
        #[arg(long)]
        target: Option<PathBuf>,
    },
}

fn parse_affect(s: &str) -> std::result::Result<AffectVector, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [p, a, d] = parts.as_slice() else {
        return Err(format!("expected P,A,D but got '{s}'"));
    };
    let num = |v: &str| v.parse::<f64>().map_err(|e| format!("'{v}': {e}"));
    Ok(AffectVector::new(num(p)?, num(a)?, num(d)?))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("failed to serialize output")?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Data directory, settings and engine lifecycle
// ---------------------------------------------------------------------------

struct App {
    layout: DataLayout,
    settings: Settings,
    json: bool,
}

impl App {
    fn open(cli: &Cli) -> Result<Self> {
        let explicit = match &cli.config {
            Some(path) => Some(
                Settings::load(path).with_context(|| format!("failed to load {}", path.display()))?,
            ),
            None => None,
        };
        let root = explicit
            .as_ref()
            .map_or_else(Settings::default, Clone::clone)
            .resolve_data_dir(cli.data_dir.as_deref());
        let layout = DataLayout::new(root);
        let settings = match explicit {
            Some(settings) => settings,
            None => {
                let path = layout.settings_path();
                Settings::load(&path).with_context(|| format!("failed to load {}", path.display()))?
            }
        };
        tracing::debug!("data dir: {}", layout.root().display());
        Ok(Self {
            layout,
            settings,
            json: cli.json,
        })
    }

    /// Fresh engine from settings, then the persisted state if there is one.
    fn engine(&self) -> Result<ClassicalBridge> {
        let mut engine =
            ClassicalBridge::new(self.settings.bridge.clone()).context("failed to initialize engine")?;
        let path = self.layout.engine_path();
        if path.exists() {
            let report = engine
                .load_state(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            tracing::debug!(
                "loaded engine v{} ({} cached, {} memories)",
                report.source_version,
                report.cache_entries,
                report.memory_nodes
            );
        }
        Ok(engine)
    }

    fn save(&self, engine: &ClassicalBridge) -> Result<()> {
        let path = self.layout.engine_path();
        engine
            .save_state(&path, None)
            .with_context(|| format!("failed to save {}", path.display()))?;
        Ok(())
    }

    fn backups(&self) -> Result<BackupManager> {
        BackupManager::new(self.layout.backups_dir(), self.settings.backup.clone())
            .context("failed to open backup directory")
    }

    fn checkpoints(&self) -> Result<CheckpointManager> {
        CheckpointManager::open(self.layout.checkpoints_dir(), self.settings.checkpoint.clone())
            .context("failed to open checkpoint registry")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let app = App::open(&cli)?;

    match cli.command {
        Commands::Encode {
            pleasure,
            arousal,
            dominance,
            shots,
            store,
        } => cmd_encode(&app, AffectVector::new(pleasure, arousal, dominance), shots, store),
        Commands::Trajectory { from, to, steps } => cmd_trajectory(&app, from, to, steps),
        Commands::Distance { a, b } => cmd_distance(&app, a, b),
        Commands::Recall {
            pleasure,
            arousal,
            dominance,
            top_k,
        } => cmd_recall(&app, AffectVector::new(pleasure, arousal, dominance), top_k),
        Commands::Checkpoint { action } => cmd_checkpoint(&app, action),
        Commands::Backup { action } => cmd_backup(&app, action),
        Commands::Migrate { file, target } => cmd_migrate(&app, &file, &target),
        Commands::Stats => cmd_stats(&app),
        Commands::Watch { interval_secs } => cmd_watch(&app, interval_secs).await,
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn print_decoded(state: &ClassicalState) {
    println!("pleasure:    {:.3}", state.affect.pleasure);
    println!("arousal:     {:.3}", state.affect.arousal);
    println!("dominance:   {:.3}", state.affect.dominance);
    println!("confidence:  {:.3}", state.confidence);
    println!("fidelity:    {:.3}", state.measurement_fidelity);
    println!("purity:      {:.3e}", state.purity);
    println!("coherence:   {:.3}", state.coherence);
    println!("mitigated:   {}", state.mitigated);
}

#[derive(Serialize)]
struct EncodeOutput<'a> {
    decoded: &'a ClassicalState,
    stored: Option<String>,
    evicted: Option<String>,
}

fn cmd_encode(app: &App, affect: AffectVector, shots: Option<usize>, store: bool) -> Result<()> {
    let mut engine = app.engine()?;
    let shots = shots.unwrap_or(engine.config().default_shots);
    let (state, outcome) = engine.encode_and_store(affect, store).context("encode failed")?;
    let decoded = engine
        .decode_quantum_to_classical(&state, shots)
        .context("decode failed")?;
    app.save(&engine)?;

    if app.json {
        return print_json(&EncodeOutput {
            decoded: &decoded,
            stored: outcome.as_ref().map(|o| o.id.to_string()),
            evicted: outcome.as_ref().and_then(|o| o.evicted).map(|(id, _)| id.to_string()),
        });
    }
    print_decoded(&decoded);
    if let Some(outcome) = outcome {
        println!("stored:      {}", outcome.id);
        if let Some((id, importance)) = outcome.evicted {
            println!("evicted:     {id} (importance {importance:.3})");
        }
        if outcome.compressed {
            println!("compressed:  yes");
        }
        if let Some(err) = &outcome.compression_error {
            tracing::warn!("memory compression failed: {err}");
        }
    }
    Ok(())
}

fn cmd_trajectory(app: &App, from: AffectVector, to: AffectVector, steps: usize) -> Result<()> {
    let engine = app.engine()?;
    let path = engine
        .create_emotional_trajectory(from, to, steps)
        .context("trajectory failed")?;
    if app.json {
        let affects: Vec<AffectVector> = path.iter().map(|s| s.affect).collect();
        return print_json(&affects);
    }
    for (i, state) in path.iter().enumerate() {
        println!(
            "{i:>3}  P={:+.3}  A={:.3}  D={:.3}  conf={:.3}",
            state.affect.pleasure, state.affect.arousal, state.affect.dominance, state.confidence
        );
    }
    Ok(())
}

fn cmd_distance(app: &App, a: AffectVector, b: AffectVector) -> Result<()> {
    let engine = app.engine()?;
    let d = engine
        .measure_emotional_distance(a, b)
        .context("distance failed")?;
    if app.json {
        return print_json(&d);
    }
    println!("fidelity:    {:.6}", d.fidelity);
    println!("trace:       {:.6}", d.trace_distance);
    println!("bures:       {:.6}", d.bures_distance);
    println!("euclidean:   {:.6}", d.euclidean_distance);
    println!("affect:      {:.6}", d.affect_distance);
    Ok(())
}

fn cmd_recall(app: &App, affect: AffectVector, top_k: usize) -> Result<()> {
    let mut engine = app.engine()?;
    let matches = engine.recall(affect, top_k);
    // retrieval refreshes importance
    app.save(&engine)?;

    if app.json {
        return print_json(&matches);
    }
    if matches.is_empty() {
        println!("(no memories found)");
    }
    for m in &matches {
        println!(
            "{}  sim={:.3}  score={:.3}  P={:+.3} A={:.3} D={:.3}",
            m.id, m.similarity, m.score, m.affect.pleasure, m.affect.arousal, m.affect.dominance
        );
    }
    Ok(())
}

fn cmd_checkpoint(app: &App, action: CheckpointAction) -> Result<()> {
    let mut manager = app.checkpoints()?;
    match action {
        CheckpointAction::Create { name, description } => {
            let engine = app.engine()?;
            let cp = manager
                .create_checkpoint(&engine, name.as_deref(), &description, false)
                .context("failed to create checkpoint")?;
            if app.json {
                return print_json(&cp);
            }
            println!("checkpoint {}", cp.id);
        }
        CheckpointAction::List => {
            let current = manager.current().map(|c| c.id.clone());
            let list = manager.list_checkpoints();
            if app.json {
                return print_json(&list);
            }
            if list.is_empty() {
                println!("(no checkpoints)");
            }
            for cp in list {
                let marker = if current.as_deref() == Some(cp.id.as_str()) { "*" } else { " " };
                let kind = if cp.is_auto { "auto" } else { "manual" };
                let status = if cp.is_valid() { "" } else { "  (missing)" };
                println!(
                    "{marker} {}  {:<12} {kind:<6} {}{status}",
                    cp.id,
                    cp.name,
                    cp.timestamp.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        CheckpointAction::Restore { id } => {
            let mut engine = app.engine()?;
            let report = manager
                .restore_checkpoint(&mut engine, &id)
                .with_context(|| format!("failed to restore checkpoint {id}"))?;
            app.save(&engine)?;
            if app.json {
                return print_json(&report);
            }
            println!("restored {}", report.checkpoint.id);
            for path in &report.recovered {
                println!("recovered {} from backup", path.display());
            }
        }
    }
    Ok(())
}

fn cmd_backup(app: &App, action: BackupAction) -> Result<()> {
    let backups = app.backups()?;
    match action {
        BackupAction::Create { file, name } => {
            let file = file.unwrap_or_else(|| app.layout.engine_path());
            if !file.exists() {
                bail!("nothing to back up: {} does not exist", file.display());
            }
            let info = backups
                .create_backup(&file, name.as_deref(), BTreeMap::new())
                .with_context(|| format!("failed to back up {}", file.display()))?;
            if app.json {
                return print_json(&info);
            }
            println!("backup {}", info.path.display());
        }
        BackupAction::List => {
            let list = backups.list_backups().context("failed to list backups")?;
            if app.json {
                return print_json(&list);
            }
            if list.is_empty() {
                println!("(no backups)");
            }
            for info in list {
                println!(
                    "{}  {}  {} bytes  {}",
                    info.path.display(),
                    info.source_path.display(),
                    info.original_size,
                    info.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        BackupAction::Verify { backup } => {
            let report = backups.verify_backup(&backup);
            if app.json {
                print_json(&report)?;
            } else if report.is_valid() {
                println!("valid: {}", backup.display());
            } else {
                println!(
                    "invalid: {} ({})",
                    backup.display(),
                    report.error.as_deref().unwrap_or("unknown")
                );
            }
            if !report.is_valid() {
                bail!("backup failed verification");
            }
        }
        BackupAction::Restore { backup, target } => {
            let written = backups
                .restore_backup(&backup, target.as_deref())
                .with_context(|| format!("failed to restore {}", backup.display()))?;
            println!("restored {}", written.display());
        }
    }
    Ok(())
}

fn cmd_migrate(app: &App, file: &Path, target: &str) -> Result<()> {
    let backups = app.backups()?;
    let report = VersionManager::new()
        .migrate_file(file, target, Some(&backups))
        .with_context(|| format!("failed to migrate {}", file.display()))?;
    if app.json {
        return print_json(&report);
    }
    if report.migrated {
        println!("migrated {} -> {}", report.from, report.to);
        if let Some(backup) = &report.backup {
            println!("backup {}", backup.display());
        }
    } else {
        println!("already at {}", report.to);
    }
    Ok(())
}

#[derive(Serialize)]
struct Stats {
    data_dir: PathBuf,
    n_qubits: usize,
    backend: &'static str,
    pattern: &'static str,
    memories: usize,
    parameters: usize,
    cached: usize,
    encodes: u64,
    decodes: u64,
    mean_fidelity: f64,
    compression_ratio: f64,
    checkpoints: usize,
    current_checkpoint: Option<String>,
}

fn cmd_stats(app: &App) -> Result<()> {
    let engine = app.engine()?;
    let manager = app.checkpoints()?;
    let stats = Stats {
        data_dir: app.layout.root().to_path_buf(),
        n_qubits: engine.config().n_qubits,
        backend: engine.backend().name(),
        pattern: engine.codec().pattern().as_str(),
        memories: engine.memory().len(),
        parameters: engine.memory().total_parameters(),
        cached: engine.measurement_cache().len(),
        encodes: engine.context().encode_count,
        decodes: engine.context().decode_count,
        mean_fidelity: engine.fidelity_metrics().mean_fidelity,
        compression_ratio: engine.memory().compression_metrics().compression_ratio,
        checkpoints: manager.len(),
        current_checkpoint: manager.current().map(|c| c.id.clone()),
    };
    if app.json {
        return print_json(&stats);
    }
    println!("data_dir:    {}", stats.data_dir.display());
    println!("n_qubits:    {}", stats.n_qubits);
    println!("backend:     {}", stats.backend);
    println!("pattern:     {}", stats.pattern);
    println!("memories:    {}", stats.memories);
    println!("parameters:  {}", stats.parameters);
    println!("cached:      {}", stats.cached);
    println!("encodes:     {}", stats.encodes);
    println!("decodes:     {}", stats.decodes);
    println!("fidelity:    {:.3}", stats.mean_fidelity);
    println!("compression: {:.3}", stats.compression_ratio);
    println!("checkpoints: {}", stats.checkpoints);
    if let Some(id) = &stats.current_checkpoint {
        println!("current:     {id}");
    }
    Ok(())
}

async fn cmd_watch(app: &App, interval_secs: Option<u64>) -> Result<()> {
    let engine = Arc::new(Mutex::new(app.engine()?));
    let manager = Arc::new(Mutex::new(app.checkpoints()?));
    let secs = interval_secs
        .unwrap_or(app.settings.checkpoint.auto_interval_secs)
        .max(1);
    let worker = AutoCheckpointer::start(
        Arc::clone(&engine),
        Arc::clone(&manager),
        Duration::from_secs(secs),
        Duration::from_millis(app.settings.checkpoint.join_timeout_ms),
    )
    .context("failed to start auto-checkpoint worker")?;
    println!("auto-checkpoint every {secs}s, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    let taken = worker.taken();
    if !worker.stop() {
        tracing::warn!("auto-checkpoint worker detached while busy");
    }
    app.save(&engine.lock())?;
    println!("stopped after {taken} checkpoints");
    Ok(())
}
