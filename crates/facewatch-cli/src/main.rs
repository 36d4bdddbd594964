use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::settings::SETTINGS;
use facewatch_core::{
    BucketGrid, DetectionEvent, Embedding, EmbeddingExtractor, EventKind, JsonLinesExtractor,
    Session,
};
use facewatch_store::{SqliteStore, StoreError};

#[derive(Parser)]
#[command(name = "facewatch", version, about = "facewatch identity and detection log CLI")]
struct Cli {
    /// Database path (defaults to $XDG_DATA_HOME/facewatch/facewatch.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face embedding under a name
    Register {
        #[arg(short, long)]
        name: String,
        /// JSON file holding the embedding ("-" reads stdin)
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// List registered identities
    List,
    /// Remove an identity and all its embeddings
    Remove { name: String },
    /// Stop matching against an identity without deleting it
    Disable { name: String },
    /// Resume matching against a disabled identity
    Enable { name: String },
    /// Show every engine setting and its effective value
    Settings,
    /// Change an engine setting
    Set { name: String, value: String },
    /// Show recent detection events
    Logs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// recognized, unknown or multiple
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// Run recorded extractor output through the engine
    Replay {
        /// JSON-lines file ("-" reads stdin)
        input: PathBuf,
        /// Write emitted events to the detection log
        #[arg(long)]
        persist: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(facewatch_store::default_db_path);
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;

    match cli.command {
        Commands::Register { name, embedding } => {
            let embedding = read_embedding(&embedding)?;
            tracing::debug!(name = %name, dimension = embedding.len(), "registering face");
            match store.register_face(&name, &embedding) {
                Ok(face) => println!(
                    "Registered face for '{}' ({} embedding{})",
                    face.identity,
                    face.embeddings,
                    if face.embeddings == 1 { "" } else { "s" }
                ),
                Err(StoreError::DuplicateFace { identity, confidence }) => bail!(
                    "face already registered as '{identity}' (confidence {confidence:.2})"
                ),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::List => {
            let identities = store.identity_summaries()?;
            if identities.is_empty() {
                println!("No identities registered");
            }
            for identity in identities {
                println!(
                    "{:<24} {:>3} embedding(s)  {:<8}  since {}",
                    identity.name,
                    identity.embeddings,
                    if identity.active { "active" } else { "disabled" },
                    identity.created_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }
        Commands::Remove { name } => {
            store.remove_identity(&name)?;
            println!("Removed '{name}'");
        }
        Commands::Disable { name } => {
            store.set_active(&name, false)?;
            println!("Disabled '{name}'");
        }
        Commands::Enable { name } => {
            store.set_active(&name, true)?;
            println!("Enabled '{name}'");
        }
        Commands::Settings => {
            let stored: BTreeMap<String, String> = store.stored_settings()?.into_iter().collect();
            for spec in SETTINGS {
                let (value, origin) = match stored.get(spec.name) {
                    Some(value) => (value.as_str(), "stored"),
                    None => (spec.default, "default"),
                };
                println!("{:<26} {:>8}  ({origin})  {}", spec.name, value, spec.description);
            }
        }
        Commands::Set { name, value } => {
            store.set_setting(&name, &value)?;
            println!("{name} = {}", value.trim());
        }
        Commands::Logs { limit, kind } => {
            let kind = match kind.as_deref() {
                Some(raw) => Some(
                    EventKind::parse(raw)
                        .with_context(|| format!("unknown event kind '{raw}'"))?,
                ),
                None => None,
            };
            for event in store.recent_events(limit, kind)? {
                print_event_line(&event);
            }
        }
        Commands::Replay { input, persist } => replay(&store, &input, persist)?,
    }

    Ok(())
}

/// Accepts a bare array of numbers or an object with an `embedding` array.
fn parse_embedding(raw: &str) -> Result<Embedding> {
    let value: serde_json::Value = serde_json::from_str(raw).context("embedding is not valid JSON")?;
    let array = match &value {
        serde_json::Value::Array(_) => &value,
        serde_json::Value::Object(map) => map
            .get("embedding")
            .context("JSON object has no \"embedding\" field")?,
        _ => bail!("expected a JSON array of numbers"),
    };
    let values: Vec<f32> =
        serde_json::from_value(array.clone()).context("embedding must be an array of numbers")?;
    let embedding = Embedding::new(values);
    embedding.validate()?;
    Ok(embedding)
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let mut raw = String::new();
    open_input(path)?
        .read_to_string(&mut raw)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_embedding(&raw)
}

fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(std::io::stdin()));
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Box::new(file))
}

/// One session per camera, fed in file order. Events are printed as JSON
/// lines on stdout as they are emitted.
fn replay(store: &SqliteStore, input: &Path, persist: bool) -> Result<()> {
    let mut extractor = JsonLinesExtractor::new(BufReader::new(open_input(input)?));
    let mut sessions: BTreeMap<String, Session> = BTreeMap::new();
    let mut emitted = 0usize;

    while let Some(frame) = extractor.next_frame()? {
        if !sessions.contains_key(&frame.camera) {
            tracing::debug!(camera = %frame.camera, "replay session starting");
            let session = Session::start(frame.camera.clone(), store, store, BucketGrid::default())?;
            sessions.insert(frame.camera.clone(), session);
        }
        let Some(session) = sessions.get_mut(&frame.camera) else {
            continue;
        };
        for event in session.process_frame(frame) {
            emit(store, &event, persist)?;
            emitted += 1;
        }
    }

    for (camera, session) in sessions {
        let stats = session.stats().clone();
        for event in session.stop() {
            emit(store, &event, persist)?;
            emitted += 1;
        }
        eprintln!(
            "{camera}: {} frames, {} faces, {} recognized, {} unknown, {} skipped",
            stats.frames, stats.faces, stats.recognized, stats.unknown, stats.skipped
        );
    }
    tracing::info!(
        emitted,
        persist,
        skipped_lines = extractor.skipped(),
        skipped_faces = extractor.skipped_faces(),
        "replay finished"
    );
    eprintln!(
        "{emitted} event(s){}; {} malformed line(s) and {} malformed face(s) skipped",
        if persist { " logged" } else { "" },
        extractor.skipped(),
        extractor.skipped_faces()
    );
    Ok(())
}

fn emit(store: &SqliteStore, event: &DetectionEvent, persist: bool) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    if persist {
        store.log_event(event)?;
    }
    Ok(())
}

fn print_event_line(event: &DetectionEvent) {
    let confidence = event
        .confidence
        .map(|c| format!("{c:.2}"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<10} {:<11} {:<16} {:>5}  {}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.source,
        event.kind,
        event.subject.as_deref().unwrap_or("-"),
        confidence,
        event.notes,
    );
}
