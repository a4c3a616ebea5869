use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{average_embeddings, DetectorGateway, RecognizerGateway};
use rollcall_engine::{decode_frame, spawn_pipeline, PipelineConfig, SessionOrchestrator, SqliteStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from one or more face photos
    Enroll {
        /// Unique identity key (e.g., a student number)
        #[arg(short, long)]
        key: String,
        /// Display name shown on annotated frames
        #[arg(short, long)]
        name: String,
        /// Photos of the person; each must contain a face
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List enrolled identities
    Roster,
    /// Run frames through the attendance pipeline
    Run {
        /// Session identifier
        #[arg(short, long)]
        session: String,
        /// Directory for annotated frames
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Frame images, processed in order
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Show attendance for a session
    Report {
        #[arg(short, long)]
        session: String,
    },
    /// Remove an enrolled identity
    Remove {
        #[arg(short, long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    match cli.command {
        Commands::Enroll { key, name, images } => enroll(&config, &store, &key, &name, &images).await?,
        Commands::Roster => {
            for entry in store.roster().await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Commands::Run { session, out, frames } => run(&config, store, &session, out.as_deref(), &frames).await?,
        Commands::Report { session } => {
            let summary = store.session_summary(&session).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Remove { key } => {
            if !store.remove_identity(&key).await? {
                bail!("no identity with key {key}");
            }
            println!("Removed {key}");
        }
    }

    Ok(())
}

async fn enroll(config: &PipelineConfig, store: &SqliteStore, key: &str, name: &str, images: &[PathBuf]) -> Result<()> {
    let mut recognizer = RecognizerGateway::standard(&config.model_dir);
    if recognizer.backend_name().is_none() {
        bail!("no recognizer available; check models in {}", config.model_dir.display());
    }

    let mut embeddings = Vec::with_capacity(images.len());
    for path in images {
        let image = image::open(path)
            .with_context(|| format!("reading {}", path.display()))?
            .to_rgb8();
        let Some(embedding) = recognizer.extract(&image) else {
            bail!("no face found in {}", path.display());
        };
        embeddings.push(embedding);
    }

    let embedding = average_embeddings(&embeddings)?;
    store.upsert_identity(key, name, Some(&embedding)).await?;
    println!("Enrolled {name} ({key}) from {} image(s)", embeddings.len());
    Ok(())
}

async fn run(config: &PipelineConfig, store: SqliteStore, session: &str, out: Option<&Path>, frames: &[PathBuf]) -> Result<()> {
    if let Some(dir) = out {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let store = Arc::new(store);
    let orchestrator = SessionOrchestrator::new(
        DetectorGateway::standard(&config.model_dir),
        RecognizerGateway::standard(&config.model_dir),
        store.clone(),
        store,
        config,
    );
    let pipeline = spawn_pipeline(orchestrator, config.queue_depth)?;

    for path in frames {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let frame = match decode_frame(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping frame");
                continue;
            }
        };

        let outcome = pipeline.submit(frame, session).await?;
        for event in &outcome.events {
            println!("{}", serde_json::to_string(event)?);
        }
        for warning in &outcome.warnings {
            eprintln!("warning: {}", serde_json::to_string(warning)?);
        }

        if let Some(dir) = out {
            let stem = path.file_stem().unwrap_or(path.as_os_str()).to_string_lossy();
            let target = dir.join(format!("{stem}.png"));
            outcome
                .annotated
                .save(&target)
                .with_context(|| format!("writing {}", target.display()))?;
        }
    }

    Ok(())
}
