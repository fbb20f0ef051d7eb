use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{Config, Database, FaceBackend, IdentityStore, MatchResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facewatch", about = "Face identity database with hot reload")]
struct Cli {
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the faces in a photo
    Identify {
        /// Database root (one subdirectory per identity)
        #[arg(long)]
        db: Option<PathBuf>,
        /// Photo to identify
        #[arg(long)]
        image: PathBuf,
        /// Minimum cosine similarity, in [-1, 1]
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Report every detected face, not only the most confident one
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Load a database and list its identities and warnings
    Inspect {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Re-identify a photo periodically while the database is edited
    Watch {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        image: PathBuf,
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Quiet period in seconds before a reload
        #[arg(long)]
        debounce: Option<u64>,
        /// Seconds between identifications
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(dir) = cli.model_dir {
        config.model_dir = dir;
    }

    match cli.command {
        Commands::Identify {
            db,
            image,
            threshold,
            all,
            json,
        } => {
            if let Some(t) = threshold {
                config.threshold = t;
            }
            config.validate()?;
            let db = open(&config, db)?;
            let img = image::open(&image)
                .with_context(|| format!("cannot read image {}", image.display()))?;

            let results = if all {
                db.identify_all(&img, config.threshold)?
            } else {
                vec![db.identify(&img, config.threshold)?]
            };
            print_results(&results, json)?;
        }
        Commands::Inspect { db, json } => {
            config.validate()?;
            let db = open(&config, db)?;
            let snapshot = db.current_snapshot()?;
            print_inspection(&db, &snapshot, json)?;
        }
        Commands::Watch {
            db,
            image,
            threshold,
            debounce,
            interval,
        } => {
            if let Some(t) = threshold {
                config.threshold = t;
            }
            if let Some(secs) = debounce {
                config.debounce_secs = secs;
            }
            config.validate()?;
            let db = Arc::new(open(&config, db)?);
            watch(db, &config, image, Duration::from_secs(interval.max(1))).await?;
        }
    }

    Ok(())
}

fn open(config: &Config, db_dir: Option<PathBuf>) -> Result<Database> {
    let backend = FaceBackend::onnx(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        config.intra_threads,
    )
    .context("cannot load face models")?;

    let root = db_dir.unwrap_or_else(|| config.db_dir.clone());
    let db = Database::open(backend, &root)
        .with_context(|| format!("cannot load identity database {}", root.display()))?;
    Ok(db)
}

fn print_results(results: &[MatchResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("no face detected");
    }
    for result in results {
        if result.is_unknown() {
            println!("unknown (best {:.2})", result.score);
        } else {
            println!("{result}");
        }
    }
    Ok(())
}

fn print_inspection(db: &Database, snapshot: &IdentityStore, json: bool) -> Result<()> {
    let warnings = db.last_warnings();

    if json {
        let identities: Vec<_> = snapshot
            .iter()
            .map(|i| serde_json::json!({ "name": i.name(), "descriptors": i.descriptors().len() }))
            .collect();
        let report = serde_json::json!({
            "root": db.root(),
            "state": db.state().to_string(),
            "version": snapshot.version(),
            "identities": identities,
            "warnings": warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{}: {} identities, {} descriptors",
        db.root().map(|p| p.display().to_string()).unwrap_or_default(),
        snapshot.len(),
        snapshot.descriptor_count()
    );
    for identity in snapshot.iter() {
        println!("  {:<24} {} photo(s)", identity.name(), identity.descriptors().len());
    }
    if !warnings.is_empty() {
        println!("{} warning(s):", warnings.len());
        for w in warnings.iter() {
            println!("  {w}");
        }
    }
    Ok(())
}

async fn watch(db: Arc<Database>, config: &Config, image: PathBuf, interval: Duration) -> Result<()> {
    let img = Arc::new(
        image::open(&image).with_context(|| format!("cannot read image {}", image.display()))?,
    );

    let status = db.start_watching(config.debounce())?;
    println!(
        "watching {} ({status:?}, debounce {}s); Ctrl-C to stop",
        db.root().map(|p| p.display().to_string()).unwrap_or_default(),
        config.debounce_secs
    );

    let mut ticker = tokio::time::interval(interval);
    let threshold = config.threshold;
    let mut last: Option<(u64, MatchResult)> = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                let (db, img) = (Arc::clone(&db), Arc::clone(&img));
                let (version, result) =
                    tokio::task::spawn_blocking(move || db.identify_with_version(&img, threshold))
                        .await??;

                let changed = last
                    .as_ref()
                    .map_or(true, |(v, r)| *v != version || r != &result);
                if changed {
                    println!("[v{version}] {} ({:.2})", result.name, result.score);
                    last = Some((version, result));
                }
            }
        }
    }

    tracing::info!("stopping");
    let db = Arc::clone(&db);
    tokio::task::spawn_blocking(move || db.shutdown()).await?;
    Ok(())
}
