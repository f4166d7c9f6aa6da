use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    Annotator, AttendanceReport, DisplayConfig, EnrollOutcome, Enroller, GalleryStore, ImageCorpus,
    Ledger, OnnxFaceAnalyzer, SessionRecognizer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

mod config;
mod engine;

use config::Config;
use engine::{EngineEvent, EngineParts};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance tracking")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new person from one or more JPEG/PNG photos
    Enroll {
        /// Identity name
        name: String,
        /// Photos of the person, one face each
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Take attendance from the camera until Ctrl-C
    Capture {
        /// Class or session label
        #[arg(short, long = "class")]
        label: String,
    },
    /// Recognize the faces in a single image
    Identify {
        image: PathBuf,
        /// Write the annotated image here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the attendance of every identity across sessions
    Report {
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the gallery from every enrollment image
    Reindex,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let ledger = Ledger::open(&config.db_path)
        .with_context(|| format!("opening ledger {}", config.db_path.display()))?;
    if !config.default_identities.is_empty() {
        let added = ledger.ensure_identities(config.default_identities.as_slice())?;
        tracing::debug!(added, "default identities seeded");
    }
    let enroller = Enroller::new(
        ImageCorpus::new(&config.dataset_dir),
        GalleryStore::new(&config.gallery_dir),
    );
    let mut analyzer = OnnxFaceAnalyzer::lazy(&config.model_dir, config.detection_threshold);

    match cli.command {
        Commands::Enroll { name, images } => {
            let mut bytes = Vec::with_capacity(images.len());
            for path in &images {
                bytes.push(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?);
            }
            match enroller.enroll(&ledger, &mut analyzer, &name, &bytes)? {
                EnrollOutcome::Enrolled {
                    identity,
                    images_stored,
                    gallery,
                } => {
                    let rows = gallery.labels().iter().filter(|l| **l == identity).count();
                    println!("Enrolled {identity}: {images_stored} image(s), {rows} with a usable face");
                    if rows == 0 {
                        println!("warning: no face was found; {identity} cannot be recognized yet");
                    }
                }
                EnrollOutcome::Rejected { identity } => {
                    bail!("{identity} is already enrolled; choose another name");
                }
            }
        }
        Commands::Capture { label } => {
            let gallery = enroller.load_embeddings(&mut analyzer)?;
            if gallery.is_empty() {
                println!("warning: gallery is empty; every face will be unknown");
            }
            let camera = rollcall_hw::Camera::open(&config.camera_device, config.frame_width, config.frame_height)
                .with_context(|| format!("opening camera {}", config.camera_device))?;

            let (events_tx, mut events) = mpsc::unbounded_channel();
            let handle = engine::spawn_engine(
                EngineParts {
                    camera,
                    analyzer,
                    recognizer: SessionRecognizer::new(config.recognition_threshold, annotator(&config)?),
                    gallery,
                    ledger: Arc::new(ledger),
                },
                events_tx,
            )?;

            let session = handle.start_session(&label).await?;
            println!("Capturing session {session} ({label}). Press Ctrl-C to stop.");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(EngineEvent::Marked { identity, .. }) => println!("✅ {identity}"),
                        Some(EngineEvent::MarkFailed { identity, error }) => {
                            eprintln!("could not record {identity}: {error}");
                        }
                        Some(EngineEvent::Stopped { error }) => bail!("recognition stopped: {error}"),
                        None => bail!("recognition engine exited"),
                    },
                }
            }

            if let Some(stopped) = handle.stop_session().await? {
                println!(
                    "Stopped session {}: {} present ({})",
                    stopped.session,
                    stopped.recognized.len(),
                    stopped.recognized.join(", ")
                );
            }
        }
        Commands::Identify { image, output } => {
            let frame = image::open(&image)
                .with_context(|| format!("reading {}", image.display()))?
                .to_rgb8();
            let gallery = enroller.load_embeddings(&mut analyzer)?;
            let recognizer = SessionRecognizer::new(config.recognition_threshold, annotator(&config)?);
            let (annotated, identities) = recognizer.process_frame(&mut analyzer, &gallery, &frame)?;

            if identities.is_empty() {
                println!("No known faces");
            } else {
                for name in &identities {
                    println!("{name}");
                }
            }
            if let Some(path) = output {
                annotated
                    .save(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        Commands::Report { json } => {
            let report = ledger.attendance_report()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Reindex => {
            let gallery = enroller.extract_all(&mut analyzer)?;
            println!(
                "Gallery rebuilt: {} embedding(s) for {} identities",
                gallery.len(),
                gallery.identities().len()
            );
        }
    }

    Ok(())
}

fn annotator(config: &Config) -> Result<Annotator> {
    let display = match &config.display_config {
        Some(path) => DisplayConfig::load(path)?,
        None => DisplayConfig::default(),
    };
    Ok(Annotator::new(display)?)
}

fn print_report(report: &AttendanceReport) {
    if report.is_empty() {
        println!("No attendance recorded yet");
        return;
    }
    let width = report
        .rows
        .iter()
        .map(|r| r.identity.chars().count())
        .max()
        .unwrap_or(0)
        .max("Name".len());

    print!("{:width$}", "Name");
    for session in &report.sessions {
        print!("  {}", session.name);
    }
    println!();
    for row in &report.rows {
        print!("{:width$}", row.identity);
        for (session, present) in report.sessions.iter().zip(&row.present) {
            let mark = if *present { "✅" } else { "❌" };
            print!("  {mark:<w$}", w = session.name.chars().count());
        }
        println!();
    }
}
