use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use faceset_core::{
    discover_people, images, merge, BuildReport, Dataset, DetectionModel, EncodingModel,
    FaceDetector, FaceRecognizer, Person,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, Overrides};

#[derive(Parser)]
#[command(name = "faceset", about = "Build face-encoding training sets from per-person image folders")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory containing the ONNX models
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Face detection model: det_10g, det_2.5g or det_500m
    #[arg(long, global = true)]
    detection_model: Option<DetectionModel>,
    /// Face encoding model: w600k_r50 or w600k_mbf
    #[arg(long, global = true)]
    encoding_model: Option<EncodingModel>,
    /// Random distortions averaged into each encoding (1 = none)
    #[arg(long, global = true)]
    jitters: Option<u32>,
    /// Seed for jitter sampling
    #[arg(long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build one person's dataset from a folder of images
    Encode {
        /// Label attached to every sample (e.g., the person's name)
        #[arg(short, long)]
        name: String,
        /// Folder of images of this person
        dir: PathBuf,
        /// Write the dataset as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Build and merge datasets for every person folder under ROOT
    Build {
        /// Folder with one subfolder of images per person
        root: PathBuf,
        /// Write the merged dataset as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List people and candidate images without loading any model
    Scan {
        root: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        model_dir: cli.global.model_dir,
        detection_model: cli.global.detection_model,
        encoding_model: cli.global.encoding_model,
        jitters: cli.global.jitters,
        seed: cli.global.seed,
    };
    let config = Config::load(cli.global.config.as_deref(), &overrides)?;

    match cli.command {
        Commands::Encode { name, dir, output } => {
            let (mut detector, mut recognizer) = load_models(&config)?;
            let mut person = Person::new(name, dir);
            let report = person
                .init_dataset(&mut detector, &mut recognizer, config.jitters)
                .with_context(|| format!("building dataset for {}", person.name))?;
            print_report(&person.name, &report);
            if let Some(path) = output {
                write_dataset(&path, person.dataset())?;
            }
        }
        Commands::Build { root, output } => {
            let mut people = discover_people(&root)?;
            if people.is_empty() {
                println!("No person folders under {}", root.display());
                return Ok(());
            }

            let (mut detector, mut recognizer) = load_models(&config)?;
            let mut total = BuildReport::default();
            for person in &mut people {
                let report = person
                    .init_dataset(&mut detector, &mut recognizer, config.jitters)
                    .with_context(|| format!("building dataset for {}", person.name))?;
                print_report(&person.name, &report);
                total = total.merged(report);
            }

            let training = merge(&people);
            println!(
                "Total: {} samples for {} people ({} images discarded)",
                training.len(),
                people.len(),
                total.discarded()
            );
            if let Some(path) = output {
                write_dataset(&path, &training)?;
            }
        }
        Commands::Scan { root } => {
            for person in discover_people(&root)? {
                let files = images::list_image_files(&person.path)
                    .with_context(|| format!("listing {}", person.path.display()))?;
                println!("{:<24} {:>5} images", person.name, files.len());
            }
        }
    }

    Ok(())
}

fn load_models(config: &Config) -> Result<(FaceDetector, FaceRecognizer)> {
    tracing::info!(
        model_dir = %config.model_dir.display(),
        detection = %config.detection_model,
        encoding = %config.encoding_model,
        jitters = config.jitters,
        "loading models"
    );
    let detector = FaceDetector::load_model(&config.model_dir, config.detection_model)?;
    let mut recognizer = FaceRecognizer::load_model(&config.model_dir, config.encoding_model)?;
    if let Some(seed) = config.seed {
        recognizer = recognizer.with_seed(seed);
    }
    Ok((detector, recognizer))
}

fn print_report(name: &str, report: &BuildReport) {
    println!(
        "{name}: {} accepted, {} no face, {} multiple faces, {} unreadable",
        report.accepted, report.no_face, report.multiple_faces, report.unreadable
    );
}

fn write_dataset(path: &Path, dataset: &Dataset) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, dataset)
        .with_context(|| format!("writing {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    tracing::info!(path = %path.display(), samples = dataset.len(), "dataset written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceset_core::Encoding;

    #[test]
    fn test_write_dataset_is_complete_on_return() {
        let mut dataset = Dataset::new();
        for (i, name) in ["alice", "bob", "carol"].iter().enumerate() {
            let encoding = Encoding { values: vec![i as f32; 512], model_version: None };
            dataset.push(encoding, *name);
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");

        write_dataset(&path, &dataset).unwrap();

        let written: Dataset = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, dataset);
    }

    #[test]
    fn test_write_dataset_missing_parent_fails() {
        let err = write_dataset(Path::new("/nonexistent/faceset/out.json"), &Dataset::new());
        assert!(err.is_err());
    }
}
