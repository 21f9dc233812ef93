use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::enroll::{enroll_dataset, SampleOutcome};
use rollcall_core::matcher::{label_for, CosineMatcher, DistanceMatcher, MatchPolicy};
use rollcall_core::recognizer::ARCFACE_EMBEDDING_DIM;
use rollcall_core::scheduler::locate_full_resolution;
use rollcall_core::{
    Annotation, AnnotationSet, FaceDetector, FaceEncoder, FaceRecognizer, IdentityStore,
    ARCFACE_MODEL_FILE, SCRFD_MODEL_FILE,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Rollcall face attendance tools")]
struct Cli {
    /// Directory holding names.json and encodings.json
    #[arg(long, env = "ROLLCALL_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Directory containing the ONNX model files
    #[arg(long, env = "ROLLCALL_MODEL_DIR", global = true)]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a folder-per-person dataset into the identity store
    Enroll {
        /// Dataset root: <dataset>/<person>/<image>
        #[arg(short, long, default_value = "faces_dataset")]
        dataset: PathBuf,
    },
    /// List enrolled identities with their sample counts
    List,
    /// Detect and label the faces in one image
    Identify {
        image: PathBuf,

        /// Cosine similarity threshold
        #[arg(long, env = "ROLLCALL_SIMILARITY_THRESHOLD", default_value_t = rollcall_core::matcher::DEFAULT_SIMILARITY_THRESHOLD)]
        threshold: f32,

        /// Use Euclidean distance with this tolerance instead of cosine similarity
        #[arg(long, env = "ROLLCALL_MATCH_TOLERANCE")]
        tolerance: Option<f32>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(rollcall_core::default_data_dir);
    let model_dir = cli.model_dir.unwrap_or_else(rollcall_core::default_model_dir);

    match cli.command {
        Commands::Enroll { dataset } => enroll(&dataset, &data_dir, &model_dir),
        Commands::List => list(&data_dir),
        Commands::Identify {
            image,
            threshold,
            tolerance,
        } => {
            let policy = match tolerance {
                Some(tolerance) => MatchPolicy::Distance(DistanceMatcher { tolerance }),
                None => MatchPolicy::Cosine(CosineMatcher { threshold }),
            };
            identify(&image, &data_dir, &model_dir, &policy)
        }
    }
}

fn load_models(model_dir: &Path) -> Result<(FaceDetector, FaceRecognizer)> {
    let scrfd = model_dir.join(SCRFD_MODEL_FILE);
    let arcface = model_dir.join(ARCFACE_MODEL_FILE);
    let detector = FaceDetector::load(&scrfd.to_string_lossy())
        .with_context(|| format!("loading detector from {}", scrfd.display()))?;
    let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())
        .with_context(|| format!("loading recognizer from {}", arcface.display()))?;
    Ok((detector, recognizer))
}

fn enroll(dataset: &Path, data_dir: &Path, model_dir: &Path) -> Result<()> {
    let (mut detector, mut recognizer) = load_models(model_dir)?;
    let report = enroll_dataset(dataset, &mut detector, &mut recognizer)?;

    for (person, path, outcome) in &report.samples {
        let file = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        match outcome {
            SampleOutcome::Encoded => println!("  {person}: encoded {file}"),
            SampleOutcome::WholeImage => println!("  {person}: encoded {file} (no face found, used whole image)"),
            SampleOutcome::Unreadable(e) => println!("  {person}: SKIP {file}: {e}"),
            SampleOutcome::Failed(e) => println!("  {person}: FAILED {file}: {e}"),
        }
    }

    if report.store.is_empty() {
        bail!("no faces encoded from {}", dataset.display());
    }
    report
        .store
        .save(data_dir)
        .with_context(|| format!("saving identity store to {}", data_dir.display()))?;

    println!();
    println!("Encoded {} sample(s), skipped {}.", report.encoded(), report.skipped());
    println!("Saved to {}", data_dir.display());
    Ok(())
}

fn list(data_dir: &Path) -> Result<()> {
    let store = IdentityStore::load(data_dir)
        .with_context(|| format!("loading identity store from {}", data_dir.display()))?;

    let counts = store.sample_counts();
    if counts.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }

    println!("{:<24} SAMPLES", "NAME");
    for (name, samples) in &counts {
        println!("{name:<24} {samples}");
    }
    println!();
    println!("{} identities, {} samples", counts.len(), store.len());
    Ok(())
}

fn identify(image_path: &Path, data_dir: &Path, model_dir: &Path, policy: &MatchPolicy) -> Result<()> {
    let store = IdentityStore::load(data_dir)
        .with_context(|| format!("loading identity store from {}", data_dir.display()))?;
    store.ensure_dimension(ARCFACE_EMBEDDING_DIM)?;
    let known = store.into_known();
    let (mut detector, mut recognizer) = load_models(model_dir)?;

    let image = image::open(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?
        .to_rgb8();

    let faces = locate_full_resolution(&mut detector, &image, 1.0)?;
    let embeddings = recognizer.encode(&image, &faces)?;

    let annotations = AnnotationSet::new(
        faces
            .iter()
            .zip(&embeddings)
            .map(|(face, embedding)| Annotation {
                region: face.region,
                label: label_for(embedding, &known, policy),
            })
            .collect(),
    );

    println!("{}", serde_json::to_string_pretty(&annotations)?);
    Ok(())
}
