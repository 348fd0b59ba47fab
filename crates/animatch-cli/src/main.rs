use animatch_core::detector::ScrfdDetector;
use animatch_core::guidelines::check_guidelines;
use animatch_core::preprocess::{decode_image, limit_dimensions};
use animatch_core::variant::{assign_variant, ExperimentRegistry, JsonFileStore, VariantConfig};
use animatch_core::{Catalog, MatchResult, Orientation, OrtLoader, ScoringEngine};
use animatch_engine::{
    spawn_worker, AnalysisOutcome, AnalysisRequest, Analyzer, Config, FaceSelection, ImageInput,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "animatch", about = "Find the anime character you look like")]
struct Cli {
    /// Experiment to draw scoring weights from (default: ANIMATCH_EXPERIMENT)
    #[arg(long, global = true)]
    experiment: Option<String>,
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match a photo against the character catalog
    Analyze {
        image: PathBuf,
        /// Catalog half to search: male or female
        #[arg(short, long)]
        orientation: Orientation,
        /// Pick this face (1-based, as listed by `faces`) when several are found
        #[arg(short, long)]
        face: Option<usize>,
        /// Embed the whole photo without face detection
        #[arg(long, conflicts_with = "face")]
        no_detect: bool,
        /// Locale for character names (en, ja, zh-TW)
        #[arg(long, default_value = "ko")]
        locale: String,
    },
    /// List the faces detected in a photo
    Faces { image: PathBuf },
    /// Run the photo guideline checks
    Check { image: PathBuf },
    /// Pick a random character (no models needed)
    Random {
        #[arg(short, long)]
        orientation: Orientation,
    },
    /// Summarize the character catalog
    Catalog,
    /// Show this installation's experiment variant
    Variant,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let experiment = cli.experiment.clone().unwrap_or_else(|| config.experiment.clone());

    match cli.command {
        Commands::Analyze {
            image,
            orientation,
            face,
            no_detect,
            locale,
        } => {
            let mut analyzer = build_analyzer(&config, &experiment)?;
            let bytes = read_image(&image)?;
            let selection = if no_detect {
                FaceSelection::Skip
            } else {
                FaceSelection::Detect
            };

            let request = AnalysisRequest::new(ImageInput::Encoded(bytes.clone()), orientation)
                .with_face(selection);
            let analysis = match analyzer.analyze(request).await? {
                AnalysisOutcome::Matched(analysis) => analysis,
                AnalysisOutcome::MultipleFaces(faces) => {
                    let Some(index) = face else {
                        print_faces(&faces, cli.json);
                        bail!("{} faces found; choose one with --face", faces.len());
                    };
                    let Some(chosen) = index.checked_sub(1).and_then(|i| faces.get(i)) else {
                        bail!("--face {index} out of range (1..={})", faces.len());
                    };
                    let request = AnalysisRequest::new(ImageInput::Encoded(bytes), orientation)
                        .with_face(FaceSelection::Region(*chosen));
                    match analyzer.analyze(request).await? {
                        AnalysisOutcome::Matched(analysis) => analysis,
                        _ => bail!("analysis did not complete"),
                    }
                }
                AnalysisOutcome::Discarded => bail!("analysis was cancelled"),
            };

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&analysis.summary)?);
            } else {
                print_result(&analysis.result, &locale);
                if let Some(label) = analyzer.variant_label() {
                    println!("variant: {label}");
                }
            }
        }
        Commands::Faces { image } => {
            let decoded = limit_dimensions(decode_image(&read_image(&image)?)?, config.upload_max_dim);
            let mut detector = ScrfdDetector::load(&config.detector_model_path())
                .context("loading face detector")?;
            let faces = animatch_core::face::locate_faces(&mut detector, &decoded, config.detect_max_dim)?;
            print_faces(&faces, cli.json);
        }
        Commands::Check { image } => {
            let decoded = decode_image(&read_image(&image)?)?;
            let checks = check_guidelines(&decoded);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&checks)?);
            } else {
                for check in checks {
                    let mark = if check.pass { "ok  " } else { "FAIL" };
                    println!("{mark} {:?} ({:.2})", check.guideline, check.value);
                }
            }
        }
        Commands::Random { orientation } => {
            let catalog = load_catalog(&config)?;
            let result = ScoringEngine::new(config.scoring_params()?).random_match(
                orientation,
                catalog.characters(),
                &mut rand::thread_rng(),
            )?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result.summary(None, 0))?);
            } else {
                print_result(&result, "ko");
            }
        }
        Commands::Catalog => {
            let catalog = load_catalog(&config)?;
            let with_face = catalog.characters().iter().filter(|c| c.has_face_embedding()).count();
            let summary = json!({
                "path": config.catalog_path.display().to_string(),
                "model": catalog.model,
                "embedding_dim": catalog.embedding_dim,
                "face_embedding_dim": catalog.face_embedding_dim,
                "characters": catalog.len(),
                "female": catalog.count_by_orientation(Orientation::Female),
                "male": catalog.count_by_orientation(Orientation::Male),
                "with_face_embedding": with_face,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Variant => {
            let (label, variant) = session_variant(&config, &experiment);
            let out = json!({
                "experiment": experiment,
                "variant": label,
                "config": variant,
                "state_path": config.state_path.display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn load_catalog(config: &Config) -> Result<Arc<Catalog>> {
    let catalog = Catalog::load(&config.catalog_path)
        .with_context(|| format!("loading catalog {}", config.catalog_path.display()))?;
    Ok(Arc::new(catalog))
}

/// Sticky variant for this installation: `(label, overrides)`.
fn session_variant(config: &Config, experiment: &str) -> (Option<String>, Option<VariantConfig>) {
    let registry = ExperimentRegistry::builtin();
    let mut store = JsonFileStore::new(&config.state_path);
    let mut rng = rand::thread_rng();
    let name = assign_variant(&registry, experiment, &mut store, &mut rng);
    let variant = registry
        .get(experiment)
        .filter(|e| e.is_active())
        .and_then(|e| e.variant(&name).copied());
    match variant {
        Some(variant) => (Some(format!("{experiment}:{name}")), Some(variant)),
        None => (None, None),
    }
}

fn build_analyzer(config: &Config, experiment: &str) -> Result<Analyzer> {
    let catalog = load_catalog(config)?;
    let loader = Arc::new(OrtLoader { intra_threads: config.intra_threads });
    let worker = spawn_worker(loader, config.worker_settings()).context("starting inference worker")?;
    let (label, variant) = session_variant(config, experiment);

    let analyzer = Analyzer::new(worker, catalog)
        .with_scoring(ScoringEngine::new(config.scoring_params()?))
        .with_variant(label, variant)
        .with_options(config.analyzer_options());

    match ScrfdDetector::load(&config.detector_model_path()) {
        Ok(detector) => Ok(analyzer.with_locator(Box::new(detector))),
        Err(e) => {
            tracing::warn!(error = %e, "face detector unavailable; analyzing whole photos");
            Ok(analyzer)
        }
    }
}

fn print_faces(faces: &[animatch_core::DetectedFace], as_json: bool) {
    if as_json {
        println!("{}", json!(faces));
        return;
    }
    if faces.is_empty() {
        println!("No faces found");
    }
    for (i, f) in faces.iter().enumerate() {
        println!(
            "{}: {:.0}x{:.0} at ({:.0}, {:.0}), confidence {:.2}",
            i + 1,
            f.width,
            f.height,
            f.x,
            f.y,
            f.confidence
        );
    }
}

fn print_result(result: &MatchResult, locale: &str) {
    let best = result.character();
    println!("{} ({})", best.display_name(locale), best.anime);
    println!(
        "{}% match, {} confidence, {} mode",
        result.percent(),
        result.confidence,
        result.mode
    );
    for runner in &result.top_n()[1..] {
        println!(
            "  #{} {}: {}%",
            runner.rank + 1,
            runner.candidate.display_name(locale),
            runner.percent
        );
    }
}
