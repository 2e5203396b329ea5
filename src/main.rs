//! Handwriting Scanner CLI
//!
//! Recognizes a batch of photographed handwritten sheets against a column template and writes
//! the consolidated rows to an Excel workbook.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use handwriting_scanner_lib::excel;
use handwriting_scanner_lib::recognizer::AzureReadRecognizer;
use handwriting_scanner_lib::{
    Aggregator, BatchOrchestrator, ColumnAlignment, ColumnClustering, Image, ReadingOrder,
    RowExtractor, Schema, Settings, TemplateRegions,
};

/// Largest image file accepted from disk.
const MAX_IMAGE_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Alignment {
    /// k-th field of a line goes to the k-th column
    ReadingOrder,
    /// Cluster regions by horizontal position
    Columns,
    /// Use the column regions declared in the template
    Template,
}

#[derive(Parser)]
#[command(
    name = "handwriting-scanner",
    version,
    about = "Extract handwritten tables from photos into a typed Excel workbook",
    after_help = "EXAMPLES:\n  \
                  handwriting-scanner --schema samples.json sheet1.jpg sheet2.jpg\n  \
                  handwriting-scanner --schema samples.json --alignment columns --out lab.xlsx scans/*.png\n\n\
                  Azure credentials are read from AZURE_OCR_KEY and AZURE_OCR_ENDPOINT (or a .env file)."
)]
struct Cli {
    /// Template JSON: {\"columns\": [{\"name\", \"type\", \"required\"}]}
    #[arg(long, env = "HWS_SCHEMA")]
    schema: PathBuf,

    /// Output workbook (default: Downloads/Handwriting_<timestamp>.xlsx)
    #[arg(short, long)]
    out: Option<String>,

    /// Concurrent image jobs
    #[arg(long)]
    workers: Option<usize>,

    /// Rows below this confidence are flagged for review
    #[arg(long)]
    threshold: Option<f64>,

    #[arg(long, value_enum, default_value_t = Alignment::ReadingOrder)]
    alignment: Alignment,

    /// Also write the JSON summary to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Open the workbook when done
    #[arg(long)]
    open: bool,

    /// Images to process (1 to 100)
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("handwriting_scanner=info,handwriting_scanner_lib=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

fn load_schema(path: &Path) -> Result<Schema> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read template {}", path.display()))?;
    Schema::from_json(&json).with_context(|| format!("Invalid template {}", path.display()))
}

fn load_image(path: &Path) -> Result<Image> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("File not found: {}", path.display()))?;
    if metadata.len() > MAX_IMAGE_BYTES {
        bail!("{} is too large (max 50MB)", path.display());
    }
    let bytes = std::fs::read(path).with_context(|| format!("Could not open {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Image::new(name, bytes))
}

fn alignment(choice: Alignment, settings: &Settings) -> Arc<dyn ColumnAlignment> {
    match choice {
        Alignment::ReadingOrder => Arc::new(ReadingOrder),
        Alignment::Columns => Arc::new(ColumnClustering {
            gap: settings.column_gap,
        }),
        Alignment::Template => Arc::new(TemplateRegions),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let mut settings = Settings::from_env().context("Invalid environment configuration")?;
    if let Some(workers) = cli.workers {
        settings.workers = workers;
    }
    if let Some(threshold) = cli.threshold {
        settings.confidence_threshold = threshold;
    }
    settings.validate()?;

    let schema = load_schema(&cli.schema)?;
    let images = cli
        .images
        .iter()
        .map(|p| load_image(p))
        .collect::<Result<Vec<_>>>()?;

    let Some(credentials) = settings.azure.clone() else {
        bail!("Azure is not configured. Set AZURE_OCR_KEY and AZURE_OCR_ENDPOINT (environment or .env).");
    };
    let recognizer = Arc::new(AzureReadRecognizer::new(credentials));
    let extractor = RowExtractor::new(alignment(cli.alignment, &settings))
        .with_unscored_confidence(settings.unscored_confidence);
    let orchestrator = BatchOrchestrator::new(recognizer, extractor, settings.clone());

    let handle = orchestrator.submit(images, schema.clone())?;

    let mut progress = handle.subscribe();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow_and_update();
            tracing::info!(completed = p.completed, total = p.total, status = ?p.status, "Progress");
            if p.status.is_terminal() {
                break;
            }
        }
    });

    let canceller = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling batch");
            canceller.cancel();
        }
    });

    let job = handle.wait().await;
    let table = Aggregator::new(settings.confidence_threshold).aggregate(&job);
    for failure in &table.failures {
        tracing::warn!(
            image = %failure.image.original_name,
            reason = %failure.reason,
            detail = %failure.detail,
            "Image failed"
        );
    }

    let bytes = excel::write(&table, &schema)?;
    let path = excel::resolve_output_path(cli.out.as_deref())?;
    excel::save(&bytes, &path)?;

    let summary = serde_json::to_string_pretty(&table.summary())?;
    println!("{}", summary);
    if let Some(report) = &cli.report {
        std::fs::write(report, &summary)
            .with_context(|| format!("Could not write report {}", report.display()))?;
    }
    tracing::info!(path = %path.display(), rows = table.rows.len(), "Export complete");

    if cli.open {
        opener::open(&path).with_context(|| format!("Could not open {}", path.display()))?;
    }
    Ok(())
}
