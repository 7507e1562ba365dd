//! CLI binary for labsift.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `IngestConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use labsift::{
    IngestConfig, IngestOutput, IngestProgressCallback, LabWithTests, Pipeline, ProgressCallback,
    Stage,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner that names the running stage and logs finished ones above it.
struct CliProgressCallback {
    bar: ProgressBar,
    skipped: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Ingesting");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            skipped: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl IngestProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_message(format!("{stage}…"));
    }

    fn on_stage_complete(&self, stage: Stage, duration_ms: u64) {
        self.bar.println(format!(
            "  {} {:<22} {}",
            green("✓"),
            stage.to_string(),
            dim(&format!("{:.1}s", duration_ms as f64 / 1000.0)),
        ));
    }

    fn on_ocr_page(&self, page_num: usize, total_pages: usize) {
        self.bar
            .set_message(format!("OCR page {page_num}/{total_pages}"));
    }

    fn on_visit_skipped(&self, visit_index: usize, visit_date: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} visit {} ({}) already stored",
            cyan("↷"),
            visit_index,
            if visit_date.trim().is_empty() {
                "unknown date"
            } else {
                visit_date
            },
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest a report for pet 42
  labsift ingest --pet-id 42 bloodwork.pdf

  # Same file again: every visit is skipped
  labsift ingest --pet-id 42 bloodwork.pdf

  # Store under a different original file name
  labsift ingest --pet-id 42 --filename clinic-export.pdf /tmp/upload-8f3a

  # List stored labs as a table (JSON by default)
  labsift labs --pet-id 42 --table

  # Re-ingest an audit artifact (no API call)
  labsift reingest --pet-id 42 files/converted_json/42/bloodwork.pdf.json

  # Show the text the model would see (no API key needed)
  labsift text scan.pdf

EXTRACTION SERVICE (first match wins):
  1. --provider / --model        edgequake-llm provider by name
  2. --google-api-key / GOOGLE_API_KEY
                                 Gemini Files API (upload + generateContent)
  3. EDGEQUAKE_LLM_PROVIDER + EDGEQUAKE_MODEL
  4. OPENAI_API_KEY              edgequake-llm OpenAI provider

ENVIRONMENT VARIABLES:
  GOOGLE_API_KEY          Gemini API key (Files API path)
  EDGEQUAKE_PROVIDER      Provider, same as --provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_DYNAMIC_LIB_PATH Directory containing libpdfium
  LABSIFT_DB              SQLite database path
  LABSIFT_CONTENT_DIR     Audit artifact root
"#;

/// Ingest PDF lab reports into deduplicated clinical records.
#[derive(Parser, Debug)]
#[command(
    name = "labsift",
    version,
    about = "Ingest PDF lab reports into deduplicated clinical records",
    long_about = "Extract lab results from PDF reports (text layer or OCR), structure them with \
a language model, and store each visit exactly once in SQLite. An audit JSON artifact is kept \
for every ingested document.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    opts: GlobalOpts,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline on one PDF.
    Ingest {
        /// PDF file to ingest.
        pdf: PathBuf,

        /// Subject (pet) the labs belong to.
        #[arg(long)]
        pet_id: i64,

        /// Original file name; names the audit artifact. Defaults to the PDF's name.
        #[arg(long)]
        filename: Option<String>,
    },

    /// List stored labs of a subject.
    Labs {
        #[arg(long)]
        pet_id: i64,
    },

    /// Ingest an existing audit artifact again.
    Reingest {
        /// Artifact JSON written by a previous `ingest`.
        artifact: PathBuf,

        #[arg(long)]
        pet_id: i64,
    },

    /// Delete every stored lab of a subject.
    Forget {
        #[arg(long)]
        pet_id: i64,
    },

    /// Print the text extracted from a PDF (text layer or OCR).
    Text {
        pdf: PathBuf,
    },
}

#[derive(Args, Debug)]
struct GlobalOpts {
    /// SQLite database file.
    #[arg(long, global = true, env = "LABSIFT_DB", default_value = "labsift.db")]
    db: PathBuf,

    /// Root directory for audit artifacts.
    #[arg(
        long,
        global = true,
        env = "LABSIFT_CONTENT_DIR",
        default_value = "files/converted_json"
    )]
    content_dir: PathBuf,

    /// Path to libpdfium (file or containing directory).
    #[arg(long, global = true, env = "LABSIFT_PDFIUM_LIB")]
    pdfium_lib: Option<PathBuf>,

    /// Tesseract executable.
    #[arg(long, global = true, env = "LABSIFT_TESSERACT", default_value = "tesseract")]
    tesseract: PathBuf,

    /// Tesseract language(s), e.g. eng or eng+deu.
    #[arg(long, global = true, env = "LABSIFT_OCR_LANG", default_value = "eng")]
    ocr_lang: String,

    /// Render DPI for the OCR fallback (300–600).
    #[arg(long, global = true, env = "LABSIFT_OCR_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(300..=600))]
    ocr_dpi: u32,

    /// Gemini API key; selects the Gemini Files API service.
    #[arg(long, global = true, env = "GOOGLE_API_KEY", hide_env_values = true)]
    google_api_key: Option<String>,

    /// LLM model ID.
    #[arg(long, global = true, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Path to a text file with a custom extraction prompt (must contain {pet_id}).
    #[arg(long, global = true, env = "LABSIFT_PROMPT")]
    prompt: Option<PathBuf>,

    /// Per-attempt extraction timeout in seconds.
    #[arg(long, global = true, env = "LABSIFT_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Retries on transient extraction failures.
    #[arg(long, global = true, env = "LABSIFT_MAX_RETRIES", default_value_t = 2,
          value_parser = clap::value_parser!(u32).range(0..=10))]
    max_retries: u32,

    /// JSON only: no stderr summary, JSON for `text` and `forget`.
    #[arg(long, global = true)]
    json: bool,

    /// Print `labs` as a table instead of JSON.
    #[arg(long, global = true)]
    table: bool,

    /// Disable the progress spinner.
    #[arg(long, global = true, env = "LABSIFT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "LABSIFT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "LABSIFT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner replaces INFO logs on the ingest path.
    let show_progress = !opts.quiet
        && !opts.no_progress
        && !opts.json
        && matches!(cli.command, Command::Ingest { .. });
    let filter = if opts.verbose {
        "debug"
    } else if opts.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress = if show_progress {
        Some(CliProgressCallback::new())
    } else {
        None
    };
    let config = build_config(
        opts,
        progress
            .clone()
            .map(|cb| cb as ProgressCallback),
    )
    .await?;
    let pipeline = Pipeline::open(config).context("Failed to open lab database")?;

    match &cli.command {
        Command::Ingest {
            pdf,
            pet_id,
            filename,
        } => {
            let bytes = tokio::fs::read(pdf)
                .await
                .with_context(|| format!("Failed to read {}", pdf.display()))?;
            let name = filename.clone().unwrap_or_else(|| {
                pdf.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| pdf.display().to_string())
            });

            let result = pipeline.process_document(&bytes, *pet_id, &name).await;
            if let Some(ref cb) = progress {
                cb.finish();
            }
            let output = result.context("Ingestion failed")?;
            print_ingest(&output, opts)?;
        }
        Command::Reingest { artifact, pet_id } => {
            let output = pipeline
                .reingest_artifact(artifact, *pet_id)
                .await
                .context("Re-ingestion failed")?;
            print_ingest(&output, opts)?;
        }
        Command::Labs { pet_id } => {
            let labs = pipeline
                .labs_for_subject(*pet_id)
                .await
                .context("Failed to load labs")?;
            print_labs(&labs, opts)?;
        }
        Command::Forget { pet_id } => {
            let removed = pipeline
                .forget_subject(*pet_id)
                .await
                .context("Failed to delete labs")?;
            if opts.json {
                println!("{}", serde_json::json!({ "petId": pet_id, "removed": removed }));
            } else if !opts.quiet {
                eprintln!("{} removed {} labs of pet {}", green("✔"), removed, pet_id);
            }
        }
        Command::Text { pdf } => {
            let bytes = tokio::fs::read(pdf)
                .await
                .with_context(|| format!("Failed to read {}", pdf.display()))?;
            let extraction = pipeline
                .extract_text(&bytes)
                .await
                .context("Text extraction failed")?;
            if opts.json {
                let json = serde_json::to_string_pretty(&extraction)
                    .context("Failed to serialise extraction")?;
                println!("{json}");
            } else {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                handle
                    .write_all(extraction.text.as_bytes())
                    .context("Failed to write to stdout")?;
                if !extraction.text.ends_with('\n') {
                    handle.write_all(b"\n").ok();
                }
                if !opts.quiet {
                    eprintln!(
                        "{} pages via {:?}, {} chars",
                        extraction.page_count,
                        extraction.method,
                        extraction.text.chars().count()
                    );
                }
            }
        }
    }

    Ok(())
}

/// Map CLI args to `IngestConfig`.
async fn build_config(opts: &GlobalOpts, progress: Option<ProgressCallback>) -> Result<IngestConfig> {
    let mut builder = IngestConfig::builder()
        .database_path(&opts.db)
        .content_dir(&opts.content_dir)
        .tesseract_cmd(&opts.tesseract)
        .ocr_language(&opts.ocr_lang)
        .ocr_dpi(opts.ocr_dpi)
        .api_timeout_secs(opts.api_timeout)
        .max_retries(opts.max_retries);

    if let Some(ref lib) = opts.pdfium_lib {
        builder = builder.pdfium_library_path(lib);
    }
    // An explicit provider wins over a Gemini key clap picked up from the env.
    match (&opts.provider, &opts.google_api_key) {
        (Some(provider), _) => builder = builder.provider_name(provider),
        (None, Some(key)) if !key.trim().is_empty() => builder = builder.gemini_api_key(key),
        _ => {}
    }
    if let Some(ref model) = opts.model {
        builder = builder.model(model);
    }
    if let Some(ref path) = opts.prompt {
        let template = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read extraction prompt from {:?}", path))?;
        builder = builder.extraction_prompt(template);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.with_env().build().context("Invalid configuration")
}

/// Output JSON on stdout, summary on stderr.
fn print_ingest(output: &IngestOutput, opts: &GlobalOpts) -> Result<()> {
    let json = serde_json::to_string_pretty(output).context("Failed to serialise output")?;
    println!("{json}");
    if opts.quiet || opts.json {
        return Ok(());
    }

    eprintln!(
        "{}  {} inserted  /  {} skipped  {}ms  →  {}",
        green("✔"),
        bold(&output.summary.inserted.len().to_string()),
        output.summary.skipped.len(),
        output.stats.total_duration_ms,
        bold(&output.artifact_path.display().to_string()),
    );
    for lab in &output.summary.inserted {
        eprintln!(
            "   lab {:>5}  {}  {} tests",
            lab.lab.id,
            format_date(lab),
            lab.tests.len()
        );
    }
    if output.stats.extraction_method.is_some() {
        eprintln!(
            "   {} tokens in  /  {} tokens out  ({} retries)",
            dim(&output.stats.input_tokens.to_string()),
            dim(&output.stats.output_tokens.to_string()),
            output.stats.retries,
        );
    }
    Ok(())
}

fn print_labs(labs: &[LabWithTests], opts: &GlobalOpts) -> Result<()> {
    if !opts.table {
        let json = serde_json::to_string_pretty(labs).context("Failed to serialise labs")?;
        println!("{json}");
        return Ok(());
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for lab in labs {
        writeln!(
            out,
            "{} {}  {}",
            bold(&format!("lab {}", lab.lab.id)),
            format_date(lab),
            dim(&lab.lab.source_path)
        )?;
        for t in &lab.tests {
            writeln!(
                out,
                "    {:<28} {:>10} {:<10} {}",
                t.test_name,
                t.value,
                t.unit,
                dim(&t.reference_range)
            )?;
        }
    }
    if labs.is_empty() && !opts.quiet {
        eprintln!("no labs stored");
    }
    Ok(())
}

fn format_date(lab: &LabWithTests) -> String {
    lab.lab
        .visit_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown   ".to_string())
}
