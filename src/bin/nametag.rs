#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use nametag_harness::annotate::{annotate_all, AnnotateConfig, GatewayAnnotator, RunStats};
use nametag_harness::corpus::{
    count_labels, exclude_examples, load_corpus, split_by_stride, strip_tags,
};
use nametag_harness::gateway::{
    ChatModel, NoopUsageSink, ProviderGateway, StderrUsageSink, UsageSink,
};
use nametag_harness::metrics::{equal_labels_ratio, equal_line_ratio};
use nametag_harness::prompts::{prompt_by_slug, PromptTemplate, DEFAULT_PROMPT};
use nametag_harness::sampler::{select_examples, SelectionConfig};

#[derive(Parser)]
#[command(name = "nametag", version, about = "LLM person-name tagging harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct SelectionArgs {
    /// Number of worked examples to select
    #[arg(long, default_value_t = 30)]
    size: usize,
    /// Minimum number of examples containing each label
    #[arg(long, default_value_t = 3)]
    min_per_label: usize,
    #[arg(long, default_value_t = 12345)]
    seed: u64,
}

impl SelectionArgs {
    fn to_config(&self) -> SelectionConfig {
        SelectionConfig {
            size: self.size,
            min_per_label: self.min_per_label,
            seed: self.seed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print label counts of a corpus, most common first
    Labels {
        #[arg(long)]
        corpus: PathBuf,
    },
    /// Select a label-balanced example set
    Select {
        #[arg(long)]
        corpus: PathBuf,
        #[command(flatten)]
        selection: SelectionArgs,
        /// Write examples here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Annotate the test split with an LLM and score it against the corpus
    Annotate {
        #[arg(long)]
        corpus: PathBuf,
        /// OpenRouter model ID
        #[arg(long)]
        model: String,
        #[command(flatten)]
        selection: SelectionArgs,
        /// Keep only every N-th test line
        #[arg(long)]
        stride: Option<usize>,
        /// Annotate at most this many test lines
        #[arg(long)]
        limit: Option<usize>,
        /// JSON file with annotation settings
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long, default_value_t = 0.0)]
        temperature: f32,
        /// Prompt template slug
        #[arg(long, default_value = DEFAULT_PROMPT.slug)]
        prompt: String,
        /// Log every provider call to stderr as JSON
        #[arg(long)]
        usage_log: bool,
        /// JSON report path
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Serialize)]
struct AnnotationReport<'a> {
    run_id: Uuid,
    model: &'a str,
    prompt: &'static str,
    selection: SelectionConfig,
    config: &'a AnnotateConfig,
    examples: &'a [String],
    truth: &'a [String],
    predictions: &'a [String],
    stats: &'a RunStats,
    equal_line_ratio: f64,
    equal_labels_ratio: f64,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Labels { corpus } => {
            let lines = load_corpus(&corpus)?;
            let counts = count_labels(&lines);
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for (label, count) in counts.most_common() {
                writeln!(out, "{count:4}  {label}")?;
            }
        }
        Commands::Select {
            corpus,
            selection,
            out,
        } => {
            let lines = load_corpus(&corpus)?;
            let examples = select_examples(&lines, &selection.to_config());
            let mut sink: Box<dyn Write> = match out {
                Some(path) => Box::new(File::create(path)?),
                None => Box::new(io::stdout().lock()),
            };
            for line in &examples {
                writeln!(sink, "{line}")?;
            }
        }
        Commands::Annotate {
            corpus,
            model,
            selection,
            stride,
            limit,
            config,
            batch_size,
            max_retries,
            concurrency,
            temperature,
            prompt,
            usage_log,
            out,
        } => {
            let template = prompt_by_slug(&prompt)
                .ok_or_else(|| format!("unknown prompt template: {prompt}"))?;

            let mut annotate_config = match config {
                Some(path) => AnnotateConfig::from_json_file(path)?,
                None => AnnotateConfig::default(),
            };
            if let Some(n) = batch_size {
                annotate_config.batch_size = n;
            }
            if let Some(n) = max_retries {
                annotate_config.max_quality_retries = n;
            }
            if let Some(n) = concurrency {
                annotate_config.concurrency = n;
            }

            let job = AnnotateJob {
                corpus,
                model,
                selection: selection.to_config(),
                stride,
                limit,
                config: annotate_config,
                temperature,
                template,
                out,
            };
            if usage_log {
                run_annotate(job, Arc::new(StderrUsageSink)).await?;
            } else {
                run_annotate(job, Arc::new(NoopUsageSink)).await?;
            }
        }
    }

    Ok(())
}

struct AnnotateJob {
    corpus: PathBuf,
    model: String,
    selection: SelectionConfig,
    stride: Option<usize>,
    limit: Option<usize>,
    config: AnnotateConfig,
    temperature: f32,
    template: PromptTemplate,
    out: PathBuf,
}

async fn run_annotate<U: UsageSink>(
    job: AnnotateJob,
    usage_sink: Arc<U>,
) -> Result<(), Box<dyn std::error::Error>> {
    let lines = load_corpus(&job.corpus)?;
    let examples = select_examples(&lines, &job.selection);

    let mut truth = exclude_examples(&lines, &examples);
    if let Some(stride) = job.stride {
        truth = split_by_stride(&truth, stride).0;
    }
    if let Some(limit) = job.limit {
        truth.truncate(limit);
    }
    let names: Vec<String> = truth.iter().map(|line| strip_tags(line)).collect();

    info!(
        corpus = lines.len(),
        examples = examples.len(),
        test = truth.len(),
        model = %job.model,
        "Prepared annotation job"
    );

    let gateway = ProviderGateway::from_env(usage_sink)?;
    let annotator = GatewayAnnotator::new(gateway, ChatModel::openrouter(&job.model))
        .with_template(job.template)
        .with_labels(job.config.valid_labels.clone())
        .temperature(job.temperature);

    let run = annotate_all(&annotator, &examples, &names, &job.config).await?;

    let report = AnnotationReport {
        run_id: annotator.run_id(),
        model: &job.model,
        prompt: job.template.slug,
        selection: job.selection,
        config: &job.config,
        examples: &examples,
        truth: &truth,
        predictions: &run.predictions,
        stats: &run.stats,
        equal_line_ratio: equal_line_ratio(&truth, &run.predictions),
        equal_labels_ratio: equal_labels_ratio(&truth, &run.predictions),
    };

    let file = File::create(&job.out)?;
    serde_json::to_writer_pretty(file, &report)?;

    println!("equal_line_ratio   {:.4}", report.equal_line_ratio);
    println!("equal_labels_ratio {:.4}", report.equal_labels_ratio);
    Ok(())
}
