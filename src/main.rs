//! mailsift CLI - resumable email-to-records pipeline.

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use mailsift::{
    BatchExecutor, Config, DeliveryPipeline, DeliveryReport, ExtractionPipeline,
    ExtractionReport, ExtractionSettings, HttpDelivery, MailboxSource, MailsiftError,
    MatchedEntityValidator, PartialReport, PassThroughEnricher, SourcePreparer, Summary,
    WholeMessageParser, save_report,
};
use std::path::{Path, PathBuf};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mailsift")]
#[command(version)]
#[command(about = "Parse an email folder into records, then deliver them in resumable batches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Phase 1: parse .eml files into a JSON record file
    Parse {
        /// Folder containing .eml files
        #[arg(short, long)]
        folder: PathBuf,

        /// Output JSON file (default: data/bulk_articles_<timestamp>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Checkpoint file (default from config)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Continue from the checkpoint instead of starting over
        #[arg(long)]
        resume: bool,

        /// Only consider the first N files
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Phase 2: deliver a record file to the remote system
    Upload {
        /// JSON record file written by `parse`
        #[arg(short, long)]
        input: PathBuf,

        /// Checkpoint file (default from config)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Continue after the last successful batch
        #[arg(long)]
        resume: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {path:?}")),
        None => Ok(Config::default()),
    }
}

fn print_example_config() {
    let example = r#"# mailsift configuration file

[extraction]
checkpoint_path = "data/bulk_checkpoint.json"
checkpoint_save_interval = 10
show_progress = true

[delivery]
checkpoint_path = "data/upload_checkpoint.json"
batch_size = 50
rate_limit_delay_secs = 1.0
max_retries = 3          # attempts per batch, first one included
backoff_unit_secs = 2.0  # delay before attempt n is n * unit
show_progress = true

[endpoint]
base_url = "https://records.example.com/api/v1"
object = "Article"
# api_key = "${RECORDS_API_KEY}"
api_key_env = "MAILSIFT_API_KEY"
timeout_secs = 60

[reports]
dir = "reports"
enabled = true
"#;
    println!("{example}");
}

fn print_extraction_summary(title: &str, report: &ExtractionReport) {
    println!("\n=== {title} ===");
    println!("Units:       {}", report.total_units);
    println!(
        "Processed:   {} ({:.1}%)",
        report.processed_units,
        report.success_rate()
    );
    println!("Failed:      {}", report.failed_units);
    println!("Remaining:   {}", report.remaining_units);
    println!("Records:     {} this run", report.records_this_run);
    println!("Runtime:     {:.1}s", report.runtime_secs);
    println!("Output:      {:?}", report.output_path);
}

fn print_delivery_summary(title: &str, report: &DeliveryReport) {
    println!("\n=== {title} ===");
    println!("Records:     {}", report.total_units);
    println!(
        "Delivered:   {} ({:.1}%)",
        report.succeeded, report.success_rate
    );
    println!("Batches:     {}", report.total_batches);
    println!("Failed:      {} batches", report.batches_failed);
    println!("Partial:     {} records dropped", report.dropped_in_partial_batches);
    println!("Retries:     {}", report.retries);
    println!("Runtime:     {:.1}s", report.runtime_secs);
}

fn write_report<S: Summary>(config: &Config, summary: &S) -> Result<()> {
    if config.reports.enabled {
        let (json_path, text_path) = save_report(summary, &config.reports.dir)?;
        println!("\nReport saved to:\n  - {json_path:?}\n  - {text_path:?}");
    }
    Ok(())
}

/// Print and save the summary carried by an aborted run, if any.
fn report_partial(config: &Config, err: &MailsiftError) {
    let saved = match err.partial_report() {
        Some(PartialReport::Extraction(report)) => {
            print_extraction_summary("Extraction Stopped", report);
            write_report(config, report)
        }
        Some(PartialReport::Delivery(report)) => {
            print_delivery_summary("Delivery Stopped", report);
            write_report(config, report)
        }
        None => Ok(()),
    };
    if let Err(e) = saved {
        warn!(error = %e, "Failed to save partial report");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            info!("Configuration is valid");
            info!("  Endpoint: {}/{}", config.endpoint.base_url, config.endpoint.object);
            info!(
                "  Batches: {} records, {:.1}s apart, {} attempts",
                config.delivery.batch_size,
                config.delivery.rate_limit_delay_secs,
                config.delivery.max_retries
            );
        }

        Commands::Parse {
            folder,
            output,
            checkpoint,
            resume,
            limit,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let output = output.unwrap_or_else(|| {
                PathBuf::from(format!(
                    "data/bulk_articles_{}.json",
                    Local::now().format("%Y%m%d_%H%M%S")
                ))
            });
            let checkpoint = checkpoint.unwrap_or_else(|| config.extraction.checkpoint_path.clone());

            let mut pipeline = ExtractionPipeline::new(
                Box::new(MailboxSource::new(folder)),
                Box::new(WholeMessageParser::new()?),
                Box::new(PassThroughEnricher),
                Box::new(MatchedEntityValidator),
                Box::new(SourcePreparer),
                ExtractionSettings::from_config(&config.extraction, limit),
            );

            let report = match pipeline.run(&output, &checkpoint, resume).await {
                Ok(report) => report,
                Err(e) => {
                    report_partial(&config, &e);
                    return Err(e).context("Extraction failed. Run with --resume to continue");
                }
            };

            print_extraction_summary("Extraction Complete", &report);
            write_report(&config, &report)?;

            if !output.exists() {
                bail!("No output produced: nothing to process in the workload");
            }
        }

        Commands::Upload {
            input,
            checkpoint,
            resume,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let checkpoint = checkpoint.unwrap_or_else(|| config.delivery.checkpoint_path.clone());
            let api_key = config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            let delivery = HttpDelivery::new(&config.endpoint, api_key)?;
            info!(url = delivery.url(), "Delivering to endpoint");
            let executor = BatchExecutor::from_config(Box::new(delivery), &config.delivery);

            let report = match DeliveryPipeline::new(executor)
                .run(&input, &checkpoint, resume)
                .await
            {
                Ok(report) => report,
                Err(e) => {
                    report_partial(&config, &e);
                    return Err(e).context("Delivery failed. Run with --resume to continue");
                }
            };

            print_delivery_summary("Delivery Complete", &report);
            write_report(&config, &report)?;

            if report.total_units > 0 && report.succeeded == 0 {
                warn!("No records were delivered");
                bail!("No records delivered");
            }
        }
    }

    Ok(())
}
