//! Hybrid-BLAST command line entry point

use anyhow::{bail, Context, Result};
use hybrid_blast::{
    backends::BackendKind,
    batch::{BatchEvent, BatchRunner, OutcomeStatus},
    config,
    input::{read_sequences, QueryTemplate},
    results::{ResultParser, ResultWriter, XmlReportParser},
};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    force_backend: Option<BackendKind>,
    concurrency: Option<usize>,
    output: Option<PathBuf>,
    purge_cache: bool,
    files: Vec<PathBuf>,
}

enum Command {
    Run(Args),
    Help,
    Version,
}

fn parse_args() -> Result<Command> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "-c" | "--config" => {
                let path = iter.next().context("--config requires a file")?;
                args.config = Some(PathBuf::from(path));
            }
            "-o" | "--output" => {
                let path = iter.next().context("--output requires a directory")?;
                args.output = Some(PathBuf::from(path));
            }
            "-j" | "--concurrency" => {
                let value = iter.next().context("--concurrency requires a number")?;
                args.concurrency = Some(value.parse().context("invalid --concurrency")?);
            }
            "--local" => args.force_backend = Some(BackendKind::Local),
            "--remote" => args.force_backend = Some(BackendKind::Remote),
            "--purge-cache" => args.purge_cache = true,
            other if other.starts_with('-') => bail!("unknown option: {}", other),
            file => args.files.push(PathBuf::from(file)),
        }
    }

    Ok(Command::Run(args))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args()? {
        Command::Help => {
            print_usage();
            return Ok(());
        }
        Command::Version => {
            println!("hybrid-blast {}", hybrid_blast::VERSION);
            return Ok(());
        }
        Command::Run(args) => args,
    };

    let mut settings = config::load(args.config.as_deref())?;
    if let Some(kind) = args.force_backend {
        settings.scheduler.force_backend = Some(kind);
    }
    if let Some(concurrency) = args.concurrency {
        settings.batch.concurrency = concurrency.max(1);
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.general.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting Hybrid-BLAST v{}", hybrid_blast::VERSION);

    let runner = BatchRunner::from_settings(&settings)?;
    info!("Loaded {} backend(s)", runner.registry().len());

    if args.purge_cache {
        let removed = runner.cache().purge_expired().await;
        info!("Purged {} expired cache entries", removed);
    }

    if args.files.is_empty() {
        if args.purge_cache {
            return Ok(());
        }
        print_usage();
        bail!("no input files given");
    }

    let template = QueryTemplate::from(&settings.defaults);
    let mut queries = Vec::new();
    for path in &args.files {
        match read_sequences(path, &template) {
            Ok(mut read) => queries.append(&mut read),
            Err(e) => error!("Skipping {}: {}", path.display(), e),
        }
    }
    if queries.is_empty() {
        bail!("no readable queries");
    }

    let writer = ResultWriter::new(
        args.output
            .unwrap_or_else(|| settings.general.results_dir.clone()),
    );
    let parser = XmlReportParser::new();

    let mut handle = runner.run(runner.job(queries));

    let cancellation = handle.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling batch");
            cancellation.request();
        }
    });

    while let Some(event) = handle.next_event().await {
        let (outcome, completed, total) = match event {
            BatchEvent::Dispatched {
                query_id, backend, ..
            } => {
                info!("{} dispatched to {}", query_id, backend);
                continue;
            }
            BatchEvent::Completed {
                outcome,
                completed,
                total,
            } => (outcome, completed, total),
        };

        let mut line = format!(
            "[{}/{}] {}: {}",
            completed, total, outcome.query_id, outcome.status
        );
        if let Some(source) = outcome.source {
            line.push_str(&format!(" via {}", source));
        }

        if let (true, Some(raw)) = (outcome.status.is_success(), outcome.result.as_ref()) {
            match writer.write(&outcome.query_id, raw) {
                Ok(path) => line.push_str(&format!(" -> {}", path.display())),
                Err(e) => error!("Failed to write result for {}: {}", outcome.query_id, e),
            }
            match parser.parse(raw) {
                Ok(report) => match report.top_hit() {
                    Some(hit) => line.push_str(&format!(
                        " ({} hits, top: {})",
                        report.hits.len(),
                        hit.definition
                    )),
                    None => line.push_str(" (no hits)"),
                },
                Err(e) => warn!("Could not parse report for {}: {}", outcome.query_id, e),
            }
        }
        println!("{line}");

        if matches!(outcome.status, OutcomeStatus::Failed(_)) {
            for diagnostic in &outcome.diagnostics {
                println!("    {diagnostic}");
            }
        }
    }

    let summary = handle.wait().await;
    println!("{summary}");
    Ok(())
}

/// Print usage information
fn print_usage() {
    println!(
        r#"
Hybrid-BLAST v{}
Batch BLAST searches across local BLAST+ and NCBI

USAGE:
    hybrid-blast [OPTIONS] <FILES>...

OPTIONS:
    -c, --config <FILE>        Path to configuration file
    -o, --output <DIR>         Directory for result artifacts
    -j, --concurrency <N>      Maximum concurrent queries
        --local                Run every query on the local backend
        --remote               Run every query on the remote backend
        --purge-cache          Remove expired cache entries
    -h, --help                 Print help information
    -V, --version              Print version information

ENVIRONMENT VARIABLES:
    HYBRID_BLAST_SETTINGS_PATH  Path to settings file
    HYBRID_BLAST_EMAIL          Contact email sent to NCBI
    HYBRID_BLAST_API_KEY        NCBI API key
    RUST_LOG                    Log filter
"#,
        hybrid_blast::VERSION
    );
}
