use paraprobe_core::config::ProbeConfig;
use paraprobe_core::enumerate::{self, PayloadSource, UrlSource};
use paraprobe_core::extract::{ExtractorConfig, FILTER_RULE, ParameterCorpus, ParameterExtractor};
use paraprobe_core::locate::locate_tools;
use paraprobe_core::report::{ReportWriter, run_stamp};
use paraprobe_core::runner::{InvokerConfig, ToolInvoker};
use paraprobe_core::schedule::{Scheduler, SchedulerConfig};
use paraprobe_core::score::aggregate;
use paraprobe_core::state::StateStore;

use anyhow::Context;
use clap::Parser;
use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Probe URL query parameters for RCE side effects", long_about = None)]
struct Cli {
    /// TOML configuration file; CLI flags override its values.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,

    /// File of target URLs, one per line.
    #[clap(long)]
    url_file: Option<PathBuf>,
    /// Single target URL.
    #[clap(long)]
    single_url: Option<String>,
    /// File of payloads, one per line.
    #[clap(long)]
    payload_file: Option<PathBuf>,
    /// Single payload.
    #[clap(long)]
    single_payload: Option<String>,
    /// Maximum number of URLs to process.
    #[clap(long)]
    max_urls: Option<usize>,

    /// Explicit path to the substitution tool (qsreplace).
    #[clap(long)]
    qsreplace_path: Option<PathBuf>,
    /// Explicit path to the pattern-filter tool (gf).
    #[clap(long)]
    gf_path: Option<PathBuf>,

    /// Worker pool size.
    #[clap(long)]
    max_workers: Option<usize>,
    /// Per-attempt timeout in seconds.
    #[clap(long)]
    timeout: Option<u64>,
    /// Retries after a failed or timed-out attempt.
    #[clap(long)]
    retries: Option<u32>,

    /// Output directory for artifacts, summaries, and state.
    #[clap(long)]
    output_dir: Option<PathBuf>,
    /// Skip building the tar.gz result archive.
    #[clap(long)]
    no_archive: bool,

    /// Only warnings and errors on the console.
    #[clap(long)]
    quiet: bool,
    /// Debug-level console output.
    #[clap(short, long)]
    verbose: bool,
    /// Simulate the run without invoking external tools.
    #[clap(long)]
    dry_run: bool,
    /// Skip work items already terminal in the state file.
    #[clap(long)]
    resume: bool,
    /// Drop all recorded state before enumerating.
    #[clap(long)]
    reset_state: bool,
}

fn load_config(cli: &Cli) -> anyhow::Result<ProbeConfig> {
    let mut config = match &cli.config_file {
        Some(config_path) => ProbeConfig::load_from_file(config_path)?,
        None => {
            let default_config_path = PathBuf::from("paraprobe.toml");
            if default_config_path.exists() {
                ProbeConfig::load_from_file(&default_config_path)?
            } else {
                ProbeConfig::default()
            }
        }
    };

    if cli.url_file.is_some() {
        config.targets.url_file = cli.url_file.clone();
    }
    if cli.single_url.is_some() {
        config.targets.single_url = cli.single_url.clone();
    }
    if cli.payload_file.is_some() {
        config.targets.payload_file = cli.payload_file.clone();
    }
    if cli.single_payload.is_some() {
        config.targets.single_payload = cli.single_payload.clone();
    }
    if cli.max_urls.is_some() {
        config.targets.max_urls = cli.max_urls;
    }
    if cli.qsreplace_path.is_some() {
        config.tools.qsreplace_path = cli.qsreplace_path.clone();
    }
    if cli.gf_path.is_some() {
        config.tools.gf_path = cli.gf_path.clone();
    }
    if let Some(workers) = cli.max_workers {
        config.run.max_workers = workers;
    }
    if let Some(timeout) = cli.timeout {
        config.run.timeout_secs = timeout;
    }
    if let Some(retries) = cli.retries {
        config.run.retries = retries;
    }
    if let Some(dir) = &cli.output_dir {
        config.output.dir = dir.clone();
    }
    if cli.no_archive {
        config.output.archive = false;
    }
    config.run.quiet |= cli.quiet;
    config.run.verbose |= cli.verbose;
    config.run.dry_run |= cli.dry_run;
    config.run.resume |= cli.resume;
    Ok(config)
}

fn init_tracing(quiet: bool, verbose: bool) {
    let default_level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(config.run.quiet, config.run.verbose);

    let started = Instant::now();

    let tools = locate_tools(
        config.tools.qsreplace_path.clone(),
        config.tools.gf_path.clone(),
        config.run.dry_run,
    )?;

    std::fs::create_dir_all(&config.output.dir)
        .with_context(|| format!("failed to create output dir {:?}", config.output.dir))?;

    let mut state = StateStore::open(config.output.state_path())?;
    if cli.reset_state {
        warn!("resetting recorded state at user request");
        state.reset()?;
    }
    let exclude = if config.run.resume {
        state.load_all()
    } else {
        HashSet::new()
    };

    let url_source = UrlSource::select(
        config.targets.url_file.clone(),
        config.targets.single_url.clone(),
        !std::io::stdin().is_terminal(),
    )?;
    let payload_source = PayloadSource::select(
        config.targets.payload_file.clone(),
        config.targets.single_payload.clone(),
    );

    let enumeration = enumerate::enumerate(
        &url_source,
        &payload_source,
        config.targets.max_urls,
        &exclude,
    )?;
    if enumeration.skipped_urls > 0 {
        warn!(skipped = enumeration.skipped_urls, "malformed URLs skipped");
    }
    if enumeration.items.is_empty() {
        if enumeration.excluded > 0 {
            info!(
                excluded = enumeration.excluded,
                "all work items already processed, nothing to do"
            );
        } else {
            warn!("no valid work items enumerated");
        }
        return Ok(());
    }
    info!(
        items = enumeration.items.len(),
        excluded = enumeration.excluded,
        "work set enumerated"
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, draining in-flight work and saving state...");
            stop.store(true, Ordering::SeqCst);
        })
        .context("failed to install interrupt handler")?;
    }

    let timeout = Duration::from_secs(config.run.timeout_secs);
    let invoker = ToolInvoker::new(InvokerConfig {
        tool: tools.substitution,
        timeout,
        retries: config.run.retries,
        retry_delay: Duration::from_millis(config.run.retry_delay_ms),
        dry_run: config.run.dry_run,
    });

    let corpus = ParameterCorpus::open(config.output.corpus_path())?;
    let extractor = Mutex::new(ParameterExtractor::new(
        ExtractorConfig {
            filter_tool: tools.filter,
            rule: FILTER_RULE.to_string(),
            timeout,
            enabled: !config.run.dry_run,
        },
        corpus,
    ));

    let writer = ReportWriter::create(config.output.dir.clone(), run_stamp())?;
    let state = Mutex::new(state);

    let scheduler = Scheduler::new(SchedulerConfig {
        max_workers: config.run.max_workers,
    });
    let outcome = scheduler.run(
        &enumeration.items,
        &invoker,
        &state,
        &extractor,
        Some(&writer),
        &stop,
    )?;

    let summary = aggregate(&outcome.results);
    writer.write_json_summary(&summary)?;
    writer.write_csv_summary(&summary)?;
    if config.output.archive && !config.run.dry_run {
        writer.archive_artifacts()?;
    }

    for entry in summary.entries.iter().filter(|e| e.score > 0).take(10) {
        info!(
            url = %entry.url,
            payload = %entry.payload,
            score = entry.score,
            "potential RCE indicator"
        );
    }
    info!(
        processed = summary.entries.len(),
        flagged = summary.entries.iter().filter(|e| e.score > 0).count(),
        stopped_early = outcome.stopped,
        elapsed_secs = format!("{:.2}", started.elapsed().as_secs_f64()),
        "run complete"
    );

    Ok(())
}
