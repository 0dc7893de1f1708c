//! Command-line interface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::analyzer::{Analyzer, AnalyzeOptions, NeverCancelled};
use crate::config::{self, Settings};
use crate::documents::PdfToolStore;
use crate::models::AnalysisMode;
use crate::progress::{ProgressSink, ProgressSnapshot};

/// Check for the verbose flag before clap parsing, so logging can be
/// initialized first.
pub fn is_verbose() -> bool {
    std::env::args().any(|a| a == "-v" || a == "--verbose")
}

#[derive(Parser)]
#[command(name = "pagelink", version, about = "Cross-document relevance analysis")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze a primary document against one or more partner documents
    Analyze {
        /// Primary document path
        #[arg(long)]
        primary: PathBuf,

        /// Partner document path (repeatable)
        #[arg(long = "partner", required = true)]
        partners: Vec<PathBuf>,

        /// Comma-separated service API keys
        #[arg(long, env = "ANALYSIS_API_KEYS", hide_env_values = true)]
        api_keys: Option<String>,

        /// Analysis mode
        #[arg(long, value_enum, default_value_t = AnalysisMode::PrimaryCentric)]
        mode: AnalysisMode,

        /// Maximum partner pages per service call
        #[arg(long, default_value_t = 40)]
        chunk_pages: u32,

        /// Minimum relevance score to keep a connection
        #[arg(long, default_value_t = 70)]
        min_score: u32,

        /// Connections kept per group
        #[arg(long, default_value_t = 2)]
        max_connections: usize,

        /// Concurrent analysis workers
        #[arg(long, default_value_t = 3)]
        workers: usize,

        /// Write the merged result to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Progress bar wired into the orchestrator's progress sink.
struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({percent}%)")
                .unwrap()
                .progress_chars("█▓░"),
        );
        bar.set_message("Analyzing");
        Self { bar }
    }
}

impl ProgressSink for BarSink {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_length(snapshot.total_units as u64);
        self.bar.set_position(snapshot.completed_units as u64);
        if let Some(message) = &snapshot.message {
            self.bar.set_message(message.clone());
        }
        if snapshot.percent == 100 {
            self.bar.finish_with_message("done");
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        tracing::debug!("Verbose output enabled");
    }
    match cli.command {
        Command::Analyze {
            primary,
            partners,
            api_keys,
            mode,
            chunk_pages,
            min_score,
            max_connections,
            workers,
            output,
        } => {
            analyze_command(
                primary,
                partners,
                api_keys,
                mode,
                chunk_pages,
                min_score,
                max_connections,
                workers,
                output,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn analyze_command(
    primary: PathBuf,
    partners: Vec<PathBuf>,
    api_keys: Option<String>,
    mode: AnalysisMode,
    chunk_pages: u32,
    min_score: u32,
    max_connections: usize,
    workers: usize,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let credentials = match api_keys {
        Some(raw) => config::credentials_from_keys(&raw),
        None => config::credentials_from_env(),
    };
    anyhow::ensure!(
        !credentials.is_empty(),
        "no API keys supplied; set ANALYSIS_API_KEYS or pass --api-keys"
    );

    let settings = Settings::from_env();
    println!(
        "{} {} credential(s), model {}",
        style("Using").bold(),
        credentials.len(),
        settings.gemini.model
    );
    let store = Arc::new(PdfToolStore::new()?);
    let sink = Arc::new(BarSink::new());
    let analyzer = Analyzer::with_gemini(
        store,
        &credentials,
        settings.gemini,
        settings.pool,
        settings.dispatch,
        Some(sink),
    )?;

    let options = AnalyzeOptions {
        mode,
        max_pages_per_chunk: chunk_pages,
        min_relevance_score: min_score,
        max_connections_per_group: max_connections,
        max_workers: workers,
        ..AnalyzeOptions::default()
    };

    let primary = primary.to_string_lossy().into_owned();
    let partners: Vec<String> = partners
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();

    let result = analyzer
        .analyze(&primary, &partners, &options, Arc::new(NeverCancelled))
        .await?;

    let group_count = match mode {
        AnalysisMode::PrimaryCentric => result.pages.len(),
        AnalysisMode::PartnerCentric => result.related.len(),
    };
    println!(
        "{} {} result groups, {} failed chunk(s), {} partial chunk(s)",
        style("Merged:").green().bold(),
        group_count,
        result.failed_chunks,
        result.partial_chunks
    );

    for status in analyzer.credential_report() {
        let state = if status.available {
            style("available").green()
        } else {
            style("cooling").yellow()
        };
        println!(
            "  {} {} ok={} failed={} {}",
            style(&status.id).dim(),
            state,
            status.success_count,
            status.total_failures,
            status
                .cooldown_remaining_secs
                .map(|s| format!("({}s cooldown left)", s))
                .unwrap_or_default()
        );
    }

    let rendered = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, rendered)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!("{} {}", style("Wrote").bold(), path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}
