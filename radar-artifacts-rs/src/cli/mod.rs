//! Command-line interface for the artifact labeling pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::{load_detections, write_detections_csv, write_statistics_json};
use crate::processors::{run_pipeline, PipelineReport, RunQuality, ZScoreBucketClassifier};
use crate::visualization::plot_clusters;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "radar-artifacts")]
#[command(about = "Unsupervised radar artifact labeling pipeline", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Label the detections of one test case
    Run {
        /// Input detection CSV
        input: PathBuf,
        /// Output directory (defaults to the input's directory)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Latent dimension of the auto-encoder
        #[arg(long)]
        latent_dim: Option<usize>,
        /// Training epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Reconstruction-error percentile for outliers
        #[arg(long)]
        percentile: Option<f64>,
        /// Mixture truncation level
        #[arg(long)]
        truncation: Option<usize>,
        /// Maximum clustering attempts
        #[arg(long)]
        max_retries: Option<usize>,
        /// Also write a PNG scatter plot of the final clusters
        #[arg(long)]
        plot: bool,
        /// Maximum number of points to plot (subsamples if exceeded)
        #[arg(long, default_value_t = 100_000)]
        max_points: usize,
    },

    /// Write the default configuration as YAML
    InitConfig {
        /// Destination path
        path: PathBuf,
    },
}

/// Per-run overrides of configuration fields from the command line.
struct Overrides {
    latent_dim: Option<usize>,
    epochs: Option<usize>,
    percentile: Option<f64>,
    truncation: Option<usize>,
    max_retries: Option<usize>,
}

impl Overrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(v) = self.latent_dim {
            config.encoder.latent_dim = v;
        }
        if let Some(v) = self.epochs {
            config.encoder.epochs = v;
        }
        if let Some(v) = self.percentile {
            config.outliers.percentile = v;
        }
        if let Some(v) = self.truncation {
            config.clustering.truncation = v;
        }
        if let Some(v) = self.max_retries {
            config.clustering.max_retries = v;
        }
    }
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}, using defaults",
                    path.display(),
                    e
                );
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    let result = match cli.command {
        Commands::Run {
            input,
            output_dir,
            latent_dim,
            epochs,
            percentile,
            truncation,
            max_retries,
            plot,
            max_points,
        } => {
            let overrides = Overrides {
                latent_dim,
                epochs,
                percentile,
                truncation,
                max_retries,
            };
            cmd_run(&input, output_dir, &overrides, plot, max_points, config)
        }
        Commands::InitConfig { path } => cmd_init_config(&path, &config),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Output file `<stem><suffix>` in `dir`.
fn output_path(dir: &Path, input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "detections".to_string());
    dir.join(format!("{}{}", stem, suffix))
}

fn cmd_run(
    input: &Path,
    output_dir: Option<PathBuf>,
    overrides: &Overrides,
    plot: bool,
    max_points: usize,
    mut config: PipelineConfig,
) -> Result<()> {
    let start = Instant::now();
    overrides.apply(&mut config);

    let output_dir = output_dir.unwrap_or_else(|| {
        input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });

    println!("Labeling detections...");
    println!("Input: {}", input.display());
    println!("Output directory: {}", output_dir.display());

    let spinner = create_spinner("Loading detections...");
    let mut table = load_detections(input, &config.data)
        .with_context(|| format!("failed to load {}", input.display()))?;
    spinner.finish_and_clear();

    let report = run_pipeline(&mut table, &config, &ZScoreBucketClassifier)
        .with_context(|| format!("pipeline failed for {}", input.display()))?;

    let spinner = create_spinner("Writing results...");
    let csv_path = output_path(&output_dir, input, "_labeled.csv");
    let json_path = output_path(&output_dir, input, "_clusters.json");

    write_detections_csv(&csv_path, &table, report.final_ids(), &config.data)?;
    write_statistics_json(&json_path, &report.statistics)?;

    let png_path = if plot {
        let path = output_path(&output_dir, input, "_clusters.png");
        spinner.set_message("Generating plot...");
        plot_clusters(&path, &table, report.final_ids(), max_points)?;
        Some(path)
    } else {
        None
    };
    spinner.finish_and_clear();

    if let RunQuality::Degraded { reason } = &report.quality {
        warn!("Run quality degraded: {}", reason);
    }

    let mut items = summary_items(&report, table.len());
    items.push(("Output CSV", csv_path.display().to_string()));
    items.push(("Statistics JSON", json_path.display().to_string()));
    if let Some(path) = png_path {
        items.push(("Plot", path.display().to_string()));
    }
    items.push(("Duration", format!("{:.2?}", start.elapsed())));

    print_summary("Artifact Labeling Complete", &items);
    Ok(())
}

fn summary_items(report: &PipelineReport, n_detections: usize) -> Vec<(&'static str, String)> {
    let quality = match &report.quality {
        RunQuality::Clean => "clean".to_string(),
        RunQuality::Degraded { reason } => format!("degraded ({})", reason),
    };
    vec![
        ("Detections", n_detections.to_string()),
        ("Outliers", report.n_outliers.to_string()),
        ("Threshold", format!("{:.6}", report.outlier_threshold)),
        ("NaN rows dropped", report.nan_rows_dropped.to_string()),
        ("Clusters", report.n_clusters.to_string()),
        ("After merging", report.merge.n_final_clusters().to_string()),
        ("Converged", report.converged.to_string()),
        ("Fit attempts", report.attempts.to_string()),
        ("Quality", quality),
    ]
}

fn cmd_init_config(path: &Path, config: &PipelineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    config
        .to_yaml(path)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {}", path.display(), e))?;
    println!("Wrote configuration to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_uses_stem() {
        let path = output_path(Path::new("out"), Path::new("data/case_01.csv"), "_labeled.csv");
        assert_eq!(path, PathBuf::from("out/case_01_labeled.csv"));
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = PipelineConfig::default();
        let overrides = Overrides {
            latent_dim: Some(5),
            epochs: None,
            percentile: Some(90.0),
            truncation: Some(12),
            max_retries: None,
        };
        overrides.apply(&mut config);

        assert_eq!(config.encoder.latent_dim, 5);
        assert_eq!(config.encoder.epochs, 50);
        assert_eq!(config.outliers.percentile, 90.0);
        assert_eq!(config.clustering.truncation, 12);
        assert_eq!(config.clustering.max_retries, 3);
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "radar-artifacts",
            "-vv",
            "run",
            "case.csv",
            "--epochs",
            "10",
            "--plot",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run { input, epochs, plot, .. } => {
                assert_eq!(input, PathBuf::from("case.csv"));
                assert_eq!(epochs, Some(10));
                assert!(plot);
            }
            _ => panic!("expected run subcommand"),
        }
    }
}
