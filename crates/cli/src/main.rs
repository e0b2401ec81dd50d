//! terratrend CLI - seasonal composites, anomalies and trends over dated rasters

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geo_types::MultiPolygon;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use terratrend_algorithms::compositing::CompositeSeries;
use terratrend_algorithms::pipeline::{
    regional_anomaly, AnomalyPlan, PipelineConfig, RegionalTrendPlan, TrendPlan, UnitFailure, YearFailure,
};
use terratrend_core::io::{Artifact, DirectorySource, FileExporter, ResultExporter};
use terratrend_core::region::read_regions;
use terratrend_core::source::RasterTimeSeriesSource;
use terratrend_core::{Region, StudyArea};

// ─── CLI structure ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "terratrend")]
#[command(author, version, about = "Seasonal anomaly and trend analysis of raster time series", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Pipeline configuration (TOML)
    #[arg(short, long, global = true, default_value = "terratrend.toml")]
    config: PathBuf,

    /// Directory of dated GeoTIFF frames
    #[arg(short, long, global = true, default_value = ".")]
    frames: PathBuf,

    /// Restrict processing to the union of these GeoJSON polygons
    #[arg(long, global = true)]
    study_area: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the frame directory and the resolved configuration
    Info,
    /// Build one seasonal composite
    Composite {
        /// Year the season starts in
        #[arg(short, long)]
        year: i32,
        /// Output GeoTIFF
        output: PathBuf,
    },
    /// Baseline anomaly of every target year
    Anomaly {
        /// Output GeoTIFF; the target year is appended to the stem when
        /// several target years are configured
        output: PathBuf,
        /// Regions to reduce each anomaly over (GeoJSON)
        #[arg(short, long)]
        regions: Option<PathBuf>,
        /// CSV table of regional anomalies
        #[arg(short, long, requires = "regions")]
        table: Option<PathBuf>,
    },
    /// Per-pixel linear trend (slope, intercept, points_used bands)
    Trend {
        /// Output GeoTIFF
        output: PathBuf,
    },
    /// Per-region yearly series and linear trend
    RegionalTrend {
        /// Regions (GeoJSON)
        #[arg(short, long)]
        regions: PathBuf,
        /// CSV table of region trends
        output: PathBuf,
        /// CSV table of the region-year series
        #[arg(short, long)]
        series: Option<PathBuf>,
    },
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install logger")
}

fn spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::from_file(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn open_source(dir: &Path, config: &PipelineConfig) -> Result<DirectorySource> {
    let pb = spinner("Scanning frames...")?;
    let source = DirectorySource::open(dir, config.dataset_id.clone())
        .with_context(|| format!("Failed to open frame directory {}", dir.display()))?;
    pb.finish_and_clear();
    info!("Frames: {} in {}", source.len(), dir.display());
    Ok(source)
}

fn load_regions(path: &Path, config: &PipelineConfig) -> Result<Vec<Region>> {
    let regions = read_regions(path, &config.regions.name_property)
        .with_context(|| format!("Failed to read regions {}", path.display()))?;
    info!("Regions: {}", regions.len());
    Ok(regions)
}

fn study_area(source: &dyn RasterTimeSeriesSource, clip: Option<&Path>, config: &PipelineConfig) -> Result<StudyArea> {
    let grid = source.grid().context("Failed to read source grid")?;
    match clip {
        None => Ok(StudyArea::full(grid)),
        Some(path) => {
            let polygons: Vec<_> = load_regions(path, config)?
                .into_iter()
                .flat_map(|r| r.geometry.0)
                .collect();
            StudyArea::with_geometry(grid, MultiPolygon(polygons)).context("Invalid study area")
        }
    }
}

fn save(artifact: Artifact<'_>, path: &Path, config: &PipelineConfig, metadata: Vec<(String, String)>) -> Result<()> {
    let pb = spinner("Writing output...")?;
    FileExporter::with_sentinel(config.no_data_sentinel)
        .with_metadata(metadata)
        .save(artifact, path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    pb.finish_and_clear();
    Ok(())
}

/// `out.tif` → `out_2023.tif`
fn year_path(path: &Path, year: i32) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("anomaly");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}_{year}.{ext}"),
        None => format!("{stem}_{year}"),
    };
    path.with_file_name(name)
}

fn report_failures(failures: &[UnitFailure]) {
    if failures.is_empty() {
        return;
    }
    warn!("{} unit(s) failed", failures.len());
    for failure in failures {
        println!("  failed: {}", failure);
    }
}

fn report_dropped_years(failures: &[YearFailure]) {
    if failures.is_empty() {
        return;
    }
    warn!("{} year(s) dropped", failures.len());
    for failure in failures {
        println!("  dropped: {}", failure);
    }
}

fn done(name: &str, path: &Path, elapsed: std::time::Duration) {
    println!("{} saved to: {}", name, path.display());
    println!("  Processing time: {:.2?}", elapsed);
}

// ─── Main ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let config = load_config(&cli.config)?;
    let source = open_source(&cli.frames, &config)?;
    let study = study_area(&source, cli.study_area.as_deref(), &config)?;

    match cli.command {
        Commands::Info => {
            let grid = study.grid();
            let (min_x, min_y, max_x, max_y) = grid.bounds();
            println!("Dataset: {}", config.dataset_id);
            println!("Frames: {}", source.len());
            if let Some(span) = source.date_span() {
                println!("Dates: {}", span);
            }
            println!("Grid: {} x {} ({} cells)", grid.cols, grid.rows, grid.len());
            println!("Bounds: ({:.6}, {:.6}) - ({:.6}, {:.6})", min_x, min_y, max_x, max_y);
            println!("Study pixels: {}", study.pixel_count());
            println!("\nConfiguration:");
            print!("{}", config.to_toml_string()?);
        }

        Commands::Composite { year, output } => {
            let start = Instant::now();
            let series = CompositeSeries::new(&source, &study, config.composite_params()?, [year])?;
            let composite = series.get(year).with_context(|| format!("Failed to composite {year}"))?;
            if let Some(reason) = composite.fallback_reason() {
                warn!("Composite {} is {} ({})", year, composite.status(), reason);
            }
            info!("Frames in window {}: {}", composite.window, composite.source_frame_count);
            save(
                Artifact::Raster(&[(config.band_name.as_str(), composite.raster())]),
                &output,
                &config,
                composite.metadata(),
            )?;
            done("Composite", &output, start.elapsed());
        }

        Commands::Anomaly { output, regions, table } => {
            let start = Instant::now();
            let plan = AnomalyPlan::from_config(&config)?;
            let pb = spinner("Computing anomalies...")?;
            let report = plan.evaluate(&source, &study).context("Anomaly evaluation failed")?;
            pb.finish_and_clear();
            report_dropped_years(&report.failures);
            let anomalies = report.output;

            let regions = regions.map(|p| load_regions(&p, &config)).transpose()?;
            for (year, anomaly) in &anomalies {
                if !anomaly.is_valid() {
                    warn!("Anomaly {} is {}", year, anomaly.status);
                }
                let path = if anomalies.len() > 1 { year_path(&output, *year) } else { output.clone() };
                save(Artifact::Raster(&[("anomaly", &anomaly.anomaly)]), &path, &config, anomaly.metadata())?;
                done("Anomaly", &path, start.elapsed());

                if let Some(regions) = &regions {
                    let report = regional_anomaly(anomaly, regions, &config.zonal_params(), config.processing_mode())?;
                    report_failures(&report.failures);
                    for (id, value) in &report.values {
                        match value {
                            Some(v) => println!("  {}: {:.4}", id, v),
                            None => println!("  {}: null", id),
                        }
                    }
                    if let Some(table_path) = &table {
                        let path = if anomalies.len() > 1 { year_path(table_path, *year) } else { table_path.clone() };
                        save(Artifact::Table(&report.table()?), &path, &config, Vec::new())?;
                        done("Regional anomalies", &path, start.elapsed());
                    }
                }
            }
        }

        Commands::Trend { output } => {
            let start = Instant::now();
            let plan = TrendPlan::from_config(&config)?;
            let pb = spinner("Fitting trends...")?;
            let report = plan.evaluate(&source, &study).context("Trend evaluation failed")?;
            pb.finish_and_clear();
            report_dropped_years(&report.failures);
            let trend = report.output;
            let points = trend.points_used_f64();
            save(
                Artifact::Raster(&[("slope", &trend.slope), ("intercept", &trend.intercept), ("points_used", &points)]),
                &output,
                &config,
                Vec::new(),
            )?;
            done("Trend", &output, start.elapsed());
        }

        Commands::RegionalTrend { regions, output, series } => {
            let start = Instant::now();
            let regions = load_regions(&regions, &config)?;
            let plan = RegionalTrendPlan::from_config(&config)?;
            let pb = spinner("Reducing regions...")?;
            let report = plan
                .evaluate(&source, &study, &regions)
                .context("Regional trend evaluation failed")?;
            pb.finish_and_clear();

            report_failures(&report.failures);
            for (id, trend) in &report.trends {
                println!("  {}: {}", id, trend);
            }
            save(Artifact::Table(&report.trend_table()?), &output, &config, Vec::new())?;
            done("Regional trends", &output, start.elapsed());
            if let Some(path) = series {
                save(Artifact::Table(&report.series_table()?), &path, &config, Vec::new())?;
                done("Regional series", &path, start.elapsed());
            }
        }
    }

    Ok(())
}
