use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fishnet::exclude::{exclude_records, ExclusionRule};
use fishnet::grid::{build_fishnet, FishnetSpec};
use fishnet::store::base_name;
use fishnet::{
    FishnetAggregator, FoldPlan, GeoJsonStore, LayerStore, LinearUnit, PlanarEngine, RunConfig,
    RunReport,
};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// `fishnet` - fold vector layers into a reference grid.
///
/// Each aggregation adds one field to a new version of the main grid:
/// acres for polygon layers, miles for line layers and counts for point
/// layers.
#[derive(Parser, Debug)]
#[command(name = "fishnet", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fold one layer into the main grid.
    Aggregate(AggregateArgs),
    /// Fold every layer of a JSON manifest, chaining grid versions.
    Batch {
        /// Manifest with `interim_path`, `fishnet_template`, `fishnet_main` and `jobs`.
        manifest: PathBuf,
    },
    /// Write an empty fishnet template.
    CreateGrid(GridArgs),
    /// Drop records matching ordered attribute rules before aggregation.
    Exclude(ExcludeArgs),
}

#[derive(clap::Args, Debug)]
struct AggregateArgs {
    /// Layer to fold in.
    #[arg(long, env = "FISHNET_INPUT")]
    input: PathBuf,

    /// Directory for intermediate layers.
    #[arg(long, env = "FISHNET_INTERIM")]
    interim: PathBuf,

    /// Clean fishnet used for intersection.
    #[arg(long, env = "FISHNET_TEMPLATE")]
    template: PathBuf,

    /// Accumulating fishnet the new field is joined onto.
    #[arg(long, env = "FISHNET_MAIN")]
    main: PathBuf,

    /// Name of the new field (at most 10 characters, no punctuation).
    #[arg(long, env = "FISHNET_FIELD")]
    field: String,

    /// Appended to the main grid name to name the output.
    #[arg(long, env = "FISHNET_SUFFIX")]
    suffix: String,

    /// Leave intermediate layers in the interim directory.
    #[arg(long, default_value_t = false)]
    keep_interim: bool,
}

#[derive(clap::Args, Debug)]
struct GridArgs {
    /// Output layer.
    #[arg(long)]
    output: PathBuf,

    /// Lower-left corner x.
    #[arg(long, allow_hyphen_values = true)]
    origin_x: f64,

    /// Lower-left corner y.
    #[arg(long, allow_hyphen_values = true)]
    origin_y: f64,

    /// Cell width in layer units.
    #[arg(long)]
    cell_width: f64,

    /// Cell height; defaults to the width.
    #[arg(long)]
    cell_height: Option<f64>,

    #[arg(long)]
    rows: u32,

    #[arg(long)]
    cols: u32,

    /// meter, foot, degree or unknown
    #[arg(long, default_value = "meter")]
    unit: LinearUnit,

    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

#[derive(clap::Args, Debug)]
struct ExcludeArgs {
    /// Layer to clean.
    #[arg(long)]
    input: PathBuf,

    /// JSON array of rules, applied in order.
    #[arg(long)]
    rules: PathBuf,

    /// Directory for the kept layer, the removed layer and the round log.
    #[arg(long)]
    output_dir: PathBuf,
}

fn log_report(report: &RunReport) {
    info!(
        "{} ({}): {} = {:.4} over {}/{} cells -> {}",
        report.input,
        report.kind,
        report.field_name,
        report.total,
        report.matched_cells,
        report.cells,
        report.output.display()
    );
}

fn aggregate(args: AggregateArgs) -> Result<()> {
    let config = RunConfig {
        input_feature: args.input,
        interim_path: args.interim,
        fishnet_template: args.template,
        fishnet_main: args.main,
        field_name: args.field,
        fishnet_suffix: args.suffix,
        keep_interim: args.keep_interim,
    };
    let report = FishnetAggregator::new(PlanarEngine::new(), GeoJsonStore::new())
        .run(&config)
        .with_context(|| format!("folding {}", config.input_feature.display()))?;
    log_report(&report);
    Ok(())
}

fn batch(manifest: &Path) -> Result<()> {
    let text = fs::read_to_string(manifest)
        .with_context(|| format!("reading manifest {}", manifest.display()))?;
    let plan: FoldPlan = serde_json::from_str(&text)
        .with_context(|| format!("parsing manifest {}", manifest.display()))?;
    if plan.jobs.is_empty() {
        warn!("Manifest {} lists no layers", manifest.display());
        return Ok(());
    }

    let reports = FishnetAggregator::new(PlanarEngine::new(), GeoJsonStore::new())
        .fold(&plan)
        .context("batch aggregation failed")?;
    for report in &reports {
        log_report(report);
    }
    if let Some(last) = reports.last() {
        info!("Final grid: {}", last.output.display());
    }
    Ok(())
}

fn create_grid(args: GridArgs) -> Result<()> {
    let store = GeoJsonStore::new();
    if store.exists(&args.output) && !args.overwrite {
        bail!(
            "{} already exists (pass --overwrite to replace it)",
            args.output.display()
        );
    }
    let spec = FishnetSpec {
        origin: (args.origin_x, args.origin_y),
        cell_width: args.cell_width,
        cell_height: args.cell_height.unwrap_or(args.cell_width),
        rows: args.rows,
        cols: args.cols,
        linear_unit: args.unit,
    };
    let grid = build_fishnet(&base_name(&args.output), &spec)?;
    store
        .write(&args.output, &grid)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!("Wrote {} cells to {}", grid.len(), args.output.display());
    Ok(())
}

fn exclude(args: ExcludeArgs) -> Result<()> {
    let store = GeoJsonStore::new();
    let layer = store
        .read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let text = fs::read_to_string(&args.rules)
        .with_context(|| format!("reading rules {}", args.rules.display()))?;
    let rules: Vec<ExclusionRule> = serde_json::from_str(&text)
        .with_context(|| format!("parsing rules {}", args.rules.display()))?;

    let outcome = exclude_records(&layer, &rules)?;

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;
    let kept_path = args.output_dir.join(&outcome.kept.name);
    let removed_path = args.output_dir.join(&outcome.removed.name);
    store.write(&kept_path, &outcome.kept)?;
    store.write(&removed_path, &outcome.removed)?;

    let log_path = args
        .output_dir
        .join(format!("{}_exclusions.json", layer.name));
    let log = serde_json::to_string_pretty(&outcome.stats)?;
    fs::write(&log_path, log).with_context(|| format!("writing {}", log_path.display()))?;

    info!(
        "Kept {} and removed {} of {} records from {}",
        outcome.kept.len(),
        outcome.removed.len(),
        layer.len(),
        layer.name
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let started = Instant::now();

    match cli.command {
        Command::Aggregate(args) => aggregate(args)?,
        Command::Batch { manifest } => batch(&manifest)?,
        Command::CreateGrid(args) => create_grid(args)?,
        Command::Exclude(args) => exclude(args)?,
    }

    info!("Finished in {:.2?}", started.elapsed());
    Ok(())
}
