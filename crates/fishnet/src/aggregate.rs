//! The fishnet aggregation pipeline.
//!
//! One run folds one input layer into the accumulating grid:
//!
//! ```text
//! polygon / line:  Start -> Dissolved -> Intersected -> Measured -> Pointified -> Joined -> Reconciled -> Done
//! point:           Start -> Exploded -> Joined (temp) -> Reconciled (renamed) -> Done
//! ```
//!
//! The branch is chosen once from the input's geometry type. Every run
//! writes exactly one new grid version, `<main>_<suffix>`, next to the main
//! grid, and only after every intermediate step has succeeded. Interim
//! layers go to the caller's interim directory and are removed when the run
//! ends, whether it succeeded or not, unless `keep_interim` is set.

use crate::engine::{GeometryEngine, JoinSpec, JOIN_COUNT, TARGET_FID};
use crate::error::{Result, ValidationError};
use crate::fields::{
    rename_field, strip_bookkeeping_fields, validate_field_name, validate_suffix, FieldMap,
    BOOKKEEPING_FIELDS,
};
use crate::layer::{FieldDef, FieldKind, GeometryKind, Layer, LinearUnit, Value};
use crate::metric::{calculate_metric, Metric};
use crate::store::{base_name, interim, sibling, LayerStore};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Layer to fold in.
    pub input_feature: PathBuf,
    /// Directory for intermediate layers.
    pub interim_path: PathBuf,
    /// Clean grid used for intersection.
    pub fishnet_template: PathBuf,
    /// Accumulating grid the metric is joined onto.
    pub fishnet_main: PathBuf,
    /// New metric field, at most ten characters, no punctuation.
    pub field_name: String,
    /// Appended to the main grid name to name the new version.
    pub fishnet_suffix: String,
    pub keep_interim: bool,
}

/// Pipeline states, in the order a run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Dissolved,
    Intersected,
    Measured,
    Pointified,
    Exploded,
    Joined,
    Reconciled,
    Done,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub input: String,
    pub kind: GeometryKind,
    pub field_name: String,
    /// Path of the new grid version.
    pub output: PathBuf,
    pub stages: Vec<Stage>,
    pub cells: usize,
    /// Cells whose new field is non-zero.
    pub matched_cells: usize,
    /// Sum of the new field over every cell.
    pub total: f64,
}

/// One layer of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerJob {
    pub input: PathBuf,
    pub field_name: String,
    pub suffix: String,
}

/// A sequence of layers folded one after another into the same grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldPlan {
    pub interim_path: PathBuf,
    pub fishnet_template: PathBuf,
    pub fishnet_main: PathBuf,
    #[serde(default)]
    pub keep_interim: bool,
    pub jobs: Vec<LayerJob>,
}

/// Interim layers written during one run. Dropping the set deletes them.
struct InterimArtifacts<'s, S: LayerStore> {
    store: &'s S,
    paths: Vec<PathBuf>,
    keep: bool,
}

impl<'s, S: LayerStore> InterimArtifacts<'s, S> {
    fn new(store: &'s S, keep: bool) -> Self {
        Self {
            store,
            paths: Vec::new(),
            keep,
        }
    }

    fn write(&mut self, path: PathBuf, layer: &Layer) -> Result<()> {
        if !self.paths.contains(&path) {
            self.paths.push(path.clone());
        }
        self.store.write(&path, layer)
    }

    /// Delete one artifact now instead of at the end of the run.
    fn discard(&mut self, path: &Path) -> Result<()> {
        self.paths.retain(|p| p != path);
        self.store.delete(path)
    }
}

impl<S: LayerStore> Drop for InterimArtifacts<'_, S> {
    fn drop(&mut self) {
        if self.keep {
            if !self.paths.is_empty() {
                info!("Keeping {} interim layer(s)", self.paths.len());
            }
            return;
        }
        for path in self.paths.drain(..) {
            match self.store.delete(&path) {
                Ok(()) => debug!("Removed interim layer {}", path.display()),
                Err(e) => warn!("Could not remove interim layer {}: {e}", path.display()),
            }
        }
    }
}

/// Acres and miles assume metres. Unknown units are taken on trust.
fn check_units(layers: &[&Layer]) -> Result<()> {
    for layer in layers {
        match layer.linear_unit {
            LinearUnit::Meter => {}
            LinearUnit::Unknown => warn!(
                "Layer {} has no declared linear unit; assuming meters",
                layer.name
            ),
            unit @ (LinearUnit::Foot | LinearUnit::Degree) => {
                return Err(ValidationError::NonMetricUnit {
                    layer: layer.name.clone(),
                    unit: unit.to_string(),
                }
                .into())
            }
        }
    }
    Ok(())
}

/// Runs the pipeline against a geometry engine and a layer store.
pub struct FishnetAggregator<E, S> {
    engine: E,
    store: S,
}

impl<E: GeometryEngine, S: LayerStore> FishnetAggregator<E, S> {
    pub fn new(engine: E, store: S) -> Self {
        Self { engine, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fold one input layer into the main grid.
    pub fn run(&self, config: &RunConfig) -> Result<RunReport> {
        validate_field_name(&config.field_name)?;
        validate_suffix(&config.fishnet_suffix)?;

        let input = self.store.read(&config.input_feature)?;
        let kind = input.describe().kind();
        let metric = Metric::for_kind(kind);
        let template = self.store.read(&config.fishnet_template)?;
        let main = self.store.read(&config.fishnet_main)?;

        if metric.is_some() {
            check_units(&[&input, &template, &main])?;
        }
        if main.has_field(&config.field_name) {
            return Err(ValidationError::FieldExists {
                field: config.field_name.clone(),
                grid: main.name.clone(),
            }
            .into());
        }

        let file_name = base_name(&config.input_feature);
        let final_name = format!("{}_{}", base_name(&config.fishnet_main), config.fishnet_suffix);
        let output = sibling(&config.fishnet_main, &final_name);
        info!(
            "Folding {file_name} ({}) into {} as {}",
            input.describe(),
            main.name,
            config.field_name
        );

        let mut artifacts = InterimArtifacts::new(&self.store, config.keep_interim);
        let mut stages = vec![Stage::Start];
        let ctx = RunContext {
            config,
            file_name: &file_name,
            final_name: &final_name,
        };

        // Points carry no measured metric; their count comes from the join.
        let grid = match metric {
            Some(metric) => self.measured_branch(
                &ctx,
                &input,
                &template,
                &main,
                metric,
                &mut artifacts,
                &mut stages,
            )?,
            None => self.point_branch(&ctx, &input, &main, &mut artifacts, &mut stages)?,
        };

        self.store.write(&output, &grid)?;
        stages.push(Stage::Done);
        info!("Wrote {}", output.display());

        let idx = grid.require_field(&config.field_name)?;
        let values: Vec<f64> = grid
            .features
            .iter()
            .filter_map(|f| f.values[idx].as_f64())
            .collect();

        Ok(RunReport {
            input: file_name,
            kind,
            field_name: config.field_name.clone(),
            output,
            stages,
            cells: grid.len(),
            matched_cells: values.iter().filter(|v| **v != 0.0).count(),
            total: values.iter().sum(),
        })
    }

    /// Run every job of `plan` in order; each job's output becomes the next
    /// job's main grid. Stops at the first failure.
    pub fn fold(&self, plan: &FoldPlan) -> Result<Vec<RunReport>> {
        let mut main = plan.fishnet_main.clone();
        let mut reports = Vec::with_capacity(plan.jobs.len());

        for (n, job) in plan.jobs.iter().enumerate() {
            info!("Batch layer {}/{}: {}", n + 1, plan.jobs.len(), job.input.display());
            let report = self.run(&RunConfig {
                input_feature: job.input.clone(),
                interim_path: plan.interim_path.clone(),
                fishnet_template: plan.fishnet_template.clone(),
                fishnet_main: main,
                field_name: job.field_name.clone(),
                fishnet_suffix: job.suffix.clone(),
                keep_interim: plan.keep_interim,
            })?;
            main = report.output.clone();
            reports.push(report);
        }

        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    fn measured_branch(
        &self,
        ctx: &RunContext<'_>,
        input: &Layer,
        template: &Layer,
        main: &Layer,
        metric: Metric,
        artifacts: &mut InterimArtifacts<'_, S>,
        stages: &mut Vec<Stage>,
    ) -> Result<Layer> {
        let file_name = ctx.file_name;
        let field = ctx.config.field_name.as_str();

        info!("Dissolving {file_name}");
        let dissolved = self
            .engine
            .dissolve(input, &format!("{file_name}_dissolve"))?;
        artifacts.write(ctx.interim(&dissolved.name), &dissolved)?;
        info!("Dissolving of {file_name} complete");
        stages.push(Stage::Dissolved);

        // Intersect against the clean template, never the accumulating grid.
        info!("Intersecting {file_name} with fishnet");
        let intersect_name = format!("fishnet_intersect_{}", dissolved.name);
        let mut pieces = self
            .engine
            .intersect_with_grid(&dissolved, template, &intersect_name)?;
        let pieces_path = ctx.interim(&intersect_name);
        artifacts.write(pieces_path.clone(), &pieces)?;
        info!("Intersecting of {file_name} with fishnet complete");
        stages.push(Stage::Intersected);

        info!("Calculating {} for {file_name}", metric.label());
        calculate_metric(&self.engine, &mut pieces, metric, field)?;
        artifacts.write(pieces_path, &pieces)?;
        info!("Calculating {} for {file_name} complete", metric.label());
        stages.push(Stage::Measured);

        info!("Converting {file_name} to points");
        let points = self
            .engine
            .to_points(&pieces, &format!("{intersect_name}_pt"))?;
        artifacts.write(ctx.interim(&points.name), &points)?;
        info!("Converting {file_name} to points complete");
        stages.push(Stage::Pointified);

        info!("Spatial joining {file_name} to the fishnet");
        let spec = JoinSpec::default()
            .with_field_map(FieldMap::join(field, field).with_fill(Value::Double(0.0)));
        let mut joined = self
            .engine
            .spatial_join(main, &points, &spec, ctx.final_name)?;
        info!("Spatial joining {file_name} to the fishnet complete");
        stages.push(Stage::Joined);

        strip_bookkeeping_fields(&mut joined, &BOOKKEEPING_FIELDS);
        stages.push(Stage::Reconciled);
        Ok(joined)
    }

    fn point_branch(
        &self,
        ctx: &RunContext<'_>,
        input: &Layer,
        main: &Layer,
        artifacts: &mut InterimArtifacts<'_, S>,
        stages: &mut Vec<Stage>,
    ) -> Result<Layer> {
        let file_name = ctx.file_name;

        // Multipoints must be split first or each counts as a single point.
        info!("Exploding {file_name}");
        let exploded = self
            .engine
            .explode_to_single_parts(input, &format!("{file_name}_explode"))?;
        artifacts.write(ctx.interim(&exploded.name), &exploded)?;
        info!("Exploding {file_name} complete");
        stages.push(Stage::Exploded);

        info!("Spatial joining {file_name} to the fishnet");
        let temp_name = format!("{}_temp", ctx.final_name);
        let mut temp = self
            .engine
            .spatial_join(main, &exploded, &JoinSpec::default(), &temp_name)?;
        let temp_path = ctx.interim(&temp_name);
        artifacts.write(temp_path.clone(), &temp)?;
        info!("Spatial joining {file_name} to the fishnet complete");
        stages.push(Stage::Joined);

        strip_bookkeeping_fields(&mut temp, &[TARGET_FID]);

        // The join count is the point density.
        info!("Renaming [{JOIN_COUNT}] to {}", ctx.config.field_name);
        let mut grid = rename_field(
            &temp,
            JOIN_COUNT,
            FieldDef::new(&ctx.config.field_name, FieldKind::Double),
        )?;
        grid.name = ctx.final_name.to_string();
        info!("Renaming [{JOIN_COUNT}] to {} complete", ctx.config.field_name);

        artifacts.discard(&temp_path)?;
        strip_bookkeeping_fields(&mut grid, &BOOKKEEPING_FIELDS);
        stages.push(Stage::Reconciled);
        Ok(grid)
    }
}

/// Names shared by the steps of one run.
struct RunContext<'a> {
    config: &'a RunConfig,
    file_name: &'a str,
    final_name: &'a str,
}

impl RunContext<'_> {
    fn interim(&self, name: &str) -> PathBuf {
        interim(&self.config.interim_path, name)
    }
}
