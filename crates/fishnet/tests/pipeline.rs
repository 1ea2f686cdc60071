use fishnet::engine::{JOIN_COUNT, TARGET_FID};
use fishnet::grid::{build_fishnet, FishnetSpec, CELL_ID};
use fishnet::{
    Feature, FishnetAggregator, FishnetError, GeoJsonStore, GeometryEngine, GeometryKind,
    JoinSpec, Layer, LayerStore, LinearUnit, MeasureKind, PlanarEngine, RunConfig, ShapeType,
    ValidationError, Value,
};
use geo_types::{line_string, polygon, MultiPoint, Point};
use std::cell::Cell;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const EPS: f64 = 1e-6;

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < EPS
}

struct Workspace {
    dir: TempDir,
    store: GeoJsonStore,
}

impl Workspace {
    /// 2x2 grid of 200 m cells from the origin, as both template and main grid.
    fn new() -> Self {
        let ws = Self {
            dir: tempfile::tempdir().unwrap(),
            store: GeoJsonStore::new(),
        };
        let grid = build_fishnet(
            "greenprint",
            &FishnetSpec {
                origin: (0.0, 0.0),
                cell_width: 200.0,
                cell_height: 200.0,
                rows: 2,
                cols: 2,
                linear_unit: LinearUnit::Meter,
            },
        )
        .unwrap();
        ws.store.write(&ws.path("template"), &grid).unwrap();
        ws.store.write(&ws.path("greenprint"), &grid).unwrap();
        ws
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{name}.geojson"))
    }

    fn add_input(&self, layer: &Layer) -> PathBuf {
        let path = self.dir.path().join("inputs").join(format!("{}.geojson", layer.name));
        self.store.write(&path, layer).unwrap();
        path
    }

    fn config(&self, input: PathBuf, field: &str, suffix: &str) -> RunConfig {
        RunConfig {
            input_feature: input,
            interim_path: self.dir.path().join("interim"),
            fishnet_template: self.path("template"),
            fishnet_main: self.path("greenprint"),
            field_name: field.to_string(),
            fishnet_suffix: suffix.to_string(),
            keep_interim: false,
        }
    }

    fn interim_files(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.dir.path().join("interim")) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn field_values(layer: &Layer, field: &str) -> Vec<Value> {
    let idx = layer.field_index(field).unwrap();
    layer.features.iter().map(|f| f.values[idx].clone()).collect()
}

/// Delegates to the planar engine and counts every call.
#[derive(Default)]
struct CountingEngine {
    inner: PlanarEngine,
    calls: Cell<usize>,
}

impl CountingEngine {
    fn bump(&self) {
        self.calls.set(self.calls.get() + 1);
    }
}

impl GeometryEngine for CountingEngine {
    fn dissolve(&self, layer: &Layer, out_name: &str) -> fishnet::Result<Layer> {
        self.bump();
        self.inner.dissolve(layer, out_name)
    }

    fn intersect_with_grid(
        &self,
        layer: &Layer,
        grid: &Layer,
        out_name: &str,
    ) -> fishnet::Result<Layer> {
        self.bump();
        self.inner.intersect_with_grid(layer, grid, out_name)
    }

    fn to_points(&self, layer: &Layer, out_name: &str) -> fishnet::Result<Layer> {
        self.bump();
        self.inner.to_points(layer, out_name)
    }

    fn explode_to_single_parts(&self, layer: &Layer, out_name: &str) -> fishnet::Result<Layer> {
        self.bump();
        self.inner.explode_to_single_parts(layer, out_name)
    }

    fn measure(&self, feature: &Feature, kind: MeasureKind) -> fishnet::Result<f64> {
        self.bump();
        self.inner.measure(feature, kind)
    }

    fn spatial_join(
        &self,
        target: &Layer,
        source: &Layer,
        spec: &JoinSpec,
        out_name: &str,
    ) -> fishnet::Result<Layer> {
        self.bump();
        self.inner.spatial_join(target, source, spec, out_name)
    }
}

#[test]
fn polygon_covering_four_cells_yields_equal_acreage() {
    let ws = Workspace::new();
    // 100,000 m² square centred on the shared corner: 25,000 m² per cell.
    let half = 25_000f64.sqrt();
    let mut parks = Layer::new("parks", ShapeType::Polygon).with_linear_unit(LinearUnit::Meter);
    parks.push(
        polygon![
            (x: 200.0 - half, y: 200.0 - half),
            (x: 200.0 + half, y: 200.0 - half),
            (x: 200.0 + half, y: 200.0 + half),
            (x: 200.0 - half, y: 200.0 + half),
        ]
        .into(),
        vec![],
    );
    let input = ws.add_input(&parks);

    let report = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&ws.config(input, "parkac", "parks"))
        .unwrap();
    assert_eq!(report.kind, GeometryKind::Polygon);
    assert_eq!(report.output, ws.path("greenprint_parks"));

    let out = ws.store.read(&report.output).unwrap();
    assert_eq!(out.name, "greenprint_parks");
    for value in field_values(&out, "parkac") {
        assert!(approx(value.as_f64().unwrap(), 6.175), "{value}");
    }
    assert!(!out.has_field(JOIN_COUNT));
    assert!(!out.has_field(TARGET_FID));
}

#[test]
fn points_are_counted_per_cell_with_zero_elsewhere() {
    let ws = Workspace::new();
    let mut wells = Layer::new("wells", ShapeType::Point);
    for (x, y) in [(10.0, 10.0), (50.0, 120.0), (300.0, 20.0)] {
        wells.push(Point::new(x, y).into(), vec![]);
    }
    let input = ws.add_input(&wells);

    let report = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&ws.config(input, "wells", "wells"))
        .unwrap();
    let out = ws.store.read(&report.output).unwrap();

    assert_eq!(out.field_names(), vec![CELL_ID, "wells"]);
    assert_eq!(
        field_values(&out, "wells"),
        vec![
            Value::Double(2.0),
            Value::Double(1.0),
            Value::Double(0.0),
            Value::Double(0.0)
        ]
    );
}

#[test]
fn multipoints_are_exploded_before_counting() {
    let ws = Workspace::new();
    let mut sites = Layer::new("sites", ShapeType::Multipoint);
    sites.push(
        MultiPoint::from(vec![
            Point::new(10.0, 10.0),
            Point::new(20.0, 20.0),
            Point::new(210.0, 210.0),
        ])
        .into(),
        vec![],
    );
    // Shared edge between the two lower cells.
    sites.push(MultiPoint::from(vec![Point::new(200.0, 50.0)]).into(), vec![]);
    let input = ws.add_input(&sites);

    let report = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&ws.config(input, "sites", "sites"))
        .unwrap();
    let out = ws.store.read(&report.output).unwrap();

    assert_eq!(
        field_values(&out, "sites"),
        vec![
            Value::Double(3.0),
            Value::Double(0.0),
            Value::Double(0.0),
            Value::Double(1.0)
        ]
    );
    assert!(approx(report.total, 4.0));
}

#[test]
fn line_length_is_reported_in_miles() {
    let ws = Workspace::new();
    let mut trails = Layer::new("trails", ShapeType::Polyline).with_linear_unit(LinearUnit::Meter);
    trails.push(line_string![(x: 0.0, y: 100.0), (x: 400.0, y: 100.0)].into(), vec![]);
    // Exact duplicate of part of the first trail; dissolve must not double it.
    trails.push(line_string![(x: 0.0, y: 100.0), (x: 400.0, y: 100.0)].into(), vec![]);
    let input = ws.add_input(&trails);

    let report = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&ws.config(input, "trailmi", "trails"))
        .unwrap();
    let out = ws.store.read(&report.output).unwrap();
    let miles: Vec<f64> = field_values(&out, "trailmi")
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();

    assert!(approx(miles[0], 200.0 / 1609.344));
    assert!(approx(miles[1], 200.0 / 1609.344));
    assert!(approx(miles[2], 0.0));
    assert!(approx(miles[3], 0.0));
}

#[test]
fn repeated_runs_produce_identical_values() {
    let ws = Workspace::new();
    let mut parks = Layer::new("parks", ShapeType::Polygon).with_linear_unit(LinearUnit::Meter);
    parks.push(
        polygon![(x: 30.0, y: 30.0), (x: 370.0, y: 40.0), (x: 250.0, y: 380.0), (x: 20.0, y: 300.0)]
            .into(),
        vec![],
    );
    let input = ws.add_input(&parks);
    let config = ws.config(input, "parkac", "parks");
    let aggregator = FishnetAggregator::new(PlanarEngine::new(), &ws.store);

    let first = aggregator.run(&config).unwrap();
    let first_values = field_values(&ws.store.read(&first.output).unwrap(), "parkac");
    let second = aggregator.run(&config).unwrap();
    let second_values = field_values(&ws.store.read(&second.output).unwrap(), "parkac");

    assert_eq!(first.output, second.output);
    assert_eq!(first_values, second_values);
}

#[test]
fn cell_identity_is_preserved() {
    let ws = Workspace::new();
    let mut wells = Layer::new("wells", ShapeType::Point);
    wells.push(Point::new(390.0, 390.0).into(), vec![]);
    let input = ws.add_input(&wells);

    let report = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&ws.config(input, "wells", "v2"))
        .unwrap();
    let main = ws.store.read(&ws.path("greenprint")).unwrap();
    let out = ws.store.read(&report.output).unwrap();

    let ids = |l: &Layer| -> Vec<(u64, Value)> {
        l.features
            .iter()
            .zip(field_values(l, CELL_ID))
            .map(|(f, v)| (f.fid, v))
            .collect()
    };
    assert_eq!(ids(&main), ids(&out));
    assert_eq!(
        main.features.iter().map(|f| &f.geometry).collect::<Vec<_>>(),
        out.features.iter().map(|f| &f.geometry).collect::<Vec<_>>()
    );
}

#[test]
fn invalid_names_fail_before_any_engine_call() {
    let ws = Workspace::new();
    let mut wells = Layer::new("wells", ShapeType::Point);
    wells.push(Point::new(1.0, 1.0).into(), vec![]);
    let input = ws.add_input(&wells);

    for (field, suffix) in [("elevenchars", "ok"), ("bad-name", "ok"), ("wells", "v_2")] {
        let engine = CountingEngine::default();
        let aggregator = FishnetAggregator::new(&engine, &ws.store);
        let err = aggregator
            .run(&ws.config(input.clone(), field, suffix))
            .unwrap_err();
        assert!(matches!(err, FishnetError::Validation(_)), "{field}/{suffix}: {err}");
        assert_eq!(engine.calls.get(), 0);
    }
    assert!(ws.interim_files().is_empty());
    assert!(!ws.store.exists(&ws.path("greenprint_ok")));
}

#[test]
fn non_metric_input_is_rejected() {
    let ws = Workspace::new();
    let mut parks = Layer::new("parks", ShapeType::Polygon).with_linear_unit(LinearUnit::Degree);
    parks.push(
        polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0)].into(),
        vec![],
    );
    let input = ws.add_input(&parks);

    let err = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&ws.config(input, "parkac", "parks"))
        .unwrap_err();
    assert!(matches!(
        err,
        FishnetError::Validation(ValidationError::NonMetricUnit { .. })
    ));
}

#[test]
fn unsupported_geometry_type_is_reported() {
    let ws = Workspace::new();
    let input = ws.dir.path().join("inputs").join("patches.geojson");
    fs::create_dir_all(input.parent().unwrap()).unwrap();
    fs::write(
        &input,
        r#"{ "type": "FeatureCollection",
             "fishnet": { "name": "patches", "shapeType": "MultiPatch", "fields": [] },
             "features": [] }"#,
    )
    .unwrap();

    let err = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&ws.config(input, "patches", "patches"))
        .unwrap_err();
    assert!(matches!(err, FishnetError::UnsupportedGeometryType(t) if t == "MultiPatch"));
    assert!(ws.interim_files().is_empty());
}

#[test]
fn plain_geojson_points_are_accepted() {
    let ws = Workspace::new();
    let input = ws.dir.path().join("inputs").join("trees.geojson");
    fs::create_dir_all(input.parent().unwrap()).unwrap();
    fs::write(
        &input,
        r#"{ "type": "FeatureCollection", "features": [
            { "type": "Feature", "properties": { "species": "oak" },
              "geometry": { "type": "Point", "coordinates": [250.0, 250.0] } },
            { "type": "Feature", "properties": { "species": "bay" },
              "geometry": { "type": "Point", "coordinates": [260.0, 260.0] } }
        ] }"#,
    )
    .unwrap();

    let report = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&ws.config(input, "trees", "trees"))
        .unwrap();
    assert_eq!(report.kind, GeometryKind::Point);
    assert_eq!(report.matched_cells, 1);

    let out = ws.store.read(&report.output).unwrap();
    assert_eq!(out.value(3, "trees"), Some(&Value::Double(2.0)));
    assert!(!out.has_field("species"));
}

#[test]
fn interim_layers_follow_naming_convention_when_kept() {
    let ws = Workspace::new();
    let mut parks = Layer::new("parks", ShapeType::Polygon).with_linear_unit(LinearUnit::Meter);
    parks.push(
        polygon![(x: 10.0, y: 10.0), (x: 50.0, y: 10.0), (x: 50.0, y: 50.0)].into(),
        vec![],
    );
    let input = ws.add_input(&parks);
    let mut config = ws.config(input, "parkac", "parks");
    config.keep_interim = true;

    FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&config)
        .unwrap();

    let mut names: Vec<String> = ws
        .interim_files()
        .iter()
        .map(|p| fishnet::store::base_name(p))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "fishnet_intersect_parks_dissolve",
            "fishnet_intersect_parks_dissolve_pt",
            "parks_dissolve",
        ]
    );
}

#[test]
fn point_run_leaves_no_temp_layer() {
    let ws = Workspace::new();
    let mut wells = Layer::new("wells", ShapeType::Point);
    wells.push(Point::new(5.0, 5.0).into(), vec![]);
    let input = ws.add_input(&wells);
    let mut config = ws.config(input, "wells", "wells");
    config.keep_interim = true;

    FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&config)
        .unwrap();
    let names: Vec<String> = ws
        .interim_files()
        .iter()
        .map(|p| fishnet::store::base_name(p))
        .collect();
    assert_eq!(names, vec!["wells_explode"]);
}

#[test]
fn dotted_main_name_keeps_its_version_and_spares_the_template() {
    let ws = Workspace::new();
    let template_before = ws.store.read(&ws.path("template")).unwrap();
    let main = ws.path("greenprint.2018");
    ws.store.write(&main, &template_before).unwrap();
    // A layer that a truncated output name would land on.
    ws.store.write(&ws.path("greenprint"), &template_before).unwrap();

    let mut wells = Layer::new("wells", ShapeType::Point);
    wells.push(Point::new(10.0, 10.0).into(), vec![]);
    let input = ws.add_input(&wells);
    let mut config = ws.config(input, "wells", "wells");
    config.fishnet_main = main;

    let report = FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&config)
        .unwrap();
    assert_eq!(report.output, ws.path("greenprint.2018_wells"));
    assert_eq!(
        ws.store.read(&report.output).unwrap().name,
        "greenprint.2018_wells"
    );
    assert_eq!(ws.store.read(&ws.path("template")).unwrap(), template_before);
    assert_eq!(ws.store.read(&ws.path("greenprint")).unwrap(), template_before);
}

#[test]
fn dotted_input_name_leaves_neighbouring_layers_alone() {
    let ws = Workspace::new();
    let data = ws.dir.path().join("data");

    let mut neighbour = Layer::new("parks", ShapeType::Polygon).with_linear_unit(LinearUnit::Meter);
    neighbour.push(
        polygon![(x: 0.0, y: 0.0), (x: 5.0, y: 0.0), (x: 5.0, y: 5.0)].into(),
        vec![],
    );
    let neighbour_path = data.join("parks.geojson");
    ws.store.write(&neighbour_path, &neighbour).unwrap();

    let mut parks = Layer::new("parks.v2", ShapeType::Polygon).with_linear_unit(LinearUnit::Meter);
    parks.push(
        polygon![(x: 10.0, y: 10.0), (x: 250.0, y: 10.0), (x: 250.0, y: 60.0), (x: 10.0, y: 60.0)]
            .into(),
        vec![],
    );
    let input = data.join("parks.v2.geojson");
    ws.store.write(&input, &parks).unwrap();

    let mut config = ws.config(input, "parkac", "parks");
    config.interim_path = data.clone();
    config.keep_interim = true;
    FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&config)
        .unwrap();

    for name in [
        "parks.v2_dissolve",
        "fishnet_intersect_parks.v2_dissolve",
        "fishnet_intersect_parks.v2_dissolve_pt",
    ] {
        assert!(data.join(format!("{name}.geojson")).is_file(), "{name}");
    }
    assert_eq!(ws.store.read(&neighbour_path).unwrap(), neighbour);

    config.keep_interim = false;
    config.fishnet_suffix = "parks2".into();
    FishnetAggregator::new(PlanarEngine::new(), &ws.store)
        .run(&config)
        .unwrap();
    assert!(!data.join("parks.v2_dissolve.geojson").exists());
    assert_eq!(ws.store.read(&neighbour_path).unwrap(), neighbour);
    assert!(ws.store.exists(&config.input_feature));
}
