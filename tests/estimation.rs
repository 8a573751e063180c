mod common;

use approx::assert_abs_diff_eq;
use common::{Toy, init_logging, neg_mae, ramp};
use foldstack::cache::{CacheStore, DiskStore, MemoryStore};
use foldstack::layout::{CaseLayout, StackLayout};
use foldstack::{
    Case, ColumnMap, ColumnSpan, EstimationError, FitScope, IndexSpec, Instance, Layer,
    LayerConfig, LayerEstimator, PredictionMatrix, RayonExecutor, RecordingDiagnostics,
    SequentialExecutor, StageKind, TaskSpec, Topology, WarningKind,
};
use std::sync::Arc;

fn config(raise: bool) -> LayerConfig {
    let mut config = LayerConfig::new("layer-1");
    config.raise_on_exception = raise;
    config
}

/// One preprocessing case, two estimators, 2-fold cross-validation.
fn scaled_pair(n_rows: usize, raise: bool) -> Layer<Toy> {
    StackLayout::new(2)
        .case(
            CaseLayout::new("sc")
                .step("scale", Toy::standardize())
                .estimator("a", Toy::mean(0.0))
                .estimator("b", Toy::mean(1.0)),
        )
        .build(config(raise), n_rows)
        .unwrap()
        .with_scorer(neg_mae)
}

fn keys_with_suffix(store: &dyn CacheStore, suffix: &str) -> Vec<String> {
    let mut keys: Vec<_> = store
        .keys()
        .unwrap()
        .into_iter()
        .filter(|k| k.ends_with(suffix))
        .collect();
    keys.sort();
    keys
}

#[test]
fn dual_fit_caches_every_instance_and_fills_out_of_fold_columns() {
    init_logging();
    let (x, y) = ramp(8);
    let layer = scaled_pair(8, true);
    let p = PredictionMatrix::zeros(8, layer.n_columns()).unwrap();
    let cache = MemoryStore::new();

    let fitted = LayerEstimator::new(&layer)
        .fit(&x, y.view(), &p, &cache, &RayonExecutor::global())
        .unwrap();

    assert_eq!(keys_with_suffix(&cache, "__e").len(), 2 + 2 * 2);
    assert_eq!(keys_with_suffix(&cache, "__t"), ["sc__0__t", "sc__1__t", "sc__t"]);

    // Fold 0 holds out rows 0..4 and trains on 4..8 (mean 5.5); fold 1 the reverse.
    let out = p.to_array();
    assert_eq!(out.column(0).to_vec(), [5.5, 5.5, 5.5, 5.5, 1.5, 1.5, 1.5, 1.5]);
    assert_eq!(out.column(1).to_vec(), [6.5, 6.5, 6.5, 6.5, 2.5, 2.5, 2.5, 2.5]);

    assert_eq!(fitted.estimators.len(), 6);
    assert_eq!(fitted.estimators_in(FitScope::Full).count(), 2);
    let preprocessing = fitted.preprocessing.as_ref().unwrap();
    assert_eq!(preprocessing.len(), 3);
    assert_eq!(fitted.preprocessing_for("sc").unwrap().scope, FitScope::Full);
    assert_eq!(fitted.preprocessing_for("sc__1").unwrap().scope, FitScope::Fold);

    let scores = fitted.scores.as_ref().unwrap();
    assert_eq!(scores.len(), 2);
    assert_abs_diff_eq!(scores["sc__a"].mean, -4.0, epsilon = 1e-12);
    assert_abs_diff_eq!(scores["sc__a"].std, 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(scores["sc__b"].mean, -4.0, epsilon = 1e-12);
}

#[test]
fn combined_topology_matches_dual_output() {
    let (x, y) = ramp(9);
    let layer = scaled_pair(9, true);

    let dual = PredictionMatrix::zeros(9, layer.n_columns()).unwrap();
    let dual_cache = MemoryStore::new();
    LayerEstimator::new(&layer)
        .fit(&x, y.view(), &dual, &dual_cache, &SequentialExecutor)
        .unwrap();

    let combined = PredictionMatrix::zeros(9, layer.n_columns()).unwrap();
    let combined_cache = MemoryStore::new();
    let fitted = LayerEstimator::new(&layer)
        .with_topology(Topology::Combined)
        .fit(&x, y.view(), &combined, &combined_cache, &RayonExecutor::global())
        .unwrap();

    assert_eq!(combined.to_array(), dual.to_array());
    let mut dual_keys = dual_cache.keys().unwrap();
    let mut combined_keys = combined_cache.keys().unwrap();
    dual_keys.sort();
    combined_keys.sort();
    assert_eq!(combined_keys, dual_keys);
    assert_eq!(fitted.scores.unwrap().len(), 2);
}

#[test]
fn tolerant_fit_drops_the_failing_instance() {
    let (x, y) = ramp(6);
    let layer = StackLayout::new(2)
        .case(
            CaseLayout::new("")
                .estimator("good", Toy::mean(0.0))
                .estimator("bad", Toy::fail_fit()),
        )
        .build(config(false), 6)
        .unwrap();
    let p = PredictionMatrix::zeros(6, layer.n_columns()).unwrap();
    let cache = MemoryStore::new();
    let sink = Arc::new(RecordingDiagnostics::new());

    let fitted = LayerEstimator::new(&layer)
        .with_diagnostics(sink.clone())
        .fit(&x, y.view(), &p, &cache, &RayonExecutor::global())
        .unwrap();

    assert!(fitted.estimators.iter().all(|e| !e.instance.starts_with("bad")));
    assert_eq!(fitted.estimators.len(), 3);
    assert!(!cache.exists("__bad__e"));
    let warnings = sink.warnings_of(WarningKind::FitFailed);
    assert_eq!(warnings.len(), 3);
    assert!(warnings[0].message.contains("singular design"));
    assert!(p.to_array().column(1).iter().all(|&v| v == 0.0));
}

#[test]
fn raising_fit_aborts_on_the_failing_instance() {
    let (x, y) = ramp(6);
    let layer = StackLayout::new(2)
        .case(
            CaseLayout::new("")
                .estimator("good", Toy::mean(0.0))
                .estimator("bad", Toy::fail_fit()),
        )
        .build(config(true), 6)
        .unwrap();
    let p = PredictionMatrix::zeros(6, layer.n_columns()).unwrap();

    let err = LayerEstimator::new(&layer)
        .fit(&x, y.view(), &p, &MemoryStore::new(), &SequentialExecutor)
        .unwrap_err();
    match err {
        EstimationError::FitFailed {
            stage, instance, ..
        } => {
            assert_eq!(stage, StageKind::Estimate);
            assert_eq!(instance, "bad");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn preprocessing_failure_is_fatal_even_when_tolerant() {
    let (x, y) = ramp(6);
    let layer = StackLayout::new(2)
        .case(
            CaseLayout::new("sc")
                .step("scale", Toy::fail_fit())
                .estimator("a", Toy::mean(0.0)),
        )
        .build(config(false), 6)
        .unwrap();
    let p = PredictionMatrix::zeros(6, layer.n_columns()).unwrap();

    let err = LayerEstimator::new(&layer)
        .fit(&x, y.view(), &p, &MemoryStore::new(), &RayonExecutor::global())
        .unwrap_err();
    assert!(matches!(
        err,
        EstimationError::FitFailed {
            stage: StageKind::Preprocess,
            ..
        }
    ));
    assert!(err.to_string().starts_with("[layer-1 | sc"));
}

#[test]
fn predict_writes_only_assigned_columns() {
    let (x, y) = ramp(8);
    let layer = scaled_pair(8, true);
    let cache = MemoryStore::new();
    let engine = LayerEstimator::new(&layer);
    let oof = PredictionMatrix::zeros(8, layer.n_columns()).unwrap();
    let fitted = engine
        .fit(&x, y.view(), &oof, &cache, &RayonExecutor::global())
        .unwrap();

    let p = PredictionMatrix::zeros(8, layer.n_columns() + 1).unwrap();
    engine
        .predict(&fitted, &x, &p, &RayonExecutor::global())
        .unwrap();
    let out = p.to_array();
    for ((case, instance), span) in layer.columns.iter() {
        if case != "sc" {
            continue;
        }
        let expected = if instance == "a" { 3.5 } else { 4.5 };
        assert!(out.column(span.offset).iter().all(|&v| v == expected));
    }
    assert!(out.column(2).iter().all(|&v| v == 0.0));
}

#[test]
fn transform_reproduces_the_out_of_fold_predictions() {
    let (x, y) = ramp(10);
    let layer = scaled_pair(10, true);
    let engine = LayerEstimator::new(&layer).with_topology(Topology::Combined);
    let oof = PredictionMatrix::zeros(10, layer.n_columns()).unwrap();
    let fitted = engine
        .fit(&x, y.view(), &oof, &MemoryStore::new(), &SequentialExecutor)
        .unwrap();

    let p = PredictionMatrix::zeros(10, layer.n_columns()).unwrap();
    engine
        .transform(&fitted, &x, &p, &RayonExecutor::global())
        .unwrap();
    assert_eq!(p.to_array(), oof.to_array());
}

#[test]
fn failed_predictions_are_zeroed_or_raised() {
    let (x, y) = ramp(6);
    let build = |raise| {
        StackLayout::new(2)
            .case(
                CaseLayout::new("")
                    .estimator("ok", Toy::mean(0.0))
                    .estimator("flaky", Toy::fail_predict()),
            )
            .build(config(raise), 6)
            .unwrap()
    };

    let tolerant = build(false);
    let sink = Arc::new(RecordingDiagnostics::new());
    let engine = LayerEstimator::new(&tolerant).with_diagnostics(sink.clone());
    let p = PredictionMatrix::zeros(6, tolerant.n_columns()).unwrap();
    p.fill(None, ColumnSpan::new(0, 2), 9.0).unwrap();
    let fitted = engine
        .fit(&x, y.view(), &p, &MemoryStore::new(), &RayonExecutor::global())
        .unwrap();
    assert_eq!(fitted.estimators.len(), 6);
    assert!(p.to_array().column(1).iter().all(|&v| v == 0.0));
    assert_eq!(sink.warnings_of(WarningKind::PredictFailed).len(), 2);

    engine
        .predict(&fitted, &x, &p, &RayonExecutor::global())
        .unwrap();
    assert!(p.to_array().column(0).iter().all(|&v| v == 2.5));
    assert_eq!(sink.warnings_of(WarningKind::PredictFailed).len(), 3);

    let strict = build(true);
    let err = LayerEstimator::new(&strict)
        .fit(
            &x,
            y.view(),
            &PredictionMatrix::zeros(6, 2).unwrap(),
            &MemoryStore::new(),
            &SequentialExecutor,
        )
        .unwrap_err();
    assert!(matches!(err, EstimationError::PredictFailed { .. }));
}

#[test]
fn probabilities_fill_a_contiguous_span() {
    let (x, _) = ramp(6);
    let labels = ndarray::array![0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
    let mut config = config(true);
    config.proba = true;
    let layer = StackLayout::new(2)
        .case(CaseLayout::new("").estimator_with_width("clf", Toy::proportions(2), 2))
        .build(config, 6)
        .unwrap();
    let engine = LayerEstimator::new(&layer);
    let oof = PredictionMatrix::zeros(6, 2).unwrap();
    let fitted = engine
        .fit(&x, labels.view(), &oof, &MemoryStore::new(), &SequentialExecutor)
        .unwrap();

    // Fold 0 trains on rows 3..6 (labels 0, 1, 1).
    let out = oof.to_array();
    assert_abs_diff_eq!(out[[0, 0]], 1.0 / 3.0, epsilon = 1e-12);
    assert_abs_diff_eq!(out[[0, 1]], 2.0 / 3.0, epsilon = 1e-12);

    let p = PredictionMatrix::zeros(6, 2).unwrap();
    engine.predict(&fitted, &x, &p, &SequentialExecutor).unwrap();
    for row in p.to_array().rows() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
    }
}

#[test]
fn longer_targets_are_right_aligned() {
    let (x, _) = ramp(6);
    let y = ndarray::Array1::from_iter((0..8).map(|i| i as f64));
    let layer = StackLayout::new(2)
        .case(CaseLayout::new("").estimator("m", Toy::mean(0.0)))
        .build(config(true), 6)
        .unwrap();
    let p = PredictionMatrix::zeros(6, 1).unwrap();
    LayerEstimator::new(&layer)
        .fit(&x, y.view(), &p, &MemoryStore::new(), &SequentialExecutor)
        .unwrap();
    // Targets 2..8 remain; fold 0 trains on targets 5, 6, 7.
    assert_eq!(p.to_array().column(0).to_vec(), [6.0, 6.0, 6.0, 3.0, 3.0, 3.0]);
}

#[test]
fn held_out_rows_are_rebased_into_a_shorter_matrix() {
    let (x, y) = ramp(8);
    let tasks = TaskSpec {
        estimators: vec![Case {
            name: "recent".to_string(),
            train: Some(IndexSpec::range(0, 4)),
            test: Some(IndexSpec::range(4, 8)),
            instances: vec![Instance::new("m", Toy::mean(0.0))],
        }],
        transformers: None,
    };
    let mut columns = ColumnMap::new();
    columns.insert("recent", "m", ColumnSpan::single(0)).unwrap();
    let layer = Layer::new(config(true), tasks, columns);

    let p = PredictionMatrix::zeros(4, 1).unwrap();
    LayerEstimator::new(&layer)
        .fit(&x, y.view(), &p, &MemoryStore::new(), &SequentialExecutor)
        .unwrap();
    assert_eq!(p.to_array().column(0).to_vec(), [1.5, 1.5, 1.5, 1.5]);
}

fn chainless_layer(raise: bool) -> Layer<Toy> {
    let tasks = TaskSpec {
        estimators: vec![Case {
            name: "sc".to_string(),
            train: None,
            test: None,
            instances: vec![Instance::new("m", Toy::mean(0.0))],
        }],
        transformers: Some(Vec::new()),
    };
    let mut columns = ColumnMap::new();
    columns.insert("sc", "m", ColumnSpan::single(0)).unwrap();
    let mut config = config(raise);
    config.n_pred = 1;
    config.ival = 0.005;
    config.lim = 0.03;
    Layer::new(config, tasks, columns)
}

#[test]
fn missing_transformer_artifact_times_out() {
    let (x, y) = ramp(4);
    let p = PredictionMatrix::zeros(4, 1).unwrap();

    let strict = chainless_layer(true);
    let err = LayerEstimator::new(&strict)
        .fit(&x, y.view(), &p, &MemoryStore::new(), &SequentialExecutor)
        .unwrap_err();
    assert!(matches!(err, EstimationError::ParallelProcessing { .. }));

    let tolerant = chainless_layer(false);
    let sink = Arc::new(RecordingDiagnostics::new());
    let err = LayerEstimator::new(&tolerant)
        .with_diagnostics(sink.clone())
        .fit(&x, y.view(), &p, &MemoryStore::new(), &SequentialExecutor)
        .unwrap_err();
    assert!(matches!(err, EstimationError::ParallelProcessing { .. }));
    assert_eq!(sink.warnings_of(WarningKind::ParallelProcessing).len(), 1);
}

#[test]
fn disk_cache_is_reassembled_by_a_fresh_estimator() {
    let dir = tempfile::tempdir().unwrap();
    let (x, y) = ramp(8);
    let layer = scaled_pair(8, true);
    let oof = PredictionMatrix::create_mapped(&dir.path().join("oof.bin"), 8, layer.n_columns())
        .unwrap();
    {
        let cache = DiskStore::new(dir.path().join("cache")).unwrap();
        LayerEstimator::new(&layer)
            .fit(&x, y.view(), &oof, &cache, &RayonExecutor::from_n_jobs(2).unwrap())
            .unwrap();
        oof.flush().unwrap();
    }

    let cache = DiskStore::new(dir.path().join("cache")).unwrap();
    let engine = LayerEstimator::new(&layer);
    let fitted = engine.assemble(&cache).unwrap();
    assert_eq!(fitted.estimators.len(), 6);
    assert_eq!(fitted.scores.as_ref().unwrap().len(), 2);

    let p = PredictionMatrix::create_mapped(&dir.path().join("p.bin"), 8, layer.n_columns())
        .unwrap();
    engine
        .transform(&fitted, &x, &p, &RayonExecutor::global())
        .unwrap();
    assert_eq!(p.to_array(), oof.to_array());
}

#[test]
fn missing_preprocessing_chain_blocks_prediction() {
    let (x, y) = ramp(8);
    let layer = scaled_pair(8, true);
    let cache = MemoryStore::new();
    let engine = LayerEstimator::new(&layer);
    let oof = PredictionMatrix::zeros(8, 2).unwrap();
    engine
        .fit(&x, y.view(), &oof, &cache, &SequentialExecutor)
        .unwrap();

    assert!(cache.remove("sc__t"));
    let fitted = engine.assemble(&cache).unwrap();
    let p = PredictionMatrix::zeros(8, 2).unwrap();
    let err = engine
        .predict(&fitted, &x, &p, &SequentialExecutor)
        .unwrap_err();
    assert!(matches!(
        err,
        EstimationError::MissingPreprocessing { ref case, .. } if case == "sc"
    ));
}

#[test]
fn invalid_settings_edited_in_code_are_errors() {
    let (x, y) = ramp(4);
    let p = PredictionMatrix::zeros(4, 1).unwrap();
    for (ival, lim) in [(0.005, -1.0), (0.0, 0.03), (f64::NAN, 0.03), (0.005, f64::INFINITY)] {
        let mut layer = chainless_layer(false);
        layer.config.ival = ival;
        layer.config.lim = lim;
        let err = LayerEstimator::new(&layer)
            .fit(&x, y.view(), &p, &MemoryStore::new(), &RayonExecutor::global())
            .unwrap_err();
        assert!(
            matches!(err, EstimationError::Config { .. }),
            "ival={ival} lim={lim}: {err}"
        );
        assert!(err.to_string().starts_with("[layer-1] "));
    }

    let (x, y) = ramp(8);
    let layer = scaled_pair(8, true);
    let oof = PredictionMatrix::zeros(8, layer.n_columns()).unwrap();
    let fitted = LayerEstimator::new(&layer)
        .fit(&x, y.view(), &oof, &MemoryStore::new(), &SequentialExecutor)
        .unwrap();
    let mut edited = scaled_pair(8, true);
    edited.config.lim = -1.0;
    let err = LayerEstimator::new(&edited)
        .predict(&fitted, &x, &oof, &SequentialExecutor)
        .unwrap_err();
    assert!(matches!(err, EstimationError::Config { .. }));
}

#[test]
fn dropped_fold_leaves_its_estimator_unscored() {
    let (x, y) = ramp(6);
    let case = |name: &str, train, test, instances: Vec<Instance<Toy>>| Case {
        name: name.to_string(),
        train,
        test,
        instances,
    };
    let tasks = TaskSpec {
        estimators: vec![
            case(
                "",
                None,
                None,
                vec![
                    Instance::new("m", Toy::mean(0.0)),
                    Instance::new("k", Toy::mean(1.0)),
                ],
            ),
            case(
                "0",
                Some(IndexSpec::range(3, 6)),
                Some(IndexSpec::range(0, 3)),
                vec![
                    Instance::new("m__0", Toy::mean(0.0)),
                    Instance::new("k__0", Toy::mean(1.0)),
                ],
            ),
            case(
                "1",
                Some(IndexSpec::range(0, 3)),
                Some(IndexSpec::range(3, 6)),
                vec![
                    Instance::new("m__1", Toy::fail_fit()),
                    Instance::new("k__1", Toy::mean(1.0)),
                ],
            ),
        ],
        transformers: None,
    };
    let mut columns = ColumnMap::new();
    for (case, instance, col) in [
        ("", "m", 0),
        ("", "k", 1),
        ("0", "m__0", 0),
        ("0", "k__0", 1),
        ("1", "m__1", 0),
        ("1", "k__1", 1),
    ] {
        columns.insert(case, instance, ColumnSpan::single(col)).unwrap();
    }
    let mut config = config(false);
    config.n_pred = 1;
    let layer = Layer::new(config, tasks, columns).with_scorer(neg_mae);

    let sink = Arc::new(RecordingDiagnostics::new());
    let fitted = LayerEstimator::new(&layer)
        .with_diagnostics(sink.clone())
        .fit(
            &x,
            y.view(),
            &PredictionMatrix::zeros(6, 2).unwrap(),
            &MemoryStore::new(),
            &SequentialExecutor,
        )
        .unwrap();

    assert_eq!(fitted.estimators.len(), 5);
    let scores = fitted.scores.as_ref().unwrap();
    assert_eq!(scores.keys().collect::<Vec<_>>(), ["k"]);
    let warnings = sink.warnings_of(WarningKind::ParallelProcessing);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].message.contains("'m'"));
}
