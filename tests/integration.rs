//! Integration tests for elk-rs
//!
//! Every test builds a small hidden-state cache and reporter directory in a
//! temporary folder, so nothing here needs a GPU or a model download.

use candle_core::{DType, Device, Tensor};
use elk_rs::reporter::reporter_path;
use elk_rs::supervised::probe_path;
use elk_rs::{
    CachedHiddenStates, Classifier, DataConfig, Dataset, Elicit, ElicitConfig, ElkError, Eval,
    EvalConfig, Normalization, RunConfig, SingleReporter, Split, SupervisedMode, SupervisedOptions,
};
use std::collections::BTreeMap;
use std::path::Path;

const HIDDEN: usize = 4;
const VARIANTS: usize = 2;
const INLP_ITERATIONS: usize = 2;

/// `n` examples with labels alternating 0/1. The true statement has a
/// positive first feature, so a reporter with weight e0 is always right.
fn split(n: usize, layers: &[usize], with_lm_preds: bool) -> Split {
    let device = Device::Cpu;
    let mut flat = Vec::with_capacity(n * VARIANTS * 2 * HIDDEN);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let label = (i % 2) as u32;
        labels.push(label);
        for variant in 0..VARIANTS {
            for statement in 0..2u32 {
                let sign = if statement == label { 1.0f32 } else { -1.0 };
                flat.push(sign * (1.0 + variant as f32 * 0.25));
                flat.push((i + variant) as f32 * 0.1);
                flat.push(0.5);
                flat.push(-0.5);
            }
        }
    }
    let h = Tensor::from_vec(flat, (n, VARIANTS, 2, HIDDEN), &device)
        .unwrap()
        .to_dtype(DType::F16)
        .unwrap();
    let hiddens = layers.iter().map(|&l| (l, h.clone())).collect();
    let labels = Tensor::from_vec(labels, (n,), &device).unwrap();

    let lm_preds = with_lm_preds.then(|| {
        Tensor::ones((n, VARIANTS, 2), DType::F32, &device).unwrap()
    });
    Split::new(labels, hiddens, lm_preds).unwrap()
}

/// Write `names` into `<cache>/<name>/{train,validation}.safetensors`
fn write_cache(cache: &Path, names: &[&str], layers: &[usize], with_lm_preds: bool) {
    for name in names {
        let ds = Dataset::new(BTreeMap::from([
            ("train".to_string(), split(6, layers, with_lm_preds)),
            ("validation".to_string(), split(3, layers, with_lm_preds)),
        ]));
        ds.save(&cache.join(name)).unwrap();
    }
}

fn first_feature_reporter() -> SingleReporter {
    let w = Tensor::from_slice(&[1f32, 0.0, 0.0, 0.0], (HIDDEN,), &Device::Cpu).unwrap();
    SingleReporter::new(w, 0.0).unwrap()
}

fn write_reporters(source: &Path, layers: &[usize]) {
    let dir = source.join("reporters");
    std::fs::create_dir_all(&dir).unwrap();
    for &layer in layers {
        first_feature_reporter().save(&reporter_path(&dir, layer)).unwrap();
    }
}

fn eval_config(cache: &Path, source: &Path, out: &Path, datasets: &[&str], workers: usize) -> EvalConfig {
    EvalConfig {
        run: RunConfig {
            data: DataConfig {
                datasets: datasets.iter().map(|s| s.to_string()).collect(),
                cache_dir: cache.to_path_buf(),
            },
            normalization: Normalization::None,
            num_gpus: 0,
            cpu_workers: workers,
            out_dir: Some(out.to_path_buf()),
            ..Default::default()
        },
        source: source.to_path_buf(),
        ..Default::default()
    }
}

fn csv_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

#[test]
fn test_eval_two_layers_two_datasets() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, source, out) = (tmp.path().join("cache"), tmp.path().join("src"), tmp.path().join("out"));
    write_cache(&cache, &["imdb", "boolq"], &[0, 1], false);
    write_reporters(&source, &[0, 1]);

    let eval = Eval::new(eval_config(&cache, &source, &out, &["imdb", "boolq"], 1), &CachedHiddenStates)
        .unwrap();
    let results = eval.execute().unwrap();
    assert_eq!(results.iter().map(|r| r.layer).collect::<Vec<_>>(), vec![0, 1]);

    let eval_csv = csv_lines(&out.join("eval.csv"));
    assert!(eval_csv[0].starts_with("dataset,layer,prompt_ensembling,acc_estimate"));
    assert_eq!(eval_csv.len(), 1 + 2 * 2 * 3);
    // Sorted by layer, datasets in name order, ensembling none/partial/full
    assert!(eval_csv[1].starts_with("boolq,0,none,1,"));
    assert!(eval_csv[3].starts_with("boolq,0,full,1,"));
    assert!(eval_csv[7].starts_with("boolq,1,none,"));

    assert_eq!(csv_lines(&out.join("lm_eval.csv")).len(), 1);
    assert_eq!(csv_lines(&out.join("lr_eval.csv")).len(), 1);
    assert!(out.join("cfg.json").exists());
    assert!(out.join("metadata.json").exists());
}

#[test]
fn test_eval_lm_preds_and_legacy_probe() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, source, out) = (tmp.path().join("cache"), tmp.path().join("src"), tmp.path().join("out"));
    write_cache(&cache, &["imdb"], &[0, 1], true);
    write_reporters(&source, &[0, 1]);

    // A single probe object, as older runs stored it, for layer 0 only
    let lr_dir = source.join("lr_models");
    std::fs::create_dir_all(&lr_dir).unwrap();
    let probe = Classifier::new(vec![1.0, 0.0, 0.0, 0.0], 0.0);
    std::fs::write(probe_path(&lr_dir, 0), serde_json::to_string(&probe).unwrap()).unwrap();

    let eval = Eval::new(eval_config(&cache, &source, &out, &["imdb"], 1), &CachedHiddenStates)
        .unwrap();
    let results = eval.execute().unwrap();

    assert_eq!(results[0].rows("lm_eval").len(), 3);
    assert_eq!(results[0].rows("lr_eval").len(), 3);
    assert!(results[1].rows("lr_eval").is_empty());
    assert!(results[0].rows("lr_eval").iter().all(|r| r.inlp_iter == Some(0)));

    let lr_csv = csv_lines(&out.join("lr_eval.csv"));
    assert!(lr_csv[0].starts_with("dataset,layer,prompt_ensembling,inlp_iter,"));
    assert_eq!(lr_csv.len(), 1 + 3);
    assert_eq!(csv_lines(&out.join("lm_eval.csv")).len(), 1 + 2 * 3);
}

#[test]
fn test_eval_skip_supervised() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, source, out) = (tmp.path().join("cache"), tmp.path().join("src"), tmp.path().join("out"));
    write_cache(&cache, &["imdb"], &[0], false);
    write_reporters(&source, &[0]);
    let lr_dir = source.join("lr_models");
    std::fs::create_dir_all(&lr_dir).unwrap();
    let probes = vec![Classifier::new(vec![1.0, 0.0, 0.0, 0.0], 0.0)];
    std::fs::write(probe_path(&lr_dir, 0), serde_json::to_string(&probes).unwrap()).unwrap();

    let mut cfg = eval_config(&cache, &source, &out, &["imdb"], 1);
    cfg.skip_supervised = true;
    let results = Eval::new(cfg, &CachedHiddenStates).unwrap().execute().unwrap();
    assert!(results[0].rows("lr_eval").is_empty());
}

#[test]
fn test_eval_with_largest_seed() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, source, out) = (tmp.path().join("cache"), tmp.path().join("src"), tmp.path().join("out"));
    write_cache(&cache, &["imdb"], &[0, 1], false);
    write_reporters(&source, &[0, 1]);

    let mut cfg = eval_config(&cache, &source, &out, &["imdb"], 1);
    cfg.run.seed = u64::MAX;
    let results = Eval::new(cfg, &CachedHiddenStates).unwrap().execute().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(csv_lines(&out.join("eval.csv")).len(), 1 + 2 * 3);
}

#[test]
fn test_empty_reporter_dir_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, source, out) = (tmp.path().join("cache"), tmp.path().join("src"), tmp.path().join("out"));
    write_cache(&cache, &["imdb", "boolq"], &[0, 1], false);
    std::fs::create_dir_all(source.join("reporters")).unwrap();

    let eval = Eval::new(eval_config(&cache, &source, &out, &["imdb", "boolq"], 1), &CachedHiddenStates)
        .unwrap();
    let err = eval.execute().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ElkError>(),
        Some(ElkError::ReporterNotFound { layer: 0, .. })
    ));
    assert_eq!(csv_lines(&out.join("eval.csv")).len(), 1);
}

#[test]
fn test_parallel_matches_sequential() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, source) = (tmp.path().join("cache"), tmp.path().join("src"));
    let layers = [0, 3, 6, 9];
    write_cache(&cache, &["imdb", "boolq"], &layers, true);
    write_reporters(&source, &layers);

    let run = |out: &Path, workers: usize| {
        Eval::new(eval_config(&cache, &source, out, &["imdb", "boolq"], workers), &CachedHiddenStates)
            .unwrap()
            .execute()
            .unwrap();
        (csv_lines(&out.join("eval.csv")), csv_lines(&out.join("lm_eval.csv")))
    };

    let sequential = run(&tmp.path().join("seq"), 1);
    let parallel = run(&tmp.path().join("par"), 3);
    assert_eq!(sequential.0.len(), 1 + 4 * 2 * 3);
    assert_eq!(sequential, parallel);
}

#[test]
fn test_ensemble_reporter_per_prompt() {
    let tmp = tempfile::tempdir().unwrap();
    let (cache, source, out) = (tmp.path().join("cache"), tmp.path().join("src"), tmp.path().join("out"));
    write_cache(&cache, &["imdb"], &[0], false);
    for member in ["prompt_0", "prompt_1"] {
        let dir = source.join("reporters").join(member);
        std::fs::create_dir_all(&dir).unwrap();
        first_feature_reporter().save(&reporter_path(&dir, 0)).unwrap();
    }

    let mut cfg = eval_config(&cache, &source, &out, &["imdb"], 1);
    cfg.probe_per_prompt = true;
    let results = Eval::new(cfg, &CachedHiddenStates).unwrap().execute().unwrap();

    let output = &results[0].outputs[0];
    assert_eq!(output.credences.dims(), &[3, VARIANTS, 2]);
    assert!(results[0]
        .rows("eval")
        .iter()
        .all(|r| (r.eval.accuracy.estimate - 1.0).abs() < 1e-9));
}

#[test]
fn test_elicit_output_is_eval_source() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = tmp.path().join("cache");
    let trained = tmp.path().join("trained");
    write_cache(&cache, &["imdb"], &[0, 1], false);

    let cfg = ElicitConfig {
        run: RunConfig {
            data: DataConfig {
                datasets: vec!["imdb".to_string()],
                cache_dir: cache.clone(),
            },
            num_gpus: 0,
            out_dir: Some(trained.clone()),
            ..Default::default()
        },
        supervised: Some(SupervisedMode::Inlp),
        supervised_options: SupervisedOptions {
            inlp_iterations: INLP_ITERATIONS,
            ..Default::default()
        },
    };
    let elicit = Elicit::new(cfg, &CachedHiddenStates).unwrap();
    let trained_results = elicit.execute().unwrap();
    let iterations = INLP_ITERATIONS;
    assert_eq!(trained_results[0].rows("lr_eval").len(), iterations * 3);

    write_reporters(&trained, &[0, 1]);
    let out = tmp.path().join("transfer");
    let results = Eval::new(eval_config(&cache, &trained, &out, &["imdb"], 1), &CachedHiddenStates)
        .unwrap()
        .execute()
        .unwrap();
    assert_eq!(results[1].rows("lr_eval").len(), iterations * 3);
    let max_iter = results[1]
        .rows("lr_eval")
        .iter()
        .filter_map(|r| r.inlp_iter)
        .max();
    assert_eq!(max_iter, Some(iterations - 1));
}
