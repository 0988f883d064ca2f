mod common;

use std::fs;
use std::path::{Path, PathBuf};

use ferrite_sep::checkpoint;
use ferrite_sep::train::{Mode, Solver};
use ferrite_sep::{Config, RunContext};

use common::{baseline_config, logged_tags, only_experiment, write_corpus, Corpus, MODEL};

/// Trains a one-epoch baseline under `{root}/pre` and returns its latest
/// checkpoint.
fn pretrained(root: &Path, corpus: &Corpus) -> PathBuf {
    let pre = root.join("pre");
    fs::create_dir_all(&pre).unwrap();
    Solver::build(Mode::Baseline, false, baseline_config(&pre, corpus, 1, ""), RunContext::seeded(11))
        .unwrap()
        .exec(None)
        .unwrap();
    only_experiment(&pre, "ckpt").join("latest.json")
}

fn transnorm_config(root: &Path, extra_solver: &str) -> Config {
    let yaml = format!(
        "solver:\n  exp_name: tn\n  save_dir: {save}\n  log_dir: {log}\n  epochs: 2\n  \
         batch_size: 2\n  grad_clip: 5.0\n  max_save_num: 2\n{extra_solver}\
         model:\n{MODEL}  norm_type: TN\n\
         optim:\n  type: Adam\n  lr: 0.001\n  weight_decay: 0.0\n\
         data:\n  dset: wsj0\n  uns_dset: vctk\n  wsj_root: {wsj}\n  vctk_root: {vctk}\n  list_dir: {lists}\n  segment: 0.05\n",
        save = root.join("ckpt").display(),
        log = root.join("logs").display(),
        wsj = root.join("audio").join("wsj0").display(),
        vctk = root.join("audio").join("vctk").display(),
        lists = root.join("lists").display(),
    );
    Config::from_yaml_str(&yaml).unwrap()
}

fn row(record: &checkpoint::CheckpointRecord, key: &str) -> Vec<f64> {
    record.state_dict[key].data[0].clone()
}

#[test]
fn cmvn_trains_on_frozen_codec_with_fixed_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = write_corpus(dir.path(), "wsj0", 4);
    let pre_path = pretrained(dir.path(), &corpus);
    let pre = checkpoint::load(&pre_path).unwrap();
    assert!(!pre.state_dict.contains_key("norm.mean"));

    let extra = format!("  pretrained: {}\n", pre_path.display());
    let config = baseline_config(dir.path(), &corpus, 2, &extra);
    Solver::build(Mode::Cmvn, false, config, RunContext::seeded(4))
        .unwrap()
        .exec(None)
        .unwrap();

    let save_dir = only_experiment(dir.path(), "ckpt");
    for name in ["0.json", "1.json", "latest.json"] {
        assert!(save_dir.join(name).is_file(), "missing {name}");
    }
    let first = checkpoint::load(&save_dir.join("0.json")).unwrap();
    let latest = checkpoint::load(&save_dir.join("latest.json")).unwrap();
    assert_eq!(latest.epoch, Some(1));

    // codec untouched by two epochs of training
    for key in ["encoder.weight", "decoder.weight"] {
        assert_eq!(latest.state_dict[key], pre.state_dict[key], "{key} moved");
    }
    assert_ne!(latest.state_dict["mask.1.weight"], pre.state_dict["mask.1.weight"]);

    // statistics computed once before training, then held
    let mean = row(&latest, "norm.mean");
    let var = row(&latest, "norm.var");
    assert!(mean.iter().any(|m| m.abs() > 1e-12));
    assert!(var.iter().all(|v| *v > 0.0));
    assert!(var.iter().any(|v| (v - 1.0).abs() > 1e-9));
    assert_eq!(row(&first, "norm.mean"), mean);
    assert_eq!(row(&first, "norm.var"), var);

    // the snapshot describes the saved model
    let snapshot = Config::load(&save_dir.join("config.yaml"), None).unwrap();
    assert_eq!(snapshot.req::<String>("model.norm_type").unwrap(), "cmvn");

    let tags = logged_tags(&only_experiment(dir.path(), "logs"));
    assert!(tags.iter().any(|t| t == "valid/wsj0_epoch_sisnri"));
    assert!(!tags.iter().any(|t| t.starts_with("test/")));
}

#[test]
fn transnorm_moves_target_statistics_and_validates_both_corpora() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path(), "wsj0", 5);
    write_corpus(dir.path(), "vctk", 5);

    Solver::build(Mode::Transnorm, false, transnorm_config(dir.path(), ""), RunContext::seeded(9))
        .unwrap()
        .exec(None)
        .unwrap();

    let save_dir = only_experiment(dir.path(), "ckpt");
    for name in ["0.json", "1.json", "latest.json"] {
        assert!(save_dir.join(name).is_file(), "missing {name}");
    }
    let latest = checkpoint::load(&save_dir.join("latest.json")).unwrap();
    let source = row(&latest, "norm.mean");
    let target = row(&latest, "norm.target_mean");
    assert!(target.iter().any(|m| m.abs() > 1e-12), "target statistics never moved");
    assert_ne!(source, target);
    assert!(row(&latest, "norm.target_var").iter().all(|v| *v > 0.0));

    let tags = logged_tags(&only_experiment(dir.path(), "logs"));
    for tag in ["valid/wsj0_epoch_sisnri", "valid/vctk_epoch_sisnri", "valid/vctk_epoch_loss"] {
        assert_eq!(tags.iter().filter(|t| *t == tag).count(), 2, "{tag} not logged every epoch");
    }
}

#[test]
fn cmvn_tests_the_final_model_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = write_corpus(dir.path(), "wsj0", 4);
    let pre_path = pretrained(dir.path(), &corpus);

    let extra = format!("  pretrained: {}\n  test_after_finished: true\n", pre_path.display());
    let config = baseline_config(dir.path(), &corpus, 1, &extra);
    Solver::build(Mode::Cmvn, false, config, RunContext::seeded(4))
        .unwrap()
        .exec(None)
        .unwrap();

    let save_dir = only_experiment(dir.path(), "ckpt");
    let log_dir = only_experiment(dir.path(), "logs");
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(log_dir.join("result.json")).unwrap()).unwrap();
    assert_eq!(written["wsj0"]["tt"]["examples"], 4);
    assert!(written["wsj0"]["cv"]["total_SISNRi"].is_number());
    assert_eq!(written["tr_config"]["model"]["norm_type"], "cmvn");
    assert_eq!(written["tt_config"]["data"]["dsets"], serde_json::json!(["wsj0"]));
    assert_eq!(written["tt_config"]["solver"]["compute_sdr"], false);
    assert_eq!(
        written["tt_config"]["solver"]["checkpoint"].as_str().unwrap(),
        save_dir.join("latest.json").to_str().unwrap()
    );

    let tags = logged_tags(&log_dir);
    assert!(tags.iter().any(|t| t == "test/wsj0_tt_sisnri"));
    assert!(tags.iter().any(|t| t == "test/wsj0_cv_sisnri"));
}

#[test]
fn transnorm_tests_source_and_target_corpora() {
    let dir = tempfile::tempdir().unwrap();
    write_corpus(dir.path(), "wsj0", 5);
    write_corpus(dir.path(), "vctk", 5);

    let config = transnorm_config(dir.path(), "  test_after_finished: true\n");
    Solver::build(Mode::Transnorm, false, config, RunContext::seeded(2))
        .unwrap()
        .exec(None)
        .unwrap();

    let log_dir = only_experiment(dir.path(), "logs");
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(log_dir.join("result.json")).unwrap()).unwrap();
    for name in ["wsj0", "vctk"] {
        for split in ["cv", "tt"] {
            assert_eq!(written[name][split]["examples"], 5, "{name}/{split}");
        }
    }
    let tags = logged_tags(&log_dir);
    assert!(tags.iter().any(|t| t == "test/vctk_tt_sisnri"));
}
