mod common;

use ferrite_sep::checkpoint;
use ferrite_sep::network::Module;
use ferrite_sep::train::{Mode, Solver, SupervisedTrainer, SupervisedVariant};
use ferrite_sep::{Config, RunContext};

use common::{baseline_config, logged_tags, only_experiment, write_corpus};

#[test]
fn baseline_trains_validates_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = write_corpus(dir.path(), "wsj0", 4);
    let config = baseline_config(dir.path(), &corpus, 2, "");

    Solver::build(Mode::Baseline, false, config, RunContext::seeded(3))
        .unwrap()
        .exec(None)
        .unwrap();

    let save_dir = only_experiment(dir.path(), "ckpt");
    assert!(save_dir.join("config.yaml").is_file());
    assert!(save_dir.join("latest.json").is_file());
    assert!(save_dir.join("0.json").is_file());
    assert!(save_dir.join("1.json").is_file());

    let latest = checkpoint::load(&save_dir.join("latest.json")).unwrap();
    assert_eq!(latest.epoch, Some(1));
    assert!(latest.forced);
    assert!(latest.optim.is_some());
    assert!(latest.score("valid_sisnri").is_some());

    let tags = logged_tags(&only_experiment(dir.path(), "logs"));
    for tag in ["train/iter_loss", "train/epoch_loss", "valid/wsj0_epoch_loss", "valid/wsj0_epoch_sisnri"] {
        assert!(tags.iter().any(|t| t == tag), "missing {tag}");
    }
    // both mixed and female pairs occur in the validation split
    assert!(tags.iter().any(|t| t == "valid/wsj0_epoch_MF_sisnri"));
    assert!(tags.iter().any(|t| t == "valid/wsj0_epoch_FF_sisnri"));
    assert!(!tags.iter().any(|t| t == "valid/wsj0_epoch_MM_sisnri"));
}

#[test]
fn resumed_run_continues_after_the_last_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = write_corpus(dir.path(), "wsj0", 4);
    let first = baseline_config(dir.path(), &corpus, 1, "");
    Solver::build(Mode::Baseline, false, first, RunContext::seeded(5))
        .unwrap()
        .exec(None)
        .unwrap();

    let save_dir = only_experiment(dir.path(), "ckpt");
    let name = save_dir.file_name().unwrap().to_str().unwrap().to_string();
    let before = checkpoint::load(&save_dir.join("latest.json")).unwrap();

    let resumed = baseline_config(
        dir.path(),
        &corpus,
        2,
        &format!("  resume_exp_name: {name}\n  resume_optim: true\n"),
    );
    let trainer = SupervisedTrainer::new(SupervisedVariant::Baseline, resumed.clone(), RunContext::seeded(5)).unwrap();
    assert!(trainer.experiment().resumed);
    assert_eq!(trainer.model().state_dict(), before.state_dict);

    Solver::build(Mode::Baseline, false, resumed, RunContext::seeded(5))
        .unwrap()
        .exec(None)
        .unwrap();
    let after = checkpoint::load(&save_dir.join("latest.json")).unwrap();
    assert_eq!(after.epoch, Some(1));
    assert!(after.step > before.step);
    // no second experiment directory
    only_experiment(dir.path(), "ckpt");
}

#[test]
fn cmvn_requires_a_pretrained_model() {
    let dir = tempfile::tempdir().unwrap();
    let corpus = write_corpus(dir.path(), "wsj0", 4);
    let config = baseline_config(dir.path(), &corpus, 1, "");
    let err = SupervisedTrainer::new(SupervisedVariant::Cmvn, config, RunContext::seeded(0)).err().unwrap();
    assert!(matches!(err, ferrite_sep::Error::MissingConfig(_)), "{err}");
}

#[test]
fn missing_corpus_root_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "solver:\n  exp_name: x\n  save_dir: {0}\n  log_dir: {0}\n  epochs: 1\n  batch_size: 2\n  \
         grad_clip: 5\n  max_save_num: 1\nmodel:\n{1}optim:\n  type: Adam\n  lr: 0.001\n  weight_decay: 0\n\
         data:\n  dset: wsj0\n",
        dir.path().display(),
        common::MODEL
    );
    let config = Config::from_yaml_str(&yaml).unwrap();
    assert!(Solver::build(Mode::Baseline, false, config, RunContext::seeded(0)).is_err());
    // nothing was created
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
