use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use ferrite_sep::train::{Mode, Solver};
use ferrite_sep::{Config, RunContext};

/// Raised by Ctrl-C; trainers stop at the next step boundary.
static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "ferrite-sep", about = "Speech separation training and evaluation")]
struct Args {
    /// Experiment configuration (YAML).
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
    /// Training procedure.
    #[arg(long, value_enum, default_value = "baseline")]
    mode: Mode,
    /// Machine-local corpus paths, merged into the `data` section.
    #[arg(long, default_value = "./config/path.yaml")]
    path: PathBuf,
    /// Run everything on the calling thread.
    #[arg(long)]
    cpu: bool,
    /// Evaluate a checkpoint instead of training.
    #[arg(long)]
    test: bool,
    #[arg(long)]
    debug: bool,
    /// Determinism seed; negative leaves the run unseeded.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    seed: i64,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}: {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    if let Err(e) = run(args) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let local_paths = if args.path.is_file() {
        Some(args.path.as_path())
    } else {
        warn!("path file '{}' not found, using corpus roots from the config", args.path.display());
        None
    };
    let config = Config::load(&args.config, local_paths)
        .with_context(|| format!("loading config '{}'", args.config.display()))?;

    let ctx = RunContext::new(args.cpu, args.debug, args.seed);
    info!(
        "mode {:?}{}, device {:?}, seed {:?}",
        args.mode,
        if args.test { " (test)" } else { "" },
        ctx.device,
        ctx.seed
    );

    let solver = Solver::build(args.mode, args.test, config, ctx).context("building the solver")?;
    ctrlc::set_handler(|| {
        warn!("interrupt received, stopping after the current step");
        STOP.store(true, Ordering::SeqCst);
    })
    .context("installing the Ctrl-C handler")?;
    solver.exec(Some(&STOP)).context("run failed")?;
    info!("done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn short_and_long_config_flags_parse() {
        for flag in ["-c", "--config"] {
            let args = Args::try_parse_from(["ferrite-sep", flag, "run.yaml", "--mode", "cmvn", "--seed", "-1"]).unwrap();
            assert_eq!(args.config, PathBuf::from("run.yaml"));
            assert_eq!(args.mode, Mode::Cmvn);
            assert_eq!(args.seed, -1);
        }
    }
}
