//! 学習エンジンのランチャ
//!
//! レジーム（online / batch）を選び、設定を読み込んで実行するだけの
//! 薄い入口。学習の本体は suisen_learn クレート側にある。

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use suisen_learn::batch::BatchLearning;
use suisen_learn::config::LearnConfig;
use suisen_learn::online::OnlineLearning;

#[derive(Parser, Debug)]
#[command(name = "learn", version, about = "suisen evaluation-function learner")]
struct Cli {
    /// JSON config file (CLI flags take precedence)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory containing csa game records
    #[arg(long)]
    kifu: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// Search depth
    #[arg(long)]
    depth: Option<u8>,

    /// Number of outer iterations (batch only)
    #[arg(long)]
    iteration: Option<u32>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Online learning: per-position gradients with mini-batch averaging
    Online,
    /// Batch learning: regenerate training data, then run gradient passes
    Batch,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().filter_or(
        env_logger::DEFAULT_FILTER_ENV,
        "info",
    ));

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LearnConfig::load(path)?,
        None => LearnConfig::default(),
    };
    if let Some(kifu) = cli.kifu {
        config.kifu = kifu;
    }
    if let Some(threads) = cli.threads {
        config.threads = threads;
    }
    if let Some(depth) = cli.depth {
        config.depth = depth;
    }
    if let Some(iteration) = cli.iteration {
        config.iteration = iteration;
    }

    match cli.mode {
        Mode::Online => OnlineLearning::new(config).run(),
        Mode::Batch => BatchLearning::new(config).run(),
    }
}
