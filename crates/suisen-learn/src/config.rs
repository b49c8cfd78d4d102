//! 学習設定
//!
//! JSONの設定ファイルとコマンドラインの両方から組み立てる。
//! CLIフラグ > 設定ファイル > 既定値 の順で優先する。

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 学習エンジンの設定
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearnConfig {
    /// 棋譜ディレクトリ（拡張子 csa のファイルを列挙する）
    pub kifu: PathBuf,
    /// ワーカスレッド数
    pub threads: usize,
    /// 探索深さ
    pub depth: u8,
    /// バッチ学習の外側反復回数
    pub iteration: u32,
    /// 評価関数テーブルの出力先
    pub eval_out: PathBuf,
    /// 駒割りの出力先
    pub material_out: PathBuf,
    /// バッチ学習の訓練データファイル
    pub training_data: PathBuf,
}

impl Default for LearnConfig {
    fn default() -> Self {
        LearnConfig {
            kifu: PathBuf::from("kifu"),
            threads: 4,
            depth: 3,
            iteration: 8,
            eval_out: PathBuf::from("eval.bin"),
            material_out: PathBuf::from("material.bin"),
            training_data: PathBuf::from("training.dat"),
        }
    }
}

impl LearnConfig {
    /// JSONファイルから読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<LearnConfig> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("cannot parse config: {}", path.display()))
    }
}
