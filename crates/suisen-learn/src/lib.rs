//! suisen-learn
//!
//! 棋譜を教師とした評価関数の機械学習エンジン。
//!
//! - オンライン学習（[`online::OnlineLearning`]）: 局面ごとの探索結果から
//!   勾配を直接積み、ミニバッチ単位で重みを更新・平均化する。
//! - バッチ学習（[`batch::BatchLearning`]）: 探索で訓練データファイルを
//!   生成し、シグモイド損失の勾配パスを繰り返して整数テーブルと
//!   駒割りを更新する。
//!
//! 探索・局面・評価テーブルは suisen-core のものを使う。

pub mod batch;
pub mod codec;
pub mod config;
pub mod fv;
pub mod generator;
pub mod online;
pub mod pool;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    // パラメータテーブルをまるごと確保するテストを直列化する
    static HEAVY: Mutex<()> = Mutex::new(());

    pub fn heavy_lock() -> MutexGuard<'static, ()> {
        HEAVY.lock().unwrap_or_else(|e| e.into_inner())
    }
}
