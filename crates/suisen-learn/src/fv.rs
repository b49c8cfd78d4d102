//! 勾配・重みベクトル（FV）
//!
//! 評価関数テーブルと同じ形の浮動小数テーブル。オンライン学習の
//! `w` / `u` / `g`、バッチ学習の `g` として使う。`extract` は局面の
//! 全有効特徴のスロットへ値を書き込む（評価関数の読み出しと同じ
//! スロット集合・同じ符号）。

use suisen_core::eval::feature::{
    for_each_kkp_mirror_pair, for_each_kpp_mirror_pair, kkp_index, kpp_index, FeatureList,
    KKP_ALL, KPP_ALL,
};
use suisen_core::position::Position;
use suisen_core::types::Color;

/// 浮動小数のパラメータテーブル
pub struct Fv {
    pub kpp: Vec<f32>,
    pub kkp: Vec<f32>,
}

impl Fv {
    /// ゼロ初期化で確保する
    pub fn new() -> Fv {
        Fv { kpp: vec![0.0; KPP_ALL], kkp: vec![0.0; KKP_ALL] }
    }

    /// 全スロットをゼロにする
    pub fn init(&mut self) {
        self.kpp.fill(0.0);
        self.kkp.fill(0.0);
    }

    /// 局面の全有効特徴のスロットへ `v` を適用する
    ///
    /// `ACCUMULATE = true` で加算、`false` で代入。先手視点のKPPには `+v`、
    /// 後手視点のKPPには `-v`、KKPには `+v` が入る。
    pub fn extract<const ACCUMULATE: bool>(&mut self, pos: &Position, v: f32) {
        let list = FeatureList::collect(pos);
        let bk = pos.king_square(Color::Black);
        let wk = pos.king_square(Color::White);
        let ik = wk.inverse();
        for i in 0..list.len {
            let fb_i = list.fb[i];
            let fw_i = list.fw[i];
            for j in (i + 1)..list.len {
                let b = kpp_index(bk, fb_i, list.fb[j]);
                let w = kpp_index(ik, fw_i, list.fw[j]);
                if ACCUMULATE {
                    self.kpp[b] += v;
                    self.kpp[w] -= v;
                } else {
                    self.kpp[b] = v;
                    self.kpp[w] = -v;
                }
            }
            let k = kkp_index(bk, wk, fb_i);
            if ACCUMULATE {
                self.kkp[k] += v;
            } else {
                self.kkp[k] = v;
            }
        }
    }

    /// 左右対称化：各ミラーペアを両者の和で置き換える
    pub fn symmetrize_sum(&mut self) {
        let kpp = &mut self.kpp;
        for_each_kpp_mirror_pair(|a, b| {
            let s = kpp[a] + kpp[b];
            kpp[a] = s;
            kpp[b] = s;
        });
        let kkp = &mut self.kkp;
        for_each_kkp_mirror_pair(|a, b| {
            let s = kkp[a] + kkp[b];
            kkp[a] = s;
            kkp[b] = s;
        });
    }
}

impl Default for Fv {
    fn default() -> Self {
        Fv::new()
    }
}
