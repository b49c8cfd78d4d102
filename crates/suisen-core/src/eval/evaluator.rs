//! 評価関数テーブル（Evaluator）
//!
//! KPP / KKP の整数テーブルを持つ。探索スレッドは Relaxed 読みで
//! 参照し、書き換えは学習側がワーカ停止中に行う。評価値は
//! Zobristハッシュをキーにしたロックレスキャッシュを通す。

use super::feature::{
    kkp_index, kpp_index, for_each_kkp_mirror_pair, for_each_kpp_mirror_pair, FeatureList,
    KKP_ALL, KPP_ALL,
};
use super::material::Material;
use crate::position::Position;
use crate::types::{Color, PieceType, Square, Value};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};

/// 盤面評価のスケール。テーブル値の合計を32で割ったものが評価値になる。
pub const POSITIONAL_SCALE: i32 = 32;

/// 評価値キャッシュのエントリ数
const CACHE_SIZE: usize = 1 << 20;

/// テーブルのスロット型
pub type EvalValue = i16;

/// ゼロ初期化された AtomicI16 のVecを確保する
fn zeroed_slots(n: usize) -> Vec<AtomicI16> {
    let v = vec![0i16; n];
    let mut v = std::mem::ManuallyDrop::new(v);
    // SAFETY: AtomicI16 は i16 と同じサイズ・ビット表現を持つ
    unsafe { Vec::from_raw_parts(v.as_mut_ptr() as *mut AtomicI16, v.len(), v.capacity()) }
}

/// 評価関数テーブル
pub struct Evaluator {
    kpp: Vec<AtomicI16>,
    kkp: Vec<AtomicI16>,
    cache: Vec<AtomicU64>,
}

impl Evaluator {
    /// ゼロ初期化のテーブルを確保する
    pub fn new() -> Evaluator {
        Evaluator {
            kpp: zeroed_slots(KPP_ALL),
            kkp: zeroed_slots(KKP_ALL),
            cache: (0..CACHE_SIZE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// 全スロットをゼロにする
    pub fn init(&self) {
        for s in &self.kpp {
            s.store(0, Ordering::Relaxed);
        }
        for s in &self.kkp {
            s.store(0, Ordering::Relaxed);
        }
        self.clear_cache();
    }

    /// KPPスロット列
    #[inline]
    pub fn kpp(&self) -> &[AtomicI16] {
        &self.kpp
    }

    /// KKPスロット列
    #[inline]
    pub fn kkp(&self) -> &[AtomicI16] {
        &self.kkp
    }

    /// 局面を評価する（先手有利が正）
    pub fn evaluate(&self, pos: &Position, material: &Material) -> Value {
        let hash = pos.hash();
        if let Some(v) = self.cache_probe(hash) {
            return Value::new(v);
        }
        let v = material_sum(pos, material) + self.positional(pos) / POSITIONAL_SCALE;
        self.cache_store(hash, v);
        Value::new(v)
    }

    /// 盤面の位置評価（スケール前の生の合計）
    fn positional(&self, pos: &Position) -> i32 {
        let list = FeatureList::collect(pos);
        let bk = pos.king_square(Color::Black);
        let ik = pos.king_square(Color::White).inverse();
        let wk = pos.king_square(Color::White);
        let mut sum = 0i32;
        for i in 0..list.len {
            let fb_i = list.fb[i];
            let fw_i = list.fw[i];
            for j in (i + 1)..list.len {
                sum += self.kpp[kpp_index(bk, fb_i, list.fb[j])].load(Ordering::Relaxed) as i32;
                sum -= self.kpp[kpp_index(ik, fw_i, list.fw[j])].load(Ordering::Relaxed) as i32;
            }
            sum += self.kkp[kkp_index(bk, wk, fb_i)].load(Ordering::Relaxed) as i32;
        }
        sum
    }

    /// 左右対称化：正準側のスロットを鏡映側へ複写する
    pub fn symmetrize(&self) {
        for_each_kpp_mirror_pair(|a, b| {
            self.kpp[b].store(self.kpp[a].load(Ordering::Relaxed), Ordering::Relaxed);
        });
        for_each_kkp_mirror_pair(|a, b| {
            self.kkp[b].store(self.kkp[a].load(Ordering::Relaxed), Ordering::Relaxed);
        });
    }

    /// テーブルをファイルに書き出す（KPP, KKPの順、リトルエンディアン）
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        write_slots(&mut w, &self.kpp)?;
        write_slots(&mut w, &self.kkp)?;
        w.flush()
    }

    /// テーブルをファイルから読み込む
    pub fn read_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut r = BufReader::new(File::open(path)?);
        read_slots(&mut r, &self.kpp)?;
        read_slots(&mut r, &self.kkp)?;
        self.clear_cache();
        Ok(())
    }

    /// 評価値キャッシュを消去する
    pub fn clear_cache(&self) {
        for e in &self.cache {
            e.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    fn cache_probe(&self, hash: u64) -> Option<i32> {
        let e = self.cache[(hash as usize) & (CACHE_SIZE - 1)].load(Ordering::Relaxed);
        if e != 0 && (e ^ hash) >> 32 == 0 {
            Some(e as u32 as i32)
        } else {
            None
        }
    }

    #[inline]
    fn cache_store(&self, hash: u64, v: i32) {
        let e = (hash & 0xFFFF_FFFF_0000_0000) | (v as u32 as u64);
        self.cache[(hash as usize) & (CACHE_SIZE - 1)].store(e, Ordering::Relaxed);
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator::new()
    }
}

/// 駒割りの合計（先手有利が正）
pub fn material_sum(pos: &Position, material: &Material) -> i32 {
    let mut sum = 0i32;
    for sq in Square::all() {
        let p = pos.piece_on(sq);
        if p.is_none() || p.piece_type() == PieceType::King {
            continue;
        }
        let v = material.piece(p.piece_type()).raw();
        if p.color() == Color::Black {
            sum += v;
        } else {
            sum -= v;
        }
    }
    for k in 0..PieceType::HAND_NUM {
        let pt = PieceType::from_hand_index(k).expect("hand index");
        let v = material.piece(pt).raw();
        sum += v * pos.hand(Color::Black, k) as i32;
        sum -= v * pos.hand(Color::White, k) as i32;
    }
    sum
}

fn write_slots<W: Write>(w: &mut W, slots: &[AtomicI16]) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    for chunk in slots.chunks(buf.len() / 2) {
        for (i, s) in chunk.iter().enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&s.load(Ordering::Relaxed).to_le_bytes());
        }
        w.write_all(&buf[..chunk.len() * 2])?;
    }
    Ok(())
}

fn read_slots<R: Read>(r: &mut R, slots: &[AtomicI16]) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    for chunk in slots.chunks(buf.len() / 2) {
        let n = chunk.len() * 2;
        r.read_exact(&mut buf[..n])?;
        for (i, s) in chunk.iter().enumerate() {
            let v = i16::from_le_bytes(buf[i * 2..i * 2 + 2].try_into().expect("2 bytes"));
            s.store(v, Ordering::Relaxed);
        }
    }
    Ok(())
}

/// 学習エンジンに注入するパラメータ一式
pub struct ParamCtx {
    pub material: Material,
    pub eval: Evaluator,
}

impl ParamCtx {
    pub fn new() -> ParamCtx {
        ParamCtx { material: Material::new(), eval: Evaluator::new() }
    }

    /// 局面を評価する（先手有利が正）
    #[inline]
    pub fn evaluate(&self, pos: &Position) -> Value {
        self.eval.evaluate(pos, &self.material)
    }

    /// 手番側から見た評価値
    #[inline]
    pub fn evaluate_stm(&self, pos: &Position) -> Value {
        let v = self.evaluate(pos);
        if pos.is_black() {
            v
        } else {
            -v
        }
    }
}

impl Default for ParamCtx {
    fn default() -> Self {
        ParamCtx::new()
    }
}
