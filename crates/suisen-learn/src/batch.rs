//! バッチ学習
//!
//! 外側の反復ごとに、(1) 現在のパラメータで探索して訓練データファイルを
//! 作り直し、(2) そのファイルに対してシグモイド損失の勾配パスを
//! `update_count` 回流して整数テーブルと駒割りを更新する。
//! 訓練データは反復の終わりに削除する。

use crate::codec::{PvRead, TrainingReader, TrainingWriter};
use crate::config::LearnConfig;
use crate::fv::Fv;
use crate::generator::{generate, GenWorker, Regime, SEARCH_WINDOW};
use crate::pool::{JobQueue, WorkerPool};
use anyhow::{bail, ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use suisen_core::eval::{material_index, Material, MATERIAL_NUM};
use suisen_core::position::Position;
use suisen_core::record::CsaReader;
use suisen_core::types::{Color, Move, PieceType, Square};
use suisen_core::ParamCtx;

/// L1正則化の強さ（整数テーブルに対する縮小）
const NORM: f32 = 1.0e-2;
/// シグモイドのゲイン
const GAIN: f32 = 7.0 / SEARCH_WINDOW as f32;
/// 勾配パス回数の初期値（反復ごとに半減）
const INITIAL_UPDATE_COUNT: u32 = 256;
/// 勾配パス回数の下限
const MIN_UPDATE_COUNT: u32 = 16;

/// 反復ごとの勾配パス回数（半減、下限16）
#[inline]
fn next_update_count(count: u32) -> u32 {
    (count / 2).max(MIN_UPDATE_COUNT)
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x * GAIN).exp())
}

#[inline]
fn dsigmoid(x: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s) * GAIN
}

#[inline]
fn shrink(x: f32) -> f32 {
    if x > 0.0 {
        -NORM
    } else if x < 0.0 {
        NORM
    } else {
        0.0
    }
}

/// ワーカと共有する状態
struct BatchShared {
    writer: Mutex<Option<TrainingWriter>>,
    total_moves: AtomicU64,
    out_of_window: AtomicU64,
    failed: AtomicBool,
    progress: Mutex<Option<ProgressBar>>,
}

impl BatchShared {
    fn new() -> BatchShared {
        BatchShared {
            writer: Mutex::new(None),
            total_moves: AtomicU64::new(0),
            out_of_window: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            progress: Mutex::new(None),
        }
    }
}

/// バッチ学習エンジン
pub struct BatchLearning {
    config: LearnConfig,
    ctx: Arc<ParamCtx>,
    g: Fv,
    gm: [f32; MATERIAL_NUM],
    rng: Xoshiro256PlusPlus,
    loss: f32,
    max: i32,
    magnitude: u64,
}

impl BatchLearning {
    pub fn new(config: LearnConfig) -> BatchLearning {
        Self::with_ctx(config, Arc::new(ParamCtx::new()))
    }

    /// パラメータ文脈を注入して作る（検証用）
    pub fn with_ctx(config: LearnConfig, ctx: Arc<ParamCtx>) -> BatchLearning {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        BatchLearning {
            config,
            ctx,
            g: Fv::new(),
            gm: [0.0; MATERIAL_NUM],
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            loss: 0.0,
            max: 0,
            magnitude: 0,
        }
    }

    /// 注入したパラメータ文脈
    pub fn ctx(&self) -> &Arc<ParamCtx> {
        &self.ctx
    }

    /// 学習を実行する
    pub fn run(&mut self) -> Result<()> {
        info!("begin learning");
        let timer = Instant::now();

        self.ctx.eval.init();

        let nt = self.config.threads.max(1);
        let workers = self.build_workers(nt);

        let queue: Arc<JobQueue<PathBuf>> = Arc::new(JobQueue::new());
        let shared = Arc::new(BatchShared::new());
        let pool = {
            let shared = Arc::clone(&shared);
            WorkerPool::start(
                &queue,
                workers,
                move |_wn, w: &mut GenWorker, path: PathBuf| process_file(&shared, w, &path),
                |_w| {},
            )
        };

        let result = self.iterate(&queue, &shared);

        queue.request_shutdown();
        pool.join();
        result?;

        info!("completed..");
        info!("elapsed: {:.1}s", timer.elapsed().as_secs_f32());
        info!("end learning");
        Ok(())
    }

    /// ワーカごとの探索器と乱数を組み立てる（乱数は前のワーカの出力で種付け）
    fn build_workers(&mut self, nt: usize) -> Vec<GenWorker> {
        let mut seed = self.rng.next_u64();
        let mut workers = Vec::with_capacity(nt);
        for _ in 0..nt {
            let worker_seed = seed;
            let mut chain = Xoshiro256PlusPlus::seed_from_u64(worker_seed);
            seed = chain.next_u64();
            workers.push(GenWorker::new(
                Arc::clone(&self.ctx),
                self.config.depth,
                worker_seed,
            ));
        }
        workers
    }

    /// 外側の反復ループ
    fn iterate(&mut self, queue: &Arc<JobQueue<PathBuf>>, shared: &BatchShared) -> Result<()> {
        let mut update_count = INITIAL_UPDATE_COUNT;

        for i in 0..self.config.iteration {
            self.generate_training_data(queue, shared)
                .with_context(|| format!("training data generation failed (iteration {i})"))?;

            update_count = next_update_count(update_count);

            for j in 0..update_count {
                self.loss = 0.0;
                self.generate_gradient()?;
                self.update_parameters();

                let total = shared.total_moves.load(Ordering::Relaxed).max(1) as f32;
                let out_wind = shared.out_of_window.load(Ordering::Relaxed) as f32;
                info!(
                    "iteration={i},{j} out_wind_loss={:.4} loss={:.4} max={} magnitude={}",
                    out_wind / total,
                    (out_wind + self.loss) / total,
                    self.max,
                    self.magnitude,
                );
            }

            self.ctx
                .eval
                .write_file(&self.config.eval_out)
                .with_context(|| format!("cannot write {}", self.config.eval_out.display()))?;
            self.ctx
                .material
                .write_file(&self.config.material_out)
                .with_context(|| format!("cannot write {}", self.config.material_out.display()))?;
            self.ctx.eval.clear_cache();

            if let Err(e) = std::fs::remove_file(&self.config.training_data) {
                warn!("cannot remove {}: {e}", self.config.training_data.display());
            }
        }
        Ok(())
    }

    /// 訓練データファイルを現在のパラメータで作り直す
    fn generate_training_data(
        &mut self,
        queue: &Arc<JobQueue<PathBuf>>,
        shared: &BatchShared,
    ) -> Result<()> {
        *shared.writer.lock().expect("writer lock") = Some(
            TrainingWriter::create(&self.config.training_data)
                .with_context(|| format!("open error [{}]", self.config.training_data.display()))?,
        );
        shared.total_moves.store(0, Ordering::Relaxed);
        shared.out_of_window.store(0, Ordering::Relaxed);
        shared.failed.store(false, Ordering::Relaxed);

        let files = file_list_checked(&self.config.kifu)?;

        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::with_template("{bar:50} {pos}/{len} [{percent}%]")
                .expect("valid template"),
        );
        *shared.progress.lock().expect("progress lock") = Some(pb.clone());

        queue.push_all(files);
        queue.wait_idle();

        *shared.progress.lock().expect("progress lock") = None;
        pb.finish();

        if let Some(w) = shared.writer.lock().expect("writer lock").take() {
            w.finish().context("cannot flush training data")?;
        }
        ensure!(
            !shared.failed.load(Ordering::Relaxed),
            "failed while generating training data"
        );
        Ok(())
    }

    /// 訓練データを流して勾配 `g` と駒割り勾配 `gm` を作る
    fn generate_gradient(&mut self) -> Result<()> {
        let mut reader = TrainingReader::open(&self.config.training_data)
            .with_context(|| format!("open error [{}]", self.config.training_data.display()))?;

        self.g.init();
        self.gm = [0.0; MATERIAL_NUM];

        while let Some(cb) = reader.next_root()? {
            let root = Position::from_compact(&cb).context("broken root in training data")?;
            let side = if root.is_black() { 1.0f32 } else { -1.0f32 };

            // 実戦手のPV
            let mut board0 = root.clone();
            match reader.read_pv(&mut board0)? {
                PvRead::End => continue,
                PvRead::Broken => {
                    // ブロックの残りを読み捨てる
                    loop {
                        let mut scratch = root.clone();
                        if reader.read_pv(&mut scratch)? == PvRead::End {
                            break;
                        }
                    }
                    continue;
                }
                PvRead::Ok => {}
            }
            let v0 = self.ctx.evaluate(&board0);

            loop {
                let mut board = root.clone();
                match reader.read_pv(&mut board)? {
                    PvRead::End => break,
                    PvRead::Broken => continue,
                    PvRead::Ok => {}
                }
                let v = self.ctx.evaluate(&board);

                let diff = (v.raw() - v0.raw()) as f32 * side;
                self.loss += sigmoid(diff);

                let g = dsigmoid(diff) * side;
                self.g.extract::<true>(&board0, g);
                self.g.extract::<true>(&board, -g);
                accumulate_material(&board0, g, &mut self.gm);
                accumulate_material(&board, -g, &mut self.gm);
            }
        }
        Ok(())
    }

    /// 勾配に従ってテーブルと駒割りを更新する
    fn update_parameters(&mut self) {
        self.g.symmetrize_sum();

        self.max = 0;
        self.magnitude = 0;
        update_slots(
            &mut self.g.kpp,
            self.ctx.eval.kpp(),
            &mut self.rng,
            &mut self.max,
            &mut self.magnitude,
        );
        update_slots(
            &mut self.g.kkp,
            self.ctx.eval.kkp(),
            &mut self.rng,
            &mut self.max,
            &mut self.magnitude,
        );

        apply_material_ranking(&self.ctx.material, &self.gm, &mut self.rng);

        // 乱数ステップで崩れた左右対称性を回復する
        self.ctx.eval.symmetrize();
        self.ctx.eval.clear_cache();
        // 探索器は learning=true で置換表を使わないため、ここでの
        // 置換表クリアは不要になっている
    }
}

/// 棋譜ディレクトリを列挙する。空ならエラー。
fn file_list_checked(dir: &Path) -> Result<Vec<PathBuf>> {
    let files = suisen_core::util::file_list::enumerate(dir, "csa")
        .with_context(|| format!("cannot enumerate kifu dir: {}", dir.display()))?;
    if files.is_empty() {
        bail!("no files.");
    }
    Ok(files)
}

/// 1棋譜ファイル分の訓練ブロックを生成する
fn process_file(shared: &BatchShared, worker: &mut GenWorker, path: &Path) {
    let mut record = match CsaReader::read(path) {
        Ok(r) => r,
        Err(e) => {
            log::error!("could not read csa file [{}]: {e}", path.display());
            shared.failed.store(true, Ordering::Relaxed);
            return;
        }
    };

    record.rewind();
    loop {
        let Some(mv) = record.next_move() else { break };
        let mut pos = record.board().clone();
        generate_block(shared, worker, &mut pos, mv);
        if !record.make_move() {
            break;
        }
    }

    if let Some(pb) = shared.progress.lock().expect("progress lock").as_ref() {
        pb.inc(1);
    }
}

/// 1局面分のブロックを書き出す
fn generate_block(shared: &BatchShared, worker: &mut GenWorker, pos: &mut Position, move0: Move) {
    let Some(sample) = generate(worker, pos, move0, Regime::Batch) else {
        return;
    };
    shared.total_moves.fetch_add(1, Ordering::Relaxed);
    shared
        .out_of_window
        .fetch_add(sample.out_of_window as u64, Ordering::Relaxed);

    let root = pos.to_compact();
    let mut pvs: Vec<&[Move]> = Vec::with_capacity(1 + sample.siblings.len());
    pvs.push(&sample.pv0);
    for sib in &sample.siblings {
        pvs.push(&sib.line);
    }

    let mut w = shared.writer.lock().expect("writer lock");
    if let Some(writer) = w.as_mut() {
        if let Err(e) = writer.write_block(&root, &pvs) {
            log::error!("training data write error: {e}");
            shared.failed.store(true, Ordering::Relaxed);
        }
    }
}

/// 局面の駒を数えて駒割り勾配へ積む（先手プラス・後手マイナス）
fn accumulate_material(pos: &Position, g: f32, gm: &mut [f32; MATERIAL_NUM]) {
    for sq in Square::all() {
        let p = pos.piece_on(sq);
        if p.is_none() || p.piece_type() == PieceType::King {
            continue;
        }
        let i = material_index(p.piece_type()).expect("non-king");
        if p.color() == Color::Black {
            gm[i] += g;
        } else {
            gm[i] -= g;
        }
    }
    for (c, sign) in [(Color::Black, 1.0f32), (Color::White, -1.0f32)] {
        for k in 0..PieceType::HAND_NUM {
            let n = pos.hand(c, k) as f32;
            if n > 0.0 {
                let pt = PieceType::from_hand_index(k).expect("hand index");
                let i = material_index(pt).expect("non-king");
                gm[i] += sign * g * n;
            }
        }
    }
}

/// 整数テーブルを勾配の符号方向へ乱数ステップで動かす
fn update_slots(
    g: &mut [f32],
    slots: &[AtomicI16],
    rng: &mut Xoshiro256PlusPlus,
    max: &mut i32,
    magnitude: &mut u64,
) {
    for (gi, slot) in g.iter_mut().zip(slots) {
        let mut e = slot.load(Ordering::Relaxed) as i32;
        *gi += shrink(e as f32);
        if *gi > 0.0 {
            e += bit(rng) + bit(rng);
        } else if *gi < 0.0 {
            e -= bit(rng) + bit(rng);
        }
        let e = e.clamp(i16::MIN as i32, i16::MAX as i32);
        slot.store(e as i16, Ordering::Relaxed);
        *max = (*max).max(e.abs());
        *magnitude += e.unsigned_abs() as u64;
    }
}

#[inline]
fn bit(rng: &mut Xoshiro256PlusPlus) -> i32 {
    rng.random::<bool>() as i32
}

/// 駒割り勾配の順位づけ更新
///
/// 13個の勾配を昇順に並べ（同値の順序は乱数で崩す）、順位に応じた
/// 残差 {-2,-2,-1,-1,-1,0,0,0,+1,+1,+1,+2,+2} を基本値へ加える。
/// 成駒の価値が生駒を下回らないよう切り上げてから交換値を再計算する。
pub fn apply_material_ranking(
    material: &Material,
    gm: &[f32; MATERIAL_NUM],
    rng: &mut Xoshiro256PlusPlus,
) {
    const RESIDUAL: [i32; MATERIAL_NUM] = [-2, -2, -1, -1, -1, 0, 0, 0, 1, 1, 1, 2, 2];

    let mut order: Vec<usize> = (0..MATERIAL_NUM).collect();
    order.shuffle(rng);
    order.sort_by(|&a, &b| gm[a].partial_cmp(&gm[b]).unwrap_or(std::cmp::Ordering::Equal));

    for (rank, &k) in order.iter().enumerate() {
        material.add(k, RESIDUAL[rank]);
    }
    material.clamp_promotions();
    material.update_ex();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_shape() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(SEARCH_WINDOW as f32 * 10.0) > 0.99);
        assert!(sigmoid(-(SEARCH_WINDOW as f32) * 10.0) < 0.01);
        // 導関数は正で、0で最大
        assert!(dsigmoid(0.0) > 0.0);
        assert!(dsigmoid(0.0) > dsigmoid(100.0));
        assert!((dsigmoid(50.0) - dsigmoid(-50.0)).abs() < 1e-6);
    }

    #[test]
    fn test_shrink_sign() {
        assert!(shrink(3.0) < 0.0);
        assert!(shrink(-3.0) > 0.0);
        assert_eq!(shrink(0.0), 0.0);
    }

    #[test]
    fn test_update_count_floors_at_16() {
        let mut c = INITIAL_UPDATE_COUNT;
        let mut seen = Vec::new();
        for _ in 0..6 {
            c = next_update_count(c);
            seen.push(c);
        }
        assert_eq!(seen, vec![128, 64, 32, 16, 16, 16]);
    }

    #[test]
    fn test_material_ranking_moves_extremes() {
        let material = Material::new();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut gm = [0.0f32; MATERIAL_NUM];
        // 歩の勾配を最小に、飛の勾配を最大にする
        let pawn = material_index(PieceType::Pawn).unwrap();
        let rook = material_index(PieceType::Rook).unwrap();
        for (i, v) in gm.iter_mut().enumerate() {
            *v = i as f32 * 0.1 + 1.0;
        }
        gm[pawn] = -10.0;
        gm[rook] = 10.0;

        let before_pawn = material.get(pawn);
        let before_rook = material.get(rook);
        apply_material_ranking(&material, &gm, &mut rng);
        assert_eq!(material.get(pawn), before_pawn - 2);
        assert_eq!(material.get(rook), before_rook + 2);
        // 交換値は再計算済み
        assert_eq!(
            material.piece_exchange(PieceType::Pawn).raw(),
            2 * material.get(pawn)
        );
    }

    #[test]
    fn test_material_ranking_residual_sum_zero() {
        let material = Material::new();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let gm = [1.0f32; MATERIAL_NUM];
        let before: i32 = (0..MATERIAL_NUM).map(|i| material.get(i)).sum();
        apply_material_ranking(&material, &gm, &mut rng);
        let after: i32 = (0..MATERIAL_NUM).map(|i| material.get(i)).sum();
        // 残差の合計は0（切り上げが起きなければ総量は保存される）
        assert_eq!(before, after);
    }

    fn test_config(dir: &std::path::Path) -> LearnConfig {
        LearnConfig {
            kifu: dir.join("kifu"),
            threads: 1,
            depth: 1,
            iteration: 1,
            eval_out: dir.join("eval.bin"),
            material_out: dir.join("material.bin"),
            training_data: dir.join("training.dat"),
        }
    }

    #[test]
    fn test_training_data_regeneration() {
        let _guard = crate::test_support::heavy_lock();
        let dir = tempfile::tempdir().unwrap();
        let kifu = dir.path().join("kifu");
        std::fs::create_dir(&kifu).unwrap();
        std::fs::write(kifu.join("game1.csa"), "PI\n+\n+7776FU\n-3334FU\n").unwrap();

        let config = test_config(dir.path());
        let training = config.training_data.clone();
        let mut bl = BatchLearning::new(config);
        let workers = bl.build_workers(1);
        let queue: Arc<JobQueue<PathBuf>> = Arc::new(JobQueue::new());
        let shared = Arc::new(BatchShared::new());
        let pool = {
            let shared = Arc::clone(&shared);
            WorkerPool::start(
                &queue,
                workers,
                move |_wn, w: &mut GenWorker, path: PathBuf| process_file(&shared, w, &path),
                |_w| {},
            )
        };

        bl.generate_training_data(&queue, &shared).unwrap();
        queue.request_shutdown();
        pool.join();

        assert!(training.exists());
        assert!(shared.total_moves.load(Ordering::Relaxed) >= 1);

        // 最初のブロックのルートは平手初期局面としてそのまま読み戻せる
        let mut r = TrainingReader::open(&training).unwrap();
        let cb = r.next_root().unwrap().unwrap();
        assert_eq!(cb, Position::hirate().to_compact());
        let mut b = Position::from_compact(&cb).unwrap();
        assert_eq!(r.read_pv(&mut b).unwrap(), PvRead::Ok);
        assert!(b.ply() >= 1);
    }

    #[test]
    fn test_empty_kifu_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("kifu")).unwrap();
        assert!(file_list_checked(&dir.path().join("kifu")).is_err());
        assert!(file_list_checked(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_update_parameters_restores_symmetry() {
        let _guard = crate::test_support::heavy_lock();
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut bl = BatchLearning::new(config);

        // 非対称な勾配を入れてから1回更新する
        let mut pos = Position::hirate();
        assert!(pos.make_move(Move::board(
            Square::new(6, 6).unwrap(),
            Square::new(6, 5).unwrap(),
            false
        )));
        bl.g.extract::<true>(&pos, 0.5);
        bl.update_parameters();

        // ミラーペアをサンプリングして一致を確認する
        use suisen_core::eval::feature::{for_each_kkp_mirror_pair, for_each_kpp_mirror_pair};
        let kpp = bl.ctx.eval.kpp();
        let mut n = 0usize;
        let mut checked = 0usize;
        for_each_kpp_mirror_pair(|a, b| {
            n += 1;
            if n % 999_983 == 0 {
                assert_eq!(
                    kpp[a].load(Ordering::Relaxed),
                    kpp[b].load(Ordering::Relaxed)
                );
                checked += 1;
            }
        });
        assert!(checked > 0);
        let kkp = bl.ctx.eval.kkp();
        for_each_kkp_mirror_pair(|a, b| {
            assert_eq!(
                kkp[a].load(Ordering::Relaxed),
                kkp[b].load(Ordering::Relaxed)
            );
        });
    }

    #[test]
    fn test_accumulate_material_signs() {
        let pos = Position::hirate();
        let mut gm = [0.0f32; MATERIAL_NUM];
        accumulate_material(&pos, 1.0, &mut gm);
        // 平手は先後同数なのですべて打ち消される
        for v in gm {
            assert!(v.abs() < 1e-6);
        }

        let mut pos = Position::hirate();
        pos.set_hand(Color::Black, PieceType::Gold, 2);
        let mut gm = [0.0f32; MATERIAL_NUM];
        accumulate_material(&pos, 0.5, &mut gm);
        let gold = material_index(PieceType::Gold).unwrap();
        assert!((gm[gold] - 1.0).abs() < 1e-6);
    }
}
