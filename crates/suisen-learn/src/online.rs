//! オンライン学習
//!
//! 棋譜の全局面をジョブにし、ワーカが探索で得たPVの末端局面から
//! 勾配を共有テーブル `g` に積む。256ジョブごとにミニバッチ更新を行い、
//! L1正則化つきで重み `w` を動かし、`u` による移動平均テーブルを
//! ディスクへ書き出す。次のラウンドの探索には生の `w` を使う。

use crate::config::LearnConfig;
use crate::fv::Fv;
use crate::generator::{generate, pv_leaf, GenWorker, Regime, NUMBER_OF_SIBLING_NODES};
use crate::pool::{JobQueue, WorkerPool};
use anyhow::{Context, Result};
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::Path;
use std::sync::atomic::{AtomicI16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use suisen_core::eval::POSITIONAL_SCALE;
use suisen_core::position::{CompactBoard, Position};
use suisen_core::record::CsaReader;
use suisen_core::types::Move;
use suisen_core::util::file_list;
use suisen_core::ParamCtx;

/// ミニバッチを構成するジョブ数
pub const MINI_BATCH_LENGTH: usize = 256;
/// L1正則化の強さ
const NORM: f32 = 1.0e-6;
/// 勾配の基本スケール
const GRADIENT: f32 = 4.0;

#[inline]
fn gradient_unit() -> f32 {
    GRADIENT * POSITIONAL_SCALE as f32
}

#[inline]
fn error(x: f32) -> f32 {
    x * gradient_unit()
}

/// L1流のソフト縮小項
#[inline]
fn shrink(x: f32) -> f32 {
    const N: f32 = NORM * POSITIONAL_SCALE as f32;
    if x > 0.0 {
        -N
    } else if x < 0.0 {
        N
    } else {
        0.0
    }
}

/// オンライン学習のジョブ（局面と実戦手）
#[derive(Debug, Clone)]
struct Job {
    board: CompactBoard,
    mv: Move,
}

/// ワーカが共有する勾配シンク
struct GradientSink {
    buf: Mutex<GradBuffer>,
    error_count: AtomicU32,
}

struct GradBuffer {
    fv: Fv,
    scale: u32,
    error_sum: f32,
}

/// オンライン学習エンジン
pub struct OnlineLearning {
    config: LearnConfig,
    ctx: Arc<ParamCtx>,
    jobs: Vec<Job>,
    w: Fv,
    u: Fv,
    mini_batch_count: u32,
}

impl OnlineLearning {
    pub fn new(config: LearnConfig) -> OnlineLearning {
        Self::with_ctx(config, Arc::new(ParamCtx::new()))
    }

    /// パラメータ文脈を注入して作る（検証用）
    pub fn with_ctx(config: LearnConfig, ctx: Arc<ParamCtx>) -> OnlineLearning {
        OnlineLearning {
            config,
            ctx,
            jobs: Vec::new(),
            w: Fv::new(),
            u: Fv::new(),
            mini_batch_count: 1,
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

        let files = file_list::enumerate(&self.config.kifu, "csa")
            .with_context(|| format!("cannot enumerate kifu dir: {}", self.config.kifu.display()))?;

        self.ctx.eval.init();
        self.mini_batch_count = 1;
        self.w.init();
        self.u.init();
        self.jobs.clear();

        let nt = self.config.threads.max(1);

        // ワーカの乱数は前のワーカの出力で順に種付けする
        let mut seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
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

        let total = files.len();
        for (i, path) in files.iter().enumerate() {
            self.read_csa(i + 1, total, path);
        }

        let mut shuffle_rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        self.jobs.shuffle(&mut shuffle_rng);

        let queue: Arc<JobQueue<Job>> = Arc::new(JobQueue::new());
        let sink = Arc::new(GradientSink {
            buf: Mutex::new(GradBuffer { fv: Fv::new(), scale: 0, error_sum: 0.0 }),
            error_count: AtomicU32::new(0),
        });

        let pool = {
            let sink = Arc::clone(&sink);
            WorkerPool::start(
                &queue,
                workers,
                move |_wn, w: &mut GenWorker, job: Job| gen_gradient(&sink, w, &job),
                |w: &mut GenWorker| w.searcher.clear_tt(),
            )
        };

        let mut result = Ok(());
        loop {
            match self.mini_batch(&queue, &sink) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        queue.request_shutdown();
        pool.join();
        result?;

        info!("completed..");
        info!("elapsed: {:.1}s", timer.elapsed().as_secs_f32());
        info!("end learning");
        Ok(())
    }

    /// 棋譜ファイルを読み込んでジョブ列に展開する
    fn read_csa(&mut self, count: usize, total: usize, path: &Path) -> bool {
        info!("loading ({count}/{total}): [{}]", path.display());

        let mut record = match CsaReader::read(path) {
            Ok(r) => r,
            Err(e) => {
                warn!("could not read csa file [{}]: {e}", path.display());
                return false;
            }
        };

        record.rewind();
        while let Some(mv) = record.next_move() {
            self.jobs.push(Job { board: record.board().to_compact(), mv });
            if !record.make_move() {
                break;
            }
        }
        true
    }

    /// ミニバッチを1回実行する。ジョブが足りなければ `false`。
    fn mini_batch(&mut self, queue: &Arc<JobQueue<Job>>, sink: &GradientSink) -> Result<bool> {
        if self.jobs.len() < MINI_BATCH_LENGTH {
            return Ok(false);
        }
        info!("jobs={}", self.jobs.len());

        {
            let mut buf = sink.buf.lock().expect("gradient lock");
            buf.scale = 0;
            buf.error_sum = 0.0;
        }
        sink.error_count.store(0, Ordering::Relaxed);

        let batch: Vec<Job> = (0..MINI_BATCH_LENGTH)
            .map(|_| self.jobs.pop().expect("length checked"))
            .collect();
        queue.push_all(batch);
        queue.wait_idle();

        let mut buf = sink.buf.lock().expect("gradient lock");
        let scale = buf.scale;
        let mut stats = WeightStats::default();
        update_weights(
            &mut buf.fv.kpp,
            &mut self.w.kpp,
            &mut self.u.kpp,
            scale,
            self.mini_batch_count,
            &mut stats,
        );
        update_weights(
            &mut buf.fv.kkp,
            &mut self.w.kkp,
            &mut self.u.kkp,
            scale,
            self.mini_batch_count,
            &mut stats,
        );

        // 移動平均のテーブルを書き出す
        let mut estats = EvalStats::default();
        average_into(
            self.ctx.eval.kpp(),
            &self.w.kpp,
            &self.u.kpp,
            self.mini_batch_count,
            &mut estats,
        );
        average_into(
            self.ctx.eval.kkp(),
            &self.w.kkp,
            &self.u.kkp,
            self.mini_batch_count,
            &mut estats,
        );
        self.ctx
            .eval
            .write_file(&self.config.eval_out)
            .with_context(|| format!("cannot write {}", self.config.eval_out.display()))?;

        // 次のラウンドの探索は生の w で行う
        reload_raw(self.ctx.eval.kpp(), &self.w.kpp);
        reload_raw(self.ctx.eval.kkp(), &self.w.kkp);

        let error_count = sink.error_count.load(Ordering::Relaxed);
        let error = buf.error_sum / error_count.max(1) as f32;
        info!(
            "mini_batch_count={} error={:.4} max={} magnitude={} non_zero={} max_w={:.3} magnitude_w={:.1} max_u={:.3}",
            self.mini_batch_count,
            error,
            estats.max,
            estats.magnitude,
            estats.non_zero,
            stats.max_w,
            stats.magnitude_w,
            stats.max_u,
        );
        drop(buf);
        self.mini_batch_count += 1;

        self.ctx.eval.clear_cache();
        queue.request_clear();
        Ok(true)
    }
}

/// 1ジョブ分の勾配を共有シンクへ積む
fn gen_gradient(sink: &GradientSink, worker: &mut GenWorker, job: &Job) {
    let Some(mut pos) = Position::from_compact(&job.board) else {
        warn!("broken job board, skipped");
        return;
    };
    let Some(sample) = generate(worker, &mut pos, job.mv, Regime::Online) else {
        return;
    };
    let side = if pos.is_black() { 1.0f32 } else { -1.0f32 };

    // 不一致度の集計（窓の外はクリップして数える）
    let mut err = 0.0f32;
    for &v in &sample.searched {
        let clipped = v.clamp(sample.alpha, sample.beta);
        err += error((clipped - sample.alpha).raw() as f32);
    }
    sink.error_count
        .fetch_add(sample.searched.len() as u32, Ordering::Relaxed);

    let g = gradient_unit() * side;
    let mut buf = sink.buf.lock().expect("gradient lock");
    let mut gsum = 0.0f32;
    for sib in &sample.siblings {
        let leaf = pv_leaf(&pos, &sib.line);
        buf.fv.extract::<true>(&leaf, -g);
        gsum += g;
    }
    let leaf0 = pv_leaf(&pos, &sample.pv0);
    buf.fv.extract::<true>(&leaf0, gsum);

    // 窓に入らなかった兄弟手も0勾配の教師として数に入れる
    buf.scale += NUMBER_OF_SIBLING_NODES;
    buf.error_sum += err;
}

#[derive(Default)]
struct WeightStats {
    max_w: f32,
    magnitude_w: f64,
    max_u: f32,
}

#[derive(Default)]
struct EvalStats {
    max: i32,
    magnitude: u64,
    non_zero: u64,
}

/// 勾配に従って `w` / `u` を更新し、`g` をゼロに戻す
fn update_weights(
    g: &mut [f32],
    w: &mut [f32],
    u: &mut [f32],
    scale: u32,
    count: u32,
    stats: &mut WeightStats,
) {
    for i in 0..g.len() {
        let grad = if scale > 0 { g[i] / scale as f32 } else { 0.0 };
        let f = grad + shrink(w[i]);
        g[i] = 0.0;
        w[i] += f;
        u[i] += f * count as f32;
        stats.max_w = stats.max_w.max(w[i].abs());
        stats.magnitude_w += w[i].abs() as f64;
        stats.max_u = stats.max_u.max(u[i].abs());
    }
}

/// 移動平均 `w - u/count` を丸めて整数テーブルへ入れる
fn average_into(
    slots: &[AtomicI16],
    w: &[f32],
    u: &[f32],
    count: u32,
    stats: &mut EvalStats,
) {
    for i in 0..w.len() {
        let e = (w[i] - u[i] / count as f32).round();
        let e = e.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        slots[i].store(e, Ordering::Relaxed);
        let a = (e as i32).abs();
        stats.max = stats.max.max(a);
        stats.magnitude += a as u64;
        stats.non_zero += (e != 0) as u64;
    }
}

/// 生の `w` を丸めて整数テーブルへ戻す
fn reload_raw(slots: &[AtomicI16], w: &[f32]) {
    for i in 0..w.len() {
        let e = w[i].round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        slots[i].store(e, Ordering::Relaxed);
    }
}
