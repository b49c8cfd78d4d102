//! 訓練データ生成（両レジーム共通）
//!
//! (局面, 実戦の指し手) の組に対して、実戦手とその兄弟手を探索し、
//! 窓に入ったPVを集める。オンライン学習はこの結果から直接勾配を
//! 積み、バッチ学習は訓練データファイルへ書き出す。

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;
use suisen_core::movegen::MoveGenerator;
use suisen_core::position::Position;
use suisen_core::progress;
use suisen_core::search::{standard_tree_size, SearchConfig, Searcher};
use suisen_core::types::{Move, Value};
use suisen_core::ParamCtx;

/// ヒンジマージンの下限（序盤）
pub const MIN_HINGE_MARGIN: i32 = 10;
/// ヒンジマージンの上限（終盤）
pub const MAX_HINGE_MARGIN: i32 = 256;
/// 1ジョブあたりの兄弟手の探索上限（オンライン）
pub const NUMBER_OF_SIBLING_NODES: u32 = 16;
/// バッチ学習の固定探索窓
pub const SEARCH_WINDOW: i32 = 256;

/// 学習レジーム
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// ヒンジマージン窓・兄弟手は16手まで
    Online,
    /// 固定窓・全兄弟手。実戦手が王手のときだけ1手延長する。
    Batch,
}

/// ワーカごとの生成状態（探索器と乱数）
pub struct GenWorker {
    pub searcher: Searcher,
    pub rng: Xoshiro256PlusPlus,
}

impl GenWorker {
    /// 学習用の設定で探索器を組み立てる
    pub fn new(ctx: Arc<ParamCtx>, depth: u8, seed: u64) -> GenWorker {
        let mut searcher = Searcher::new(ctx);
        searcher.set_config(SearchConfig {
            max_depth: depth,
            worker_size: 1,
            tree_size: standard_tree_size(1),
            enable_limit: false,
            enable_time_management: false,
            ponder: false,
            logging: false,
            learning: true,
        });
        GenWorker { searcher, rng: Xoshiro256PlusPlus::seed_from_u64(seed) }
    }
}

/// 窓に入った兄弟手
#[derive(Debug, Clone)]
pub struct Sibling {
    pub mv: Move,
    pub value: Value,
    /// 兄弟手自身を先頭に含むPV
    pub line: Vec<Move>,
}

/// 1ジョブ分の生成結果
#[derive(Debug, Clone)]
pub struct Sample {
    /// 実戦手の評価値（ルート手番から見た値）
    pub v0: Value,
    /// 実戦手を先頭に含むPV
    pub pv0: Vec<Move>,
    /// 窓の下限
    pub alpha: Value,
    /// 窓の上限
    pub beta: Value,
    /// 窓に入った兄弟手
    pub siblings: Vec<Sibling>,
    /// 探索した全兄弟手の値（不一致度の集計用）
    pub searched: Vec<Value>,
    /// 窓の上側に外れた兄弟手の数
    pub out_of_window: u32,
}

/// 進行度に応じたヒンジマージン（序盤10 〜 終盤256）
pub fn hinge_margin(pos: &Position) -> i32 {
    let prog = progress::progress(pos) as f32 / progress::SCALE as f32;
    let margin = MIN_HINGE_MARGIN as f32 + (MAX_HINGE_MARGIN - MIN_HINGE_MARGIN) as f32 * prog;
    margin.round() as i32
}

/// PVの末端局面を得る
///
/// 先頭の手は履歴を破棄して適用し、以降は不正・空の手に当たった時点で打ち切る。
pub fn pv_leaf(root: &Position, line: &[Move]) -> Position {
    let mut pos = root.clone();
    let mut iter = line.iter();
    if let Some(&first) = iter.next() {
        if !pos.make_move_irr(first) {
            return pos;
        }
    }
    for &mv in iter {
        if mv.is_none() || !pos.make_move(mv) {
            break;
        }
    }
    pos
}

/// (局面, 実戦手) から訓練サンプルを生成する
///
/// 学習信号がない場合（合法手が2手未満、実戦手が適用できない、
/// 実戦手の評価が詰みスコア）は `None` を返す。`pos` は呼び出し後に
/// 元の局面へ戻っている。
pub fn generate(
    worker: &mut GenWorker,
    pos: &mut Position,
    move0: Move,
    regime: Regime,
) -> Option<Sample> {
    let mut moves = MoveGenerator::generate(pos);
    if moves.len() < 2 {
        return None;
    }

    worker.searcher.clear_history();

    // 実戦手の探索。バッチでは王手の実戦手に限り1手深くする。
    let deep0 = regime == Regime::Batch && pos.gives_check(move0);
    if !pos.make_move(move0) {
        return None;
    }
    worker
        .searcher
        .search_bounded(pos, -Value::INFINITE, Value::INFINITE, deep0);
    let v0 = -worker.searcher.info().eval;
    let mut pv0 = vec![move0];
    pv0.extend_from_slice(worker.searcher.info().pv.moves());
    pos.unmake_move();

    // 詰みは除外
    if v0.is_mate_score() {
        return None;
    }

    // 実戦手の評価値から窓を決める
    let (alpha, beta) = match regime {
        Regime::Online => (
            v0 - Value::new(hinge_margin(pos)),
            v0 + Value::new(MAX_HINGE_MARGIN),
        ),
        Regime::Batch => (
            v0 - Value::new(SEARCH_WINDOW),
            v0 + Value::new(SEARCH_WINDOW),
        ),
    };

    moves.as_mut_slice().shuffle(&mut worker.rng);

    let mut sample = Sample {
        v0,
        pv0,
        alpha,
        beta,
        siblings: Vec::new(),
        searched: Vec::new(),
        out_of_window: 0,
    };

    for &mv in moves.iter() {
        if mv == move0 {
            continue;
        }
        if regime == Regime::Online
            && sample.searched.len() as u32 >= NUMBER_OF_SIBLING_NODES
        {
            break;
        }

        if !pos.make_move(mv) {
            continue;
        }
        // 王手の1手延長は実戦手だけ。兄弟手は設定どおりの深さで探索する。
        worker.searcher.search_bounded(pos, -beta, -alpha, false);
        let val = -worker.searcher.info().eval;
        let pv = worker.searcher.info().pv.moves().to_vec();
        pos.unmake_move();

        sample.searched.push(val);

        if val <= alpha {
            continue;
        }
        if val >= beta {
            sample.out_of_window += 1;
            continue;
        }

        let mut line = vec![mv];
        line.extend_from_slice(&pv);
        sample.siblings.push(Sibling { mv, value: val, line });
    }

    Some(sample)
}
