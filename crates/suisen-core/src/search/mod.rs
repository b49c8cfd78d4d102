//! 探索（固定深さのアルファベータ + 静止探索）
//!
//! 学習のデータ生成で使う単一スレッドの探索器。`SearchConfig::learning`
//! を立てると置換表を一切使わず、局面間で状態を持ち越さない。

mod history;
mod tt;

use crate::eval::ParamCtx;
use crate::movegen::MoveGenerator;
use crate::position::Position;
use crate::types::{Move, Moves, Value};
use history::History;
use smallvec::SmallVec;
use std::sync::Arc;
use tt::{Bound, TranspositionTable};

/// 静止探索を含めた最大深さ
const MAX_PLY: u8 = 64;

/// ワーカ数に応じた標準の置換表サイズ
pub fn standard_tree_size(worker_size: u32) -> u32 {
    worker_size * (1 << 16)
}

/// 探索設定
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// 探索深さ
    pub max_depth: u8,
    /// ワーカ数（この探索器は1のみ対応）
    pub worker_size: u32,
    /// 置換表サイズ（エントリ数）
    pub tree_size: u32,
    /// ノード数制限を有効にするか
    pub enable_limit: bool,
    /// 時間管理を有効にするか
    pub enable_time_management: bool,
    /// 先読み（ponder）
    pub ponder: bool,
    /// 探索ログ
    pub logging: bool,
    /// 学習モード（置換表を無効化し、局面間の再現性を確保する）
    pub learning: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_depth: 5,
            worker_size: 1,
            tree_size: standard_tree_size(1),
            enable_limit: true,
            enable_time_management: true,
            ponder: false,
            logging: true,
            learning: false,
        }
    }
}

/// 読み筋（principal variation）
#[derive(Debug, Clone, Default)]
pub struct Pv {
    moves: SmallVec<[Move; 32]>,
}

impl Pv {
    pub fn new() -> Pv {
        Pv::default()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.moves.clear();
    }

    /// 先頭の1手と後続の読み筋から組み立てる
    #[inline]
    pub fn set(&mut self, mv: Move, tail: &Pv) {
        self.moves.clear();
        self.moves.push(mv);
        self.moves.extend_from_slice(&tail.moves);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    #[inline]
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// 既存の手列から作る
    pub fn from_moves(moves: &[Move]) -> Pv {
        Pv { moves: SmallVec::from_slice(moves) }
    }
}

/// 探索結果
#[derive(Debug, Clone, Default)]
pub struct SearchInfo {
    /// 手番側から見た評価値
    pub eval: Value,
    /// 読み筋
    pub pv: Pv,
    /// 探索ノード数
    pub nodes: u64,
}

/// 探索器
pub struct Searcher {
    ctx: Arc<ParamCtx>,
    config: SearchConfig,
    history: History,
    tt: TranspositionTable,
    info: SearchInfo,
}

impl Searcher {
    /// パラメータを借りて探索器を作る
    pub fn new(ctx: Arc<ParamCtx>) -> Searcher {
        let config = SearchConfig::default();
        let tt = TranspositionTable::new(config.tree_size as usize);
        Searcher { ctx, config, history: History::new(), tt, info: SearchInfo::default() }
    }

    /// 現在の設定
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// 設定を入れ替える
    pub fn set_config(&mut self, config: SearchConfig) {
        debug_assert_eq!(config.worker_size, 1);
        if config.tree_size != self.config.tree_size {
            self.tt = TranspositionTable::new(config.tree_size as usize);
        }
        self.config = config;
    }

    /// 直近の探索結果
    #[inline]
    pub fn info(&self) -> &SearchInfo {
        &self.info
    }

    /// 履歴表を初期化する
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// 置換表を初期化する
    pub fn clear_tt(&mut self) {
        self.tt.clear();
    }

    /// 全幅の窓で探索する。合法手がなければ `false`。
    pub fn search(&mut self, pos: &mut Position) -> bool {
        self.search_bounded(pos, -Value::INFINITE, Value::INFINITE, false)
    }

    /// 窓 `[alpha, beta]` で探索する。`deep` で1手深くする。
    pub fn search_bounded(
        &mut self,
        pos: &mut Position,
        alpha: Value,
        beta: Value,
        deep: bool,
    ) -> bool {
        let depth = self.config.max_depth.max(1) + deep as u8;
        self.info = SearchInfo::default();

        let mut moves = MoveGenerator::generate(pos);
        if moves.is_empty() {
            self.info.eval = Value::mated_in(0);
            return false;
        }
        self.order_moves(pos, &mut moves, Move::NONE);

        let mut best = -Value::INFINITE;
        let mut pv = Pv::new();
        let mut child = Pv::new();
        let mut a = alpha;
        for &mv in moves.iter() {
            let ok = pos.make_move(mv);
            debug_assert!(ok, "generated move must be legal");
            if !ok {
                continue;
            }
            let val = -self.alpha_beta(pos, depth - 1, 1, -beta, -a, &mut child);
            pos.unmake_move();

            if val > best {
                best = val;
                pv.set(mv, &child);
                if val > a {
                    a = val;
                }
                if val >= beta {
                    break;
                }
            }
        }

        self.info.eval = best;
        self.info.pv = pv;
        if self.config.logging {
            log::debug!(
                "search depth={} eval={} nodes={} pv_len={}",
                depth,
                best.raw(),
                self.info.nodes,
                self.info.pv.len()
            );
        }
        true
    }

    fn alpha_beta(
        &mut self,
        pos: &mut Position,
        depth: u8,
        ply: u8,
        alpha: Value,
        beta: Value,
        pv: &mut Pv,
    ) -> Value {
        pv.clear();
        if depth == 0 {
            return self.qsearch(pos, ply, alpha, beta);
        }
        self.info.nodes += 1;

        let key = pos.hash();
        let mut tt_move = Move::NONE;
        if !self.config.learning {
            if let Some((val, d, bound, mv)) = self.tt.probe(key) {
                tt_move = mv;
                if d >= depth {
                    match bound {
                        Bound::Exact => return val,
                        Bound::Lower if val >= beta => return val,
                        Bound::Upper if val <= alpha => return val,
                        _ => {}
                    }
                }
            }
        }

        let mut moves = MoveGenerator::generate(pos);
        if moves.is_empty() {
            return Value::mated_in(ply as i32);
        }
        self.order_moves(pos, &mut moves, tt_move);

        let mut best = -Value::INFINITE;
        let mut best_move = Move::NONE;
        let mut child = Pv::new();
        let mut a = alpha;
        for &mv in moves.iter() {
            if !pos.make_move(mv) {
                continue;
            }
            let val = -self.alpha_beta(pos, depth - 1, ply + 1, -beta, -a, &mut child);
            pos.unmake_move();

            if val > best {
                best = val;
                best_move = mv;
                pv.set(mv, &child);
                if val > a {
                    a = val;
                }
                if val >= beta {
                    if pos.piece_on(mv.to()).is_none() && !mv.is_drop() {
                        self.history.add(mv, depth);
                    }
                    break;
                }
            }
        }

        if !self.config.learning {
            let bound = if best >= beta {
                Bound::Lower
            } else if best <= alpha {
                Bound::Upper
            } else {
                Bound::Exact
            };
            self.tt.store(key, best, depth, bound, best_move);
        }
        best
    }

    fn qsearch(&mut self, pos: &mut Position, ply: u8, alpha: Value, beta: Value) -> Value {
        self.info.nodes += 1;

        let in_check = pos.in_check();
        let mut best = if in_check {
            -Value::INFINITE
        } else {
            self.ctx.evaluate_stm(pos)
        };
        if ply >= MAX_PLY || (!in_check && best >= beta) {
            return best;
        }
        let mut a = alpha.max(best);

        let mut moves = MoveGenerator::generate(pos);
        if in_check && moves.is_empty() {
            return Value::mated_in(ply as i32);
        }
        if !in_check {
            moves.retain(|mv| !mv.is_drop() && !pos.piece_on(mv.to()).is_none());
        }
        self.order_moves(pos, &mut moves, Move::NONE);

        for &mv in moves.iter() {
            if !pos.make_move(mv) {
                continue;
            }
            let val = -self.qsearch(pos, ply + 1, -beta, -a);
            pos.unmake_move();
            if val > best {
                best = val;
                if val > a {
                    a = val;
                }
                if val >= beta {
                    break;
                }
            }
        }
        best
    }

    /// 置換表の手・取る手（交換値順）・履歴の順に並べる
    fn order_moves(&self, pos: &Position, moves: &mut Moves, tt_move: Move) {
        moves.sort_by_cached_key(|&mv| {
            let mut score = 0i64;
            if mv == tt_move && !mv.is_none() {
                score += 1 << 40;
            }
            let captured = pos.piece_on(mv.to());
            if !captured.is_none() {
                score += (1 << 20) + self.ctx.material.piece_exchange(captured.piece_type()).raw() as i64;
            } else {
                score += self.history.get(mv) as i64;
            }
            -score
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Color, Piece, PieceType, Square};

    fn sq(file: u8, rank: u8) -> Square {
        Square::new(file, rank).unwrap()
    }

    fn learning_searcher(ctx: Arc<ParamCtx>, depth: u8) -> Searcher {
        let mut s = Searcher::new(ctx);
        let config = SearchConfig {
            max_depth: depth,
            worker_size: 1,
            tree_size: standard_tree_size(1),
            enable_limit: false,
            enable_time_management: false,
            ponder: false,
            logging: false,
            learning: true,
        };
        s.set_config(config);
        s
    }

    #[test]
    fn test_search_returns_pv() {
        let ctx = Arc::new(ParamCtx::new());
        let mut s = learning_searcher(ctx, 2);
        let mut pos = Position::hirate();
        assert!(s.search(&mut pos));
        let info = s.info();
        assert!(!info.pv.is_empty());
        assert!(info.nodes > 0);
        // 読み筋は現局面から順に再生できる
        let mut replay = pos.clone();
        for &mv in info.pv.moves() {
            assert!(replay.make_move(mv), "pv move must be legal: {mv}");
        }
    }

    #[test]
    fn test_search_finds_mate_in_one() {
        let ctx = Arc::new(ParamCtx::new());
        let mut s = learning_searcher(ctx, 2);
        let mut pos = Position::empty();
        pos.set_piece(sq(4, 0), Piece::new(Color::White, PieceType::King));
        pos.set_piece(sq(4, 2), Piece::new(Color::Black, PieceType::Gold));
        pos.set_piece(sq(4, 5), Piece::new(Color::Black, PieceType::Rook));
        pos.set_piece(sq(8, 8), Piece::new(Color::Black, PieceType::King));
        assert!(pos.validate());
        assert!(s.search(&mut pos));
        assert!(s.info().eval.is_win(), "eval={:?}", s.info().eval);
        assert_eq!(s.info().pv.moves()[0], Move::board(sq(4, 2), sq(4, 1), false));
    }

    #[test]
    fn test_search_no_legal_moves() {
        let ctx = Arc::new(ParamCtx::new());
        let mut s = learning_searcher(ctx, 2);
        // 詰まされた玉
        let mut pos = Position::empty();
        pos.set_piece(sq(0, 0), Piece::new(Color::Black, PieceType::King));
        pos.set_piece(sq(4, 8), Piece::new(Color::White, PieceType::King));
        pos.set_piece(sq(0, 2), Piece::new(Color::White, PieceType::Dragon));
        pos.set_piece(sq(2, 0), Piece::new(Color::White, PieceType::Dragon));
        assert!(pos.validate());
        assert!(!s.search(&mut pos));
        assert!(s.info().eval.is_loss());
    }

    #[test]
    fn test_bounded_search_respects_window() {
        let ctx = Arc::new(ParamCtx::new());
        let mut s = learning_searcher(ctx, 1);
        let mut pos = Position::hirate();
        // 非常に狭い窓でも値は返る（fail-soft）
        assert!(s.search_bounded(&mut pos, Value::new(-1), Value::new(1), false));
        let _ = s.info().eval;
    }

    #[test]
    fn test_deep_flag_extends_depth() {
        let ctx = Arc::new(ParamCtx::new());
        let mut s = learning_searcher(ctx, 1);
        let mut pos = Position::hirate();
        assert!(s.search_bounded(&mut pos, -Value::INFINITE, Value::INFINITE, false));
        let shallow_nodes = s.info().nodes;
        assert!(s.search_bounded(&mut pos, -Value::INFINITE, Value::INFINITE, true));
        assert!(s.info().nodes > shallow_nodes);
    }
}
