//! 指し手生成
//!
//! 合法手（自玉を相手の利きに晒さない手）のみを返す。盤上の駒の移動は
//! 成り・不成の両方を生成し、行き所のない駒になる不成は生成しない。
//! 打ち歩詰めの除外は行わない。

use crate::position::Position;
use crate::types::{Color, Move, Moves, PieceType, Square};

/// 指し手生成器
pub struct MoveGenerator;

impl MoveGenerator {
    /// 全合法手を生成する
    pub fn generate(pos: &mut Position) -> Moves {
        let mut moves = Moves::new();
        let us = pos.side_to_move();

        // 盤上の駒
        for from in Square::all() {
            let p = pos.piece_on(from);
            if p.is_none() || p.color() != us {
                continue;
            }
            for to in Square::all() {
                let t = pos.piece_on(to);
                if !t.is_none() && t.color() == us {
                    continue;
                }
                if !pos.can_attack(p, from, to) {
                    continue;
                }
                let black = us == Color::Black;
                let pt = p.piece_type();
                if pt.can_promote()
                    && (from.relative_rank(black) < 3 || to.relative_rank(black) < 3)
                {
                    push_if_legal(pos, Move::board(from, to, true), &mut moves);
                }
                if pos.is_valid_promotion(p, from, to, false) {
                    push_if_legal(pos, Move::board(from, to, false), &mut moves);
                }
            }
        }

        // 駒打ち
        for k in 0..PieceType::HAND_NUM {
            if pos.hand(us, k) == 0 {
                continue;
            }
            let pt = PieceType::from_hand_index(k).expect("hand index");
            for to in Square::all() {
                if !pos.piece_on(to).is_none() {
                    continue;
                }
                if !pos.is_valid_drop(pt, to) {
                    continue;
                }
                push_if_legal(pos, Move::drop(pt, to), &mut moves);
            }
        }

        moves
    }
}

/// 王手放置にならない手だけを加える
fn push_if_legal(pos: &mut Position, mv: Move, moves: &mut Moves) {
    if pos.make_move(mv) {
        pos.unmake_move();
        moves.push(mv);
    }
}
