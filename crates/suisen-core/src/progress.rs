//! 進行度（game progress）の推定
//!
//! 捕獲されて持駒になった駒と盤上の成駒を重み付きで数え、
//! `[0, SCALE]` に正規化する。序盤0、駒の捌き合いが進むほど大きくなる。
//! 学習のヒンジマージンのスケジューリングに使う。

use crate::position::Position;
use crate::types::{Color, PieceType, Square};

/// 進行度の最大値
pub const SCALE: i32 = 1000;

/// 駒種ごとの重み（手駒インデックス順）
const WEIGHTS: [i32; PieceType::HAND_NUM] = [1, 3, 3, 5, 5, 8, 8];

/// この点数で進行度が飽和する
const SATURATION: i32 = 48;

/// 局面の進行度を返す（0 = 序盤, SCALE = 終盤）
pub fn progress(pos: &Position) -> i32 {
    let mut score = 0i32;
    for c in [Color::Black, Color::White] {
        for k in 0..PieceType::HAND_NUM {
            score += WEIGHTS[k] * pos.hand(c, k) as i32;
        }
    }
    for sq in Square::all() {
        let p = pos.piece_on(sq);
        if p.is_none() {
            continue;
        }
        let pt = p.piece_type();
        if pt.is_promoted() {
            if let Some(k) = pt.unpromote().hand_index() {
                score += WEIGHTS[k];
            }
        }
    }
    (score * SCALE / SATURATION).min(SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Piece;

    #[test]
    fn test_progress_hirate_is_zero() {
        assert_eq!(progress(&Position::hirate()), 0);
    }

    #[test]
    fn test_progress_increases_with_captures() {
        let mut pos = Position::hirate();
        pos.set_hand(Color::Black, PieceType::Rook, 1);
        let p1 = progress(&pos);
        assert!(p1 > 0);
        pos.set_hand(Color::White, PieceType::Gold, 2);
        assert!(progress(&pos) > p1);
    }

    #[test]
    fn test_progress_saturates() {
        let mut pos = Position::hirate();
        pos.set_hand(Color::Black, PieceType::Pawn, 18);
        pos.set_hand(Color::Black, PieceType::Rook, 2);
        pos.set_hand(Color::Black, PieceType::Bishop, 2);
        pos.set_hand(Color::White, PieceType::Gold, 4);
        pos.set_hand(Color::White, PieceType::Silver, 4);
        assert_eq!(progress(&pos), SCALE);
    }

    #[test]
    fn test_progress_counts_promoted_pieces() {
        let mut pos = Position::hirate();
        pos.set_piece(
            Square::new(4, 4).unwrap(),
            Piece::new(Color::Black, PieceType::Dragon),
        );
        assert!(progress(&pos) > 0);
    }
}
