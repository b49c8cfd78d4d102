//! CSA形式の棋譜リーダ
//!
//! 学習で必要な範囲のCSA標準棋譜形式（V2系）を読む。
//! 対応: PI / P1-P9 / P+ P-（持駒・盤上・AL）/ 手番行 / 指し手 /
//! T行・N行・$行・コメント行・%終局・カンマ区切り。

use super::Record;
use crate::position::Position;
use crate::types::{Color, Move, Piece, PieceType, Square};
use std::fmt;
use std::io;
use std::path::Path;

/// CSA読み込みエラー
#[derive(Debug)]
pub enum CsaError {
    Io(io::Error),
    Parse { line: usize, msg: String },
}

impl fmt::Display for CsaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsaError::Io(e) => write!(f, "io error: {e}"),
            CsaError::Parse { line, msg } => write!(f, "parse error at line {line}: {msg}"),
        }
    }
}

impl std::error::Error for CsaError {}

impl From<io::Error> for CsaError {
    fn from(e: io::Error) -> CsaError {
        CsaError::Io(e)
    }
}

/// CSA棋譜リーダ
pub struct CsaReader;

impl CsaReader {
    /// ファイルから棋譜を読み込む
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Record, CsaError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// テキストから棋譜を読み込む
    pub fn parse(text: &str) -> Result<Record, CsaError> {
        let mut parser = Parser::default();
        for (ln, raw) in text.lines().enumerate() {
            for seg in raw.split(',') {
                let seg = seg.trim_end();
                if seg.is_empty() {
                    continue;
                }
                parser.statement(ln + 1, seg)?;
                if parser.finished {
                    break;
                }
            }
            if parser.finished {
                break;
            }
        }
        parser.into_record(text.lines().count())
    }
}

#[derive(Default)]
struct Parser {
    board_seen: bool,
    setup: Option<Position>,
    side: Option<Color>,
    record: Option<Record>,
    finished: bool,
}

impl Parser {
    fn statement(&mut self, ln: usize, s: &str) -> Result<(), CsaError> {
        if !s.is_ascii() {
            return err(ln, "non-ascii statement");
        }
        match s.as_bytes()[0] {
            b'\'' | b'V' | b'N' | b'$' | b'T' => Ok(()),
            b'%' => {
                self.finished = true;
                Ok(())
            }
            b'P' => self.board_line(ln, s),
            b'+' | b'-' => {
                if s.len() == 1 {
                    // 手番行
                    let c = if s == "+" { Color::Black } else { Color::White };
                    if self.record.is_some() {
                        return err(ln, "turn line after moves");
                    }
                    self.side = Some(c);
                    Ok(())
                } else {
                    self.move_line(ln, s)
                }
            }
            _ => err(ln, "unknown statement"),
        }
    }

    fn board_line(&mut self, ln: usize, s: &str) -> Result<(), CsaError> {
        if self.record.is_some() {
            return err(ln, "board line after moves");
        }
        if s == "PI" {
            self.setup = Some(Position::hirate());
            self.board_seen = true;
            return Ok(());
        }
        let pos = self.setup.get_or_insert_with(Position::empty);
        let b = s.as_bytes();
        if b.len() >= 2 && b[1].is_ascii_digit() && b[1] != b'0' {
            // P1-P9: 9筋から1筋へ並ぶ
            let rank = b[1] - b'1';
            let cells = &s[2..];
            for (i, cell) in cells.as_bytes().chunks(3).enumerate() {
                if i >= 9 {
                    return err(ln, "too many cells in board row");
                }
                let file = 8 - i as u8;
                let cell = std::str::from_utf8(cell).map_err(|_| parse(ln, "bad cell"))?;
                if cell.trim() == "*" || cell.len() < 3 {
                    continue;
                }
                let color = side_char(cell.as_bytes()[0]).ok_or_else(|| parse(ln, "bad cell side"))?;
                let pt = piece_code(&cell[1..3]).ok_or_else(|| parse(ln, "bad piece code"))?;
                let sq = Square::new(file, rank).ok_or_else(|| parse(ln, "bad square"))?;
                pos.set_piece(sq, Piece::new(color, pt));
            }
            self.board_seen = true;
            return Ok(());
        }
        if b.len() >= 2 && (b[1] == b'+' || b[1] == b'-') {
            // P+ / P-: 駒の追加（盤上・持駒・AL）
            let color = side_char(b[1]).expect("checked");
            let rest = &s[2..];
            for chunk in rest.as_bytes().chunks(4) {
                let item = std::str::from_utf8(chunk).map_err(|_| parse(ln, "bad placement"))?;
                if item.len() < 4 {
                    return err(ln, "short placement");
                }
                if &item[2..4] == "AL" {
                    assign_rest(pos, color);
                    continue;
                }
                let pt = piece_code(&item[2..4]).ok_or_else(|| parse(ln, "bad piece code"))?;
                if &item[0..2] == "00" {
                    let base = pt.unpromote();
                    let k = base.hand_index().ok_or_else(|| parse(ln, "king in hand"))?;
                    let n = pos.hand(color, k);
                    pos.set_hand(color, base, n + 1);
                } else {
                    let sq = csa_square(&item[0..2]).ok_or_else(|| parse(ln, "bad square"))?;
                    pos.set_piece(sq, Piece::new(color, pt));
                }
            }
            self.board_seen = true;
            return Ok(());
        }
        err(ln, "bad board line")
    }

    fn move_line(&mut self, ln: usize, s: &str) -> Result<(), CsaError> {
        if s.len() < 7 {
            return err(ln, "short move");
        }
        if self.record.is_none() {
            let mut pos = if self.board_seen {
                self.setup.take().ok_or_else(|| parse(ln, "no board"))?
            } else {
                Position::hirate()
            };
            pos.set_side_to_move(self.side.unwrap_or(Color::Black));
            if !pos.validate() {
                return err(ln, "invalid initial board");
            }
            self.record = Some(Record::new(pos));
        }
        let record = self.record.as_mut().expect("initialized above");

        let color = side_char(s.as_bytes()[0]).ok_or_else(|| parse(ln, "bad move side"))?;
        if color != record.board().side_to_move() {
            return err(ln, "move side mismatch");
        }
        let to = csa_square(&s[3..5]).ok_or_else(|| parse(ln, "bad to square"))?;
        let pt = piece_code(&s[5..7]).ok_or_else(|| parse(ln, "bad piece code"))?;

        let mv = if &s[1..3] == "00" {
            if pt.is_promoted() || pt == PieceType::King {
                return err(ln, "cannot drop this piece");
            }
            Move::drop(pt, to)
        } else {
            let from = csa_square(&s[1..3]).ok_or_else(|| parse(ln, "bad from square"))?;
            let p = record.board().piece_on(from);
            if p.is_none() {
                return err(ln, "no piece on from square");
            }
            let promote = if p.piece_type() == pt {
                false
            } else if p.piece_type().promote() == Some(pt) {
                true
            } else {
                return err(ln, "piece code mismatch");
            };
            Move::board(from, to, promote)
        };

        if !record.append(mv) {
            return err(ln, "illegal move");
        }
        Ok(())
    }

    fn into_record(self, last_line: usize) -> Result<Record, CsaError> {
        match self.record {
            Some(r) => Ok(r),
            None => {
                // 指し手が1手もない棋譜。初期局面だけの棋譜として返す。
                let mut pos = match self.setup {
                    Some(p) => p,
                    None => Position::hirate(),
                };
                pos.set_side_to_move(self.side.unwrap_or(Color::Black));
                if !pos.validate() {
                    return err(last_line, "invalid initial board");
                }
                Ok(Record::new(pos))
            }
        }
    }
}

fn err<T>(line: usize, msg: &str) -> Result<T, CsaError> {
    Err(parse(line, msg))
}

fn parse(line: usize, msg: &str) -> CsaError {
    CsaError::Parse { line, msg: msg.to_string() }
}

fn side_char(c: u8) -> Option<Color> {
    match c {
        b'+' => Some(Color::Black),
        b'-' => Some(Color::White),
        _ => None,
    }
}

fn csa_square(s: &str) -> Option<Square> {
    let b = s.as_bytes();
    if b.len() != 2 {
        return None;
    }
    let file = b[0].checked_sub(b'1')?;
    let rank = b[1].checked_sub(b'1')?;
    Square::new(file, rank)
}

fn piece_code(s: &str) -> Option<PieceType> {
    match s {
        "FU" => Some(PieceType::Pawn),
        "KY" => Some(PieceType::Lance),
        "KE" => Some(PieceType::Knight),
        "GI" => Some(PieceType::Silver),
        "KI" => Some(PieceType::Gold),
        "KA" => Some(PieceType::Bishop),
        "HI" => Some(PieceType::Rook),
        "OU" => Some(PieceType::King),
        "TO" => Some(PieceType::Tokin),
        "NY" => Some(PieceType::ProLance),
        "NK" => Some(PieceType::ProKnight),
        "NG" => Some(PieceType::ProSilver),
        "UM" => Some(PieceType::Horse),
        "RY" => Some(PieceType::Dragon),
        _ => None,
    }
}

/// 盤上と両者の持駒に現れない駒を全て `color` の持駒に加える（AL指定）
fn assign_rest(pos: &mut Position, color: Color) {
    const TOTALS: [u8; PieceType::HAND_NUM] = [18, 4, 4, 4, 4, 2, 2];
    let mut used = [0u8; PieceType::HAND_NUM];
    for sq in Square::all() {
        let p = pos.piece_on(sq);
        if p.is_none() || p.piece_type() == PieceType::King {
            continue;
        }
        if let Some(k) = p.piece_type().unpromote().hand_index() {
            used[k] += 1;
        }
    }
    for c in [Color::Black, Color::White] {
        for k in 0..PieceType::HAND_NUM {
            used[k] += pos.hand(c, k);
        }
    }
    for k in 0..PieceType::HAND_NUM {
        let rest = TOTALS[k].saturating_sub(used[k]);
        if rest > 0 {
            let pt = PieceType::from_hand_index(k).expect("hand index");
            let n = pos.hand(color, k);
            pos.set_hand(color, pt, n + rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_game() {
        let text = "\
V2.2
N+sente
N-gote
PI
+
+7776FU,T12
-3334FU
+8822UM
-3122GI
%TORYO
";
        let mut r = CsaReader::parse(text).unwrap();
        assert_eq!(r.len(), 4);
        r.rewind();
        assert!(r.board().is_black());
        assert_eq!(r.next_move().unwrap().to_string(), "7g7f");
        assert!(r.make_move());
        assert_eq!(r.next_move().unwrap().to_string(), "3c3d");
    }

    #[test]
    fn test_parse_promotion_and_drop() {
        let text = "\
PI
+
+7776FU
-3334FU
+8822UM
-3122GI
+0055KA
";
        let mut r = CsaReader::parse(text).unwrap();
        assert_eq!(r.len(), 5);
        r.rewind();
        for _ in 0..2 {
            assert!(r.make_move());
        }
        // 8822UM: 角が成って馬になる
        let mv = r.next_move().unwrap();
        assert!(mv.is_promotion());
        assert!(r.make_move());
        assert!(r.make_move());
        // 0055KA: 取った角を打つ
        let mv = r.next_move().unwrap();
        assert!(mv.is_drop());
        assert_eq!(mv.drop_piece(), Some(PieceType::Bishop));
    }

    #[test]
    fn test_parse_explicit_board() {
        let text = "\
P1 *  *  *  *  * -OU *  *  *
P9 *  *  * +OU *  *  *  *  *
P+00KI
P-00AL
+
+0052KI
";
        let mut r = CsaReader::parse(text).unwrap();
        assert_eq!(r.len(), 1);
        r.rewind();
        let pos = r.board();
        assert_eq!(pos.hand(Color::Black, PieceType::Gold.hand_index().unwrap()), 1);
        // ALで残りの駒が後手の持駒になっている
        assert_eq!(pos.hand(Color::White, PieceType::Pawn.hand_index().unwrap()), 18);
        assert_eq!(pos.hand(Color::White, PieceType::Gold.hand_index().unwrap()), 3);
    }

    #[test]
    fn test_parse_rejects_illegal_move() {
        let text = "PI\n+\n+7775FU\n";
        assert!(CsaReader::parse(text).is_err());
    }

    #[test]
    fn test_read_missing_file() {
        assert!(matches!(
            CsaReader::read("/nonexistent/game.csa"),
            Err(CsaError::Io(_))
        ));
    }
}
