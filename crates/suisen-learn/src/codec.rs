//! 訓練データファイルの読み書き
//!
//! 1ブロックの構造:
//!
//! ```text
//! CompactBoard                  // ルート局面（固定長）
//! repeat:
//!   u8  length                  // 0 でブロック終端
//!   u16 move_codes[length-1]    // 16ビットの指し手列
//! ```
//!
//! 先頭のPVは実戦の指し手のもの、続いて窓に入った兄弟手のPVが並ぶ。

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use suisen_core::position::{CompactBoard, Position};
use suisen_core::types::Move;

/// 訓練データの書き出し
pub struct TrainingWriter {
    w: BufWriter<File>,
}

impl TrainingWriter {
    /// ファイルを新規作成する
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<TrainingWriter> {
        Ok(TrainingWriter { w: BufWriter::new(File::create(path)?) })
    }

    /// 1ブロック（ルート局面と全PV）を書き出す
    ///
    /// 各PVは先頭が候補手でなければならない。255手を超えるPVは
    /// 書式の上限まで切り詰める。
    pub fn write_block(&mut self, root: &CompactBoard, pvs: &[&[Move]]) -> io::Result<()> {
        self.w.write_all(root.as_bytes())?;
        for pv in pvs {
            let n = pv.len().min(u8::MAX as usize - 1);
            self.w.write_all(&[(n + 1) as u8])?;
            for mv in &pv[..n] {
                self.w.write_all(&mv.serialize16().to_le_bytes())?;
            }
        }
        self.w.write_all(&[0u8])
    }

    /// バッファを書き切って閉じる
    pub fn finish(mut self) -> io::Result<()> {
        self.w.flush()
    }
}

/// PV読み出しの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvRead {
    /// ブロック終端（length = 0）
    End,
    /// PVを盤面に再生できた
    Ok,
    /// 壊れたPV。バイト列は消費済みで、盤面は途中までの状態。
    Broken,
}

/// 訓練データの読み込み
pub struct TrainingReader {
    r: BufReader<File>,
}

impl TrainingReader {
    /// ファイルを開く
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<TrainingReader> {
        Ok(TrainingReader { r: BufReader::new(File::open(path)?) })
    }

    /// 次のブロックのルート局面を読む。きれいなEOFなら `None`。
    pub fn next_root(&mut self) -> io::Result<Option<CompactBoard>> {
        let mut buf = [0u8; CompactBoard::SIZE];
        match self.r.read_exact(&mut buf) {
            Ok(()) => Ok(Some(CompactBoard::from_bytes(buf))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 長さつきPVを1本消費し、`pos` に再生する
    ///
    /// 不正・空の指し手に当たってもPVの残りバイトは消費し、
    /// ストリームの同期を保ったまま `Broken` を返す。
    pub fn read_pv(&mut self, pos: &mut Position) -> io::Result<PvRead> {
        let mut len = [0u8; 1];
        self.r.read_exact(&mut len)?;
        if len[0] == 0 {
            return Ok(PvRead::End);
        }
        let count = len[0] as usize - 1;
        let mut ok = true;
        for _ in 0..count {
            let mut code = [0u8; 2];
            self.r.read_exact(&mut code)?;
            if !ok {
                continue;
            }
            let raw = u16::from_le_bytes(code);
            match Move::deserialize16(raw, pos) {
                Some(mv) if pos.make_move(mv) => {}
                _ => ok = false,
            }
        }
        Ok(if ok { PvRead::Ok } else { PvRead::Broken })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suisen_core::types::Square;

    fn mv(f0: u8, r0: u8, f1: u8, r1: u8) -> Move {
        Move::board(
            Square::new(f0, r0).unwrap(),
            Square::new(f1, r1).unwrap(),
            false,
        )
    }

    #[test]
    fn test_block_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");

        let root = Position::hirate();
        let cb = root.to_compact();
        let pv0 = [mv(6, 6, 6, 5), mv(2, 2, 2, 3)];
        let pv1 = [mv(1, 6, 1, 5)];

        let mut w = TrainingWriter::create(&path).unwrap();
        w.write_block(&cb, &[&pv0, &pv1]).unwrap();
        w.finish().unwrap();

        let mut r = TrainingReader::open(&path).unwrap();
        let cb2 = r.next_root().unwrap().unwrap();
        assert_eq!(cb2, cb);

        let mut b0 = root.clone();
        assert_eq!(r.read_pv(&mut b0).unwrap(), PvRead::Ok);
        assert_eq!(b0.ply(), 2);
        let mut b1 = root.clone();
        assert_eq!(r.read_pv(&mut b1).unwrap(), PvRead::Ok);
        assert_eq!(b1.ply(), 1);
        let mut scratch = root.clone();
        assert_eq!(r.read_pv(&mut scratch).unwrap(), PvRead::End);
        assert!(r.next_root().unwrap().is_none());
    }

    #[test]
    fn test_reencode_is_identical() {
        // デコードして再エンコードするとバイト列が一致する
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");
        let path2 = dir.path().join("training2.dat");

        let root = Position::hirate();
        let pv0 = [mv(6, 6, 6, 5), mv(2, 2, 2, 3), mv(8, 6, 8, 5)];
        let pv1 = [mv(1, 6, 1, 5), mv(8, 2, 8, 3)];
        let mut w = TrainingWriter::create(&path).unwrap();
        w.write_block(&root.to_compact(), &[&pv0, &pv1]).unwrap();
        w.finish().unwrap();

        // バイト列を解析して指し手列を復元し、同じ書式で書き直す
        let bytes = std::fs::read(&path).unwrap();
        let (cb_bytes, mut rest) = bytes.split_at(suisen_core::position::CompactBoard::SIZE);
        let cb = CompactBoard::from_bytes(cb_bytes.try_into().unwrap());
        let mut pvs: Vec<Vec<Move>> = Vec::new();
        loop {
            let len = rest[0];
            rest = &rest[1..];
            if len == 0 {
                break;
            }
            let mut replay = Position::from_compact(&cb).unwrap();
            let mut line = Vec::new();
            for _ in 0..len - 1 {
                let raw = u16::from_le_bytes([rest[0], rest[1]]);
                rest = &rest[2..];
                let mv = Move::deserialize16(raw, &replay).unwrap();
                assert!(replay.make_move(mv));
                line.push(mv);
            }
            pvs.push(line);
        }
        assert!(rest.is_empty());
        assert_eq!(pvs.len(), 2);

        let refs: Vec<&[Move]> = pvs.iter().map(|p| p.as_slice()).collect();
        let mut w2 = TrainingWriter::create(&path2).unwrap();
        w2.write_block(&cb, &refs).unwrap();
        w2.finish().unwrap();
        let bytes2 = std::fs::read(&path2).unwrap();
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn test_broken_pv_keeps_stream_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");

        let root = Position::hirate();
        let bad = [mv(4, 4, 4, 3)]; // 44に駒はない
        let good = [mv(6, 6, 6, 5)];
        let mut w = TrainingWriter::create(&path).unwrap();
        w.write_block(&root.to_compact(), &[&bad, &good]).unwrap();
        w.finish().unwrap();

        let mut r = TrainingReader::open(&path).unwrap();
        let cb = r.next_root().unwrap().unwrap();
        let mut b = Position::from_compact(&cb).unwrap();
        assert_eq!(r.read_pv(&mut b).unwrap(), PvRead::Broken);
        // 壊れたPVの後でも次のPVは正しく読める
        let mut b = Position::from_compact(&cb).unwrap();
        assert_eq!(r.read_pv(&mut b).unwrap(), PvRead::Ok);
        let mut b2 = Position::from_compact(&cb).unwrap();
        assert_eq!(r.read_pv(&mut b2).unwrap(), PvRead::End);
    }

    #[test]
    fn test_truncated_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.dat");
        let root = Position::hirate();
        let pv0 = [mv(6, 6, 6, 5)];
        let mut w = TrainingWriter::create(&path).unwrap();
        w.write_block(&root.to_compact(), &[&pv0]).unwrap();
        w.finish().unwrap();
        // 途中で切り詰める
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        let mut r = TrainingReader::open(&path).unwrap();
        let cb = r.next_root().unwrap().unwrap();
        let mut b = Position::from_compact(&cb).unwrap();
        // PV本体が切れているのでエラー
        assert!(r.read_pv(&mut b).is_err());
    }
}
