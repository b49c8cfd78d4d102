//! 駒割り（Material）
//!
//! 13種の駒の基本値と、そこから導出する交換値を保持する。
//! 学習中はバッチ更新の合間（ワーカ停止中）にのみ書き換えられ、
//! 探索スレッドは Relaxed 読みで参照する。

use crate::types::{PieceType, Value};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

/// 駒割りのエントリ数（玉を除く13種）
pub const MATERIAL_NUM: usize = 13;

/// 既定の駒割り
const DEFAULTS: [i32; MATERIAL_NUM] = [
    87,  // pawn
    232, // lance
    257, // knight
    369, // silver
    444, // gold
    569, // bishop
    642, // rook
    534, // tokin
    489, // pro_lance
    510, // pro_knight
    495, // pro_silver
    827, // horse
    945, // dragon
];

/// 駒種から駒割りインデックス（0-12）へ。玉はNone。
#[inline]
pub fn material_index(pt: PieceType) -> Option<usize> {
    match pt {
        PieceType::Pawn => Some(0),
        PieceType::Lance => Some(1),
        PieceType::Knight => Some(2),
        PieceType::Silver => Some(3),
        PieceType::Gold => Some(4),
        PieceType::Bishop => Some(5),
        PieceType::Rook => Some(6),
        PieceType::Tokin => Some(7),
        PieceType::ProLance => Some(8),
        PieceType::ProKnight => Some(9),
        PieceType::ProSilver => Some(10),
        PieceType::Horse => Some(11),
        PieceType::Dragon => Some(12),
        PieceType::King => None,
    }
}

/// 駒割りインデックスから駒種へ
#[inline]
pub fn material_piece(idx: usize) -> PieceType {
    const TABLE: [PieceType; MATERIAL_NUM] = [
        PieceType::Pawn,
        PieceType::Lance,
        PieceType::Knight,
        PieceType::Silver,
        PieceType::Gold,
        PieceType::Bishop,
        PieceType::Rook,
        PieceType::Tokin,
        PieceType::ProLance,
        PieceType::ProKnight,
        PieceType::ProSilver,
        PieceType::Horse,
        PieceType::Dragon,
    ];
    TABLE[idx]
}

/// 駒割りテーブル
pub struct Material {
    values: [AtomicI32; MATERIAL_NUM],
    exchanges: [AtomicI32; MATERIAL_NUM],
}

impl Material {
    /// 既定値で初期化する
    pub fn new() -> Material {
        let m = Material {
            values: std::array::from_fn(|i| AtomicI32::new(DEFAULTS[i])),
            exchanges: std::array::from_fn(|_| AtomicI32::new(0)),
        };
        m.update_ex();
        m
    }

    /// 駒の価値
    #[inline]
    pub fn piece(&self, pt: PieceType) -> Value {
        match material_index(pt) {
            Some(i) => Value::new(self.values[i].load(Ordering::Relaxed)),
            None => Value::PIECE_INF,
        }
    }

    /// 駒を取ったときの交換値
    #[inline]
    pub fn piece_exchange(&self, pt: PieceType) -> Value {
        match material_index(pt) {
            Some(i) => Value::new(self.exchanges[i].load(Ordering::Relaxed)),
            None => Value::PIECE_INF_EX,
        }
    }

    /// 駒が成ったときの差分（非負）
    #[inline]
    pub fn piece_promote(&self, pt: PieceType) -> Value {
        match pt.promote() {
            Some(promoted) => {
                let d = self.piece(promoted).raw() - self.piece(pt).raw();
                Value::new(d.max(0))
            }
            None => Value::ZERO,
        }
    }

    /// 基本値から全交換値を再計算する
    ///
    /// `ex[p] = value[p] + value[unpromote(p)]`
    pub fn update_ex(&self) {
        for i in 0..MATERIAL_NUM {
            let pt = material_piece(i);
            let base = material_index(pt.unpromote()).expect("non-king");
            let ex = self.values[i].load(Ordering::Relaxed)
                + self.values[base].load(Ordering::Relaxed);
            self.exchanges[i].store(ex, Ordering::Relaxed);
        }
    }

    /// インデックス指定の読み出し（学習用）
    #[inline]
    pub fn get(&self, idx: usize) -> i32 {
        self.values[idx].load(Ordering::Relaxed)
    }

    /// インデックス指定の加算（学習用）。交換値は呼び出し側が `update_ex` で更新する。
    #[inline]
    pub fn add(&self, idx: usize, delta: i32) {
        self.values[idx].fetch_add(delta, Ordering::Relaxed);
    }

    /// 成駒の価値が生駒を下回らないよう切り上げる
    pub fn clamp_promotions(&self) {
        for i in 0..MATERIAL_NUM {
            let pt = material_piece(i);
            if !pt.is_promoted() {
                continue;
            }
            let base = material_index(pt.unpromote()).expect("non-king");
            let b = self.values[base].load(Ordering::Relaxed);
            if self.values[i].load(Ordering::Relaxed) < b {
                self.values[i].store(b, Ordering::Relaxed);
            }
        }
    }

    /// 13個のスカラを固定順で書き出す
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut f = File::create(path)?;
        let mut buf = [0u8; MATERIAL_NUM * 4];
        for i in 0..MATERIAL_NUM {
            let v = self.values[i].load(Ordering::Relaxed);
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        f.write_all(&buf)
    }

    /// 13個のスカラを固定順で読み込み、交換値を再計算する
    pub fn read_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut f = File::open(path)?;
        let mut buf = [0u8; MATERIAL_NUM * 4];
        f.read_exact(&mut buf)?;
        for i in 0..MATERIAL_NUM {
            let v = i32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().expect("4 bytes"));
            self.values[i].store(v, Ordering::Relaxed);
        }
        self.update_ex();
        Ok(())
    }
}

impl Default for Material {
    fn default() -> Self {
        Material::new()
    }
}

impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<i32> = (0..MATERIAL_NUM).map(|i| self.get(i)).collect();
        f.debug_struct("Material").field("values", &values).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_identity() {
        let m = Material::new();
        for i in 0..MATERIAL_NUM {
            let pt = material_piece(i);
            let expect = m.piece(pt) + m.piece(pt.unpromote());
            assert_eq!(m.piece_exchange(pt), expect, "{pt:?}");
        }
        assert_eq!(m.piece_exchange(PieceType::Pawn), m.piece(PieceType::Pawn) + m.piece(PieceType::Pawn));
    }

    #[test]
    fn test_king_sentinels() {
        let m = Material::new();
        assert_eq!(m.piece(PieceType::King), Value::PIECE_INF);
        assert_eq!(m.piece_exchange(PieceType::King), Value::PIECE_INF_EX);
        assert_eq!(m.piece_promote(PieceType::King), Value::ZERO);
    }

    #[test]
    fn test_promote_non_negative() {
        let m = Material::new();
        for i in 0..MATERIAL_NUM {
            let pt = material_piece(i);
            assert!(m.piece_promote(pt).raw() >= 0);
        }
        // 成駒の価値を意図的に下げてもpromoteは負にならない
        let tokin = material_index(PieceType::Tokin).unwrap();
        m.values[tokin].store(10, Ordering::Relaxed);
        assert_eq!(m.piece_promote(PieceType::Pawn), Value::ZERO);
        m.clamp_promotions();
        assert_eq!(m.get(tokin), m.get(material_index(PieceType::Pawn).unwrap()));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("material.bin");
        let m = Material::new();
        m.add(0, 5);
        m.update_ex();
        m.write_file(&path).unwrap();

        let m2 = Material::new();
        m2.read_file(&path).unwrap();
        for i in 0..MATERIAL_NUM {
            assert_eq!(m2.get(i), m.get(i));
        }
        assert_eq!(m2.piece_exchange(PieceType::Pawn), m.piece_exchange(PieceType::Pawn));
    }
}
