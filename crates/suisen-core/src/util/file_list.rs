//! ディレクトリ内のファイル列挙

use std::io;
use std::path::{Path, PathBuf};

/// `dir` 直下から拡張子 `ext` のファイルをソート順で列挙する
pub fn enumerate<P: AsRef<Path>>(dir: P, ext: &str) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(ext)
        })
        .collect();
    files.sort();
    Ok(files)
}
