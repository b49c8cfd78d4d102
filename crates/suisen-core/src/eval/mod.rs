//! 評価関数（特徴点・駒割り・テーブル）

pub mod feature;

mod evaluator;
mod material;

pub use evaluator::{material_sum, EvalValue, Evaluator, ParamCtx, POSITIONAL_SCALE};
pub use material::{material_index, material_piece, Material, MATERIAL_NUM};
