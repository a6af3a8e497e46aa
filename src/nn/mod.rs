//! Ready-made stage building blocks.
//!
//! Most pipelines bring their own [`StageModule`](crate::pipeline::StageModule);
//! these cover dense regression models and the tests.

pub mod linear;
pub mod loss;

pub use linear::Linear;
pub use loss::{mae_metric, mse_criterion, mse_loss};
