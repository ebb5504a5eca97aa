// Payout Allocation Engine
pub mod currency;
pub mod engine;
pub mod models;
pub mod split;

pub use engine::PayoutEngine;
pub use models::{PayoutExecResult, PayoutPreview, PayoutResolution};
