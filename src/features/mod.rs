//! Causal rolling-window features over the game log.

pub mod engine;
pub mod form;
pub mod reconstruct;
pub mod schema;
pub mod window;

pub use engine::derive;
pub use reconstruct::FeatureReconstructor;
