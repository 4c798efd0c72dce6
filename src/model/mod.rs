pub mod calibration;
pub mod explain;
pub mod prediction;
pub mod scorer;

pub use calibration::PlattCalibration;
pub use explain::{explain, Explanation, Thresholds};
pub use prediction::{Prediction, PredictionService};
pub use scorer::{LogisticScorer, Scorer};
