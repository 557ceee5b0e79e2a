pub mod scorer;

pub use scorer::{score_edge, score_pair, to_edge, ScoreBreakdown};
