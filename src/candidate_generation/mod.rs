pub mod candidate_generation;

pub use candidate_generation::{
    generate_candidate_edges, plan_candidate_pairs, score_work_unit, stream_candidate_edges, CandidatePlan,
    RejectionIndex, ScoredBatch, WorkUnit,
};
