// src/matching/scorer.rs
// Weighted pair similarity over normalized product features.

use std::collections::BTreeSet;
use strsim::jaro_winkler;

use crate::errors::DedupeError;
use crate::models::matching::{FeatureKind, FeatureScore, SimilarityEdge};
use crate::models::product::NormalizedProduct;
use crate::normalization::units::{parse_price_group, PRICE_GROUP_COUNT};

pub const NAME_OVERLAP_WEIGHT: f64 = 0.55;
pub const FUZZY_NAME_WEIGHT: f64 = 0.15;
pub const UNIT_WEIGHT: f64 = 0.20;
pub const PRICE_GROUP_WEIGHT: f64 = 0.10;

/// Same unit, different quantity scales down to at most this.
const PARTIAL_UNIT_CREDIT: f64 = 0.5;
/// Price brackets this far apart (or more) score zero.
const PRICE_GROUP_SPAN: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub score: f64,
    pub features: Vec<FeatureScore>,
    /// Features that failed to compute; each contributed zero.
    pub errors: Vec<DedupeError>,
}

/// Scores a pair. The pair is put in canonical order (by id) first, so the
/// result does not depend on argument order.
pub fn score_pair(a: &NormalizedProduct, b: &NormalizedProduct) -> ScoreBreakdown {
    let (a, b) = if (a.id.as_str(), a.raw_name.as_str()) <= (b.id.as_str(), b.raw_name.as_str()) {
        (a, b)
    } else {
        (b, a)
    };

    let mut features = Vec::with_capacity(4);
    let mut errors = Vec::new();

    features.push(FeatureScore {
        kind: FeatureKind::NameOverlap,
        score: jaccard(&a.tokens.name_tokens(), &b.tokens.name_tokens()),
        weight: NAME_OVERLAP_WEIGHT,
        failed: false,
    });

    features.push(FeatureScore {
        kind: FeatureKind::FuzzyName,
        score: jaro_winkler(&a.tokens.core_name(), &b.tokens.core_name()),
        weight: FUZZY_NAME_WEIGHT,
        failed: false,
    });

    // Absent on either side: the feature is left out entirely
    if let Some(result) = unit_similarity(a, b) {
        features.push(feature_or_failure(FeatureKind::Unit, UNIT_WEIGHT, result, a, b, &mut errors));
    }
    if let Some(result) = price_group_similarity(a, b) {
        features.push(feature_or_failure(
            FeatureKind::PriceGroup,
            PRICE_GROUP_WEIGHT,
            result,
            a,
            b,
            &mut errors,
        ));
    }

    let total_weight: f64 = features.iter().map(|f| f.weight).sum();
    let weighted: f64 = features.iter().map(|f| f.weight * f.score).sum();
    let score = if total_weight > 0.0 {
        (weighted / total_weight).clamp(0.0, 1.0)
    } else {
        0.0
    };

    ScoreBreakdown { score, features, errors }
}

/// Scores a pair and packages it as an edge with `idx_a < idx_b`.
pub fn score_edge(a: &NormalizedProduct, b: &NormalizedProduct) -> (SimilarityEdge, Vec<DedupeError>) {
    let breakdown = score_pair(a, b);
    (to_edge(a, b, &breakdown), breakdown.errors)
}

pub fn to_edge(a: &NormalizedProduct, b: &NormalizedProduct, breakdown: &ScoreBreakdown) -> SimilarityEdge {
    let (first, second) = if a.idx <= b.idx { (a, b) } else { (b, a) };
    SimilarityEdge {
        idx_a: first.idx,
        idx_b: second.idx,
        id_a: first.id.clone(),
        id_b: second.id.clone(),
        score: breakdown.score,
        matched_features: breakdown.features.clone(),
    }
}

fn feature_or_failure(
    kind: FeatureKind,
    weight: f64,
    result: Result<f64, String>,
    a: &NormalizedProduct,
    b: &NormalizedProduct,
    errors: &mut Vec<DedupeError>,
) -> FeatureScore {
    match result {
        Ok(score) => FeatureScore {
            kind,
            score,
            weight,
            failed: false,
        },
        Err(reason) => {
            errors.push(DedupeError::Scoring {
                feature: kind.as_str(),
                id_a: a.id.clone(),
                id_b: b.id.clone(),
                reason,
            });
            FeatureScore {
                kind,
                score: 0.0,
                weight,
                failed: true,
            }
        }
    }
}

fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn unit_similarity(a: &NormalizedProduct, b: &NormalizedProduct) -> Option<Result<f64, String>> {
    let (unit_a, unit_b) = (a.unit_token.as_deref()?, b.unit_token.as_deref()?);
    if unit_a != unit_b {
        return Some(Ok(0.0));
    }
    let quantities = match (a.quantity_value(), b.quantity_value()) {
        (Some(qa), Some(qb)) => (qa, qb),
        _ => {
            return Some(Err(format!(
                "unparsable quantity ({:?}, {:?})",
                a.quantity_token, b.quantity_token
            )))
        }
    };
    if a.quantity_token == b.quantity_token {
        return Some(Ok(1.0));
    }
    let (lo, hi) = if quantities.0 <= quantities.1 {
        quantities
    } else {
        (quantities.1, quantities.0)
    };
    if hi <= 0.0 {
        return Some(Ok(0.0));
    }
    Some(Ok(PARTIAL_UNIT_CREDIT * lo / hi))
}

fn price_group_similarity(a: &NormalizedProduct, b: &NormalizedProduct) -> Option<Result<f64, String>> {
    let (token_a, token_b) = (a.price_group_token.as_deref()?, b.price_group_token.as_deref()?);
    let brackets = parse_price_group(token_a).and_then(|ga| parse_price_group(token_b).map(|gb| (ga, gb)));
    Some(brackets.map(|(ga, gb)| {
        debug_assert!(ga < PRICE_GROUP_COUNT && gb < PRICE_GROUP_COUNT);
        let distance = (ga as f64 - gb as f64).abs();
        (1.0 - distance / PRICE_GROUP_SPAN).max(0.0)
    }))
}
