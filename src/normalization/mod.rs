pub mod normalizer;
pub mod units;

pub use normalizer::{normalize_product_name, normalize_record, normalize_records, NormalizationOutcome, ParsedName};
