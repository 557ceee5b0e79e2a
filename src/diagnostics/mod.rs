pub mod queries;
pub mod snapshot;

pub use queries::{
    find_canonical_name, find_duplicates, get_product_groups, get_similar_products, test_similarity,
    test_similarity_by_id, DuplicatePair, SimilarProduct, SimilarityReport,
};
pub use snapshot::CatalogSnapshot;
