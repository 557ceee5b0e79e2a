pub mod create_clusters;

pub use create_clusters::{build_clusters, cluster_id_for, ClusterBuilder};
