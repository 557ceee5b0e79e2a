pub mod canonical;

pub use canonical::resolve_canonical;
