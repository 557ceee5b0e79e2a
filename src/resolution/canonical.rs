// src/resolution/canonical.rs

use crate::models::product::NormalizedProduct;

/// Picks the survivor of a cluster: the longest normalized name (in chars),
/// ties broken by the lexicographically smallest id. `None` for an empty slice.
pub fn resolve_canonical<'a>(members: &[&'a NormalizedProduct]) -> Option<&'a NormalizedProduct> {
    members.iter().copied().reduce(|best, candidate| {
        let best_len = best.normalized_name.chars().count();
        let cand_len = candidate.normalized_name.chars().count();
        if cand_len > best_len || (cand_len == best_len && candidate.id < best.id) {
            candidate
        } else {
            best
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::product::ProductRecord;
    use crate::normalization::normalize_record;

    fn product(id: &str, name: &str) -> NormalizedProduct {
        normalize_record(&ProductRecord::new(id, name, "feed")).unwrap()
    }

    #[test]
    fn test_longest_name_wins() {
        let a = product("a", "Coca Cola 330ml");
        let b = product("b", "Coca-Cola lon 330 ml");
        let winner = resolve_canonical(&[&a, &b]).unwrap();
        assert_eq!(winner.id, "b");
        assert_eq!(winner.normalized_name, "coca cola lon 330ml");
    }

    #[test]
    fn test_ties_go_to_smallest_id_regardless_of_order() {
        let x = product("sku-9", "Tiger lon 330ml");
        let y = product("sku-10", "Tiger can 330ml");
        assert_eq!(resolve_canonical(&[&x, &y]).unwrap().id, "sku-10");
        assert_eq!(resolve_canonical(&[&y, &x]).unwrap().id, "sku-10");
        assert!(resolve_canonical(&[]).is_none());
    }
}
