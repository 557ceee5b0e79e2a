// src/blocking/blocking_index.rs
// Coarse blocking of normalized products by head token and unit.

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::product::NormalizedProduct;
use crate::models::stats_models::{RunWarning, WarningKind};

/// Unit slot used in the key of records whose name carried no unit.
pub const NO_UNIT: &str = "-";

pub fn block_key(head: &str, unit: Option<&str>) -> String {
    format!("{}|{}", head, unit.unwrap_or(NO_UNIT))
}

/// True when the index would put `a` and `b` in at least one common block,
/// size limits aside.
pub fn shares_block(a: &NormalizedProduct, b: &NormalizedProduct) -> bool {
    a.head() == b.head()
        && (a.unit_token == b.unit_token || a.unit_token.is_none() || b.unit_token.is_none())
}

/// A block that exceeded `max_block_size` and was left out of pair generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedBlock {
    pub key: String,
    pub size: usize,
}

/// Block key -> member arena indices.
///
/// Every product lands in the block of its own key. A product without a unit
/// is also placed in each `head|<unit>` block of its head so it still meets
/// same-head products that carry a unit. Blocks iterate in key order and
/// members are kept ascending, which makes pair generation deterministic.
#[derive(Debug, Default)]
pub struct BlockingIndex {
    blocks: BTreeMap<String, Vec<usize>>,
    keys_by_record: HashMap<usize, Vec<String>>,
    skipped: Vec<SkippedBlock>,
}

impl BlockingIndex {
    pub fn build(products: &[NormalizedProduct], max_block_size: usize) -> Self {
        let mut blocks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut units_by_head: HashMap<&str, BTreeSet<&str>> = HashMap::new();

        // Phase 1: own key per product
        for product in products {
            let key = block_key(product.head(), product.unit_token.as_deref());
            blocks.entry(key).or_default().push(product.idx);
            if let Some(unit) = product.unit_token.as_deref() {
                units_by_head.entry(product.head()).or_default().insert(unit);
            }
        }

        // Phase 2: unitless products join every unit block of their head
        for product in products.iter().filter(|p| p.unit_token.is_none()) {
            if let Some(units) = units_by_head.get(product.head()) {
                for unit in units {
                    blocks
                        .entry(block_key(product.head(), Some(*unit)))
                        .or_default()
                        .push(product.idx);
                }
            }
        }

        let mut skipped = Vec::new();
        blocks.retain(|key, members| {
            members.sort_unstable();
            members.dedup();
            if members.len() > max_block_size {
                warn!(
                    "Skipping oversized block '{}' ({} members, max {})",
                    key,
                    members.len(),
                    max_block_size
                );
                skipped.push(SkippedBlock {
                    key: key.clone(),
                    size: members.len(),
                });
                false
            } else {
                true
            }
        });

        let mut keys_by_record: HashMap<usize, Vec<String>> = HashMap::new();
        for (key, members) in &blocks {
            for &idx in members {
                keys_by_record.entry(idx).or_default().push(key.clone());
            }
        }

        info!(
            "Blocking index built: {} products, {} blocks, {} skipped as oversized",
            products.len(),
            blocks.len(),
            skipped.len()
        );
        debug!(
            "Largest block has {} members",
            blocks.values().map(Vec::len).max().unwrap_or(0)
        );

        Self {
            blocks,
            keys_by_record,
            skipped,
        }
    }

    /// Active blocks in key order.
    pub fn blocks(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.blocks.iter().map(|(k, m)| (k.as_str(), m.as_slice()))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn members(&self, key: &str) -> Option<&[usize]> {
        self.blocks.get(key).map(Vec::as_slice)
    }

    pub fn keys_for(&self, idx: usize) -> &[String] {
        self.keys_by_record.get(&idx).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every other product sharing at least one active block with `idx`, ascending.
    pub fn candidates_for(&self, idx: usize) -> BTreeSet<usize> {
        self.keys_for(idx)
            .iter()
            .filter_map(|key| self.blocks.get(key))
            .flatten()
            .copied()
            .filter(|&other| other != idx)
            .collect()
    }

    pub fn skipped_blocks(&self) -> &[SkippedBlock] {
        &self.skipped
    }

    pub fn warnings(&self) -> Vec<RunWarning> {
        self.skipped
            .iter()
            .map(|b| {
                RunWarning::new(
                    WarningKind::OversizedBlock,
                    Some(b.key.clone()),
                    format!("block has {} members and was not compared", b.size),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::product::ProductRecord;
    use crate::normalization::normalize_records;

    fn products(names: &[&str]) -> Vec<NormalizedProduct> {
        let records: Vec<ProductRecord> = names
            .iter()
            .enumerate()
            .map(|(i, n)| ProductRecord::new(format!("p{}", i), *n, "feed"))
            .collect();
        normalize_records(&records).products
    }

    #[test]
    fn test_records_block_by_head_and_unit() {
        let p = products(&["Coca Cola 330ml", "Coca-Cola lon 330 ml", "Pepsi 330ml", "Coca Cola 1.5 L"]);
        let index = BlockingIndex::build(&p, 1000);
        let keys: Vec<&str> = index.blocks().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["coca|ml", "pepsi|ml"]);
        assert_eq!(index.members("coca|ml"), Some(&[0, 1, 3][..]));
        assert_eq!(index.candidates_for(2).len(), 0);
    }

    #[test]
    fn test_unitless_records_join_unit_blocks_of_their_head() {
        let p = products(&["Nescafe Gold", "Nescafe Gold 200g", "Nescafe 3in1 20 pcs"]);
        let index = BlockingIndex::build(&p, 1000);
        assert_eq!(index.members("nescafe|-"), Some(&[0][..]));
        assert_eq!(index.members("nescafe|g"), Some(&[0, 1][..]));
        assert_eq!(index.members("nescafe|pcs"), Some(&[0, 2][..]));
        assert_eq!(index.candidates_for(0), BTreeSet::from([1, 2]));
        // Different units never meet
        assert!(!index.candidates_for(1).contains(&2));
    }

    #[test]
    fn test_oversized_blocks_are_skipped_with_warning() {
        let p = products(&["Milo 180ml", "Milo hop 180ml", "Milo 110ml", "Ovaltine 180ml"]);
        let index = BlockingIndex::build(&p, 2);
        assert_eq!(index.block_count(), 1);
        assert_eq!(index.skipped_blocks(), &[SkippedBlock { key: "milo|ml".to_string(), size: 3 }]);
        let warnings = index.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::OversizedBlock);
        assert!(index.keys_for(0).is_empty());
    }

    #[test]
    fn test_shares_block_agrees_with_index() {
        let p = products(&["Nescafe Gold", "Nescafe Gold 200g", "Nescafe 3in1 20 pcs", "Milo 200g"]);
        let index = BlockingIndex::build(&p, 1000);
        for a in &p {
            for b in &p {
                if a.idx != b.idx {
                    assert_eq!(shares_block(a, b), index.candidates_for(a.idx).contains(&b.idx));
                }
            }
        }
    }
}
