// src/models/product.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A catalog row as handed to the engine by the repository.
///
/// Everything except `normalized_name`, `unit_token`, `price_group_token` and
/// `merged_into` is read-only for a run; those four fields are what a merge
/// decision rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub raw_name: String,
    pub source_id: String,
    #[serde(default)]
    pub normalized_name: Option<String>,
    #[serde(default)]
    pub unit_token: Option<String>,
    #[serde(default)]
    pub price_group_token: Option<String>,
    /// List price from the import metadata, used to derive the price bracket.
    #[serde(default)]
    pub price: Option<f64>,
    /// Survivor id once this record has been collapsed by a merge.
    #[serde(default)]
    pub merged_into: Option<String>,
}

impl ProductRecord {
    pub fn new(id: impl Into<String>, raw_name: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            raw_name: raw_name.into(),
            source_id: source_id.into(),
            normalized_name: None,
            unit_token: None,
            price_group_token: None,
            price: None,
            merged_into: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_price_group(mut self, token: impl Into<String>) -> Self {
        self.price_group_token = Some(token.into());
        self
    }

    pub fn is_merged(&self) -> bool {
        self.merged_into.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Head,
    Unit,
    Quantity,
    Descriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedToken {
    pub kind: TokenKind,
    pub text: String,
    /// Packaging words ("can", "bottle", "lon"...) stay in the name but are
    /// ignored by name overlap.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub packaging: bool,
}

impl NormalizedToken {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            packaging: false,
        }
    }

    pub fn packaging(text: impl Into<String>) -> Self {
        Self {
            kind: TokenKind::Descriptor,
            text: text.into(),
            packaging: true,
        }
    }
}

/// Classified tokens of one product name, in name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTokens {
    pub tokens: Vec<NormalizedToken>,
}

impl NormalizedTokens {
    fn first_of(&self, kind: TokenKind) -> Option<&str> {
        self.tokens
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.text.as_str())
    }

    pub fn head(&self) -> Option<&str> {
        self.first_of(TokenKind::Head)
    }

    pub fn unit(&self) -> Option<&str> {
        self.first_of(TokenKind::Unit)
    }

    pub fn quantity(&self) -> Option<&str> {
        self.first_of(TokenKind::Quantity)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &NormalizedToken> {
        self.tokens.iter().filter(|t| t.kind == TokenKind::Descriptor)
    }

    /// Head plus non-packaging descriptors; the set name overlap is computed on.
    pub fn name_tokens(&self) -> BTreeSet<&str> {
        self.tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Head | TokenKind::Descriptor) && !t.packaging)
            .map(|t| t.text.as_str())
            .collect()
    }

    /// Head plus non-packaging descriptors in name order, space separated.
    pub fn core_name(&self) -> String {
        self.tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Head | TokenKind::Descriptor) && !t.packaging)
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Arena entry for a record that survived normalization. `idx` is its
/// position in the run's product arena and the key used by union-find.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedProduct {
    pub idx: usize,
    pub id: String,
    pub source_id: String,
    pub raw_name: String,
    pub normalized_name: String,
    pub tokens: NormalizedTokens,
    pub unit_token: Option<String>,
    pub quantity_token: Option<String>,
    pub price_group_token: Option<String>,
}

impl NormalizedProduct {
    pub fn head(&self) -> &str {
        self.tokens.head().unwrap_or_default()
    }

    /// Quantity in base units, when the name carried one.
    pub fn quantity_value(&self) -> Option<f64> {
        self.quantity_token.as_deref().and_then(|q| q.parse::<f64>().ok())
    }
}
