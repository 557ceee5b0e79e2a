// src/normalization/normalizer.rs
// Multi-phase product name normalization with unit-of-measure extraction and token classification.

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{DedupeError, DedupeResult};
use crate::models::product::{NormalizedProduct, NormalizedToken, NormalizedTokens, ProductRecord, TokenKind};
use crate::normalization::units::{
    fold_diacritics, format_quantity, is_packaging_term, is_stopword, lookup_unit, price_group_for,
};

// "330ml", "0.33l"
static MEASURE_TOKEN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)([a-z]+)$").ok());
// "6x330ml"
static MULTIPACK_TOKEN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(\d+)x(\d+(?:\.\d+)?)([a-z]+)$").ok());
// "6x"
static COUNT_TOKEN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^\d+x$").ok());
static NUMBER_TOKEN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^\d+(?:\.\d+)?$").ok());

const NOISE_PATTERNS: [&str; 6] = [
    r"[©®™]",                        // Trademark symbols
    r"\*+",                          // Asterisks
    r"\bsku\s*[:#]?\s*[a-z0-9-]+",   // Inline SKU codes
    r"\bma\s*sp\s*[:#]?\s*[a-z0-9-]+", // Inline product codes ("ma sp: 123")
    r"\[[^\]]*\]",                   // Bracketed import tags
    r"\bhot\s+deal\b|\bsale\b|\bpromo\b", // Promotion labels
];

static NOISE_REGEXES: Lazy<Vec<Regex>> =
    Lazy::new(|| NOISE_PATTERNS.iter().filter_map(|p| Regex::new(p).ok()).collect());

/// Result of normalizing one raw name.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedName {
    pub normalized_name: String,
    pub tokens: NormalizedTokens,
    pub unit_token: Option<String>,
    pub quantity_token: Option<String>,
}

/// Normalizes a catalog record. The returned product has `idx == 0`; the
/// caller assigns the arena position.
pub fn normalize_record(record: &ProductRecord) -> DedupeResult<NormalizedProduct> {
    let parsed = normalize_product_name(&record.raw_name).map_err(|reason| DedupeError::Normalization {
        record_id: record.id.clone(),
        reason,
    })?;

    // A bracket already present on the record wins over one derived from price.
    let price_group_token = record
        .price_group_token
        .clone()
        .or_else(|| record.price.and_then(price_group_for));

    Ok(NormalizedProduct {
        idx: 0,
        id: record.id.clone(),
        source_id: record.source_id.clone(),
        raw_name: record.raw_name.clone(),
        normalized_name: parsed.normalized_name,
        tokens: parsed.tokens,
        unit_token: parsed.unit_token,
        quantity_token: parsed.quantity_token,
        price_group_token,
    })
}

/// Products that normalized cleanly (arena order) plus the per-record failures.
#[derive(Debug, Default)]
pub struct NormalizationOutcome {
    pub products: Vec<NormalizedProduct>,
    pub failures: Vec<DedupeError>,
}

/// Normalizes every record, skipping (not aborting on) the ones that fail.
pub fn normalize_records(records: &[ProductRecord]) -> NormalizationOutcome {
    let mut outcome = NormalizationOutcome::default();
    for record in records {
        match normalize_record(record) {
            Ok(mut product) => {
                product.idx = outcome.products.len();
                outcome.products.push(product);
            }
            Err(e) => {
                warn!("Skipping record {}: {}", record.id, e);
                outcome.failures.push(e);
            }
        }
    }
    debug!(
        "Normalized {} of {} records ({} skipped)",
        outcome.products.len(),
        records.len(),
        outcome.failures.len()
    );
    outcome
}

pub fn normalize_product_name(raw: &str) -> Result<ParsedName, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty name".to_string());
    }

    // Phase 1: lower-case and fold diacritics
    let folded = fold_diacritics(trimmed);

    // Phase 2: drop import noise (codes, promo labels, symbols)
    let denoised = remove_product_noise(&folded);

    // Phase 3: punctuation to whitespace, keeping decimal separators inside numbers
    let cleaned = strip_punctuation(&denoised);

    let words: Vec<&str> = cleaned.split_whitespace().collect();
    if words.is_empty() {
        return Err(format!("name '{}' has no alphanumeric content", trimmed));
    }

    // Phase 4: classify head, descriptors, quantity and unit
    let parsed = classify_words(&words);
    if parsed.tokens.head().is_none() {
        return Err(format!("name '{}' has no product term", trimmed));
    }
    Ok(parsed)
}

fn remove_product_noise(name: &str) -> String {
    let mut result = name.to_string();
    for re in NOISE_REGEXES.iter() {
        result = re.replace_all(&result, " ").to_string();
    }
    result
}

fn strip_punctuation(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(chars.len());
    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            out.push(c);
        } else if (c == '.' || c == ',')
            && i > 0
            && chars[i - 1].is_ascii_digit()
            && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())
        {
            out.push('.');
        } else {
            out.push(' ');
        }
    }
    out
}

fn matches_token(re: &Lazy<Option<Regex>>, word: &str) -> bool {
    re.as_ref().map_or(false, |r| r.is_match(word))
}

struct Classifier {
    tokens: Vec<NormalizedToken>,
    parts: Vec<String>,
    quantity: Option<String>,
    unit: Option<String>,
    has_head: bool,
}

impl Classifier {
    fn new() -> Self {
        Self {
            tokens: Vec::new(),
            parts: Vec::new(),
            quantity: None,
            unit: None,
            has_head: false,
        }
    }

    fn push_word(&mut self, word: &str) {
        if !self.has_head {
            self.has_head = true;
            self.tokens.push(NormalizedToken::new(TokenKind::Head, word));
        } else {
            self.tokens.push(NormalizedToken::new(TokenKind::Descriptor, word));
        }
        self.parts.push(word.to_string());
    }

    fn push_descriptor(&mut self, text: String) {
        self.tokens.push(NormalizedToken::new(TokenKind::Descriptor, text.clone()));
        self.parts.push(text);
    }

    fn push_packaging(&mut self, word: &str) {
        self.tokens.push(NormalizedToken::packaging(word));
        self.parts.push(word.to_string());
    }

    /// The first measure becomes the record's quantity/unit; later ones are descriptors.
    fn push_measure(&mut self, amount: &str, base: &'static str, factor: f64) -> bool {
        let value = match amount.parse::<f64>() {
            Ok(v) => v * factor,
            Err(_) => return false,
        };
        let quantity = format_quantity(value);
        let rendered = format!("{}{}", quantity, base);
        if self.quantity.is_none() {
            self.tokens.push(NormalizedToken::new(TokenKind::Quantity, quantity.clone()));
            self.tokens.push(NormalizedToken::new(TokenKind::Unit, base));
            self.quantity = Some(quantity);
            self.unit = Some(base.to_string());
            self.parts.push(rendered);
        } else {
            self.push_descriptor(rendered);
        }
        true
    }

    fn finish(self) -> ParsedName {
        ParsedName {
            normalized_name: self.parts.join(" "),
            tokens: NormalizedTokens { tokens: self.tokens },
            unit_token: self.unit,
            quantity_token: self.quantity,
        }
    }
}

fn classify_words(words: &[&str]) -> ParsedName {
    let mut classifier = Classifier::new();
    let mut i = 0;

    while i < words.len() {
        let word = words[i];

        if let Some(caps) = MULTIPACK_TOKEN.as_ref().and_then(|r| r.captures(word)) {
            if let Some((base, factor)) = lookup_unit(&caps[3]) {
                classifier.push_descriptor(format!("{}x", &caps[1]));
                if classifier.push_measure(&caps[2], base, factor) {
                    i += 1;
                    continue;
                }
            }
        }

        if let Some(caps) = MEASURE_TOKEN.as_ref().and_then(|r| r.captures(word)) {
            if let Some((base, factor)) = lookup_unit(&caps[2]) {
                if classifier.push_measure(&caps[1], base, factor) {
                    i += 1;
                    continue;
                }
            }
        }

        if matches_token(&NUMBER_TOKEN, word) {
            let next = words.get(i + 1).copied();
            if let Some((base, factor)) = next.and_then(lookup_unit) {
                if classifier.push_measure(word, base, factor) {
                    i += 2;
                    continue;
                }
            }
            if next == Some("x") {
                classifier.push_descriptor(format!("{}x", word));
                i += 2;
                continue;
            }
            classifier.push_descriptor(word.to_string());
            i += 1;
            continue;
        }

        if matches_token(&COUNT_TOKEN, word) {
            classifier.push_descriptor(word.to_string());
        } else if is_stopword(word) {
            // dropped
        } else if is_packaging_term(word) {
            classifier.push_packaging(word);
        } else if classifier.has_head && word.chars().count() < 2 {
            // single letters after the head carry no signal
        } else {
            classifier.push_word(word);
        }
        i += 1;
    }

    classifier.finish()
}
