// src/normalization/units.rs
// Unit-of-measure, packaging and price-bracket vocabulary used by the normalizer.

/// (alias, canonical base unit, factor to base unit)
const UNIT_ALIASES: [(&str, &str, f64); 34] = [
    // Volume
    ("ml", "ml", 1.0), ("cc", "ml", 1.0), ("cl", "ml", 10.0), ("dl", "ml", 100.0),
    ("l", "ml", 1000.0), ("lt", "ml", 1000.0), ("lit", "ml", 1000.0),
    ("litre", "ml", 1000.0), ("liter", "ml", 1000.0), ("litres", "ml", 1000.0),
    ("liters", "ml", 1000.0), ("floz", "ml", 29.5735),
    // Weight
    ("mg", "g", 0.001), ("g", "g", 1.0), ("gr", "g", 1.0), ("gram", "g", 1.0),
    ("grams", "g", 1.0), ("kg", "g", 1000.0), ("kgs", "g", 1000.0),
    ("oz", "g", 28.3495), ("lb", "g", 453.592), ("lbs", "g", 453.592),
    // Count
    ("pcs", "pcs", 1.0), ("pc", "pcs", 1.0), ("piece", "pcs", 1.0),
    ("pieces", "pcs", 1.0), ("pack", "pcs", 1.0), ("packs", "pcs", 1.0),
    ("pk", "pcs", 1.0), ("cai", "pcs", 1.0), ("chiec", "pcs", 1.0),
    ("vien", "pcs", 1.0), ("tabs", "pcs", 1.0), ("sheets", "pcs", 1.0),
];

const PACKAGING_TERMS: [&str; 26] = [
    "can", "cans", "lon", "bottle", "bottles", "chai", "box", "boxes", "hop",
    "pack", "pk", "goi", "bag", "bags", "tui", "jar", "hu", "carton", "thung",
    "tin", "pouch", "sachet", "tube", "cup", "ly", "loc",
];

const PRODUCT_STOPWORDS: [&str; 14] = [
    "a", "an", "the", "and", "of", "with", "for", "in", "new", "moi", "va", "cua", "loai", "hang",
];

/// Number of coarse price brackets (`pg0`..`pg9`).
pub const PRICE_GROUP_COUNT: u8 = 10;
const PRICE_GROUP_PREFIX: &str = "pg";

/// Canonical base unit and conversion factor for a unit alias.
pub fn lookup_unit(alias: &str) -> Option<(&'static str, f64)> {
    UNIT_ALIASES
        .iter()
        .find(|(a, _, _)| *a == alias)
        .map(|(_, base, factor)| (*base, *factor))
}

pub fn is_packaging_term(token: &str) -> bool {
    PACKAGING_TERMS.contains(&token)
}

pub fn is_stopword(token: &str) -> bool {
    PRODUCT_STOPWORDS.contains(&token)
}

/// Renders a base-unit quantity with at most three decimals and no trailing zeros.
pub fn format_quantity(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        let s = format!("{:.3}", rounded);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Log-scale price bracket: one bracket per order of magnitude, clamped to
/// `pg0..pg9`. Non-positive or non-finite prices have no bracket.
pub fn price_group_for(price: f64) -> Option<String> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    let bracket = price.log10().floor().clamp(0.0, (PRICE_GROUP_COUNT - 1) as f64) as u8;
    Some(format!("{}{}", PRICE_GROUP_PREFIX, bracket))
}

pub fn parse_price_group(token: &str) -> Result<u8, String> {
    let digits = token
        .strip_prefix(PRICE_GROUP_PREFIX)
        .ok_or_else(|| format!("price group token '{}' lacks the '{}' prefix", token, PRICE_GROUP_PREFIX))?;
    let bracket: u8 = digits
        .parse()
        .map_err(|_| format!("price group token '{}' has no numeric bracket", token))?;
    if bracket >= PRICE_GROUP_COUNT {
        return Err(format!("price group bracket {} is out of range", bracket));
    }
    Ok(bracket)
}

/// Lower-cases and folds Latin diacritics (including Vietnamese tone marks) to ASCII.
pub fn fold_diacritics(input: &str) -> String {
    input.chars().flat_map(|c| c.to_lowercase()).map(fold_char).collect()
}

fn fold_char(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' | 'ạ' | 'ả' | 'ấ' | 'ầ' | 'ẩ' | 'ẫ' | 'ậ'
        | 'ắ' | 'ằ' | 'ẳ' | 'ẵ' | 'ặ' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'đ' | 'ď' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' | 'ẹ' | 'ẻ' | 'ẽ' | 'ế' | 'ề' | 'ể' | 'ễ' | 'ệ' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ĩ' | 'ỉ' | 'ị' => 'i',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ơ' | 'ọ' | 'ỏ' | 'ố' | 'ồ' | 'ổ' | 'ỗ' | 'ộ' | 'ớ'
        | 'ờ' | 'ở' | 'ỡ' | 'ợ' => 'o',
        'ś' | 'š' => 's',
        'ß' => 's',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ũ' | 'ư' | 'ů' | 'ụ' | 'ủ' | 'ứ' | 'ừ' | 'ử' | 'ữ' | 'ự' => 'u',
        'ý' | 'ÿ' | 'ỳ' | 'ỵ' | 'ỷ' | 'ỹ' => 'y',
        'ž' | 'ź' | 'ż' => 'z',
        '×' => 'x',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_lookup_canonicalizes_to_base_units() {
        assert_eq!(lookup_unit("l"), Some(("ml", 1000.0)));
        assert_eq!(lookup_unit("kg"), Some(("g", 1000.0)));
        assert_eq!(lookup_unit("pcs"), Some(("pcs", 1.0)));
        assert_eq!(lookup_unit("cola"), None);
    }

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(330.0), "330");
        assert_eq!(format_quantity(0.33 * 1000.0), "330");
        assert_eq!(format_quantity(0.5), "0.5");
        assert_eq!(format_quantity(453.592), "453.592");
    }

    #[test]
    fn test_price_groups() {
        assert_eq!(price_group_for(5.0).as_deref(), Some("pg0"));
        assert_eq!(price_group_for(12_000.0).as_deref(), Some("pg4"));
        assert_eq!(price_group_for(1e15).as_deref(), Some("pg9"));
        assert_eq!(price_group_for(0.0), None);
        assert_eq!(price_group_for(f64::NAN), None);
        assert_eq!(parse_price_group("pg4"), Ok(4));
        assert!(parse_price_group("pgx").is_err());
        assert!(parse_price_group("cheap").is_err());
        assert!(parse_price_group("pg12").is_err());
    }

    #[test]
    fn test_fold_diacritics() {
        assert_eq!(fold_diacritics("Nước Ngọt Đóng Chai"), "nuoc ngot dong chai");
        assert_eq!(fold_diacritics("Crème Brûlée"), "creme brulee");
    }
}
