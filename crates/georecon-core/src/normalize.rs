//! Canonical key derivation for location mentions.
//!
//! Every equality and grouping decision in the engine goes through
//! [`normalize`], so the function is pure, total and idempotent.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Fold a raw mention into its `location_clean` key.
///
/// - compatibility decomposition (NFKD) with combining marks dropped
/// - Unicode lowercase, independent of locale
/// - typographic quotes and dashes mapped to their ASCII forms
/// - whitespace runs collapsed to a single space
/// - leading and trailing punctuation stripped
///
/// Input with no letters or digits maps to the empty key.
///
/// ```
/// use georecon_core::normalize;
///
/// assert_eq!(normalize("  Ouahigouya,  Région du Nord. "), "ouahigouya, region du nord");
/// assert_eq!(normalize("--"), "");
/// ```
#[must_use]
pub fn normalize(raw: &str) -> String {
    let folded: String = raw
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .filter(|c| !is_combining_mark(*c))
        .map(fold_typography)
        .collect();

    let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");

    collapsed
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}

fn fold_typography(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201B}' | '\u{2032}' => '\'',
        '\u{201C}' | '\u{201D}' | '\u{201F}' | '\u{2033}' => '"',
        '\u{2010}'..='\u{2015}' | '\u{2212}' => '-',
        c if c.is_control() => ' ',
        c => c,
    }
}

/// True when `raw` carries no usable key.
#[must_use]
pub fn is_blank(raw: &str) -> bool {
    normalize(raw).is_empty()
}
