//! Category slug normalization.
//!
//! A slug is the deduplication key for categories: two display strings
//! that normalize to the same slug are the same category.

use unicode_normalization::UnicodeNormalization;

/// Turn a free-text category name into a canonical lookup key.
///
/// Lowercase, strip diacritics via NFD decomposition, collapse runs of
/// non-alphanumeric characters into single hyphens, trim edge hyphens.
pub fn normalize(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;

    // NFD splits "è" into "e" + combining grave; combining marks are dropped.
    for c in name.nfd() {
        if is_combining_mark(c) {
            continue;
        }
        if c.is_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            for lc in c.to_lowercase() {
                slug.push(lc);
            }
        } else {
            pending_hyphen = true;
        }
    }

    slug
}

fn is_combining_mark(c: char) -> bool {
    matches!(c, '\u{0300}'..='\u{036F}' | '\u{1AB0}'..='\u{1AFF}' | '\u{1DC0}'..='\u{1DFF}' | '\u{20D0}'..='\u{20FF}' | '\u{FE20}'..='\u{FE2F}')
}
