//! Language-agnostic text normalization shared by the intent analyzer and
//! the lexical search fallback.
//!
//! Tokenization: lowercase, normalize to NFC then NFD, drop combining marks,
//! split on non-alphanumeric boundaries, and keep tokens longer than two
//! characters. The OCR-tolerant variants cover the common dotless-i and
//! digit-for-letter confusions seen in scanned content.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalize and tokenize a query or chunk of text.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let composed: String = lowered.nfc().collect();
    let stripped: String = composed.nfd().filter(|c| !is_combining_mark(*c)).collect();

    stripped
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(|t| t.to_string())
        .collect()
}

/// Spelling variants of a token that tolerate OCR artifacts.
///
/// Maps U+0131 (dotless i) to `i`, and `1` at digit-letter boundaries to
/// `i`. The original token is always first.
pub fn ocr_variants(token: &str) -> Vec<String> {
    let mut variants = vec![token.to_string()];

    let dotless = token.replace('\u{0131}', "i");
    if dotless != token {
        variants.push(dotless);
    }

    let chars: Vec<char> = token.chars().collect();
    let mut mapped = String::with_capacity(token.len());
    let mut changed = false;
    for (i, &c) in chars.iter().enumerate() {
        let prev_alpha = i > 0 && chars[i - 1].is_alphabetic();
        let next_alpha = i + 1 < chars.len() && chars[i + 1].is_alphabetic();
        if c == '1' && (prev_alpha || next_alpha) {
            mapped.push('i');
            changed = true;
        } else {
            mapped.push(c);
        }
    }
    if changed {
        variants.push(mapped);
    }

    variants.dedup();
    variants
}

/// True when any OCR-tolerant variant of `token` occurs in `haystack`
/// (already lowercased).
pub fn token_matches(token: &str, haystack: &str) -> bool {
    ocr_variants(token).iter().any(|v| haystack.contains(v.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_short_tokens() {
        let tokens = tokenize("Is it on the invoice DB?");
        assert_eq!(tokens, vec!["the", "invoice"]);
    }

    #[test]
    fn test_tokenize_strips_diacritics() {
        let tokens = tokenize("Müşteri ödemeleri");
        assert_eq!(tokens, vec!["musteri", "odemeleri"]);
    }

    #[test]
    fn test_tokenize_splits_on_punctuation() {
        let tokens = tokenize("order_items,invoices;2024");
        assert_eq!(tokens, vec!["order", "items", "invoices", "2024"]);
    }

    #[test]
    fn test_tokenize_empty_for_single_symbol() {
        assert!(tokenize("?").is_empty());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_ocr_variant_dotless_i() {
        let variants = ocr_variants("ıstanbul");
        assert!(variants.contains(&"istanbul".to_string()));
    }

    #[test]
    fn test_ocr_variant_digit_one() {
        let variants = ocr_variants("inv1ce");
        assert!(variants.contains(&"invice".to_string()));
        // A standalone number is left alone.
        assert_eq!(ocr_variants("2024"), vec!["2024".to_string()]);
    }

    #[test]
    fn test_token_matches_with_variant() {
        assert!(token_matches("fa1r", "this is a fair deal"));
        assert!(!token_matches("unrelated", "this is a fair deal"));
    }
}
