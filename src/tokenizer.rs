//! Pluggable token counting for context-pack budgets.

use std::sync::Arc;

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
    fn name(&self) -> &str;
}

/// Default: bytes/3 estimation (fast, no model downloads).
pub struct BytesEstimateTokenizer;

impl Tokenizer for BytesEstimateTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(3)
    }
    fn name(&self) -> &str {
        "bytes-estimate"
    }
}

/// Create a tokenizer by name. Unknown names fall back to bytes-estimate.
pub fn create_tokenizer(_name: &str) -> Arc<dyn Tokenizer> {
    Arc::new(BytesEstimateTokenizer)
}

/// Truncate `text` so that it counts at most `max_tokens`. Cuts on char
/// boundaries and appends an ellipsis marker when anything was dropped.
pub fn truncate_to_tokens(text: &str, max_tokens: usize, tokenizer: &dyn Tokenizer) -> String {
    if tokenizer.count_tokens(text) <= max_tokens {
        return text.to_string();
    }
    if max_tokens == 0 {
        return String::new();
    }

    // Start from a generous byte estimate and shrink until it fits.
    let mut keep_bytes = (max_tokens * 4).min(text.len());
    loop {
        while keep_bytes > 0 && !text.is_char_boundary(keep_bytes) {
            keep_bytes -= 1;
        }
        let candidate = format!("{}…", &text[..keep_bytes]);
        if keep_bytes == 0 || tokenizer.count_tokens(&candidate) <= max_tokens {
            return candidate;
        }
        keep_bytes = keep_bytes.saturating_sub(keep_bytes / 8 + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_estimate_rounds_up() {
        let t = BytesEstimateTokenizer;
        assert_eq!(t.count_tokens(""), 0);
        assert_eq!(t.count_tokens("ab"), 1);
        assert_eq!(t.count_tokens("abcd"), 2);
    }

    #[test]
    fn unknown_name_falls_back() {
        assert_eq!(create_tokenizer("whatever").name(), "bytes-estimate");
    }

    #[test]
    fn truncate_noop_when_within_budget() {
        let t = BytesEstimateTokenizer;
        assert_eq!(truncate_to_tokens("short", 100, &t), "short");
    }

    #[test]
    fn truncate_respects_budget() {
        let t = BytesEstimateTokenizer;
        let long = "x".repeat(1000);
        let cut = truncate_to_tokens(&long, 10, &t);
        assert!(t.count_tokens(&cut) <= 10);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn truncate_zero_budget_is_empty() {
        let t = BytesEstimateTokenizer;
        assert_eq!(truncate_to_tokens("anything", 0, &t), "");
    }

    #[test]
    fn truncate_lands_on_char_boundaries() {
        let t = BytesEstimateTokenizer;
        let text = "héllo wörld ".repeat(50);
        let cut = truncate_to_tokens(&text, 12, &t);
        assert!(t.count_tokens(&cut) <= 12);
    }
}
