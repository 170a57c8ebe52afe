//! Small text helpers shared by the strategies and the retriever

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// True when `text` contains any of `keywords`, ignoring case
    pub fn contains_any(text: &str, keywords: &[&str]) -> bool {
        let lower = text.to_lowercase();
        keywords.iter().any(|k| lower.contains(k))
    }

    /// Collapse runs of whitespace into single spaces and trim
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    pub fn first_words(text: &str, n: usize) -> Cow<'_, str> {
        if n == 0 || text.is_empty() {
            return Cow::Borrowed("");
        }

        let mut word_count = 0;
        let mut end_pos = 0;

        for (pos, _) in text.match_indices(' ') {
            word_count += 1;
            if word_count >= n {
                end_pos = pos;
                break;
            }
        }

        if end_pos > 0 {
            Cow::Borrowed(&text[..end_pos])
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Truncate to at most `max_len` bytes, ending in `...`, never splitting a character.
    pub fn truncate_with_ellipsis(text: &str, max_len: usize) -> Cow<'_, str> {
        if text.len() <= max_len {
            Cow::Borrowed(text)
        } else if max_len <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut cut = max_len - 3;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            let mut result = String::with_capacity(cut + 3);
            result.push_str(&text[..cut]);
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}
