//! Extraction of `<tag>..</tag>` sections from free-form model output.

use regex::Regex;

/// Return the trimmed body of the first `<tag>..</tag>` pair, if any.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{0}>(.*?)</{0}>", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}
