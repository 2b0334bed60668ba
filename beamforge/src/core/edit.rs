//! Exactly-once search-and-replace used by the `edit_file` tool.

/// Replace `search` with `replace` in `content` iff `search` occurs exactly once.
///
/// Returns `Err(count)` with the observed occurrence count otherwise; the
/// caller's content is never modified in that case.
pub fn replace_once(content: &str, search: &str, replace: &str) -> Result<String, usize> {
    if search.is_empty() {
        return Err(0);
    }
    let count = content.matches(search).count();
    if count != 1 {
        return Err(count);
    }
    Ok(content.replacen(search, replace, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_occurrence_is_replaced() {
        let out = replace_once("let a = 1;\nlet b = 2;\n", "b = 2", "b = 3").expect("replace");
        assert_eq!(out, "let a = 1;\nlet b = 3;\n");
    }

    #[test]
    fn missing_and_ambiguous_matches_report_count() {
        assert_eq!(replace_once("abc", "x", "y"), Err(0));
        assert_eq!(replace_once("x x x", "x", "y"), Err(3));
        assert_eq!(replace_once("abc", "", "y"), Err(0));
    }
}
