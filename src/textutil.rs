//! UTF-8-safe preview helpers for log fields, permission prompts and the CLI.

/// Truncate by characters and append `suffix` when truncation occurs.
pub fn truncate_with_suffix_by_chars(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    format!("{prefix}{suffix}")
}

/// Collapse all whitespace runs (newlines included) to single spaces and
/// cap the result at `max_chars` characters.
pub fn single_line_preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_with_suffix_by_chars(&collapsed, max_chars, "...")
}
