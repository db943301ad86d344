//! Shared text helpers for the Steward crate.

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Byte index of the largest char boundary not greater than `index`.
fn floor_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Byte index of the smallest char boundary not less than `index`.
fn ceil_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Truncate to at most `max_bytes`, appending an ellipsis when cut.
pub fn truncate_str(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let cut = floor_boundary(text, max_bytes.saturating_sub(3));
    format!("{}...", &text[..cut])
}

/// Keep the last `max_bytes` of `text`, marking the elision at the front.
pub fn keep_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let start = ceil_boundary(text, text.len() - max_bytes);
    format!("[earlier content elided]\n{}", &text[start..])
}

/// Keep `keep_bytes` split between the head and the tail of `text`.
pub fn head_tail_excerpt(text: &str, keep_bytes: usize) -> String {
    if text.len() <= keep_bytes {
        return text.to_string();
    }
    let half = keep_bytes / 2;
    let head_end = floor_boundary(text, half);
    let tail_start = ceil_boundary(text, text.len() - half);
    let elided = tail_start - head_end;
    format!(
        "{}\n[... {} bytes elided ...]\n{}",
        &text[..head_end],
        elided,
        &text[tail_start..]
    )
}

/// Single-line preview used for ledger search and listings.
pub fn preview(text: &str, max_bytes: usize) -> String {
    let flat: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    truncate_str(&flat, max_bytes)
}
