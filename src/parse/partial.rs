//! Partial recovery of records from malformed or truncated responses.
//!
//! Primary-centric responses are recovered record by record: repeated
//! `"primary_page"` anchors identify candidate page objects, each extracted
//! independently with a brace-matching scanner so one truncated object does
//! not take down its neighbors. Partner-centric responses are recovered by
//! progressively truncating the tail and closing the open containers.

use serde_json::Value;

/// Extract candidate page objects around each `"primary_page"` anchor.
///
/// Returns raw values; shape validation happens during sanitization.
pub fn recover_primary_pages(text: &str) -> Vec<Value> {
    let anchor =
        regex::Regex::new(r#""primary_page"\s*:\s*(\d+)"#).expect("static anchor pattern");
    let starts: Vec<usize> = anchor.find_iter(text).map(|m| m.start()).collect();

    let mut recovered = Vec::new();
    for (i, &anchor_start) in starts.iter().enumerate() {
        let Some(obj_start) = text[..anchor_start].rfind('{') else {
            continue;
        };
        // Stop the scan before the next candidate's opening brace.
        let search_end = match starts.get(i + 1) {
            Some(&next) => text[..next].rfind('{').unwrap_or(text.len()),
            None => text.len(),
        };
        let Some(obj_end) = find_object_end(text, obj_start, search_end) else {
            tracing::debug!("Anchor at byte {} has no balanced object", anchor_start);
            continue;
        };
        if let Ok(value) = serde_json::from_str::<Value>(&text[obj_start..obj_end]) {
            recovered.push(value);
        }
    }
    recovered
}

/// Scan forward from `start` for the matching close brace, respecting
/// strings and escapes. Returns the exclusive end index.
pub fn find_object_end(text: &str, start: usize, search_end: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let end = search_end.min(bytes.len());
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().take(end).skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Recover a truncated list response by closing open containers.
///
/// Starting from the `anchor_key` array, cuts the text back to successive
/// object boundaries and appends the missing `]`/`}` closers until
/// something decodes with a non-empty array under the key.
pub fn close_progressively(text: &str, anchor_key: &str) -> Option<Value> {
    let needle = format!("\"{}\"", anchor_key);
    let key_start = text.find(&needle)?;
    let tail = &text[key_start..];

    // Candidate cut points: just past every close brace outside a string.
    let mut cuts = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in tail.as_bytes().iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'}' => cuts.push(i + 1),
            _ => {}
        }
    }

    for &cut in cuts.iter().rev().take(100) {
        let mut candidate = String::with_capacity(cut + 16);
        candidate.push('{');
        candidate.push_str(&tail[..cut]);

        let open_braces = count_unbalanced(&candidate, b'{', b'}');
        let open_brackets = count_unbalanced(&candidate, b'[', b']');
        if open_braces < 0 || open_brackets < 0 {
            continue;
        }
        for _ in 0..open_brackets {
            candidate.push(']');
        }
        for _ in 0..open_braces {
            candidate.push('}');
        }
        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
            let non_empty = value
                .get(anchor_key)
                .and_then(Value::as_array)
                .is_some_and(|a| !a.is_empty());
            if non_empty {
                return Some(value);
            }
        }
    }
    None
}

fn count_unbalanced(text: &str, open: u8, close: u8) -> i32 {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for &b in text.as_bytes() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
        }
    }
    depth
}
