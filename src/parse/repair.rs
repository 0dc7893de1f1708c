//! Textual repair passes applied to raw service responses before decoding.

/// Strip non-content wrapper markup: surrounding whitespace, fenced code
/// blocks, and any prose before the first fence.
pub fn strip_wrappers(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(fence_start) = trimmed.find("```") else {
        return trimmed;
    };
    let after_fence = &trimmed[fence_start + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let body = match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim()
}

/// Normalize common corruptions: non-ASCII quotes to ASCII, trailing
/// separators removed, non-finite numeric tokens replaced with null.
pub fn normalize(text: &str) -> String {
    let text: String = text
        .chars()
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{00ab}' | '\u{00bb}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();

    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut skip_until = 0usize;
    for (i, c) in text.char_indices() {
        if i < skip_until {
            continue;
        }
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                // Drop the comma when the next significant char closes a
                // container.
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                if !(j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']')) {
                    out.push(c);
                }
            }
            _ => {
                if let Some(len) = non_finite_token_len(&text[i..]) {
                    out.push_str("null");
                    skip_until = i + len;
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

fn non_finite_token_len(rest: &str) -> Option<usize> {
    for token in ["-Infinity", "Infinity", "NaN"] {
        if rest.starts_with(token) {
            let next = rest[token.len()..].chars().next();
            if !next.is_some_and(|c| c.is_alphanumeric() || c == '_') {
                return Some(token.len());
            }
        }
    }
    None
}

/// Find the largest balanced, brace-delimited region of the text.
pub fn largest_balanced_region(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    let mut stack: Vec<usize> = Vec::new();
    let mut best: Option<(usize, usize)> = None;

    for (i, &b) in bytes.iter().enumerate() {
        let c = b as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push(i),
            '}' => {
                if let Some(start) = stack.pop() {
                    if stack.is_empty() {
                        let span = (start, i + 1);
                        if best.map_or(true, |(s, e)| span.1 - span.0 > e - s) {
                            best = Some(span);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    best.map(|(s, e)| &text[s..e])
}
