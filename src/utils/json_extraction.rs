//! JSON extraction from free-form model responses.
//!
//! Vision models are asked for a bare JSON object but frequently wrap it in
//! a markdown fence or prepend reasoning. These helpers recover the object.

/// Extracts the first parseable JSON object from `content`.
///
/// Tried in order: a ```json fenced block, a generic fenced block, the whole
/// trimmed content, then the last and first brace-balanced objects found
/// anywhere in the text.
pub fn extract_json_object(content: &str) -> Option<String> {
    let trimmed = content.trim();

    for fenced in [
        extract_fenced_block(trimmed, "```json"),
        extract_fenced_block(trimmed, "```"),
    ]
    .into_iter()
    .flatten()
    {
        if is_json_object(&fenced) {
            return Some(fenced);
        }
    }

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            let candidate = &trimmed[..=end];
            if is_json_object(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    // Reasoning models put the answer last.
    let mut last = None;
    let mut search_from = 0;
    while let Some(offset) = trimmed[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = find_matching_brace(&trimmed[start..]) {
            let candidate = &trimmed[start..=start + end];
            if is_json_object(candidate) {
                last = Some(candidate.to_string());
                search_from = start + end + 1;
                continue;
            }
        }
        search_from = start + 1;
    }
    last
}

/// Returns the index of the `}` closing the object that starts at `s[0]`.
///
/// String literals and escape sequences are skipped.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn extract_fenced_block(content: &str, fence: &str) -> Option<String> {
    let start = content.find(fence)? + fence.len();
    let rest = &content[start..];
    // Skip a language tag on the opening fence line.
    let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &rest[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

fn is_json_object(candidate: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(candidate),
        Ok(serde_json::Value::Object(_))
    )
}
