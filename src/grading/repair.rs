//! Best-effort repair of model output that should have been JSON.
//!
//! Models are told to reply with bare JSON, and mostly do. The rest of the
//! time the payload is fine but wrapped: Markdown fences, a sentence of
//! preamble, a trailing comma, or a reply cut off by the token limit. Each
//! rule below is a pure `&str → String` pass, run in this order:
//!
//! 1. Strip Markdown code fences
//! 2. Cut to the outermost JSON object or array
//! 3. Drop control characters and the BOM
//! 4. Quote bare object keys
//! 5. Close unterminated strings, drop stray closers, append missing closers
//! 6. Remove trailing commas before `}` / `]`
//!
//! Repair never validates; the caller parses the result and decides.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all repair rules to `raw`.
pub fn repair_json(raw: &str) -> String {
    let s = strip_code_fences(raw);
    let s = extract_json_body(&s);
    let s = remove_control_chars(&s);
    let s = quote_bare_keys(&s);
    let s = balance_delimiters(&s);
    remove_trailing_commas(&s)
}

// ── Rule 1: Strip code fences ────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)(?:```|$)").unwrap());

/// Content of the first fenced block, or the input if there is none.
pub fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_FENCED.captures(trimmed) {
        Some(caps) => caps[1].trim().to_string(),
        None => trimmed.to_string(),
    }
}

// ── Rule 2: Outermost JSON value ─────────────────────────────────────────────

/// From the first `{` or `[` to where it closes; everything after is prose.
/// An unclosed value runs to the end of the input.
fn extract_json_body(input: &str) -> String {
    let Some(start) = input.find(['{', '[']) else {
        return input.to_string();
    };
    let body = &input[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
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
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return body[..=i].to_string();
                }
            }
            _ => {}
        }
    }
    body.to_string()
}

// ── Rule 3: Control characters ───────────────────────────────────────────────

fn remove_control_chars(input: &str) -> String {
    input
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || (!c.is_control() && c != '\u{FEFF}'))
        .collect()
}

// ── Rule 4: Bare keys ────────────────────────────────────────────────────────

static RE_BARE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)"#).unwrap());

fn quote_bare_keys(input: &str) -> String {
    RE_BARE_KEY.replace_all(input, r#"$1"$2"$3"#).to_string()
}

// ── Rule 5: Balance strings and delimiters ───────────────────────────────────

fn balance_delimiters(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            match c {
                _ if escaped => {
                    escaped = false;
                    out.push(c);
                }
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                // Raw line breaks are invalid inside JSON strings.
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if closers.last() == Some(&c) {
                    closers.pop();
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    if !closers.is_empty() {
        let len = out.trim_end().len();
        out.truncate(len);
        if out.ends_with(',') {
            out.pop();
        }
        if out.ends_with(':') {
            out.push_str(" null");
        }
        while let Some(closer) = closers.pop() {
            out.push(closer);
        }
    }
    out
}

// ── Rule 6: Trailing commas ──────────────────────────────────────────────────

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").unwrap());

fn remove_trailing_commas(input: &str) -> String {
    RE_TRAILING_COMMA.replace_all(input, "$1").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parses(s: &str) -> Value {
        serde_json::from_str(s).unwrap_or_else(|e| panic!("not JSON ({e}): {s}"))
    }

    #[test]
    fn strips_json_fence() {
        let out = repair_json("```json\n{\"answers\": []}\n```");
        assert_eq!(parses(&out)["answers"], Value::Array(vec![]));
    }

    #[test]
    fn strips_unterminated_fence() {
        let out = strip_code_fences("```json\n{\"a\": 1}");
        assert_eq!(out, "{\"a\": 1}");
    }

    #[test]
    fn cuts_surrounding_prose() {
        let out = repair_json("Here is the grading:\n{\"answers\": [], \"feedback\": \"ok\"}\nHope it helps!");
        assert_eq!(parses(&out)["feedback"], "ok");
    }

    #[test]
    fn removes_trailing_commas() {
        let out = repair_json(r#"{"answers": [{"questionNumber": "1",},],}"#);
        assert_eq!(parses(&out)["answers"][0]["questionNumber"], "1");
    }

    #[test]
    fn closes_truncated_output() {
        let out = repair_json(r#"{"answers": [{"questionNumber": "1", "studentAnswer": "He is"#);
        let v = parses(&out);
        assert_eq!(v["answers"][0]["studentAnswer"], "He is");
    }

    #[test]
    fn dangling_key_gets_null() {
        let out = repair_json(r#"{"answers": [], "feedback":"#);
        assert!(parses(&out)["feedback"].is_null());
    }

    #[test]
    fn quotes_bare_keys() {
        let out = repair_json(r#"{answers: [{questionNumber: "1"}]}"#);
        assert_eq!(parses(&out)["answers"][0]["questionNumber"], "1");
    }

    #[test]
    fn escapes_raw_newlines_in_strings() {
        let out = repair_json("{\"feedback\": \"line one\nline two\"}");
        assert_eq!(parses(&out)["feedback"], "line one\nline two");
    }

    #[test]
    fn brackets_inside_strings_are_ignored() {
        let out = repair_json(r#"{"feedback": "use [brackets] and {braces}"}"#);
        assert_eq!(parses(&out)["feedback"], "use [brackets] and {braces}");
    }

    #[test]
    fn valid_json_is_unchanged() {
        let input = r#"{"answers":[{"questionNumber":"1","isCorrect":true}],"overallScore":"90"}"#;
        assert_eq!(repair_json(input), input);
    }
}
