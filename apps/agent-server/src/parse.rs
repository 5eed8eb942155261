// [[ASSEMBLY]]/apps/agent-server/src/parse.rs
// Purpose: Turn LLM CLI text into a JSON document.
// Architecture: Infrastructure Helper Layer
// Dependencies: serde_json, thiserror

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("LLM output was empty")]
    Empty,
    #[error("No JSON object found in LLM output")]
    NoJsonObject,
    #[error("Malformed JSON object in LLM output: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Strict parse first. The only fallback is the first balanced `{...}` block,
/// which covers prose-wrapped and ```json fenced answers. The result must be
/// a JSON object.
pub fn parse_json_document(raw: &str) -> Result<Value, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let block = first_object_block(trimmed).ok_or(ParseError::NoJsonObject)?;
    match serde_json::from_str::<Value>(block) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(ParseError::NoJsonObject),
        Err(e) => Err(ParseError::Malformed(e)),
    }
}

/// Slice of the first `{` through its matching `}`. Braces inside string
/// literals (including escaped quotes) do not count.
fn first_object_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_object_parses() {
        let value = parse_json_document(r#"{"concept": {"genre": "tafsir"}}"#).unwrap();
        assert_eq!(value["concept"]["genre"], "tafsir");
    }

    #[test]
    fn test_fenced_answer_uses_fallback() {
        let raw = "Here is the analysis:\n```json\n{\"categories\": [\"fiqh\"], \"note\": \"a } inside \\\" quotes {\"}\n```\nDone.";
        let value = parse_json_document(raw).unwrap();
        assert_eq!(value["categories"][0], "fiqh");
        assert_eq!(value["note"], "a } inside \" quotes {");
    }

    #[test]
    fn test_errors_are_tagged() {
        assert!(matches!(parse_json_document("   "), Err(ParseError::Empty)));
        assert!(matches!(
            parse_json_document("no structure at all"),
            Err(ParseError::NoJsonObject)
        ));
        assert!(matches!(
            parse_json_document("[1, 2, 3]"),
            Err(ParseError::NoJsonObject)
        ));
        assert!(matches!(
            parse_json_document("prefix {\"a\": tru} suffix"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_json_document("unterminated {\"a\": 1"),
            Err(ParseError::NoJsonObject)
        ));
    }
}
