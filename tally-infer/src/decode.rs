//! Boundary where free-form model text becomes typed structure.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no JSON object found in output")]
    NoObject,
    #[error("unbalanced JSON object in output")]
    Unbalanced,
    #[error("invalid JSON: {0}")]
    Json(String),
}

/// Locates the JSON object in a model reply: the whole reply, a ```json fence,
/// or the first balanced `{...}` span (braces inside strings are ignored).
pub fn extract_json_object(text: &str) -> Result<&str, DecodeError> {
    let stripped = text.trim();
    if stripped.starts_with('{') && stripped.ends_with('}') {
        return Ok(stripped);
    }

    if let Some(fence) = stripped.find("```json") {
        let after = fence + "```json".len();
        if let (Some(open), Some(close)) = (
            stripped[after..].find('{').map(|i| after + i),
            stripped[after..].find("```").map(|i| after + i),
        ) {
            if close > open {
                return Ok(stripped[open..close].trim());
            }
        }
    }

    let start = stripped.find('{').ok_or(DecodeError::NoObject)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in stripped[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&stripped[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    Err(DecodeError::Unbalanced)
}

pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, DecodeError> {
    let candidate = extract_json_object(text)?;
    serde_json::from_str(candidate).map_err(|e| DecodeError::Json(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    struct Reply {
        route: String,
    }

    #[test]
    fn accepts_bare_fenced_and_embedded_objects() {
        let bare: Reply = decode_json(r#"{"route":"fast_path"}"#).unwrap();
        assert_eq!(bare.route, "fast_path");

        let fenced: Reply =
            decode_json("Sure!\n```json\n{\"route\": \"deep_path\"}\n```\nDone.").unwrap();
        assert_eq!(fenced.route, "deep_path");

        let embedded: Reply =
            decode_json(r#"The answer is {"route": "a}b", "x": {"y": 1}} hope that helps"#).unwrap();
        assert_eq!(embedded.route, "a}b");
    }

    #[test]
    fn reports_missing_and_unbalanced_objects() {
        assert!(matches!(extract_json_object("no json here"), Err(DecodeError::NoObject)));
        assert!(matches!(
            extract_json_object("prefix {\"a\": {\"b\": 1}"),
            Err(DecodeError::Unbalanced)
        ));
        assert!(matches!(
            decode_json::<Reply>("{\"other\": 1}"),
            Err(DecodeError::Json(_))
        ));
    }
}
