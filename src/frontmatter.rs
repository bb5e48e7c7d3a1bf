use crate::errors::{PersistError, PersistResult};
use crate::models::{EntityId, ParsedDocument};
use serde_json::{Map, Value};

const DELIMITER: &str = "---";

pub fn serialize_document(document: &ParsedDocument) -> PersistResult<String> {
    let metadata_yaml = serde_yaml::to_string(&Value::Object(document.frontmatter.clone()))?;
    Ok(format!(
        "{DELIMITER}\n{}{DELIMITER}\n\n{}",
        metadata_yaml, document.content
    ))
}

/// Splits a Markdown document into its frontmatter mapping and body.
///
/// A document without an opening delimiter is all body. JSON frontmatter is
/// accepted as well as YAML.
pub fn deserialize_document(text: &str) -> PersistResult<ParsedDocument> {
    let normalized = text.replace("\r\n", "\n");
    let Some(rest) = normalized.strip_prefix("---\n") else {
        return Ok(ParsedDocument::new(Map::new(), normalized));
    };

    let (frontmatter, body) = if let Some(body) = rest.strip_prefix("---\n") {
        ("", body)
    } else if rest == DELIMITER {
        ("", "")
    } else if let Some(split_at) = rest.find("\n---\n") {
        (&rest[..split_at], &rest[(split_at + 5)..])
    } else if let Some(frontmatter) = rest.strip_suffix("\n---") {
        (frontmatter, "")
    } else {
        return Err(PersistError::Decode(
            "malformed markdown frontmatter (missing closing delimiter)".to_string(),
        ));
    };

    let body = body.strip_prefix('\n').unwrap_or(body);
    Ok(ParsedDocument::new(parse_frontmatter(frontmatter)?, body))
}

/// The string `id` field of a document's frontmatter, if the document parses
/// and carries one.
pub fn document_id(text: &str) -> Option<EntityId> {
    let document = deserialize_document(text).ok()?;
    match document.frontmatter.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        _ => None,
    }
}

fn parse_frontmatter(frontmatter: &str) -> PersistResult<Map<String, Value>> {
    if frontmatter.trim().is_empty() {
        return Ok(Map::new());
    }

    let metadata: Value = match serde_json::from_str(frontmatter) {
        Ok(value) => value,
        Err(_) => {
            let yaml_value: serde_yaml::Value = serde_yaml::from_str(frontmatter)?;
            serde_json::to_value(yaml_value)?
        }
    };

    match metadata {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(PersistError::Decode(format!(
            "frontmatter must be a mapping, found {}",
            value_kind(&other)
        ))),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frontmatter(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object frontmatter")
    }

    #[test]
    fn document_roundtrip_preserves_fields_and_body() {
        let document = ParsedDocument::new(
            frontmatter(json!({
                "user_id": "user-1",
                "name": "John Doe",
                "pinned": false,
                "tags": ["a", "b"]
            })),
            "Met at the offsite.\n\nFollow up in March.",
        );
        let rendered = serialize_document(&document).expect("serialize");
        assert!(rendered.starts_with("---\n"));
        assert_eq!(deserialize_document(&rendered).expect("deserialize"), document);
    }

    #[test]
    fn plain_markdown_is_all_body() {
        let parsed = deserialize_document("# Heading\n\ntext").expect("deserialize");
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.content, "# Heading\n\ntext");
    }

    #[test]
    fn accepts_json_frontmatter_and_crlf() {
        let parsed =
            deserialize_document("---\r\n{\"name\": \"Acme\"}\r\n---\r\n\r\nbody").expect("deserialize");
        assert_eq!(parsed.frontmatter, frontmatter(json!({"name": "Acme"})));
        assert_eq!(parsed.content, "body");
    }

    #[test]
    fn empty_frontmatter_blocks_are_allowed() {
        let parsed = deserialize_document("---\n---\nbody").expect("deserialize");
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.content, "body");

        let parsed = deserialize_document("---\nname: x\n---").expect("deserialize");
        assert_eq!(parsed.frontmatter, frontmatter(json!({"name": "x"})));
        assert_eq!(parsed.content, "");
    }

    #[test]
    fn document_id_reads_the_frontmatter_id() {
        assert_eq!(document_id("---\nid: n1\n---\n\nbody"), Some("n1".to_string()));
        assert_eq!(document_id("---\nid: 7\n---\n"), None);
        assert_eq!(document_id("plain body"), None);
        assert_eq!(document_id("---\nid: [broken\n"), None);
    }

    #[test]
    fn rejects_unterminated_or_non_mapping_frontmatter() {
        let error = deserialize_document("---\nname: x\nbody").expect_err("missing closing delimiter");
        assert!(error.to_string().contains("DECODE_FAILED"));

        let error = deserialize_document("---\n- a\n- b\n---\n").expect_err("sequence frontmatter");
        assert!(error.to_string().contains("mapping"));
    }
}
