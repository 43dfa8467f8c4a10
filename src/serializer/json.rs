// Flat JSON object documents.

use super::{object_to_parts, parts_to_object, Context, Serializer};
use crate::value::{Map, Value};

pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn parse(&self, bytes: &[u8], ctx: &Context) -> Result<(String, Map), String> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        let Value::Object(map) = value else {
            return Err("expected a top-level JSON object".to_string());
        };
        Ok(object_to_parts(map, ctx.metadata_key.as_deref()))
    }

    fn serialize(&self, content: &str, metadata: &Map, ctx: &Context) -> Result<Vec<u8>, String> {
        let map = parts_to_object(content, metadata, ctx.metadata_key.as_deref());
        let mut bytes = serde_json::to_vec_pretty(&map).map_err(|e| e.to_string())?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_content_key_extracted() {
        let bytes = br#"{"content": "hello", "title": "Doc"}"#;
        let (content, meta) = JsonSerializer.parse(bytes, &Context::default()).unwrap();
        assert_eq!(content, "hello");
        assert_eq!(meta["title"], Value::String("Doc".into()));
        assert!(!meta.contains_key("content"));
    }

    #[test]
    fn test_metadata_key_nesting() {
        let ctx = Context {
            metadata_key: Some("meta".to_string()),
        };
        let bytes = br#"{"meta": {"title": "Doc"}, "content": "hello"}"#;
        let (content, meta) = JsonSerializer.parse(bytes, &ctx).unwrap();
        assert_eq!(content, "hello");
        assert_eq!(meta["title"], Value::String("Doc".into()));

        // Empty content is omitted when nesting is active.
        let out = JsonSerializer.serialize("", &meta, &ctx).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("content"));
        assert!(text.contains("meta"));
    }

    #[test]
    fn test_round_trip_flat() {
        let mut meta = Map::new();
        meta.insert("n".into(), Value::Int(7));
        meta.insert("tags".into(), Value::Array(vec![Value::String("a".into())]));
        let bytes = JsonSerializer
            .serialize("body", &meta, &Context::default())
            .unwrap();
        let (content, parsed) = JsonSerializer.parse(&bytes, &Context::default()).unwrap();
        assert_eq!(content, "body");
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_top_level_array_rejected() {
        let err = JsonSerializer
            .parse(b"[1, 2]", &Context::default())
            .unwrap_err();
        assert!(err.contains("object"));
    }
}
