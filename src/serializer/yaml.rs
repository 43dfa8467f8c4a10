// Flat YAML object documents. Same shape rules as JSON.

use super::{object_to_parts, parts_to_object, Context, Serializer};
use crate::value::{Map, Value};

pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn parse(&self, bytes: &[u8], ctx: &Context) -> Result<(String, Map), String> {
        let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
        if text.trim().is_empty() {
            return Ok((String::new(), Map::new()));
        }
        let value: Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        let Value::Object(map) = value else {
            return Err("expected a top-level YAML mapping".to_string());
        };
        Ok(object_to_parts(map, ctx.metadata_key.as_deref()))
    }

    fn serialize(&self, content: &str, metadata: &Map, ctx: &Context) -> Result<Vec<u8>, String> {
        let map = parts_to_object(content, metadata, ctx.metadata_key.as_deref());
        let yaml = serde_yaml::to_string(&map).map_err(|e| e.to_string())?;
        Ok(yaml.into_bytes())
    }
}
