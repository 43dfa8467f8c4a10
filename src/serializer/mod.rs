// Per-format codecs behind a pluggable registry.

pub mod csv;
pub mod json;
pub mod markdown;
pub mod yaml;

use crate::document::{Document, Format};
use crate::error::{Result, VaultError};
use crate::value::{normalize_map_strict, Map, Value};
use std::collections::HashMap;

/// Options shared by every codec.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// When set, JSON/YAML documents nest their metadata under this key
    /// instead of spreading it across the top level.
    pub metadata_key: Option<String>,
}

/// A codec for one on-disk format. Implementations translate between raw
/// bytes and a (content, metadata) pair; ID handling and strict-mode
/// normalization live in the [`Registry`].
pub trait Serializer: Send + Sync {
    fn parse(&self, bytes: &[u8], ctx: &Context) -> std::result::Result<(String, Map), String>;
    fn serialize(
        &self,
        content: &str,
        metadata: &Map,
        ctx: &Context,
    ) -> std::result::Result<Vec<u8>, String>;
}

/// Format-keyed codec registry with an optional strict numeric-fidelity mode.
pub struct Registry {
    strict: bool,
    ctx: Context,
    codecs: HashMap<Format, Box<dyn Serializer>>,
}

impl Registry {
    pub fn new(strict: bool, metadata_key: Option<String>) -> Self {
        let mut codecs: HashMap<Format, Box<dyn Serializer>> = HashMap::new();
        codecs.insert(Format::Markdown, Box::new(markdown::MarkdownSerializer));
        codecs.insert(Format::Json, Box::new(json::JsonSerializer));
        codecs.insert(Format::Yaml, Box::new(yaml::YamlSerializer));
        codecs.insert(Format::Csv, Box::new(csv::CsvSerializer));
        Registry {
            strict,
            ctx: Context { metadata_key },
            codecs,
        }
    }

    /// Replace or add the codec for a format.
    pub fn register(&mut self, format: Format, codec: Box<dyn Serializer>) {
        self.codecs.insert(format, codec);
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn parse(&self, format: Format, id: &str, bytes: &[u8]) -> Result<Document> {
        let codec = self.codec(format, id)?;
        let (content, mut metadata) = codec
            .parse(bytes, &self.ctx)
            .map_err(|message| VaultError::serialization(id, message))?;
        if self.strict {
            normalize_map_strict(&mut metadata);
        }
        Ok(Document {
            id: id.to_string(),
            content,
            metadata,
        })
    }

    pub fn serialize(&self, format: Format, doc: &Document) -> Result<Vec<u8>> {
        let codec = self.codec(format, &doc.id)?;
        let metadata = if self.strict {
            let mut normalized = doc.metadata.clone();
            normalize_map_strict(&mut normalized);
            std::borrow::Cow::Owned(normalized)
        } else {
            std::borrow::Cow::Borrowed(&doc.metadata)
        };
        codec
            .serialize(&doc.content, &metadata, &self.ctx)
            .map_err(|message| VaultError::serialization(&doc.id, message))
    }

    fn codec(&self, format: Format, id: &str) -> Result<&dyn Serializer> {
        self.codecs
            .get(&format)
            .map(|c| c.as_ref())
            .ok_or_else(|| VaultError::serialization(id, format!("no codec for {format:?}")))
    }
}

/// Split a flat object into (content, metadata) following the metadata_key
/// rules shared by the JSON and YAML codecs.
pub(crate) fn object_to_parts(mut map: Map, metadata_key: Option<&str>) -> (String, Map) {
    match metadata_key {
        Some(key) => {
            let metadata = match map.remove(key) {
                Some(Value::Object(inner)) => inner,
                _ => Map::new(),
            };
            let content = match map.remove("content") {
                Some(Value::String(s)) => s,
                _ => String::new(),
            };
            (content, metadata)
        }
        None => {
            let content = match map.get("content") {
                Some(Value::String(_)) => match map.remove("content") {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                },
                _ => String::new(),
            };
            (content, map)
        }
    }
}

/// Inverse of [`object_to_parts`]: build the flat top-level object. When
/// nesting is active, an empty content string is omitted entirely.
pub(crate) fn parts_to_object(content: &str, metadata: &Map, metadata_key: Option<&str>) -> Map {
    let mut map = Map::new();
    match metadata_key {
        Some(key) => {
            map.insert(key.to_string(), Value::Object(metadata.clone()));
            if !content.is_empty() {
                map.insert("content".to_string(), Value::String(content.to_string()));
            }
        }
        None => {
            map = metadata.clone();
            map.insert("content".to_string(), Value::String(content.to_string()));
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strict_mode_round_trips_large_int_everywhere() {
        let registry = Registry::new(true, None);
        let mut doc = Document::new("big");
        doc.metadata
            .insert("n".into(), Value::Int(9223372036854775807));

        for format in [Format::Markdown, Format::Json, Format::Yaml, Format::Csv] {
            let bytes = registry.serialize(format, &doc).unwrap();
            let parsed = registry.parse(format, "big", &bytes).unwrap();
            let digits = match &parsed.metadata["n"] {
                Value::String(s) | Value::Decimal(s) => s.clone(),
                other => panic!("unexpected value in {format:?}: {other:?}"),
            };
            assert_eq!(digits, "9223372036854775807", "format {format:?}");
        }
    }

    #[test]
    fn test_registry_wraps_errors_with_id() {
        let registry = Registry::new(false, None);
        let err = registry
            .parse(Format::Json, "broken", b"{not json")
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_custom_codec_registration() {
        struct Upper;
        impl Serializer for Upper {
            fn parse(
                &self,
                bytes: &[u8],
                _ctx: &Context,
            ) -> std::result::Result<(String, Map), String> {
                Ok((
                    String::from_utf8_lossy(bytes).to_uppercase(),
                    Map::new(),
                ))
            }
            fn serialize(
                &self,
                content: &str,
                _metadata: &Map,
                _ctx: &Context,
            ) -> std::result::Result<Vec<u8>, String> {
                Ok(content.to_lowercase().into_bytes())
            }
        }

        let mut registry = Registry::new(false, None);
        registry.register(Format::Markdown, Box::new(Upper));
        let doc = registry.parse(Format::Markdown, "x", b"hi").unwrap();
        assert_eq!(doc.content, "HI");
    }
}
