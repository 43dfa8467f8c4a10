// Documents and the mapping between logical IDs and on-disk paths.

use crate::value::{Map, Value};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File extensions the store treats as documents.
pub const DOC_EXTENSIONS: &[&str] = &["md", "json", "yaml", "yml", "csv"];

/// One logical record: an ID, a free-form content body, and a metadata map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: Map,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Document {
            id: id.into(),
            content: String::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// On-disk storage format of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Markdown,
    Json,
    Yaml,
    Csv,
}

impl Format {
    pub fn from_extension(ext: &str) -> Option<Format> {
        match ext {
            "md" | "markdown" => Some(Format::Markdown),
            "json" => Some(Format::Json),
            "yaml" | "yml" => Some(Format::Yaml),
            "csv" => Some(Format::Csv),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Format> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Format::from_extension)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Format::Markdown => "md",
            Format::Json => "json",
            Format::Yaml => "yaml",
            Format::Csv => "csv",
        }
    }
}

/// Resolve the relative file path and format for a document ID.
///
/// The format comes from the ID's file extension if it has a recognized one,
/// otherwise from an `ext` metadata field, defaulting to Markdown.
pub fn location(id: &str, metadata: &Map) -> (String, Format) {
    if let Some(format) = Format::from_path(Path::new(id)) {
        return (id.to_string(), format);
    }
    if let Some(ext) = metadata.get("ext").and_then(Value::as_str) {
        if let Some(format) = Format::from_extension(ext) {
            return (format!("{id}.{ext}"), format);
        }
    }
    (format!("{id}.md"), Format::Markdown)
}

/// Derive a logical document ID from a relative file path.
/// The default `.md` extension is stripped; any other extension stays part
/// of the ID, so `config.json` is addressed as `config.json`.
pub fn id_from_path(rel_path: &str) -> String {
    match rel_path.strip_suffix(".md") {
        Some(stem) => stem.to_string(),
        None => rel_path.to_string(),
    }
}

/// Whether a path looks like a document the store should care about.
pub fn is_document_file(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => DOC_EXTENSIONS.contains(&ext),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_location_default_markdown() {
        let (path, format) = location("notes/hello", &Map::new());
        assert_eq!(path, "notes/hello.md");
        assert_eq!(format, Format::Markdown);
    }

    #[test]
    fn test_location_from_id_extension() {
        let (path, format) = location("config.json", &Map::new());
        assert_eq!(path, "config.json");
        assert_eq!(format, Format::Json);
    }

    #[test]
    fn test_location_from_ext_metadata() {
        let mut meta = Map::new();
        meta.insert("ext".into(), Value::String("yaml".into()));
        let (path, format) = location("settings", &meta);
        assert_eq!(path, "settings.yaml");
        assert_eq!(format, Format::Yaml);
    }

    #[test]
    fn test_id_round_trips_through_path() {
        assert_eq!(id_from_path("notes/hello.md"), "notes/hello");
        assert_eq!(id_from_path("config.json"), "config.json");
        assert_eq!(id_from_path("data.csv"), "data.csv");
    }

    #[test]
    fn test_is_document_file() {
        assert!(is_document_file(Path::new("a/b.md")));
        assert!(is_document_file(Path::new("a/b.yml")));
        assert!(!is_document_file(Path::new("a/b.txt")));
        assert!(!is_document_file(Path::new("a/b")));
    }
}
