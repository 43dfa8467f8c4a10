// Markdown with an optional YAML frontmatter block.

use super::{Context, Serializer};
use crate::value::Map;

pub struct MarkdownSerializer;

impl Serializer for MarkdownSerializer {
    fn parse(&self, bytes: &[u8], _ctx: &Context) -> Result<(String, Map), String> {
        let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;

        let lines: Vec<&str> = text.split('\n').collect();
        if !lines.first().is_some_and(|l| is_delimiter(l)) {
            // No frontmatter: the whole file is content.
            return Ok((text.to_string(), Map::new()));
        }

        let close = lines
            .iter()
            .skip(1)
            .position(|l| is_delimiter(l))
            .map(|i| i + 1)
            .ok_or("unterminated frontmatter block")?;

        let frontmatter: String = lines[1..close]
            .iter()
            .map(|l| strip_cr(l))
            .collect::<Vec<_>>()
            .join("\n");
        let metadata: Map = if frontmatter.trim().is_empty() {
            Map::new()
        } else {
            serde_yaml::from_str(&frontmatter).map_err(|e| e.to_string())?
        };

        let content = lines[close + 1..].join("\n");
        Ok((content, metadata))
    }

    fn serialize(&self, content: &str, metadata: &Map, _ctx: &Context) -> Result<Vec<u8>, String> {
        if metadata.is_empty() {
            return Ok(content.as_bytes().to_vec());
        }
        let yaml = serde_yaml::to_string(metadata).map_err(|e| e.to_string())?;
        // serde_yaml output already ends with a newline
        Ok(format!("---\n{yaml}---\n{content}").into_bytes())
    }
}

/// A delimiter line is exactly `---`. Only the carriage return of a CRLF
/// line ending is tolerated; trailing spaces make it ordinary content.
fn is_delimiter(line: &str) -> bool {
    strip_cr(line) == "---"
}

fn strip_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}
