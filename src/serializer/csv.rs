// CSV documents: header row plus a single data row. Collection files reuse
// the table and cell helpers here.

use super::{Context, Serializer};
use crate::value::{Map, Value};

pub struct CsvSerializer;

impl Serializer for CsvSerializer {
    fn parse(&self, bytes: &[u8], _ctx: &Context) -> Result<(String, Map), String> {
        let (headers, rows) = read_table(bytes).map_err(|e| e.to_string())?;
        let row = rows.first().ok_or("CSV document has no data row")?;

        let mut content = String::new();
        let mut metadata = Map::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            if header.eq_ignore_ascii_case("content") {
                content = cell.clone();
            } else {
                metadata.insert(header.clone(), decode_cell(cell));
            }
        }
        Ok((content, metadata))
    }

    fn serialize(&self, content: &str, metadata: &Map, _ctx: &Context) -> Result<Vec<u8>, String> {
        let mut headers: Vec<String> = metadata.keys().cloned().collect();
        let mut row: Vec<String> = metadata.values().map(encode_cell).collect();
        // A document with no metadata still needs a parseable table shape,
        // so the content column is kept even when empty.
        if !content.is_empty() || headers.is_empty() {
            headers.push("content".to_string());
            row.push(content.to_string());
        }
        write_table(&headers, &[row]).map_err(|e| e.to_string())
    }
}

/// Read a whole CSV file as (headers, data rows).
pub fn read_table(bytes: &[u8]) -> Result<(Vec<String>, Vec<Vec<String>>), csv::Error> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok((headers, rows))
}

/// Render headers plus rows back into CSV bytes.
pub fn write_table(headers: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

/// Decode one cell using the smart-JSON heuristic: a trimmed value wrapped
/// in a matching `{}`/`[]` pair is attempted as JSON and kept as structured
/// data on success, as the raw string otherwise.
///
/// Known false-positive surface: a literal string that happens to be valid
/// object/array-shaped JSON is reinterpreted as structured data. Callers may
/// depend on this, so it is preserved deliberately.
pub fn decode_cell(cell: &str) -> Value {
    let trimmed = cell.trim();
    let looks_structured = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if looks_structured {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return value;
        }
    }
    Value::String(cell.to_string())
}

/// Encode one metadata value into a cell. Maps and arrays are JSON-encoded;
/// scalars are written as their plain string form, nulls as empty cells.
pub fn encode_cell(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_document_round_trip() {
        let mut meta = Map::new();
        meta.insert("name".into(), Value::String("Jane Doe".into()));
        meta.insert("age".into(), Value::String("33".into()));
        let bytes = CsvSerializer
            .serialize("bio text", &meta, &Context::default())
            .unwrap();
        let (content, parsed) = CsvSerializer.parse(&bytes, &Context::default()).unwrap();
        assert_eq!(content, "bio text");
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_empty_document_round_trip() {
        let bytes = CsvSerializer
            .serialize("", &Map::new(), &Context::default())
            .unwrap();
        assert!(!bytes.is_empty());
        let (content, meta) = CsvSerializer.parse(&bytes, &Context::default()).unwrap();
        assert_eq!(content, "");
        assert!(meta.is_empty());
    }

    #[test]
    fn test_content_header_case_insensitive() {
        let bytes = b"Name,CONTENT\njane,hello\n";
        let (content, meta) = CsvSerializer.parse(bytes, &Context::default()).unwrap();
        assert_eq!(content, "hello");
        assert_eq!(meta["Name"], Value::String("jane".into()));
    }

    #[test]
    fn test_missing_data_row_is_error() {
        let err = CsvSerializer
            .parse(b"a,b\n", &Context::default())
            .unwrap_err();
        assert!(err.contains("no data row"));
    }

    #[test]
    fn test_smart_json_decodes_structured_cells() {
        assert_eq!(
            decode_cell(r#"{"a": 1}"#),
            Value::Object(Map::from([("a".to_string(), Value::Int(1))]))
        );
        assert_eq!(
            decode_cell("[1, 2]"),
            Value::Array(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn test_smart_json_keeps_invalid_braces_as_string() {
        assert_eq!(decode_cell("{not json}"), Value::String("{not json}".into()));
        assert_eq!(decode_cell("plain"), Value::String("plain".into()));
        // Numbers are not sniffed; cells stay strings.
        assert_eq!(decode_cell("42"), Value::String("42".into()));
    }

    #[test]
    fn test_complex_values_json_encoded_into_cells() {
        let value = Value::Array(vec![Value::String("x".into())]);
        let cell = encode_cell(&value);
        assert_eq!(cell, r#"["x"]"#);
        assert_eq!(decode_cell(&cell), value);
    }
}
