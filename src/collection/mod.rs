// Collection files: a single CSV or JSON file whose rows are independently
// addressable documents.

use crate::document::{Document, Format};
use crate::error::{Result, VaultError};
use crate::serializer::csv::{decode_cell, encode_cell, read_table, write_table};
use crate::value::{normalize_map_strict, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// A resolved row address inside a collection file.
#[derive(Debug, Clone)]
pub struct CollectionRef {
    pub abs_path: PathBuf,
    pub rel_path: String,
    pub format: Format,
    pub row_key: String,
}

impl CollectionRef {
    /// Canonical document ID for this row.
    pub fn row_id(&self) -> String {
        format!("{}/{}", self.rel_path, self.row_key)
    }
}

/// Split an ID into its collection segment and trailing row key.
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    let (stem, key) = id.rsplit_once('/')?;
    if stem.is_empty() || key.is_empty() {
        return None;
    }
    Some((stem, key))
}

/// Probe for an existing collection file matching the ID's leading segment:
/// the segment itself, then (when extension-less) `<segment>.csv` and
/// `<segment>.json`, first existing non-directory match wins.
pub fn find(root: &Path, id: &str) -> Option<CollectionRef> {
    let (stem, key) = split_id(id)?;
    for (rel, format) in candidates(stem) {
        let abs = root.join(&rel);
        if abs.is_file() {
            return Some(CollectionRef {
                abs_path: abs,
                rel_path: rel,
                format,
                row_key: key.to_string(),
            });
        }
    }
    None
}

/// Resolve the collection file a save should target. An explicit `.csv` or
/// `.json` segment addresses that file even when it does not exist yet;
/// otherwise only an existing file qualifies.
pub fn target(root: &Path, id: &str) -> Option<CollectionRef> {
    let (stem, key) = split_id(id)?;
    match Format::from_path(Path::new(stem)) {
        Some(format @ (Format::Csv | Format::Json)) => Some(CollectionRef {
            abs_path: root.join(stem),
            rel_path: stem.to_string(),
            format,
            row_key: key.to_string(),
        }),
        Some(_) => None,
        None => find(root, id),
    }
}

fn candidates(stem: &str) -> Vec<(String, Format)> {
    match Format::from_path(Path::new(stem)) {
        Some(format @ (Format::Csv | Format::Json)) => vec![(stem.to_string(), format)],
        Some(_) => Vec::new(),
        None => vec![
            (format!("{stem}.csv"), Format::Csv),
            (format!("{stem}.json"), Format::Json),
        ],
    }
}

/// Row-level reads and read-modify-write rendering for collection files.
pub struct Collections {
    id_column: String,
    strict: bool,
}

impl Collections {
    pub fn new(id_column: impl Into<String>, strict: bool) -> Collections {
        Collections {
            id_column: id_column.into(),
            strict,
        }
    }

    /// Read the file once and return the row addressed by `cref`.
    pub fn get_row(&self, cref: &CollectionRef) -> Result<Document> {
        let bytes = std::fs::read(&cref.abs_path)?;
        match cref.format {
            Format::Csv => self.get_csv_row(cref, &bytes),
            Format::Json => self.get_json_row(cref, &bytes),
            _ => Err(VaultError::serialization(
                cref.row_id(),
                "not a collection format",
            )),
        }
    }

    /// One read-modify-write pass applying every staged update and delete
    /// for this file, returning the rewritten bytes.
    pub fn render(
        &self,
        cref: &CollectionRef,
        updates: &BTreeMap<String, Document>,
        deletes: &BTreeSet<String>,
    ) -> Result<Vec<u8>> {
        match cref.format {
            Format::Csv => self.render_csv(cref, updates, deletes),
            Format::Json => self.render_json(cref, updates, deletes),
            _ => Err(VaultError::serialization(
                cref.rel_path.clone(),
                "not a collection format",
            )),
        }
    }

    /// Surface every row of a collection file as an independent document
    /// with ID `<relative-path>/<row-key>`. Files without an addressable ID
    /// column yield nothing.
    pub fn list_rows(&self, abs_path: &Path, rel_path: &str) -> Result<Vec<Document>> {
        let format = match Format::from_path(abs_path) {
            Some(format @ (Format::Csv | Format::Json)) => format,
            _ => return Ok(Vec::new()),
        };
        let bytes = std::fs::read(abs_path)?;
        match format {
            Format::Csv => {
                let (headers, rows) = read_table(&bytes)
                    .map_err(|e| VaultError::serialization(rel_path, e))?;
                let Some(id_idx) = self.id_column_index(&headers) else {
                    return Ok(Vec::new());
                };
                let mut docs = Vec::new();
                for row in &rows {
                    let Some(key) = row.get(id_idx).filter(|k| !k.is_empty()) else {
                        continue;
                    };
                    docs.push(self.csv_row_to_doc(
                        format!("{rel_path}/{key}"),
                        &headers,
                        row,
                        id_idx,
                    ));
                }
                Ok(docs)
            }
            Format::Json => {
                let value: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| VaultError::serialization(rel_path, e))?;
                let Value::Array(items) = value else {
                    return Ok(Vec::new());
                };
                let mut docs = Vec::new();
                for item in items {
                    let Value::Object(obj) = item else { continue };
                    let Some(key) = obj.get(&self.id_column).map(Value::to_string) else {
                        continue;
                    };
                    if key.is_empty() {
                        continue;
                    }
                    docs.push(self.json_obj_to_doc(format!("{rel_path}/{key}"), obj));
                }
                Ok(docs)
            }
            _ => unreachable!(),
        }
    }

    // ── CSV ────────────────────────────────────────────────────────

    fn id_column_index(&self, headers: &[String]) -> Option<usize> {
        headers.iter().position(|h| *h == self.id_column)
    }

    fn get_csv_row(&self, cref: &CollectionRef, bytes: &[u8]) -> Result<Document> {
        let (headers, rows) =
            read_table(bytes).map_err(|e| VaultError::serialization(cref.row_id(), e))?;
        let id_idx = self.id_column_index(&headers).ok_or_else(|| {
            VaultError::serialization(
                cref.row_id(),
                format!("ID column '{}' not found in {}", self.id_column, cref.rel_path),
            )
        })?;
        for row in &rows {
            if row.get(id_idx).map(String::as_str) == Some(cref.row_key.as_str()) {
                return Ok(self.csv_row_to_doc(cref.row_id(), &headers, row, id_idx));
            }
        }
        Err(VaultError::NotFound(cref.row_id()))
    }

    fn csv_row_to_doc(
        &self,
        id: String,
        headers: &[String],
        row: &[String],
        id_idx: usize,
    ) -> Document {
        let mut doc = Document::new(id);
        for (i, header) in headers.iter().enumerate() {
            if i == id_idx {
                continue;
            }
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            if header.eq_ignore_ascii_case("content") {
                doc.content = cell.to_string();
            } else {
                doc.metadata.insert(header.clone(), decode_cell(cell));
            }
        }
        if self.strict {
            normalize_map_strict(&mut doc.metadata);
        }
        doc
    }

    fn render_csv(
        &self,
        cref: &CollectionRef,
        updates: &BTreeMap<String, Document>,
        deletes: &BTreeSet<String>,
    ) -> Result<Vec<u8>> {
        let (mut headers, mut rows) = if cref.abs_path.is_file() {
            let bytes = std::fs::read(&cref.abs_path)?;
            read_table(&bytes).map_err(|e| VaultError::serialization(cref.rel_path.clone(), e))?
        } else {
            (vec![self.id_column.clone()], Vec::new())
        };

        let id_idx = self.id_column_index(&headers).ok_or_else(|| {
            VaultError::serialization(
                cref.rel_path.clone(),
                format!("ID column '{}' not found in {}", self.id_column, cref.rel_path),
            )
        })?;

        // Add columns any staged document introduces; pad existing rows.
        let wants_content = updates.values().any(|doc| !doc.content.is_empty());
        let has_content_col = headers.iter().any(|h| h.eq_ignore_ascii_case("content"));
        let mut new_columns: Vec<String> = Vec::new();
        for doc in updates.values() {
            for key in doc.metadata.keys() {
                if !headers.contains(key) && !new_columns.contains(key) {
                    new_columns.push(key.clone());
                }
            }
        }
        if wants_content && !has_content_col {
            new_columns.push("content".to_string());
        }
        if !new_columns.is_empty() {
            for row in &mut rows {
                row.extend(std::iter::repeat(String::new()).take(new_columns.len()));
            }
            headers.extend(new_columns);
        }

        for key in deletes {
            let before = rows.len();
            rows.retain(|row| row.get(id_idx).map(String::as_str) != Some(key.as_str()));
            if rows.len() == before {
                return Err(VaultError::NotFound(format!("{}/{key}", cref.rel_path)));
            }
        }

        for (key, doc) in updates {
            let rendered = self.doc_to_csv_row(&headers, id_idx, key, doc);
            match rows
                .iter_mut()
                .find(|row| row.get(id_idx).map(String::as_str) == Some(key.as_str()))
            {
                Some(existing) => *existing = rendered,
                None => rows.push(rendered),
            }
        }

        write_table(&headers, &rows)
            .map_err(|e| VaultError::serialization(cref.rel_path.clone(), e))
    }

    /// Row-replace semantics: every header column is filled from the staged
    /// document's metadata, with columns it does not mention cleared to "".
    fn doc_to_csv_row(
        &self,
        headers: &[String],
        id_idx: usize,
        key: &str,
        doc: &Document,
    ) -> Vec<String> {
        let mut metadata = doc.metadata.clone();
        if self.strict {
            normalize_map_strict(&mut metadata);
        }
        headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                if i == id_idx {
                    key.to_string()
                } else if header.eq_ignore_ascii_case("content") {
                    doc.content.clone()
                } else {
                    metadata.get(header).map(encode_cell).unwrap_or_default()
                }
            })
            .collect()
    }

    // ── JSON ───────────────────────────────────────────────────────

    fn get_json_row(&self, cref: &CollectionRef, bytes: &[u8]) -> Result<Document> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| VaultError::serialization(cref.row_id(), e))?;
        let Value::Array(items) = value else {
            return Err(VaultError::serialization(
                cref.row_id(),
                "expected a top-level JSON array",
            ));
        };
        for item in items {
            if let Value::Object(obj) = item {
                if obj.get(&self.id_column).map(Value::to_string).as_deref()
                    == Some(cref.row_key.as_str())
                {
                    return Ok(self.json_obj_to_doc(cref.row_id(), obj));
                }
            }
        }
        Err(VaultError::NotFound(cref.row_id()))
    }

    fn json_obj_to_doc(&self, id: String, mut obj: Map) -> Document {
        let mut doc = Document::new(id);
        obj.remove(&self.id_column);
        if let Some(Value::String(content)) = obj.remove("content") {
            doc.content = content;
        }
        doc.metadata = obj;
        if self.strict {
            normalize_map_strict(&mut doc.metadata);
        }
        doc
    }

    fn render_json(
        &self,
        cref: &CollectionRef,
        updates: &BTreeMap<String, Document>,
        deletes: &BTreeSet<String>,
    ) -> Result<Vec<u8>> {
        let mut items: Vec<Value> = if cref.abs_path.is_file() {
            let bytes = std::fs::read(&cref.abs_path)?;
            match serde_json::from_slice(&bytes)
                .map_err(|e| VaultError::serialization(cref.rel_path.clone(), e))?
            {
                Value::Array(items) => items,
                _ => {
                    return Err(VaultError::serialization(
                        cref.rel_path.clone(),
                        "expected a top-level JSON array",
                    ))
                }
            }
        } else {
            Vec::new()
        };

        let row_key_of = |item: &Value| -> Option<String> {
            match item {
                Value::Object(obj) => obj.get(&self.id_column).map(Value::to_string),
                _ => None,
            }
        };

        for key in deletes {
            let before = items.len();
            items.retain(|item| row_key_of(item).as_deref() != Some(key.as_str()));
            if items.len() == before {
                return Err(VaultError::NotFound(format!("{}/{key}", cref.rel_path)));
            }
        }

        for (key, doc) in updates {
            let mut obj = doc.metadata.clone();
            if self.strict {
                normalize_map_strict(&mut obj);
            }
            obj.insert(self.id_column.clone(), Value::String(key.clone()));
            if !doc.content.is_empty() {
                obj.insert("content".to_string(), Value::String(doc.content.clone()));
            }
            let rendered = Value::Object(obj);
            match items
                .iter_mut()
                .find(|item| row_key_of(item).as_deref() == Some(key.as_str()))
            {
                Some(existing) => *existing = rendered,
                None => items.push(rendered),
            }
        }

        let mut bytes = serde_json::to_vec_pretty(&Value::Array(items))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}
