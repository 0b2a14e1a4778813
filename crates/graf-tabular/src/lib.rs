//! Tabular file handling: permissive CSV reading, XLSX worksheet parsing, and
//! JSON-to-record-set conversion.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde_json::{Map, Value};
use thiserror::Error;

/// Name of this crate, used as a stable identifier in diagnostics.
pub const CRATE_NAME: &str = "graf-tabular";

/// Maximum decompressed bytes read from a single workbook ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Candidate CSV delimiters, tried when the default parse fails.
const DELIMITER_CANDIDATES: [char; 4] = [',', ';', '\t', '|'];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("csv parsing failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("workbook error: {0}")]
    Workbook(String),
    #[error("table is empty: {0}")]
    Empty(String),
    #[error("json value has no tabular shape")]
    JsonShape,
    #[error("file is not valid UTF-8 text")]
    NotUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A fully-read table: one header row plus zero or more data rows, every data
/// row padded to the header width.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn first_row(&self) -> Option<&[String]> {
        self.rows.first().map(|r| r.as_slice())
    }
}

/// Outcome of a saved-file verification chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Some parse strategy in the chain succeeded.
    Parsed,
    /// Nothing parsed but the file is present and non-empty.
    PresentUnparsed,
    /// The file is missing or empty.
    Failed,
}

/// Picks the delimiter occurring most often in the header line. Ties keep the
/// earlier candidate, so a plain line yields a comma.
pub fn sniff_delimiter(header_line: &str) -> u8 {
    let mut best = b',';
    let mut best_count = header_line.matches(',').count();
    for &candidate in &DELIMITER_CANDIDATES[1..] {
        let count = header_line.matches(candidate).count();
        if count > best_count {
            best = candidate as u8;
            best_count = count;
        }
    }
    best
}

/// Reads a CSV file, falling back through progressively more permissive parse
/// strategies: default comma parse, ragged-row-tolerant parse, unquoted parse
/// with backslash escapes, then a sniffed delimiter.
pub fn read_csv_table(path: &Path) -> Result<Table, TableError> {
    let bytes = std::fs::read(path)?;
    read_csv_bytes(&bytes)
}

pub fn read_csv_bytes(bytes: &[u8]) -> Result<Table, TableError> {
    if std::str::from_utf8(bytes).is_err() {
        return Err(TableError::NotUtf8);
    }
    let header_line = first_line(bytes);
    let delimiter = sniff_delimiter(&header_line);
    match csv_attempt(bytes, b',', true, None, false) {
        Ok(table) => {
            // A one-column result under a dominant non-comma delimiter means
            // the default parse swallowed the real separator.
            if table.columns.len() == 1 && delimiter != b',' {
                if let Ok(resniffed) = csv_attempt(bytes, delimiter, true, None, true) {
                    if resniffed.columns.len() > 1 {
                        return Ok(resniffed);
                    }
                }
            }
            Ok(table)
        }
        Err(_) => {
            if let Ok(table) = csv_attempt(bytes, b',', true, None, true) {
                return Ok(table);
            }
            if let Ok(table) = csv_attempt(bytes, b',', false, Some(b'\\'), true) {
                return Ok(table);
            }
            csv_attempt(bytes, delimiter, true, None, true)
        }
    }
}

fn first_line(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn csv_attempt(
    bytes: &[u8],
    delimiter: u8,
    quoting: bool,
    escape: Option<u8>,
    skip_ragged: bool,
) -> Result<Table, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .quoting(quoting)
        .escape(escape)
        .flexible(skip_ragged)
        .has_headers(true)
        .from_reader(bytes);
    let columns: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|f| String::from_utf8_lossy(f).trim().to_string())
        .collect();
    if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
        return Err(TableError::Empty("no header row".to_string()));
    }
    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record?;
        let mut row: Vec<String> = record
            .iter()
            .map(|f| String::from_utf8_lossy(f).to_string())
            .collect();
        if row.len() != columns.len() {
            if skip_ragged && row.len() > columns.len() {
                continue;
            }
            row.resize(columns.len(), String::new());
        }
        rows.push(row);
    }
    Ok(Table { columns, rows })
}

/// Serializes a table to CSV bytes. Callers own the (atomic) write to disk.
pub fn to_csv_bytes(columns: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>, TableError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| TableError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

/// Runs the CSV verification chain against a saved download.
pub fn verify_csv_file(path: &Path) -> Verification {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(_) => return Verification::Failed,
    };
    if bytes.is_empty() {
        return Verification::Failed;
    }
    if read_csv_bytes(&bytes).is_ok() {
        return Verification::Parsed;
    }
    match std::str::from_utf8(&bytes) {
        Ok(text) if !text.trim().is_empty() => Verification::Parsed,
        _ => Verification::PresentUnparsed,
    }
}

/// Runs the Excel verification chain against a saved download.
pub fn verify_xlsx_file(path: &Path) -> Verification {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(_) => return Verification::Failed,
    };
    if bytes.is_empty() {
        return Verification::Failed;
    }
    if read_xlsx_table(&bytes).is_ok() {
        Verification::Parsed
    } else {
        Verification::PresentUnparsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellType {
    Shared,
    Inline,
    Other,
}

/// Reads the first worksheet of an XLSX workbook into a table. The first
/// spreadsheet row becomes the header.
pub fn read_xlsx_table(bytes: &[u8]) -> Result<Table, TableError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| TableError::Workbook(e.to_string()))?;
    let shared = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&mut archive);
    let first = sheet_names
        .first()
        .ok_or_else(|| TableError::Workbook("no worksheets".to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, first, MAX_XML_ENTRY_BYTES)?;
    let mut rows = parse_sheet_rows(&xml, &shared)?;
    while rows.first().is_some_and(|r| r.iter().all(|c| c.is_empty())) {
        rows.remove(0);
    }
    if rows.is_empty() {
        return Err(TableError::Empty("worksheet has no rows".to_string()));
    }
    let columns = rows.remove(0);
    let width = columns.len();
    let rows = rows
        .into_iter()
        .map(|mut r| {
            r.resize(width, String::new());
            r
        })
        .collect();
    Ok(Table { columns, rows })
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, TableError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| TableError::Workbook(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| TableError::Workbook(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(TableError::Workbook(format!(
            "ZIP entry {name} exceeds size limit ({max_bytes} bytes)"
        )));
    }
    Ok(out)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, TableError> {
    // Workbooks without string cells ship no sharedStrings part.
    let xml = match read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES) {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        strings.push(te.unescape().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(TableError::Workbook(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn read_cell_attrs(e: &quick_xml::events::BytesStart<'_>, default_col: usize) -> (usize, CellType) {
    let mut col = default_col;
    let mut ty = CellType::Other;
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"r" => {
                if let Some(i) = column_index(&String::from_utf8_lossy(attr.value.as_ref())) {
                    col = i;
                }
            }
            b"t" => {
                ty = match attr.value.as_ref() {
                    b"s" => CellType::Shared,
                    b"inlineStr" => CellType::Inline,
                    _ => CellType::Other,
                };
            }
            _ => {}
        }
    }
    (col, ty)
}

/// Column index from an `A1`-style cell reference (`A` is 0, `AA` is 26).
/// References whose column accumulates past `usize` are unparseable.
fn column_index(cell_ref: &str) -> Option<usize> {
    let mut idx = 0usize;
    let mut seen = false;
    for c in cell_ref.chars() {
        if !c.is_ascii_alphabetic() {
            break;
        }
        seen = true;
        let offset = c.to_ascii_uppercase() as usize - 'A' as usize + 1;
        idx = idx.checked_mul(26)?.checked_add(offset)?;
    }
    if seen {
        Some(idx - 1)
    } else {
        None
    }
}

fn set_cell(row: &mut Vec<String>, col: usize, value: String) {
    if row.len() <= col {
        row.resize(col + 1, String::new());
    }
    row[col] = value;
}

fn parse_sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>, TableError> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut in_row = false;
    let mut cell_col = 0usize;
    let mut cell_type = CellType::Other;
    let mut in_v = false;
    let mut in_inline_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = true;
                    current = Vec::new();
                }
                b"c" if in_row => {
                    let (col, ty) = read_cell_attrs(&e, current.len());
                    cell_col = col;
                    cell_type = ty;
                }
                b"v" => in_v = true,
                b"t" if cell_type == CellType::Inline => in_inline_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Empty(e)) => {
                if e.local_name().as_ref() == b"c" && in_row {
                    let (col, _) = read_cell_attrs(&e, current.len());
                    set_cell(&mut current, col, String::new());
                }
            }
            Ok(quick_xml::events::Event::Text(te)) => {
                let text = te.unescape().unwrap_or_default();
                if in_v {
                    let value = match cell_type {
                        CellType::Shared => text
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default(),
                        _ => text.into_owned(),
                    };
                    set_cell(&mut current, cell_col, value);
                } else if in_inline_t {
                    set_cell(&mut current, cell_col, text.into_owned());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = false;
                    rows.push(std::mem::take(&mut current));
                }
                b"v" => in_v = false,
                b"t" => in_inline_t = false,
                b"c" => cell_type = CellType::Other,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(TableError::Workbook(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

/// Turns a JSON document into a record set: an array yields one record per
/// element; an object with a list-valued member yields records from the first
/// such list; any other object becomes a single record.
pub fn json_to_records(value: &Value) -> Result<Vec<Map<String, Value>>, TableError> {
    match value {
        Value::Array(items) => Ok(items
            .iter()
            .map(|item| match item {
                Value::Object(map) => map.clone(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other.clone());
                    map
                }
            })
            .collect()),
        Value::Object(map) => {
            for member in map.values() {
                if member.is_array() {
                    return json_to_records(member);
                }
            }
            Ok(vec![map.clone()])
        }
        _ => Err(TableError::JsonShape),
    }
}

/// Flattens records onto a CSV: nested objects become dotted column names,
/// arrays are carried as JSON text, and the header is the sorted union of
/// every record's keys.
pub fn json_records_to_csv_bytes(records: &[Map<String, Value>]) -> Result<Vec<u8>, TableError> {
    if records.is_empty() {
        return Err(TableError::Empty("no records to project".to_string()));
    }
    let flattened: Vec<BTreeMap<String, String>> = records
        .iter()
        .map(|record| {
            let mut out = BTreeMap::new();
            for (key, value) in record {
                flatten_into(key, value, &mut out);
            }
            out
        })
        .collect();
    let mut columns: Vec<String> = Vec::new();
    for record in &flattened {
        for key in record.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns.sort();
    let rows: Vec<Vec<String>> = flattened
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|col| record.get(col).cloned().unwrap_or_default())
                .collect()
        })
        .collect();
    to_csv_bytes(&columns, &rows)
}

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                flatten_into(&format!("{prefix}.{key}"), nested, out);
            }
        }
        Value::Null => {
            out.insert(prefix.to_string(), String::new());
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}
