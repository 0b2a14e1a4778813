//! Maps source columns onto the grant ontology with an LLM, caching results
//! by column-set hash so a source is only ever mapped once per layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use graf_core::{ColumnMapping, GrafConfig, OntologyField};
use graf_storage::{
    resolve_latest_dir, strip_code_fences, write_bytes_atomic, write_json_atomic, BackoffPolicy,
    ChatModel, ChatRequest, RawDataStore,
};
use graf_tabular::{json_records_to_csv_bytes, json_to_records, read_csv_table, read_xlsx_table,
    to_csv_bytes, Table};

/// Name of this crate, used as a stable identifier in diagnostics.
pub const CRATE_NAME: &str = "graf-mapping";

const MAPPING_ATTEMPTS: u32 = 3;
const MAPPING_SYSTEM_PROMPT: &str =
    "You are a helpful academic data assistant that maps columns between schemas.";

/// Hash of a column set, independent of column order.
pub fn column_set_hash(columns: &[String]) -> String {
    let mut sorted: Vec<&str> = columns.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    format!("{:x}", md5::compute(sorted.join(",")))
}

/// Cache file for one source and column-set hash.
pub fn mapping_cache_path(mappings_dir: &Path, source_id: &str, hash: &str) -> PathBuf {
    mappings_dir
        .join(source_id)
        .join(format!("{hash}_mapping.json"))
}

/// Cached mapping for this exact column set, if one was saved earlier.
/// Unreadable cache files count as absent.
pub fn load_cached_mapping(
    mappings_dir: &Path,
    source_id: &str,
    columns: &[String],
) -> Option<ColumnMapping> {
    let path = mapping_cache_path(mappings_dir, source_id, &column_set_hash(columns));
    let text = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&text) {
        Ok(mapping) => Some(mapping),
        Err(err) => {
            warn!(error = %err, file = %path.display(), "ignoring unreadable mapping cache");
            None
        }
    }
}

/// Columns of a table plus first-row example values. Example collection stops
/// at the first empty cell; later columns are listed without examples.
pub fn columns_and_examples(table: &Table) -> (Vec<String>, BTreeMap<String, String>) {
    let columns = table.columns.clone();
    let mut examples = BTreeMap::new();
    if let Some(row) = table.first_row() {
        for (i, column) in columns.iter().enumerate() {
            match row.get(i) {
                Some(cell) if !cell.trim().is_empty() => {
                    examples.insert(column.clone(), cell.clone());
                }
                _ => break,
            }
        }
    }
    (columns, examples)
}

/// Prompt asking the model for one ontology field (or `"null"`) per column.
pub fn build_mapping_prompt(
    source_id: &str,
    columns: &[String],
    examples: &BTreeMap<String, String>,
) -> String {
    let column_text: Vec<String> = columns
        .iter()
        .map(|col| match examples.get(col) {
            Some(example) => format!("* {col}: {example}"),
            None => format!("* {col}"),
        })
        .collect();
    let schema_text: Vec<String> = OntologyField::ALL
        .iter()
        .map(|field| {
            format!(
                "- {}: {} ({})",
                field.name(),
                field.description(),
                field.constraints()
            )
        })
        .collect();
    format!(
        "You are an expert in data schema mapping for academic grant data.\n\n\
         I need to map columns from a dataset about research grants from '{source_id}' \
         to the CrossRef grant metadata schema.\n\n\
         SOURCE COLUMNS (with examples from first row if available):\n{}\n\n\
         TARGET SCHEMA (CrossRef grant metadata):\n{}\n\n\
         For each source column, map it to the most appropriate CrossRef schema field, \
         or 'null' if there is no appropriate match.\n\
         Consider semantic meaning, not just exact name matches. Be thorough and \
         consider all possible mappings.\n\n\
         Return your response as a valid json with the following format:\n\
         {{\n    \"source_column_name\": \"crossref_field_name\",\n    ...\n}}\n\n\
         Only include the JSON object in your response, with no additional text.",
        column_text.join("\n"),
        schema_text.join("\n"),
    )
}

/// Keeps only entries whose target is an ontology field name or `"null"`.
/// JSON nulls are normalized to the `"null"` sentinel.
pub fn validate_mapping(raw: BTreeMap<String, Value>) -> BTreeMap<String, String> {
    let mut valid = BTreeMap::new();
    for (column, target) in raw {
        let target = match target {
            Value::Null => "null".to_string(),
            Value::String(s) => s,
            other => {
                warn!(column = %column, target = %other, "mapping target is not a string");
                continue;
            }
        };
        if target == "null" || OntologyField::parse(&target).is_some() {
            valid.insert(column, target);
        } else {
            warn!(column = %column, target = %target, "mapping target is not an ontology field");
        }
    }
    valid
}

enum FileOutcome {
    AlreadyMapped,
    Mapped,
    /// Unreadable or empty file, skipped without failing the source.
    Unusable,
    /// The model never produced a usable mapping.
    NoMapping,
}

/// Walks downloaded sources, extracts their column sets, and asks the model
/// for a mapping unless a cached one exists.
pub struct MapperPipeline {
    mappings_dir: PathBuf,
    store: RawDataStore,
    model: Box<dyn ChatModel>,
    backoff: BackoffPolicy,
}

impl MapperPipeline {
    pub fn new(config: &GrafConfig, model: Box<dyn ChatModel>) -> MapperPipeline {
        MapperPipeline {
            mappings_dir: config.mappings_dir.clone(),
            store: RawDataStore::new(&config.raw_data_dir),
            model,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> MapperPipeline {
        self.backoff = backoff;
        self
    }

    pub fn mappings_dir(&self) -> &Path {
        &self.mappings_dir
    }

    /// Maps every source directory under the raw data root. Returns the
    /// per-source result, keyed by source id.
    pub async fn map_all(&self, force: bool) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for dir in self.store.list_source_dirs() {
            let Some(source_id) = dir.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                continue;
            };
            info!(source_id = %source_id, "mapping columns");
            let ok = self.map_source(&source_id, force).await;
            results.insert(source_id, ok);
        }
        results
    }

    /// Maps one source from its most recent download. Returns false when no
    /// tabular file could be found or the model never produced a mapping.
    pub async fn map_source(&self, source_id: &str, force: bool) -> bool {
        let source_root = self.store.source_root(source_id, None);
        if !source_root.is_dir() {
            warn!(source_id, "source directory not found");
            return false;
        }
        let latest_dirs = latest_dirs_for_source(&source_root);
        if latest_dirs.is_empty() {
            warn!(source_id, "no downloads found for source");
            return false;
        }
        let mut any_table = false;
        let mut all_mapped = true;
        for latest in latest_dirs {
            let tables = self.candidate_tables(&latest).await;
            for path in tables {
                any_table = true;
                match self.map_table(source_id, &path, force).await {
                    FileOutcome::AlreadyMapped | FileOutcome::Mapped => {}
                    FileOutcome::Unusable => {}
                    FileOutcome::NoMapping => all_mapped = false,
                }
            }
        }
        if !any_table {
            warn!(source_id, "no tabular files found for source");
            return false;
        }
        all_mapped
    }

    /// Cached mapping for this column set, used by readers that project rows.
    pub fn cached_mapping(&self, source_id: &str, columns: &[String]) -> Option<ColumnMapping> {
        load_cached_mapping(&self.mappings_dir, source_id, columns)
    }

    async fn map_table(&self, source_id: &str, path: &Path, force: bool) -> FileOutcome {
        let table = match read_csv_table(path) {
            Ok(table) => table,
            Err(err) => {
                warn!(error = %err, file = %path.display(), "could not read table");
                return FileOutcome::Unusable;
            }
        };
        if table.columns.is_empty() {
            warn!(file = %path.display(), "table has no columns");
            return FileOutcome::Unusable;
        }
        let (columns, examples) = columns_and_examples(&table);
        if !force && load_cached_mapping(&self.mappings_dir, source_id, &columns).is_some() {
            info!(source_id, file = %path.display(), "mapping already cached");
            return FileOutcome::AlreadyMapped;
        }

        let mapping = self.mapping_from_model(source_id, &columns, &examples).await;
        if mapping.is_empty() {
            warn!(source_id, file = %path.display(), "no mapping produced");
            return FileOutcome::NoMapping;
        }
        match self.save_mapping(source_id, columns, mapping).await {
            Ok(saved) => {
                info!(source_id, file = %saved.display(), "mapping saved");
                FileOutcome::Mapped
            }
            Err(err) => {
                warn!(error = %err, source_id, "could not save mapping");
                FileOutcome::NoMapping
            }
        }
    }

    /// Asks the model for a mapping, retrying on transport errors and
    /// malformed replies. An empty map means every attempt failed.
    async fn mapping_from_model(
        &self,
        source_id: &str,
        columns: &[String],
        examples: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let request = ChatRequest {
            system: Some(MAPPING_SYSTEM_PROMPT.to_string()),
            user: build_mapping_prompt(source_id, columns, examples),
            temperature: 0.1,
            max_tokens: 1500,
            model: None,
        };
        for attempt in 0..MAPPING_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }
            let reply = match self.model.complete(&request).await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(source_id, attempt, error = %err, "mapping request failed");
                    continue;
                }
            };
            let stripped = strip_code_fences(&reply);
            match serde_json::from_str::<BTreeMap<String, Value>>(stripped) {
                Ok(raw) => return validate_mapping(raw),
                Err(err) => {
                    warn!(source_id, attempt, error = %err, "mapping reply was not a JSON object");
                }
            }
        }
        BTreeMap::new()
    }

    async fn save_mapping(
        &self,
        source_id: &str,
        columns: Vec<String>,
        mapping: BTreeMap<String, String>,
    ) -> anyhow::Result<PathBuf> {
        let path = mapping_cache_path(&self.mappings_dir, source_id, &column_set_hash(&columns));
        let record = ColumnMapping {
            source: source_id.to_string(),
            columns,
            timestamp: Utc::now(),
            mapping,
        };
        write_json_atomic(&path, &record).await?;
        Ok(path)
    }

    /// Tabular files in a download directory: CSVs as found, else Excel
    /// workbooks converted to CSV alongside, else JSON payloads projected to
    /// CSV. Conversion failures skip the file.
    async fn candidate_tables(&self, latest_dir: &Path) -> Vec<PathBuf> {
        let mut csvs = files_with_extensions(latest_dir, &["csv"]);
        if csvs.is_empty() {
            for workbook in files_with_extensions(latest_dir, &["xlsx", "xls"]) {
                match convert_workbook(&workbook).await {
                    Ok(path) => csvs.push(path),
                    Err(err) => {
                        warn!(error = %err, file = %workbook.display(), "workbook conversion failed");
                    }
                }
            }
        }
        if csvs.is_empty() {
            for json in files_with_extensions(latest_dir, &["json"]) {
                if json.file_name().and_then(|n| n.to_str()) == Some("metadata.json") {
                    continue;
                }
                match convert_json(&json).await {
                    Ok(path) => csvs.push(path),
                    Err(err) => {
                        warn!(error = %err, file = %json.display(), "json conversion failed");
                    }
                }
            }
        }
        csvs.sort();
        csvs
    }
}

/// Download directories holding a source's newest data: the source root's
/// own `latest`, or the `latest` of each action subdirectory.
pub fn latest_dirs_for_source(source_root: &Path) -> Vec<PathBuf> {
    if let Some(latest) = resolve_latest_dir(source_root) {
        return vec![latest];
    }
    let mut dirs = Vec::new();
    let entries = match std::fs::read_dir(source_root) {
        Ok(entries) => entries,
        Err(_) => return dirs,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !entry.path().is_dir() || name.starts_with('.') || name == "latest" {
            continue;
        }
        if let Some(latest) = resolve_latest_dir(&entry.path()) {
            dirs.push(latest);
        }
    }
    dirs.sort();
    dirs
}

fn files_with_extensions(dir: &Path, extensions: &[&str]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return files,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matched = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.iter().any(|want| e.eq_ignore_ascii_case(want)))
            .unwrap_or(false);
        if matched {
            files.push(path);
        }
    }
    files.sort();
    files
}

async fn convert_workbook(path: &Path) -> anyhow::Result<PathBuf> {
    let bytes = std::fs::read(path)?;
    let table = read_xlsx_table(&bytes)?;
    let csv = to_csv_bytes(&table.columns, &table.rows)?;
    let target = path.with_extension("csv");
    write_bytes_atomic(&target, &csv).await?;
    Ok(target)
}

async fn convert_json(path: &Path) -> anyhow::Result<PathBuf> {
    let bytes = std::fs::read(path)?;
    let value: Value = serde_json::from_slice(&bytes)?;
    let records = json_to_records(&value)?;
    let csv = json_records_to_csv_bytes(&records)?;
    let target = path.with_extension("csv");
    write_bytes_atomic(&target, &csv).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use graf_core::DownloadRecord;
    use graf_storage::LlmError;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn hash_ignores_column_order() {
        let a = vec!["Project Title".to_string(), "Amount".to_string()];
        let b = vec!["Amount".to_string(), "Project Title".to_string()];
        assert_eq!(column_set_hash(&a), column_set_hash(&b));
        assert_eq!(column_set_hash(&a), "f312f08d162b729f27bd19b6d1fae87c");
    }

    #[test]
    fn cache_path_follows_source_and_hash() {
        let path = mapping_cache_path(Path::new("/m"), "micinn", "abc123");
        assert_eq!(path, PathBuf::from("/m/micinn/abc123_mapping.json"));
    }

    #[test]
    fn examples_stop_at_the_first_empty_cell() {
        let table = Table {
            columns: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            rows: vec![vec!["1".to_string(), String::new(), "3".to_string()]],
        };
        let (columns, examples) = columns_and_examples(&table);
        assert_eq!(columns.len(), 3);
        assert_eq!(examples.get("a").map(String::as_str), Some("1"));
        assert!(!examples.contains_key("b"));
        assert!(!examples.contains_key("c"));
    }

    #[test]
    fn prompt_lists_columns_and_schema() {
        let columns = vec!["Title".to_string(), "Cost".to_string()];
        let mut examples = BTreeMap::new();
        examples.insert("Title".to_string(), "Coastal study".to_string());
        let prompt = build_mapping_prompt("micinn", &columns, &examples);
        assert!(prompt.contains("'micinn'"));
        assert!(prompt.contains("* Title: Coastal study"));
        assert!(prompt.contains("* Cost\n"));
        assert!(prompt.contains("TARGET SCHEMA (CrossRef grant metadata):"));
        assert!(prompt.contains("- project_title:"));
        assert!(prompt.contains("- amount:"));
    }

    #[test]
    fn validation_drops_unknown_fields_and_keeps_nulls() {
        let mut raw = BTreeMap::new();
        raw.insert("Foo".to_string(), Value::String("not_a_real_field".to_string()));
        raw.insert("Bar".to_string(), Value::String("amount".to_string()));
        raw.insert("Baz".to_string(), Value::Null);
        let valid = validate_mapping(raw);
        assert_eq!(valid.len(), 2);
        assert_eq!(valid.get("Bar").map(String::as_str), Some("amount"));
        assert_eq!(valid.get("Baz").map(String::as_str), Some("null"));
        assert!(!valid.contains_key("Foo"));
    }

    struct ScriptedModel {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            ScriptedModel {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Err(LlmError::EmptyResponse)
            } else {
                replies.remove(0)
            }
        }
    }

    fn test_config(root: &Path) -> GrafConfig {
        GrafConfig {
            raw_data_dir: root.join("raw"),
            mappings_dir: root.join("mappings"),
            sources_file: root.join("sources.yaml"),
            user_agent: "graf-test/0".to_string(),
            http_timeout_secs: 5,
            http_retries: 0,
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    async fn seed_download(config: &GrafConfig, source_id: &str, file: &str, body: &[u8]) {
        let store = RawDataStore::new(&config.raw_data_dir);
        let now = Utc::now();
        let fetch = store.create_fetch_dir(source_id, None, now).await.unwrap();
        std::fs::write(fetch.path.join(file), body).unwrap();
        let record = DownloadRecord {
            timestamp: now,
            directory: fetch.stamp.clone(),
            source_id: source_id.to_string(),
            status: "success".to_string(),
            action: None,
        };
        store.finalize_fetch(&fetch, &record).await.unwrap();
    }

    #[tokio::test]
    async fn model_mapping_is_validated_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_download(
            &config,
            "micinn",
            "grants.csv",
            b"Title,Cost\nCoastal study,90000\n",
        )
        .await;

        let model = ScriptedModel::new(vec![Ok(
            "```json\n{\"Title\": \"project_title\", \"Cost\": \"amount\"}\n```".to_string(),
        )]);
        let pipeline =
            MapperPipeline::new(&config, Box::new(model)).with_backoff(fast_backoff());
        assert!(pipeline.map_source("micinn", false).await);

        let columns = vec!["Title".to_string(), "Cost".to_string()];
        let cached = pipeline.cached_mapping("micinn", &columns).unwrap();
        assert_eq!(cached.source, "micinn");
        assert_eq!(cached.columns, columns);
        assert_eq!(cached.mapping.get("Title").map(String::as_str), Some("project_title"));
        assert_eq!(
            cached.mapped_field("Cost"),
            Some(OntologyField::Amount)
        );
    }

    #[tokio::test]
    async fn cached_column_sets_skip_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_download(&config, "micinn", "grants.csv", b"Title,Cost\nx,1\n").await;

        let first = ScriptedModel::new(vec![Ok(
            "{\"Title\": \"project_title\", \"Cost\": \"amount\"}".to_string(),
        )]);
        let pipeline =
            MapperPipeline::new(&config, Box::new(first)).with_backoff(fast_backoff());
        assert!(pipeline.map_source("micinn", false).await);

        let second = std::sync::Arc::new(ScriptedModel::new(vec![Ok("{}".to_string())]));
        let pipeline = MapperPipeline::new(&config, Box::new(SharedModel(second.clone())))
            .with_backoff(fast_backoff());
        assert!(pipeline.map_source("micinn", false).await);
        assert_eq!(second.call_count(), 0);
    }

    #[tokio::test]
    async fn force_remaps_even_when_cached() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_download(&config, "micinn", "grants.csv", b"Title,Cost\nx,1\n").await;

        let first = ScriptedModel::new(vec![Ok(
            "{\"Title\": \"project_title\", \"Cost\": \"amount\"}".to_string(),
        )]);
        let pipeline =
            MapperPipeline::new(&config, Box::new(first)).with_backoff(fast_backoff());
        assert!(pipeline.map_source("micinn", false).await);

        let again = std::sync::Arc::new(ScriptedModel::new(vec![Ok(
            "{\"Title\": \"project_title\", \"Cost\": \"null\"}".to_string(),
        )]));
        let pipeline = MapperPipeline::new(&config, Box::new(SharedModel(again.clone())))
            .with_backoff(fast_backoff());
        assert!(pipeline.map_source("micinn", true).await);
        assert_eq!(again.call_count(), 1);

        let columns = vec!["Title".to_string(), "Cost".to_string()];
        let cached = pipeline.cached_mapping("micinn", &columns).unwrap();
        assert_eq!(cached.mapping.get("Cost").map(String::as_str), Some("null"));
    }

    struct SharedModel(std::sync::Arc<ScriptedModel>);

    #[async_trait]
    impl ChatModel for SharedModel {
        async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
            self.0.complete(request).await
        }
    }

    #[tokio::test]
    async fn malformed_replies_retry_then_fail_without_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_download(&config, "micinn", "grants.csv", b"Title,Cost\nx,1\n").await;

        let model = std::sync::Arc::new(ScriptedModel::new(vec![
            Ok("not json at all".to_string()),
            Ok("still not json".to_string()),
            Ok("[1, 2, 3]".to_string()),
        ]));
        let pipeline = MapperPipeline::new(&config, Box::new(SharedModel(model.clone())))
            .with_backoff(fast_backoff());
        assert!(!pipeline.map_source("micinn", false).await);
        assert_eq!(model.call_count(), 3);

        let columns = vec!["Title".to_string(), "Cost".to_string()];
        assert!(pipeline.cached_mapping("micinn", &columns).is_none());
    }

    #[tokio::test]
    async fn json_downloads_are_projected_before_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_download(
            &config,
            "openaire_projects",
            "openaire_projects.json",
            br#"[{"code": "P1", "title": "Coastal"}, {"code": "P2", "title": "Alpine"}]"#,
        )
        .await;
        // metadata.json never becomes a mapping candidate.
        let store = RawDataStore::new(&config.raw_data_dir);
        let latest = resolve_latest_dir(&store.source_root("openaire_projects", None)).unwrap();
        std::fs::write(latest.join("metadata.json"), b"{\"status\": \"Downloaded\"}").unwrap();

        let model = ScriptedModel::new(vec![Ok(
            "{\"code\": \"grant_id\", \"title\": \"project_title\"}".to_string(),
        )]);
        let pipeline =
            MapperPipeline::new(&config, Box::new(model)).with_backoff(fast_backoff());
        assert!(pipeline.map_source("openaire_projects", false).await);
        assert!(latest.join("openaire_projects.csv").is_file());

        let columns = vec!["code".to_string(), "title".to_string()];
        let cached = pipeline.cached_mapping("openaire_projects", &columns).unwrap();
        assert_eq!(cached.mapped_field("code"), Some(OntologyField::GrantId));
    }

    fn build_xlsx(shared: &[&str], sheet_xml: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        let mut sst = String::from("<sst>");
        for s in shared {
            sst.push_str(&format!("<si><t>{s}</t></si>"));
        }
        sst.push_str("</sst>");
        writer.start_file("xl/sharedStrings.xml", options).unwrap();
        writer.write_all(sst.as_bytes()).unwrap();
        writer
            .start_file("xl/worksheets/sheet1.xml", options)
            .unwrap();
        writer.write_all(sheet_xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn workbook_downloads_are_converted_and_hashed_by_their_headers() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let workbook = build_xlsx(
            &["Title", "Cost", "Coastal study"],
            "<worksheet><sheetData>\
             <row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"B1\" t=\"s\"><v>1</v></c></row>\
             <row r=\"2\"><c r=\"A2\" t=\"s\"><v>2</v></c><c r=\"B2\"><v>90000</v></c></row>\
             </sheetData></worksheet>",
        );
        seed_download(&config, "la_marato", "grants.xlsx", &workbook).await;

        let model = ScriptedModel::new(vec![Ok(
            "{\"Title\": \"project_title\", \"Cost\": \"amount\"}".to_string(),
        )]);
        let pipeline =
            MapperPipeline::new(&config, Box::new(model)).with_backoff(fast_backoff());
        assert!(pipeline.map_source("la_marato", false).await);

        // The conversion lands beside the workbook as a plain CSV.
        let store = RawDataStore::new(&config.raw_data_dir);
        let latest = resolve_latest_dir(&store.source_root("la_marato", None)).unwrap();
        assert!(latest.join("grants.csv").is_file());

        // The cache is keyed by the converted file's headers.
        let columns = vec!["Title".to_string(), "Cost".to_string()];
        let cached = pipeline.cached_mapping("la_marato", &columns).unwrap();
        assert_eq!(cached.columns, columns);
        assert_eq!(
            cached.mapped_field("Title"),
            Some(OntologyField::ProjectTitle)
        );
    }

    #[tokio::test]
    async fn map_all_reports_per_source_results() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_download(&config, "good", "grants.csv", b"Title\nx\n").await;
        seed_download(&config, "bad", "grants.csv", b"Other\ny\n").await;

        let model = ScriptedModel::new(vec![
            // Sources are walked in name order, so "bad" is asked first.
            Ok("nonsense".to_string()),
            Ok("nonsense".to_string()),
            Ok("nonsense".to_string()),
            Ok("{\"Title\": \"project_title\"}".to_string()),
        ]);
        let pipeline =
            MapperPipeline::new(&config, Box::new(model)).with_backoff(fast_backoff());
        let results = pipeline.map_all(false).await;
        assert_eq!(results.get("good"), Some(&true));
        assert_eq!(results.get("bad"), Some(&false));
    }
}
