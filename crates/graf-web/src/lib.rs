//! Read-only JSON API over the raw data store and mapping cache.

use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tracing::warn;

use graf_core::GrafConfig;
use graf_fetch::SourceRegistry;
use graf_mapping::{latest_dirs_for_source, load_cached_mapping};
use graf_storage::RawDataStore;
use graf_tabular::read_csv_table;

pub const CRATE_NAME: &str = "graf-web";

#[derive(Clone)]
pub struct AppState {
    pub config: GrafConfig,
}

impl AppState {
    pub fn new(config: GrafConfig) -> Self {
        Self { config }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/grants", get(grants_handler))
        .route("/sources", get(sources_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("GRAF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(GrafConfig::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving grant data");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn grants_handler(State(state): State<Arc<AppState>>) -> Response {
    let grants = load_grants(&state.config);
    Json(json!({ "grants": grants })).into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match SourceRegistry::load(&state.config.sources_file) {
        Ok(registry) => Json(json!({ "sources": registry.sources })).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Every stored grant row, projected onto ontology field names through the
/// cached column mappings. Sources with no cached mapping are left out, as
/// are columns mapped to `"null"`.
fn load_grants(config: &GrafConfig) -> Vec<Value> {
    let store = RawDataStore::new(&config.raw_data_dir);
    let mut grants = Vec::new();
    for dir in store.list_source_dirs() {
        let Some(source_id) = dir.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        for latest in latest_dirs_for_source(&dir) {
            for csv in csv_files(&latest) {
                append_projected_rows(config, &source_id, &csv, &mut grants);
            }
        }
    }
    grants
}

fn append_projected_rows(
    config: &GrafConfig,
    source_id: &str,
    csv: &Path,
    grants: &mut Vec<Value>,
) {
    let table = match read_csv_table(csv) {
        Ok(table) => table,
        Err(err) => {
            warn!(error = %err, file = %csv.display(), "skipping unreadable table");
            return;
        }
    };
    let Some(mapping) = load_cached_mapping(&config.mappings_dir, source_id, &table.columns)
    else {
        return;
    };
    for row in &table.rows {
        let mut grant = Map::new();
        for (i, column) in table.columns.iter().enumerate() {
            let Some(field) = mapping.mapped_field(column) else {
                continue;
            };
            let value = row.get(i).map(String::as_str).unwrap_or_default();
            if value.is_empty() {
                continue;
            }
            grant.insert(field.name().to_string(), Value::String(value.to_string()));
        }
        if grant.is_empty() {
            continue;
        }
        grant.insert("source_id".to_string(), Value::String(source_id.to_string()));
        grants.push(Value::Object(grant));
    }
}

fn csv_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return files,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if path.is_file() && is_csv {
            files.push(path);
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use graf_core::DownloadRecord;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tower::ServiceExt;

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

    async fn seed_download(config: &GrafConfig, source_id: &str, csv: &[u8]) {
        let store = RawDataStore::new(&config.raw_data_dir);
        let now = Utc::now();
        let fetch = store.create_fetch_dir(source_id, None, now).await.unwrap();
        std::fs::write(fetch.path.join("grants.csv"), csv).unwrap();
        let record = DownloadRecord {
            timestamp: now,
            directory: fetch.stamp.clone(),
            source_id: source_id.to_string(),
            status: "success".to_string(),
            action: None,
        };
        store.finalize_fetch(&fetch, &record).await.unwrap();
    }

    fn seed_mapping(config: &GrafConfig, source_id: &str, columns: &[&str], pairs: &[(&str, &str)]) {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let mapping = graf_core::ColumnMapping {
            source: source_id.to_string(),
            columns: columns.clone(),
            timestamp: Utc::now(),
            mapping: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        let path = graf_mapping::mapping_cache_path(
            &config.mappings_dir,
            source_id,
            &graf_mapping::column_set_hash(&columns),
        );
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec_pretty(&mapping).unwrap()).unwrap();
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn grants_endpoint_projects_mapped_sources_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        seed_download(
            &config,
            "micinn",
            b"Title,Cost,Internal Ref\nCoastal study,90000,X-1\n",
        )
        .await;
        seed_download(&config, "unmapped", b"Other\nvalue\n").await;
        seed_mapping(
            &config,
            "micinn",
            &["Title", "Cost", "Internal Ref"],
            &[("Title", "project_title"), ("Cost", "amount"), ("Internal Ref", "null")],
        );

        let (status, body) = get_json(app(AppState::new(config)), "/grants").await;
        assert_eq!(status, StatusCode::OK);
        let grants = body["grants"].as_array().unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0]["project_title"], "Coastal study");
        assert_eq!(grants[0]["amount"], "90000");
        assert_eq!(grants[0]["source_id"], "micinn");
        // "null" targets and unmapped columns never surface.
        assert!(grants[0].get("Internal Ref").is_none());
    }

    #[tokio::test]
    async fn grants_endpoint_is_empty_without_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (status, body) = get_json(app(AppState::new(config)), "/grants").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["grants"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn sources_endpoint_serves_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::write(
            &config.sources_file,
            "sources:\n  - source_id: micinn\n    funder: MICINN\n    format: csv\n",
        )
        .unwrap();
        let (status, body) = get_json(app(AppState::new(config)), "/sources").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sources"][0]["source_id"], "micinn");
        assert_eq!(body["sources"][0]["format"], "csv");
    }

    #[tokio::test]
    async fn sources_endpoint_errors_when_registry_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (status, body) = get_json(app(AppState::new(config)), "/sources").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("sources.yaml"));
    }

    #[test]
    fn csv_listing_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.csv"), b"x\n").unwrap();
        std::fs::write(dir.path().join("a.CSV"), b"y\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"z\n").unwrap();
        let files: Vec<PathBuf> = csv_files(dir.path());
        let names: Vec<&str> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["a.CSV", "b.csv"]);
    }
}
