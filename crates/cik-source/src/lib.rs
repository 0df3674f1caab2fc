//! Snapshot source contracts + the strict decoder for the company tickers document.

use std::collections::btree_map::Entry;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cik_core::{ExternalId, RemoteRecord, Snapshot};
use cik_storage::{sha256_hex, HttpError, HttpFetcher};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "cik-source";

#[derive(Debug, Error)]
pub enum MalformedRecordError {
    #[error("invalid snapshot document: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("entry {key}: cik_str {value:?} is not an integer")]
    InvalidIdentifier { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] HttpError),
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] MalformedRecordError),
    #[error("reading snapshot file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// Decoded snapshot plus provenance of the document it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedSnapshot {
    pub records: Snapshot,
    pub duplicate_ids: usize,
    pub sha256: Option<String>,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<FetchedSnapshot, FetchError>;
}

/// `cik_str` arrives either as a JSON number or as a numeric string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CikValue {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    cik_str: CikValue,
    ticker: String,
    title: String,
}

/// Top-level entries kept in document order.
struct TickerDocument(Vec<(String, TickerEntry)>);

impl<'de> Deserialize<'de> for TickerDocument {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DocumentVisitor;

        impl<'de> Visitor<'de> for DocumentVisitor {
            type Value = TickerDocument;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping keys to ticker entries")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, entry)) = map.next_entry::<String, TickerEntry>()? {
                    entries.push((key, entry));
                }
                Ok(TickerDocument(entries))
            }
        }

        deserializer.deserialize_map(DocumentVisitor)
    }
}

fn parse_identifier(key: &str, value: CikValue) -> Result<ExternalId, MalformedRecordError> {
    match value {
        CikValue::Number(n) => Ok(n),
        CikValue::Text(text) => text.parse::<ExternalId>().map_err(|_| {
            MalformedRecordError::InvalidIdentifier {
                key: key.to_string(),
                value: text,
            }
        }),
    }
}

/// Decode the whole document or nothing. A later entry for an id replaces the earlier one;
/// each replacement is counted in `duplicate_ids`.
pub fn decode_snapshot(bytes: &[u8]) -> Result<FetchedSnapshot, MalformedRecordError> {
    let TickerDocument(entries) = serde_json::from_slice(bytes)?;

    let mut records = Snapshot::new();
    let mut duplicate_ids = 0usize;
    for (key, entry) in entries {
        let external_id = parse_identifier(&key, entry.cik_str)?;
        let record = RemoteRecord {
            external_id,
            ticker: entry.ticker,
            title: entry.title,
        };
        match records.entry(external_id) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                duplicate_ids += 1;
                debug!(
                    external_id,
                    key = %key,
                    replaced = %slot.get().ticker,
                    ticker = %record.ticker,
                    "duplicate id in snapshot, keeping last"
                );
                slot.insert(record);
            }
        }
    }

    Ok(FetchedSnapshot {
        records,
        duplicate_ids,
        sha256: None,
    })
}

#[derive(Debug)]
pub struct HttpSnapshotSource {
    http: HttpFetcher,
    url: String,
}

impl HttpSnapshotSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<FetchedSnapshot, FetchError> {
        let response = self.http.fetch_bytes(&self.url).await?;
        let mut snapshot = decode_snapshot(&response.body)?;
        snapshot.sha256 = Some(sha256_hex(&response.body));
        info!(
            url = %response.final_url,
            records = snapshot.records.len(),
            duplicates = snapshot.duplicate_ids,
            bytes = response.body.len(),
            "snapshot fetched"
        );
        Ok(snapshot)
    }
}

/// Reads a previously downloaded document from disk.
#[derive(Debug, Clone)]
pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for FileSnapshotSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<FetchedSnapshot, FetchError> {
        load_snapshot_file(&self.path).await
    }
}

pub async fn load_snapshot_file(path: impl AsRef<Path>) -> Result<FetchedSnapshot, FetchError> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut snapshot = decode_snapshot(&bytes)?;
    snapshot.sha256 = Some(sha256_hex(&bytes));
    Ok(snapshot)
}

/// Serves a fixed snapshot on every fetch.
#[derive(Debug, Clone, Default)]
pub struct StaticSnapshotSource {
    snapshot: FetchedSnapshot,
}

impl StaticSnapshotSource {
    pub fn new(records: Snapshot) -> Self {
        Self {
            snapshot: FetchedSnapshot {
                records,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    fn describe(&self) -> String {
        format!("static snapshot ({} records)", self.snapshot.records.len())
    }

    async fn fetch(&self) -> Result<FetchedSnapshot, FetchError> {
        Ok(self.snapshot.clone())
    }
}
