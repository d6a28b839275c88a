/// Persistent revision storage
/// One append-only record sequence per document stream
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::{content_digest, CollaborationError, Result, RevisionEntry, StreamKey};

/// Everything persisted for one stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredStream {
    pub initial_contents: String,
    pub entries: Vec<RevisionEntry>,
}

/// Backing store for revision logs
#[async_trait::async_trait]
pub trait RevisionStore: Send + Sync {
    /// Start a stream with its initial contents; a no-op if it already exists
    async fn create(&self, key: &StreamKey, contents: &str) -> Result<()>;

    /// Persist one accepted revision.
    ///
    /// Conditional on the stream: `entry.revision` must directly follow the
    /// last stored revision, otherwise nothing is written and a storage error
    /// is returned. A caller that gave up on an earlier append can therefore
    /// never store the same revision twice.
    async fn append(&self, key: &StreamKey, entry: &RevisionEntry) -> Result<()>;

    /// Load a stream, or `None` if it was never created
    async fn load(&self, key: &StreamKey) -> Result<Option<StoredStream>>;
}

/// In-process store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    streams: RwLock<HashMap<StreamKey, StoredStream>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RevisionStore for MemoryStore {
    async fn create(&self, key: &StreamKey, contents: &str) -> Result<()> {
        let mut streams = self.streams.write().await;
        streams.entry(key.clone()).or_insert_with(|| StoredStream {
            initial_contents: contents.to_string(),
            entries: Vec::new(),
        });
        Ok(())
    }

    async fn append(&self, key: &StreamKey, entry: &RevisionEntry) -> Result<()> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(key)
            .ok_or_else(|| CollaborationError::StorageError(format!("unknown stream {}", key)))?;
        let head = stream.entries.last().map_or(0, |last| last.revision);
        check_next(key, head, entry)?;
        stream.entries.push(entry.clone());
        Ok(())
    }

    async fn load(&self, key: &StreamKey) -> Result<Option<StoredStream>> {
        let streams = self.streams.read().await;
        Ok(streams.get(key).cloned())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record")]
enum StoredRecord {
    #[serde(rename = "created")]
    Created { key: StreamKey, contents: String },

    #[serde(rename = "appended")]
    Appended { entry: RevisionEntry },
}

fn check_next(key: &StreamKey, head: u64, entry: &RevisionEntry) -> Result<()> {
    if entry.revision == head + 1 {
        Ok(())
    } else {
        Err(CollaborationError::StorageError(format!(
            "stream {} is at revision {}, refusing revision {}",
            key, head, entry.revision
        )))
    }
}

/// One JSON-lines file per stream under a data directory
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,

    /// Last stored revision per stream, filled on first use; the lock also
    /// serializes appends
    heads: Mutex<HashMap<StreamKey, u64>>,
}

impl JsonFileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            heads: Mutex::new(HashMap::new()),
        }
    }

    fn stream_path(&self, key: &StreamKey) -> PathBuf {
        let readable: String = key
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        // The digest keeps keys that sanitize to the same name apart
        let digest = content_digest(&format!("{}\n{}", key.workspace_id, key.file_edit_session_key));
        self.dir
            .join(format!("{}-{}.jsonl", readable, &digest[..12]))
    }

    async fn write_record(file: &mut fs::File, record: &StoredRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await.map_err(storage_error)?;
        file.sync_data().await.map_err(storage_error)?;
        Ok(())
    }

    /// Parse a stream file.
    ///
    /// A last line that is unterminated and unreadable is a write cut short
    /// by a crash; it is cut off the file so later appends start clean.
    async fn read_stream(&self, key: &StreamKey) -> Result<Option<StoredStream>> {
        let path = self.stream_path(key);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(storage_error(e)),
        };

        let mut stream: Option<StoredStream> = None;
        let mut offset = 0;
        for (line_no, line) in content.split_inclusive('\n').enumerate() {
            let start = offset;
            offset += line.len();
            if line.trim().is_empty() {
                continue;
            }
            let record: StoredRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) if !line.ends_with('\n') => {
                    tracing::warn!(
                        "{} line {}: dropping torn record: {}",
                        path.display(),
                        line_no + 1,
                        e
                    );
                    Self::truncate(&path, start as u64).await?;
                    break;
                }
                Err(e) => {
                    return Err(CollaborationError::StorageError(format!(
                        "{} line {}: {}",
                        path.display(),
                        line_no + 1,
                        e
                    )))
                }
            };

            let out_of_order = || {
                CollaborationError::StorageError(format!(
                    "{} line {}: record out of order",
                    path.display(),
                    line_no + 1
                ))
            };
            match record {
                StoredRecord::Created { contents, .. } => {
                    if stream.is_some() {
                        return Err(out_of_order());
                    }
                    stream = Some(StoredStream {
                        initial_contents: contents,
                        entries: Vec::new(),
                    });
                }
                StoredRecord::Appended { entry } => match stream.as_mut() {
                    Some(stream) => stream.entries.push(entry),
                    None => return Err(out_of_order()),
                },
            }
        }

        Ok(stream)
    }

    async fn truncate(path: &Path, len: u64) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(storage_error)?;
        file.set_len(len).await.map_err(storage_error)?;
        file.sync_data().await.map_err(storage_error)
    }
}

fn stream_head(stream: &StoredStream) -> u64 {
    stream.entries.last().map_or(0, |last| last.revision)
}

fn storage_error(err: std::io::Error) -> CollaborationError {
    CollaborationError::StorageError(err.to_string())
}

#[async_trait::async_trait]
impl RevisionStore for JsonFileStore {
    async fn create(&self, key: &StreamKey, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(storage_error)?;

        let path = self.stream_path(key);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(storage_error(e)),
        };

        let record = StoredRecord::Created {
            key: key.clone(),
            contents: contents.to_string(),
        };
        Self::write_record(&mut file, &record).await?;
        self.heads.lock().await.insert(key.clone(), 0);
        tracing::debug!("created stream file {}", path.display());
        Ok(())
    }

    async fn append(&self, key: &StreamKey, entry: &RevisionEntry) -> Result<()> {
        let mut heads = self.heads.lock().await;
        let head = match heads.get(key) {
            Some(head) => *head,
            None => {
                let stream = self.read_stream(key).await?.ok_or_else(|| {
                    CollaborationError::StorageError(format!("unknown stream {}", key))
                })?;
                stream_head(&stream)
            }
        };
        check_next(key, head, entry)?;

        let path = self.stream_path(key);
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(storage_error)?;
        // Forget the head until the write is known to be complete
        heads.remove(key);
        let record = StoredRecord::Appended {
            entry: entry.clone(),
        };
        Self::write_record(&mut file, &record).await?;
        heads.insert(key.clone(), entry.revision);
        Ok(())
    }

    async fn load(&self, key: &StreamKey) -> Result<Option<StoredStream>> {
        let mut heads = self.heads.lock().await;
        let stream = self.read_stream(key).await?;
        match &stream {
            Some(stream) => heads.insert(key.clone(), stream_head(stream)),
            None => heads.remove(key),
        };
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientId, RevisionLog};
    use docops::DocOpBuilder;

    fn sample_entries() -> Vec<RevisionEntry> {
        let mut log = RevisionLog::new(StreamKey::new("ws", "doc"), "one\n");
        let client = ClientId::new();
        log.append(client, 0, &DocOpBuilder::new().retain_line(1).insert("two").build())
            .unwrap();
        log.entries().cloned().collect()
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        let key = StreamKey::new("ws", "doc");
        assert!(store.load(&key).await.unwrap().is_none());

        store.create(&key, "one\n").await.unwrap();
        store.create(&key, "ignored").await.unwrap();
        for entry in sample_entries() {
            store.append(&key, &entry).await.unwrap();
        }

        let stream = store.load(&key).await.unwrap().unwrap();
        assert_eq!(stream.initial_contents, "one\n");
        assert_eq!(stream.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_unknown_stream() {
        let store = MemoryStore::new();
        let entry = sample_entries().remove(0);
        let result = store.append(&StreamKey::new("ws", "missing"), &entry).await;
        assert!(matches!(result, Err(CollaborationError::StorageError(_))));
    }

    #[tokio::test]
    async fn test_json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let key = StreamKey::new("ws/1", "doc 1");

        store.create(&key, "one\n").await.unwrap();
        let entries = sample_entries();
        store.append(&key, &entries[0]).await.unwrap();

        // A second store over the same directory sees the same stream
        let reopened = JsonFileStore::new(dir.path());
        reopened.create(&key, "ignored").await.unwrap();
        let stream = reopened.load(&key).await.unwrap().unwrap();
        assert_eq!(stream.initial_contents, "one\n");
        assert_eq!(stream.entries, entries);

        let log = RevisionLog::restore(key, &stream.initial_contents, stream.entries).unwrap();
        assert_eq!(log.contents(), "one\ntwo");
    }

    #[tokio::test]
    async fn test_json_file_store_keeps_similar_keys_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let first = StreamKey::new("ws", "a/b");
        let second = StreamKey::new("ws", "a_b");

        store.create(&first, "first").await.unwrap();
        store.create(&second, "second").await.unwrap();

        let loaded = store.load(&second).await.unwrap().unwrap();
        assert_eq!(loaded.initial_contents, "second");
    }

    #[tokio::test]
    async fn test_append_must_follow_head() {
        let memory = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let files = JsonFileStore::new(dir.path());
        let key = StreamKey::new("ws", "doc");
        let entry = sample_entries().remove(0);

        let stores: [&dyn RevisionStore; 2] = [&memory, &files];
        for store in stores {
            store.create(&key, "one\n").await.unwrap();
            store.append(&key, &entry).await.unwrap();
            assert!(matches!(
                store.append(&key, &entry).await,
                Err(CollaborationError::StorageError(_))
            ));

            let mut skipped = entry.clone();
            skipped.revision = 3;
            assert!(store.append(&key, &skipped).await.is_err());
            assert_eq!(store.load(&key).await.unwrap().unwrap().entries.len(), 1);
        }

        // A fresh store over the same files learns the head from disk
        let reopened = JsonFileStore::new(dir.path());
        assert!(reopened.append(&key, &entry).await.is_err());
    }

    #[tokio::test]
    async fn test_json_file_store_drops_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let key = StreamKey::new("ws", "doc");
        store.create(&key, "one\n").await.unwrap();

        let path = store.stream_path(&key);
        let mut file = fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(br#"{"record":"appended","ent"#).await.unwrap();
        drop(file);

        let reopened = JsonFileStore::new(dir.path());
        let stream = reopened.load(&key).await.unwrap().unwrap();
        assert!(stream.entries.is_empty());

        let entry = sample_entries().remove(0);
        reopened.append(&key, &entry).await.unwrap();
        let stream = JsonFileStore::new(dir.path()).load(&key).await.unwrap().unwrap();
        assert_eq!(stream.entries, vec![entry]);
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_corrupt_middle() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let key = StreamKey::new("ws", "doc");
        store.create(&key, "").await.unwrap();

        let path = store.stream_path(&key);
        let mut file = fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"not json\n").await.unwrap();
        drop(file);

        assert!(matches!(
            store.load(&key).await,
            Err(CollaborationError::StorageError(_))
        ));
    }

    #[test]
    fn test_json_file_store_missing_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let loaded = tokio_test::block_on(store.load(&StreamKey::new("ws", "none"))).unwrap();
        assert!(loaded.is_none());
    }
}
