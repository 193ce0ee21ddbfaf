use deltastore_common::SchemaRegistry;
use deltastore_graph::{ChangeSetGraph, VersionRegistry};
use deltastore_log::Change;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Current on-disk format versions.
const STORE_SCHEMA_VERSION: u32 = 1;
const CHANGE_SCHEMA_VERSION: u32 = 1;

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("format version mismatch: file has v{file_version}, expected v{expected_version}")]
    FormatMismatch {
        file_version: u32,
        expected_version: u32,
    },
}

/// Metadata stored in store.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub store_schema_version: u32,
    pub change_schema_version: u32,
    pub segment_count: u32,
    /// Hash of the current graph snapshot file, if one has been written.
    pub graph_sha256: Option<String>,
}

/// A single entry in the integrity manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub sha256: String,
    pub prev_hash: Option<String>,
}

/// Integrity manifest tracking change-segment hashes in a chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: Vec<ManifestEntry>,
}

/// Serialized view of the metadata side of the store: registered schemas,
/// the change-set/commit DAG, and the version registry (including the
/// active version).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub schemas: SchemaRegistry,
    pub graph: ChangeSetGraph,
    pub versions: VersionRegistry,
}

/// File-backed store with format versioning and integrity checking.
///
/// The change log is the source of truth; segments are append-only. The
/// graph snapshot is small (references only) and rewritten on checkpoint.
pub struct DurableStore {
    root: PathBuf,
    meta: StoreMeta,
    manifest: IntegrityManifest,
}

impl DurableStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("changes"))?;
        std::fs::create_dir_all(root.join("graph"))?;
        std::fs::create_dir_all(root.join("integrity"))?;

        let meta_path = root.join("store.meta.json");
        let manifest_path = root.join("integrity").join("manifest.json");

        let (meta, manifest) = if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.store_schema_version != STORE_SCHEMA_VERSION {
                return Err(PersistError::FormatMismatch {
                    file_version: meta.store_schema_version,
                    expected_version: STORE_SCHEMA_VERSION,
                });
            }
            if meta.change_schema_version != CHANGE_SCHEMA_VERSION {
                return Err(PersistError::FormatMismatch {
                    file_version: meta.change_schema_version,
                    expected_version: CHANGE_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = StoreMeta {
                store_schema_version: STORE_SCHEMA_VERSION,
                change_schema_version: CHANGE_SCHEMA_VERSION,
                segment_count: 0,
                graph_sha256: None,
            };
            let manifest = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&manifest_path)?, &manifest)?;
            (meta, manifest)
        };

        Ok(Self {
            root,
            meta,
            manifest,
        })
    }

    /// Append a batch of changes as a new segment.
    pub fn append_segment(&mut self, changes: &[Change]) -> Result<(), PersistError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.meta.segment_count += 1;
        let seg_idx = self.meta.segment_count;
        let filename = format!("{seg_idx:06}.changes.cbor.zst");
        let path = self.root.join("changes").join(&filename);

        let cbor_bytes = cbor_serialize(changes)?;
        let compressed = zstd_compress(&cbor_bytes)?;

        let hash = sha256_hex(&compressed);
        let prev_hash = self.manifest.entries.last().map(|e| e.sha256.clone());

        std::fs::write(&path, &compressed)?;

        self.manifest.entries.push(ManifestEntry {
            filename,
            sha256: hash,
            prev_hash,
        });

        self.save_meta()?;
        self.save_manifest()?;
        Ok(())
    }

    /// Load all change segments in append order, verifying each hash.
    pub fn load_changes(&self) -> Result<Vec<Change>, PersistError> {
        let mut all = Vec::new();
        for seg_idx in 1..=self.meta.segment_count {
            let filename = format!("{seg_idx:06}.changes.cbor.zst");
            let path = self.root.join("changes").join(&filename);
            let compressed = std::fs::read(&path)?;
            self.verify_file_hash(&filename, &compressed)?;
            let cbor_bytes = zstd_decompress(&compressed)?;
            let changes: Vec<Change> = cbor_deserialize(&cbor_bytes)?;
            all.extend(changes);
        }
        Ok(all)
    }

    /// Rewrite the graph snapshot file and record its hash in the metadata.
    pub fn save_graph(&mut self, snapshot: &GraphSnapshot) -> Result<(), PersistError> {
        let path = self.root.join("graph").join("graph.cbor.zst");
        let cbor_bytes = cbor_serialize(snapshot)?;
        let compressed = zstd_compress(&cbor_bytes)?;
        let hash = sha256_hex(&compressed);
        std::fs::write(&path, &compressed)?;
        self.meta.graph_sha256 = Some(hash);
        self.save_meta()?;
        Ok(())
    }

    /// Load the graph snapshot, if one has been written. Fails closed on a
    /// hash mismatch.
    pub fn load_graph(&self) -> Result<Option<GraphSnapshot>, PersistError> {
        let Some(expected) = &self.meta.graph_sha256 else {
            return Ok(None);
        };
        let path = self.root.join("graph").join("graph.cbor.zst");
        let compressed = std::fs::read(&path)?;
        let actual = sha256_hex(&compressed);
        if actual != *expected {
            return Err(PersistError::IntegrityMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        let cbor_bytes = zstd_decompress(&compressed)?;
        Ok(Some(cbor_deserialize(&cbor_bytes)?))
    }

    /// Verify the whole hash chain plus the graph snapshot hash.
    pub fn verify_integrity(&self) -> Result<(), PersistError> {
        let mut prev_hash: Option<String> = None;
        for entry in &self.manifest.entries {
            if entry.prev_hash != prev_hash {
                return Err(PersistError::IntegrityMismatch {
                    expected: prev_hash.unwrap_or_else(|| "None".into()),
                    actual: entry.prev_hash.clone().unwrap_or_else(|| "None".into()),
                });
            }
            let path = self.root.join("changes").join(&entry.filename);
            let data = std::fs::read(&path)?;
            let actual_hash = sha256_hex(&data);
            if actual_hash != entry.sha256 {
                return Err(PersistError::IntegrityMismatch {
                    expected: entry.sha256.clone(),
                    actual: actual_hash,
                });
            }
            prev_hash = Some(entry.sha256.clone());
        }
        if self.meta.graph_sha256.is_some() {
            self.load_graph()?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    fn verify_file_hash(&self, filename: &str, data: &[u8]) -> Result<(), PersistError> {
        let actual = sha256_hex(data);
        for entry in &self.manifest.entries {
            if entry.filename == filename {
                if entry.sha256 != actual {
                    return Err(PersistError::IntegrityMismatch {
                        expected: entry.sha256.clone(),
                        actual,
                    });
                }
                return Ok(());
            }
        }
        // File not in manifest is OK for first-time creation
        Ok(())
    }

    fn save_meta(&self) -> Result<(), PersistError> {
        let path = self.root.join("store.meta.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }

    fn save_manifest(&self) -> Result<(), PersistError> {
        let path = self.root.join("integrity").join("manifest.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.manifest)?;
        Ok(())
    }
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PersistError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| PersistError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, PersistError> {
    ciborium::from_reader(data).map_err(|e| PersistError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, PersistError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, PersistError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
