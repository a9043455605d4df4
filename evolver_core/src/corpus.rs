use crate::ids::UniqueIdAllocator;
use crate::vector::TestVector;
use bincode::{
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Defines errors that can arise while reading or writing corpus bins.
///
/// None of these stop a campaign: the mutator falls back to the next bin and
/// the aggregator logs and keeps counting.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// No entry with this name exists in the bin.
    #[error("No entry named '{name}' in the {bin} bin")]
    NotFound { bin: Bin, name: String },

    /// An entry with this name already exists; names are unique within a bin.
    #[error("An entry named '{name}' already exists in the {bin} bin")]
    AlreadyExists { bin: Bin, name: String },

    /// An I/O error occurred while touching the underlying storage.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// A test vector could not be encoded for storage.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// A stored test vector could not be decoded.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<EncodeError> for CorpusError {
    fn from(err: EncodeError) -> Self {
        CorpusError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for CorpusError {
    fn from(err: DecodeError) -> Self {
        CorpusError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// The logical partitions of the corpus.
///
/// `Good` and `Archive` feed the mutator. `Faulty` collects vectors whose
/// execution broke the harness and `Crash` keeps every crashing vector; the
/// mutator never draws from either.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Bin {
    Good,
    Archive,
    Faulty,
    Crash,
}

impl Bin {
    pub const ALL: [Bin; 4] = [Bin::Good, Bin::Archive, Bin::Faulty, Bin::Crash];

    pub const fn folder_name(&self) -> &'static str {
        match self {
            Bin::Good => "good",
            Bin::Archive => "archive",
            Bin::Faulty => "faulty",
            Bin::Crash => "crash",
        }
    }
}

impl std::fmt::Display for Bin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.folder_name())
    }
}

/// Persistence backend for test vectors, keyed by bin and name.
///
/// Implementations must tolerate concurrent `save` and `load` calls from
/// different workers; a reader never observes a partially written entry.
pub trait VectorStore: Send + Sync {
    /// Lists the names currently stored in `bin`, in no particular order.
    fn list(&self, bin: Bin) -> Result<Vec<String>, CorpusError>;

    /// Loads a fresh, owned copy of the named entry.
    fn load(&self, bin: Bin, name: &str) -> Result<TestVector, CorpusError>;

    /// Stores `vector` under a name that must not exist yet, returning where it landed.
    fn save(&self, bin: Bin, name: &str, vector: &TestVector) -> Result<PathBuf, CorpusError>;

    /// Removes the named entry.
    fn remove(&self, bin: Bin, name: &str) -> Result<(), CorpusError>;

    fn len(&self, bin: Bin) -> Result<usize, CorpusError> {
        Ok(self.list(bin)?.len())
    }

    fn is_empty(&self, bin: Bin) -> Result<bool, CorpusError> {
        Ok(self.len(bin)? == 0)
    }
}

/// A `VectorStore` kept entirely in memory. Not persistent across runs.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    bins: Mutex<HashMap<Bin, BTreeMap<String, TestVector>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorStore for InMemoryVectorStore {
    fn list(&self, bin: Bin) -> Result<Vec<String>, CorpusError> {
        let bins = self.bins.lock().unwrap_or_else(|p| p.into_inner());
        Ok(bins
            .get(&bin)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn load(&self, bin: Bin, name: &str) -> Result<TestVector, CorpusError> {
        let bins = self.bins.lock().unwrap_or_else(|p| p.into_inner());
        bins.get(&bin)
            .and_then(|entries| entries.get(name))
            .cloned()
            .ok_or_else(|| CorpusError::NotFound {
                bin,
                name: name.to_string(),
            })
    }

    fn save(&self, bin: Bin, name: &str, vector: &TestVector) -> Result<PathBuf, CorpusError> {
        let mut bins = self.bins.lock().unwrap_or_else(|p| p.into_inner());
        let entries = bins.entry(bin).or_default();
        if entries.contains_key(name) {
            return Err(CorpusError::AlreadyExists {
                bin,
                name: name.to_string(),
            });
        }
        entries.insert(name.to_string(), vector.clone());
        Ok(Path::new(bin.folder_name()).join(name))
    }

    fn remove(&self, bin: Bin, name: &str) -> Result<(), CorpusError> {
        let mut bins = self.bins.lock().unwrap_or_else(|p| p.into_inner());
        bins.get_mut(&bin)
            .and_then(|entries| entries.remove(name))
            .map(|_| ())
            .ok_or_else(|| CorpusError::NotFound {
                bin,
                name: name.to_string(),
            })
    }
}

/// A `VectorStore` that keeps one bincode file per entry, one directory per bin.
///
/// Layout under `output_folder`: `good/`, `faulty/`, `crash/`, and `archive/`
/// unless an explicit archive folder is configured. Files are written to a
/// temporary name in the bin directory and renamed into place, so concurrent
/// readers only ever see complete entries.
pub struct OnDiskVectorStore {
    folders: HashMap<Bin, PathBuf>,
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl OnDiskVectorStore {
    /// File extension for stored test vectors.
    const VECTOR_FILE_EXTENSION: &'static str = "vector";

    fn current_bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    /// Opens (creating when needed) the bin directories below `output_folder`.
    pub fn new(output_folder: &Path, archive_folder: Option<&Path>) -> Result<Self, CorpusError> {
        let mut folders = HashMap::new();
        for bin in Bin::ALL {
            let folder = match (bin, archive_folder) {
                (Bin::Archive, Some(archive)) => archive.to_path_buf(),
                _ => output_folder.join(bin.folder_name()),
            };
            if folder.exists() && !folder.is_dir() {
                return Err(CorpusError::Io(format!(
                    "Corpus path {:?} exists but is not a directory",
                    folder
                )));
            }
            fs::create_dir_all(&folder).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create {} directory at {:?}: {}",
                    bin, folder, e
                ))
            })?;
            folders.insert(bin, folder);
        }
        Ok(Self {
            folders,
            bincode_config: Self::current_bincode_config(),
        })
    }

    pub fn folder(&self, bin: Bin) -> &Path {
        // Every bin is inserted by `new`.
        self.folders[&bin].as_path()
    }

    fn entry_path(&self, bin: Bin, name: &str) -> PathBuf {
        self.folder(bin)
            .join(name)
            .with_extension(Self::VECTOR_FILE_EXTENSION)
    }

    /// Highest purely numeric entry name across all bins, if any.
    pub fn highest_id(&self) -> Result<Option<u64>, CorpusError> {
        let mut highest = None;
        for bin in Bin::ALL {
            for name in self.list(bin)? {
                if let Ok(id) = name.parse::<u64>() {
                    highest = highest.max(Some(id));
                }
            }
        }
        Ok(highest)
    }
}

impl VectorStore for OnDiskVectorStore {
    fn list(&self, bin: Bin) -> Result<Vec<String>, CorpusError> {
        let folder = self.folder(bin);
        let mut names = Vec::new();
        for entry_result in fs::read_dir(folder).map_err(|e| {
            CorpusError::Io(format!("Failed to read {} directory {:?}: {}", bin, folder, e))
        })? {
            let path = entry_result?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(Self::VECTOR_FILE_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        Ok(names)
    }

    fn load(&self, bin: Bin, name: &str) -> Result<TestVector, CorpusError> {
        let path = self.entry_path(bin, name);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CorpusError::NotFound {
                    bin,
                    name: name.to_string(),
                });
            }
            Err(e) => {
                return Err(CorpusError::Io(format!(
                    "Failed to read vector file {:?}: {}",
                    path, e
                )));
            }
        };
        if content.is_empty() {
            return Err(CorpusError::Deserialization(format!(
                "Vector file {:?} is empty, cannot deserialize.",
                path
            )));
        }
        let (vector, _length): (TestVector, usize) =
            bincode::serde::decode_from_slice(&content, self.bincode_config).map_err(|e| {
                CorpusError::Deserialization(format!(
                    "Bincode deserialization failed for vector file {:?}: {}",
                    path, e
                ))
            })?;
        Ok(vector)
    }

    fn save(&self, bin: Bin, name: &str, vector: &TestVector) -> Result<PathBuf, CorpusError> {
        let path = self.entry_path(bin, name);
        let bytes = bincode::serde::encode_to_vec(vector, self.bincode_config)?;

        let mut staged = tempfile::Builder::new()
            .prefix(".staged-")
            .tempfile_in(self.folder(bin))?;
        staged.write_all(&bytes).map_err(|e| {
            CorpusError::Io(format!("Failed to write staged vector for {:?}: {}", path, e))
        })?;
        staged.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                CorpusError::AlreadyExists {
                    bin,
                    name: name.to_string(),
                }
            } else {
                CorpusError::Io(format!("Failed to move vector into {:?}: {}", path, e.error))
            }
        })?;
        debug!(%bin, name, "stored test vector");
        Ok(path)
    }

    fn remove(&self, bin: Bin, name: &str) -> Result<(), CorpusError> {
        let path = self.entry_path(bin, name);
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CorpusError::NotFound {
                    bin,
                    name: name.to_string(),
                }
            } else {
                CorpusError::Io(format!("Failed to remove vector file {:?}: {}", path, e))
            }
        })
    }
}

/// Names and retrieves corpus entries on top of a [`VectorStore`].
///
/// Entry names come from the shared [`UniqueIdAllocator`], so they are unique
/// across bins as well as within them.
#[derive(Clone)]
pub struct CorpusStore {
    store: Arc<dyn VectorStore>,
    ids: Arc<UniqueIdAllocator>,
}

impl CorpusStore {
    pub fn new(store: Arc<dyn VectorStore>, ids: Arc<UniqueIdAllocator>) -> Self {
        Self { store, ids }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn ids(&self) -> &Arc<UniqueIdAllocator> {
        &self.ids
    }

    /// Stores `vector` in `bin` under a freshly allocated name.
    pub fn add(&self, bin: Bin, vector: &TestVector) -> Result<PathBuf, CorpusError> {
        let name = format!("{:08}", self.ids.next_id());
        self.store.save(bin, &name, vector)
    }

    pub fn len(&self, bin: Bin) -> Result<usize, CorpusError> {
        self.store.len(bin)
    }

    pub fn is_empty(&self, bin: Bin) -> Result<bool, CorpusError> {
        self.store.is_empty(bin)
    }

    /// Loads a uniformly chosen entry of `bin`, or `None` when the bin is empty.
    pub fn random_entry<R: Rng + ?Sized>(
        &self,
        bin: Bin,
        rng: &mut R,
    ) -> Result<Option<TestVector>, CorpusError> {
        let names = self.store.list(bin)?;
        if names.is_empty() {
            return Ok(None);
        }
        let name = &names[rng.random_range(0..names.len())];
        match self.store.load(bin, name) {
            Ok(vector) => Ok(Some(vector)),
            Err(e) => {
                warn!(%bin, name = name.as_str(), error = %e, "could not load corpus entry");
                Err(e)
            }
        }
    }
}
