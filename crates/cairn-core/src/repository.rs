use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use cairn_types::checksum::Checksum;
use cairn_types::snapshot_id::SnapshotId;

use crate::compress::{self, Compression};
use crate::config::RepositoryConfig;
use crate::encryption;
use crate::error::{CairnError, Result};
use crate::hashing::HashingAlgorithm;
use crate::packfile;
use crate::snapshot::header::Header;
use crate::state::{Location, State, StateIndex};
use crate::storage::{
    backend_from_location, snapshot_key, with_retry, Namespace, StorageBackend, CONFIG_KEY,
};

/// A handle to an opened repository.
///
/// Holds the storage backend, the resolved codec/hash/key material, and the
/// aggregate location index merged from all committed states. The master
/// key is immutable after open; subkeys never leave the encryption module.
pub struct Repository {
    storage: Arc<dyn StorageBackend>,
    config: RepositoryConfig,
    hashing: HashingAlgorithm,
    compression: Compression,
    master_key: Option<Zeroizing<[u8; encryption::KEY_SIZE]>>,
    state_index: Mutex<StateIndex>,
}

impl Repository {
    /// Create a new repository at `location` with the default configuration.
    pub fn create(location: &str, passphrase: Option<&[u8]>) -> Result<Self> {
        Self::create_with_config(location, RepositoryConfig::new(), passphrase)
    }

    pub fn create_with_config(
        location: &str,
        config: RepositoryConfig,
        passphrase: Option<&[u8]>,
    ) -> Result<Self> {
        let storage = backend_from_location(location)?;
        Self::init(storage, config, passphrase)
    }

    /// Initialize a repository on an already-built backend. Fails with
    /// `AlreadyExists` when a CONFIG blob is present.
    pub fn init(
        storage: Box<dyn StorageBackend>,
        mut config: RepositoryConfig,
        passphrase: Option<&[u8]>,
    ) -> Result<Self> {
        let storage: Arc<dyn StorageBackend> = Arc::from(storage);

        if storage.exists(CONFIG_KEY)? {
            return Err(CairnError::AlreadyExists("repository".into()));
        }

        config.chunking.validate()?;
        let hashing = HashingAlgorithm::lookup(&config.hashing)?;
        let compression = Compression::lookup(config.compression.as_deref())?;

        let master_key = match passphrase {
            Some(passphrase) => {
                let secret = encryption::build_secret_from_passphrase(passphrase)?;
                config.encryption = Some(crate::config::EncryptionConfig {
                    algorithm: encryption::default_algorithm().to_string(),
                    key: secret.clone(),
                });
                Some(encryption::derive_secret(passphrase, &secret)?)
            }
            None => {
                config.encryption = None;
                None
            }
        };

        storage.put(CONFIG_KEY, &config.serialize()?)?;
        debug!(repository_id = %config.repository_id, "created repository");

        Ok(Repository {
            storage,
            config,
            hashing,
            compression,
            master_key,
            state_index: Mutex::new(StateIndex::new()),
        })
    }

    /// Open an existing repository at `location`.
    pub fn open(location: &str, passphrase: Option<&[u8]>) -> Result<Self> {
        let storage = backend_from_location(location)?;
        Self::open_with(storage, passphrase)
    }

    /// Open a repository on an already-built backend: read CONFIG, verify
    /// the passphrase, derive the master key, and merge committed states.
    pub fn open_with(storage: Box<dyn StorageBackend>, passphrase: Option<&[u8]>) -> Result<Self> {
        let storage: Arc<dyn StorageBackend> = Arc::from(storage);

        let config_data = storage
            .get(CONFIG_KEY)?
            .ok_or_else(|| CairnError::NotFound("repository CONFIG".into()))?;
        let config = RepositoryConfig::deserialize(&config_data)?;

        let hashing = HashingAlgorithm::lookup(&config.hashing)?;
        let compression = Compression::lookup(config.compression.as_deref())?;

        let master_key = match &config.encryption {
            Some(enc) => {
                let passphrase = passphrase.ok_or_else(|| {
                    CairnError::Config("passphrase required for encrypted repository".into())
                })?;
                Some(encryption::derive_secret(passphrase, &enc.key)?)
            }
            None => None,
        };

        let repo = Repository {
            storage,
            config,
            hashing,
            compression,
            master_key,
            state_index: Mutex::new(StateIndex::new()),
        };
        repo.load_states()?;
        Ok(repo)
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn hashing(&self) -> HashingAlgorithm {
        self.hashing
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    pub fn checksum(&self, data: &[u8]) -> Checksum {
        self.hashing.checksum(data)
    }

    // ----- codec pipeline -----

    /// Forward pipeline for stored bytes: compress, then seal when the
    /// repository is encrypted.
    pub fn encode_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = compress::compress(self.compression, plaintext)?;
        match &self.master_key {
            Some(key) => encryption::seal(key, &compressed),
            None => Ok(compressed),
        }
    }

    /// Inverse pipeline. Every failure is hard; callers never see partial
    /// plaintext.
    pub fn decode_blob(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = match &self.master_key {
            Some(key) => encryption::open(key, data)?,
            None => data.to_vec(),
        };
        compress::decompress(self.compression, &compressed)
    }

    // ----- state index -----

    /// Merge every committed STATE blob into the aggregate location index.
    fn load_states(&self) -> Result<()> {
        let keys = with_retry("list states", || {
            self.storage.list(Namespace::State.prefix())
        })?;
        let mut index = self.state_index.lock().unwrap();
        for key in keys {
            let Some(state_checksum) = Namespace::State.checksum_from_key(&key) else {
                warn!("ignoring malformed state key: {key}");
                continue;
            };
            let Some(body) = with_retry("get state", || self.storage.get(&key))? else {
                continue;
            };
            let plaintext = self.decode_blob(&body)?;
            let state = State::deserialize(&plaintext)?;
            index.merge(state_checksum, &state);
        }
        debug!(locations = index.len(), "merged committed states");
        Ok(())
    }

    /// Whether a digest is already stored (committed states only).
    pub fn has_location(&self, checksum: &Checksum) -> bool {
        self.state_index.lock().unwrap().contains(checksum)
    }

    pub fn lookup_location(&self, checksum: &Checksum) -> Option<Location> {
        self.state_index.lock().unwrap().lookup(checksum).copied()
    }

    /// Serialize, encode, and persist a snapshot's state. Strictly follows
    /// every packfile put of the same snapshot.
    pub fn commit_state(&self, state: &State) -> Result<Checksum> {
        let body = self.encode_blob(&state.serialize()?)?;
        let state_checksum = self.checksum(&body);
        let key = Namespace::State.key(&state_checksum);
        with_retry("put state", || self.storage.put(&key, &body))?;
        self.state_index
            .lock()
            .unwrap()
            .merge(state_checksum, state);
        Ok(state_checksum)
    }

    /// Persist a sealed packfile and record its entries' locations.
    pub fn put_packfile(&self, sealed: &packfile::SealedPackfile, state: &mut State) -> Result<()> {
        let key = Namespace::Packfile.key(&sealed.checksum);
        with_retry("put packfile", || self.storage.put(&key, &sealed.data))?;
        for entry in &sealed.entries {
            state.insert(
                entry.checksum,
                Location {
                    packfile: sealed.checksum,
                    offset: entry.offset,
                    length: entry.length,
                    kind: entry.kind,
                },
            );
        }
        debug!(
            packfile = %sealed.checksum,
            blobs = sealed.entries.len(),
            bytes = sealed.data.len(),
            "flushed packfile"
        );
        Ok(())
    }

    /// Read one blob out of a packfile by its committed location, decode
    /// it, and re-verify its digest.
    pub fn read_chunk_at(
        &self,
        checksum: &Checksum,
        location: &Location,
        context: &str,
    ) -> Result<Vec<u8>> {
        let encoded = with_retry("get packfile range", || {
            packfile::read_entry(
                self.storage.as_ref(),
                &location.packfile,
                location.offset,
                location.length,
            )
        })?;
        let plaintext = self.decode_blob(&encoded)?;
        if self.checksum(&plaintext) != *checksum {
            return Err(CairnError::corruption(
                context,
                format!("chunk digest mismatch for {checksum}"),
            ));
        }
        Ok(plaintext)
    }

    /// Read a chunk through the aggregate state index.
    pub fn read_chunk(&self, checksum: &Checksum, context: &str) -> Result<Vec<u8>> {
        let location = self
            .lookup_location(checksum)
            .ok_or_else(|| CairnError::NotFound(format!("chunk {checksum}")))?;
        self.read_chunk_at(checksum, &location, context)
    }

    // ----- blob namespace (objects and snapshot sections) -----

    /// Store an already-serialized object/section under its plaintext
    /// digest. A second put of the same digest is a no-op.
    pub fn put_blob(&self, plaintext: &[u8]) -> Result<Checksum> {
        let checksum = self.checksum(plaintext);
        let key = Namespace::Blob.key(&checksum);
        if !with_retry("blob exists", || self.storage.exists(&key))? {
            let encoded = self.encode_blob(plaintext)?;
            with_retry("put blob", || self.storage.put(&key, &encoded))?;
        }
        Ok(checksum)
    }

    pub fn has_blob(&self, checksum: &Checksum) -> Result<bool> {
        let key = Namespace::Blob.key(checksum);
        with_retry("blob exists", || self.storage.exists(&key))
    }

    /// Fetch, decode, and digest-verify a blob.
    pub fn read_blob(&self, checksum: &Checksum, context: &str) -> Result<Vec<u8>> {
        let key = Namespace::Blob.key(checksum);
        let encoded = with_retry("get blob", || self.storage.get(&key))?
            .ok_or_else(|| CairnError::NotFound(format!("blob {checksum}")))?;
        let plaintext = self.decode_blob(&encoded)?;
        if self.checksum(&plaintext) != *checksum {
            return Err(CairnError::corruption(
                context,
                format!("blob digest mismatch for {checksum}"),
            ));
        }
        Ok(plaintext)
    }

    // ----- snapshot headers -----

    pub fn put_header(&self, header: &Header) -> Result<()> {
        let body = self.encode_blob(&header.serialize()?)?;
        let key = snapshot_key(&header.snapshot_id);
        with_retry("put snapshot", || self.storage.put(&key, &body))
    }

    pub fn get_header(&self, id: &SnapshotId) -> Result<Header> {
        let key = snapshot_key(id);
        let body = with_retry("get snapshot", || self.storage.get(&key))?
            .ok_or_else(|| CairnError::SnapshotNotFound(id.to_hex()))?;
        Header::deserialize(&self.decode_blob(&body)?)
    }

    /// Ids of all finalized snapshots. Only snapshots whose header has
    /// been stored are visible here.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        let keys = with_retry("list snapshots", || self.storage.list("SNAPSHOT"))?;
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(hex) = key.rsplit('/').next() {
                if let Ok(id) = SnapshotId::from_hex(hex) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Remove a snapshot: header first, then its committed state, then a
    /// conservative pack-level reclamation sweep. Chunks shared with other
    /// snapshots are never touched.
    pub fn delete_snapshot(&self, id: &SnapshotId) -> Result<()> {
        // The header must disappear before any reclamation so readers
        // cannot open a snapshot whose chunks are being removed.
        let key = snapshot_key(id);
        if !with_retry("snapshot exists", || self.storage.exists(&key))? {
            return Err(CairnError::SnapshotNotFound(id.to_hex()));
        }
        with_retry("delete snapshot", || self.storage.delete(&key))?;

        let state_checksum = self.state_index.lock().unwrap().state_for(id).copied();
        if let Some(state_checksum) = state_checksum {
            let state_key = Namespace::State.key(&state_checksum);
            with_retry("delete state", || self.storage.delete(&state_key))?;
        }

        // Rebuild the aggregate index from the remaining states.
        {
            let mut index = self.state_index.lock().unwrap();
            *index = StateIndex::new();
        }
        self.load_states()?;

        self.reclaim_unreferenced_packfiles()
    }

    /// Delete packfiles no remaining state references. Runs strictly after
    /// the owning snapshot's header and state are gone.
    fn reclaim_unreferenced_packfiles(&self) -> Result<()> {
        let referenced = self.state_index.lock().unwrap().referenced_packfiles();
        let keys = with_retry("list packfiles", || {
            self.storage.list(Namespace::Packfile.prefix())
        })?;
        for key in keys {
            let Some(checksum) = Namespace::Packfile.checksum_from_key(&key) else {
                continue;
            };
            if !referenced.contains(&checksum) {
                debug!(packfile = %checksum, "reclaiming unreferenced packfile");
                with_retry("delete packfile", || self.storage.delete(&key))?;
            }
        }
        Ok(())
    }
}
