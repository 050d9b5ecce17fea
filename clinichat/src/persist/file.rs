//! On-disk session storage: one JSON file per namespace.
//!
//! Files live directly in the session directory and are named
//! `<identity>.<universe>.json`. Identities made only of ASCII letters,
//! digits and `-` are used verbatim; any other identity is written as `_`
//! followed by the hex of its UTF-8 bytes, so two identities never share a
//! file. Writes go through a temporary file and a
//! rename so a crash never leaves a half-written record behind.

use std::path::{Path, PathBuf};

use clinichat_proto::message::ParticipantId;
use clinichat_proto::scope::Universe;

use super::{Namespace, PersistError, PersistedState, SessionPersistence};

const EXTENSION: &str = "json";

/// [`SessionPersistence`] backed by files in a directory.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    /// Uses `dir` as the session directory, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::Io`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The session directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `namespace`.
    #[must_use]
    pub fn path_for(&self, namespace: &Namespace) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{EXTENSION}",
            encode_identity(namespace.identity.as_str()),
            namespace.universe
        ))
    }
}

impl SessionPersistence for FilePersistence {
    fn snapshot(&self, namespace: &Namespace, state: &PersistedState) -> Result<(), PersistError> {
        let path = self.path_for(namespace);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        let bytes = serde_json::to_vec(state)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, namespace: &Namespace) -> Result<Option<PersistedState>, PersistError> {
        match std::fs::read(self.path_for(namespace)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn purge_except(&self, identity: &ParticipantId) -> Result<usize, PersistError> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(owner) = record_owner(&path) else {
                continue;
            };
            if owner != identity.as_str() {
                std::fs::remove_file(&path)?;
                tracing::info!(path = %path.display(), "purged stale session record");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Decoded identity of a record file, `None` for unrelated files.
fn record_owner(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (owner, universe) = stem.rsplit_once('.')?;
    universe.parse::<Universe>().ok()?;
    decode_identity(owner)
}

fn is_verbatim(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn encode_identity(id: &str) -> String {
    if is_verbatim(id) {
        id.to_string()
    } else {
        format!("_{}", hex::encode(id))
    }
}

fn decode_identity(name: &str) -> Option<String> {
    match name.strip_prefix('_') {
        Some(encoded) => String::from_utf8(hex::decode(encoded).ok()?).ok(),
        None => is_verbatim(name).then(|| name.to_string()),
    }
}
