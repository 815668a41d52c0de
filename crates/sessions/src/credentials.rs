use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use {
    serde::{Deserialize, Serialize},
    tracing::debug,
    wapi_common::{CredentialRecord, now_secs},
};

use crate::name::validate_session_name;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no credential record for session `{0}`")]
    NotFound(String),
    #[error("credential i/o for session `{session}`: {source}")]
    Io {
        session: String,
        #[source]
        source: io::Error,
    },
    #[error("corrupt credential record for session `{session}`: {reason}")]
    Corrupt { session: String, reason: String },
    #[error("invalid session name `{0}`")]
    InvalidName(String),
}

/// On-disk layout of one credential file.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    session: String,
    saved_at: u64,
    record: CredentialRecord,
}

/// File-based credential storage, one `<session>.json` per session.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the record for `session`. Deterministic in the name.
    pub fn path_for(&self, session: &str) -> Result<PathBuf, CredentialError> {
        validate_session_name(session)
            .map_err(|_| CredentialError::InvalidName(session.to_string()))?;
        Ok(self.dir.join(format!("{session}.json")))
    }

    /// Replace the stored record for `session`.
    ///
    /// Writes a temp file in the same directory, syncs it, then renames it
    /// over the old record so readers only ever see a complete file.
    pub fn save(&self, session: &str, record: &CredentialRecord) -> Result<(), CredentialError> {
        let path = self.path_for(session)?;
        let io_err = |source| CredentialError::Io {
            session: session.to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let data = serde_json::to_vec_pretty(&StoredCredential {
            session: session.to_string(),
            saved_at: now_secs(),
            record: record.clone(),
        })
        .map_err(|e| io_err(io::Error::other(e)))?;

        let tmp = self
            .dir
            .join(format!(".{session}.{}.tmp", uuid::Uuid::new_v4().simple()));
        if let Err(e) = write_synced(&tmp, &data).and_then(|()| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        debug!(session, path = %path.display(), "credential record saved");
        Ok(())
    }

    /// Load the record for `session`; `NotFound` when none was ever saved.
    pub fn load(&self, session: &str) -> Result<CredentialRecord, CredentialError> {
        let path = self.path_for(session)?;
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CredentialError::NotFound(session.to_string()));
            },
            Err(source) => {
                return Err(CredentialError::Io {
                    session: session.to_string(),
                    source,
                });
            },
        };

        let stored: StoredCredential =
            serde_json::from_slice(&data).map_err(|e| CredentialError::Corrupt {
                session: session.to_string(),
                reason: e.to_string(),
            })?;
        if stored.session != session {
            return Err(CredentialError::Corrupt {
                session: session.to_string(),
                reason: format!("record belongs to session `{}`", stored.session),
            });
        }
        Ok(stored.record)
    }
}

fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;

    // Set file permissions to 0600 on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(data)?;
    file.sync_all()
}
