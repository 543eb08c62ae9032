//! Drop-folder provider: watch a local directory for `.eml` files.
//! Meant for drag-and-drop testing without an IMAP or Graph account.
//! Stored files move to `processed/` on ack; files that cannot be
//! decoded move to `failed/`.

use crate::parse::parse_rfc822;
use crate::{FetchedMail, MailProvider, ProviderError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::Mutex;

pub struct FileProvider {
    watch_dir: PathBuf,
    poll_interval: Duration,
    /// uid -> source path, for ack-time moves.
    pending: Mutex<HashMap<i64, PathBuf>>,
}

impl FileProvider {
    pub fn new(watch_dir: impl Into<PathBuf>, poll_interval_secs: u64) -> std::io::Result<Self> {
        let watch_dir = watch_dir.into();
        std::fs::create_dir_all(&watch_dir)?;
        std::fs::create_dir_all(watch_dir.join("processed"))?;
        std::fs::create_dir_all(watch_dir.join("failed"))?;
        Ok(Self {
            watch_dir,
            poll_interval: Duration::from_secs(poll_interval_secs),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// UID from the file modification time in milliseconds: monotonic for
    /// files dropped over time and stable across restarts.
    fn file_uid(path: &Path) -> Option<i64> {
        let meta = std::fs::metadata(path).ok()?;
        let mtime = meta.modified().ok()?;
        let millis = mtime.duration_since(UNIX_EPOCH).ok()?.as_millis();
        i64::try_from(millis).ok()
    }

    fn quarantine_file(&self, path: &Path) {
        let target = self.watch_dir.join("failed").join(
            path.file_name().unwrap_or_default(),
        );
        if let Err(e) = std::fs::rename(path, &target) {
            tracing::warn!(path = %path.display(), error = %e, "Could not move undecodable file");
        }
    }
}

#[async_trait]
impl MailProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn list(&self, _folder: &str, since_uid: i64, limit: usize) -> Result<Vec<FetchedMail>> {
        let mut candidates: Vec<(i64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.watch_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_eml = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("eml"));
            if !is_eml {
                continue;
            }
            if let Some(uid) = Self::file_uid(&path) {
                if uid > since_uid {
                    candidates.push((uid, path));
                }
            }
        }
        candidates.sort_by_key(|(uid, _)| *uid);
        candidates.truncate(limit);

        let mut mails = Vec::new();
        let mut pending = self.pending.lock().await;
        for (uid, path) in candidates {
            let raw = std::fs::read(&path)?;
            match parse_rfc822(uid, &raw) {
                Ok(mail) => {
                    pending.insert(uid, path);
                    mails.push(mail);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Undecodable drop file");
                    self.quarantine_file(&path);
                }
            }
        }
        Ok(mails)
    }

    async fn ack(&self, _folder: &str, uid: i64) -> Result<()> {
        let path = {
            let mut pending = self.pending.lock().await;
            pending.remove(&uid)
        };
        let Some(path) = path else {
            return Ok(());
        };
        let target = self
            .watch_dir
            .join("processed")
            .join(path.file_name().ok_or_else(|| {
                ProviderError::Protocol(format!("pending path without file name: {}", path.display()))
            })?);
        std::fs::rename(&path, &target)?;
        Ok(())
    }
}
