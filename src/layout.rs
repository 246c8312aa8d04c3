//! On-disk layout of managed servers
//!
//! Every server lives in its own directory under the managed root:
//!
//! ```text
//! <root>/<id>/Caddyfile
//! <root>/<id>/access.log
//! <root>/<id>/error.log
//! <root>/<id>/caddy.pid    (while a serve process supervises the server)
//! ```
//!
//! Caddyfiles are replaced atomically (temp file + rename) so that concurrent
//! readers only ever see a complete old or new file.

use crate::caddyfile::{self, LogPaths};
use crate::error::{Result, ServeError};
use crate::server::{validate_id, ServerDefinition};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the generated Caddyfile inside a server directory
pub const CADDYFILE_NAME: &str = "Caddyfile";
/// File name of the access log inside a server directory
pub const ACCESS_LOG_NAME: &str = "access.log";
/// File name of the error log inside a server directory
pub const ERROR_LOG_NAME: &str = "error.log";
/// File name of the supervisor's pid file inside a server directory
pub const PID_FILE_NAME: &str = "caddy.pid";

/// Default managed root: `<data dir>/Serve/servers`
pub fn default_root() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("Serve")
        .join("servers")
}

/// Path computations and file operations rooted at one managed directory
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The managed root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything for `id`
    pub fn server_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn caddyfile_path(&self, id: &str) -> PathBuf {
        self.server_dir(id).join(CADDYFILE_NAME)
    }

    pub fn access_log_path(&self, id: &str) -> PathBuf {
        self.server_dir(id).join(ACCESS_LOG_NAME)
    }

    pub fn error_log_path(&self, id: &str) -> PathBuf {
        self.server_dir(id).join(ERROR_LOG_NAME)
    }

    pub fn pid_file_path(&self, id: &str) -> PathBuf {
        self.server_dir(id).join(PID_FILE_NAME)
    }

    pub fn log_paths(&self, id: &str) -> LogPaths {
        LogPaths {
            access: self.access_log_path(id),
            error: self.error_log_path(id),
        }
    }

    /// Whether a directory exists for `id`
    pub fn exists(&self, id: &str) -> bool {
        self.server_dir(id).is_dir()
    }

    /// Render and atomically replace the Caddyfile for `definition`
    pub fn write(&self, definition: &ServerDefinition) -> Result<PathBuf> {
        let text = caddyfile::render_with_logs(definition, &self.log_paths(&definition.id))?;

        let dir = self.server_dir(&definition.id);
        fs::create_dir_all(&dir).map_err(|e| ServeError::io(&dir, e))?;

        let path = self.caddyfile_path(&definition.id);
        let mut tmp = tempfile::Builder::new()
            .prefix(".Caddyfile.")
            .tempfile_in(&dir)
            .map_err(|e| ServeError::io(&dir, e))?;
        tmp.write_all(text.as_bytes())
            .map_err(|e| ServeError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| ServeError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| ServeError::io(&path, e.error))?;

        debug!(id = %definition.id, path = %path.display(), "Caddyfile written");
        Ok(path)
    }

    /// Read the definition stored for `id`
    ///
    /// Returns `Ok(None)` when nothing is configured for `id`. The directory
    /// name is authoritative for the id.
    pub fn read(&self, id: &str) -> Result<Option<ServerDefinition>> {
        validate_id(id)?;

        let path = self.caddyfile_path(id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ServeError::io(&path, e)),
        };

        caddyfile::parse_with_id(id, &text).map(Some)
    }

    /// Read every configured server, skipping entries that fail to load
    pub fn read_all(&self) -> Result<Vec<ServerDefinition>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServeError::io(&self.root, e)),
        };

        let mut definitions = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "Failed to read directory entry");
                    continue;
                }
            };

            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "Skipping server directory with non UTF-8 name");
                continue;
            };
            if id.starts_with('.') {
                continue;
            }

            match self.read(&id) {
                Ok(Some(definition)) => definitions.push(definition),
                Ok(None) => debug!(id = %id, "Server directory has no Caddyfile"),
                Err(e) => warn!(id = %id, error = %e, "Skipping unreadable server"),
            }
        }

        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    /// Remove the server directory with its Caddyfile and logs
    pub fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;

        let dir = self.server_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(id, path = %dir.display(), "Server directory removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServeError::io(&dir, e)),
        }
    }

    /// Rename the server directory from `old_id` to `new_id`
    ///
    /// The Caddyfile is regenerated afterwards so its id marker and log paths
    /// follow the new directory.
    pub fn move_server(&self, old_id: &str, new_id: &str) -> Result<ServerDefinition> {
        validate_id(old_id)?;
        validate_id(new_id)?;

        let from = self.server_dir(old_id);
        let to = self.server_dir(new_id);

        if old_id == new_id {
            return self.read(old_id)?.ok_or_else(|| {
                ServeError::io(&from, std::io::Error::from(ErrorKind::NotFound))
            });
        }

        if !from.is_dir() {
            return Err(ServeError::io(&from, std::io::Error::from(ErrorKind::NotFound)));
        }

        // Claim the target name first; create_dir fails if anything holds it.
        // rename then only ever replaces the empty directory claimed here.
        fs::create_dir_all(&self.root).map_err(|e| ServeError::io(&self.root, e))?;
        if let Err(e) = fs::create_dir(&to) {
            if e.kind() == ErrorKind::AlreadyExists {
                return Err(ServeError::Conflict(format!(
                    "a server named '{}' already exists",
                    new_id
                )));
            }
            return Err(ServeError::io(&to, e));
        }

        if let Err(e) = fs::rename(&from, &to) {
            // Only succeeds while the claim is still empty
            let _ = fs::remove_dir(&to);
            return Err(ServeError::io(&from, e));
        }
        info!(from = old_id, to = new_id, "Server directory moved");

        let mut definition = self.read(new_id)?.ok_or_else(|| {
            ServeError::io(
                self.caddyfile_path(new_id),
                std::io::Error::from(ErrorKind::NotFound),
            )
        })?;
        definition.id = new_id.to_string();
        self.write(&definition)?;

        Ok(definition)
    }
}
