//! User preferences persisted across sessions as a small TOML file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use libris_api_types::{SortDir, SortField};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cache::lock::{rw_read, rw_write};
use crate::infra::gateway::DEFAULT_PAGE_SIZE;

use super::filters::FilterState;

const SOURCE: &str = "application::preferences";

pub const PAGE_SIZES: [u32; 4] = [12, 24, 48, 96];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }
}

impl std::str::FromStr for Theme {
    type Err = PreferenceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            other => Err(PreferenceError::InvalidTheme(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Preferences {
    pub theme: Theme,
    pub sort_by: SortField,
    pub sort_dir: SortDir,
    pub page_size: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            sort_by: SortField::default(),
            sort_dir: SortDir::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Preferences {
    /// Starting filters for a fresh listing.
    pub fn filter_defaults(&self) -> FilterState {
        FilterState::with_preferences(self.sort_by, self.sort_dir, self.page_size)
    }
}

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("failed to access preferences at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid preferences file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode preferences: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("page size {0} is not one of 12, 24, 48, 96")]
    InvalidPageSize(u32),
    #[error("unknown theme `{0}`")]
    InvalidTheme(String),
}

fn validate_page_size(size: u32) -> Result<u32, PreferenceError> {
    if PAGE_SIZES.contains(&size) {
        Ok(size)
    } else {
        Err(PreferenceError::InvalidPageSize(size))
    }
}

/// Process-wide preferences, written through to disk on every change.
pub struct PreferenceStore {
    path: Option<PathBuf>,
    current: RwLock<Preferences>,
    /// Serializes read-modify-save cycles.
    writer: Mutex<()>,
}

impl PreferenceStore {
    /// Preferences that are never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: RwLock::new(Preferences::default()),
            writer: Mutex::new(()),
        }
    }

    /// Load from `path`; a missing file yields defaults.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, PreferenceError> {
        let path = path.into();
        let preferences = match fs::read_to_string(&path).await {
            Ok(raw) => {
                let parsed: Preferences =
                    toml::from_str(&raw).map_err(|source| PreferenceError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                validate_page_size(parsed.page_size)?;
                debug!(path = %path.display(), "Loaded preferences");
                parsed
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Preferences::default(),
            Err(source) => return Err(PreferenceError::Io { path, source }),
        };
        Ok(Self {
            path: Some(path),
            current: RwLock::new(preferences),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> Preferences {
        *rw_read(&self.current, SOURCE, "get")
    }

    pub async fn set_theme(&self, theme: Theme) -> Result<Preferences, PreferenceError> {
        self.update(|prefs| prefs.theme = theme).await
    }

    pub async fn toggle_theme(&self) -> Result<Preferences, PreferenceError> {
        self.update(|prefs| prefs.theme = prefs.theme.toggled()).await
    }

    pub async fn set_sort(
        &self,
        sort_by: SortField,
        sort_dir: SortDir,
    ) -> Result<Preferences, PreferenceError> {
        self.update(|prefs| {
            prefs.sort_by = sort_by;
            prefs.sort_dir = sort_dir;
        })
        .await
    }

    pub async fn set_page_size(&self, size: u32) -> Result<Preferences, PreferenceError> {
        let size = validate_page_size(size)?;
        self.update(|prefs| prefs.page_size = size).await
    }

    /// Memory only changes once the new preferences are on disk.
    async fn update(&self, edit: impl FnOnce(&mut Preferences)) -> Result<Preferences, PreferenceError> {
        let _writer = self.writer.lock().await;
        let mut next = self.get();
        edit(&mut next);
        self.save(&next).await?;
        *rw_write(&self.current, SOURCE, "update") = next;
        Ok(next)
    }

    async fn save(&self, preferences: &Preferences) -> Result<(), PreferenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let encoded = toml::to_string(preferences)?;
        let io_error = |source| PreferenceError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let staging = path.with_extension("toml.tmp");
        fs::write(&staging, encoded).await.map_err(io_error)?;
        fs::rename(&staging, path).await.map_err(io_error)?;
        info!(path = %path.display(), "Saved preferences");
        Ok(())
    }
}
