//! Category registry: category slug → human-readable name.
//!
//! The registry only grows. A new category usually means the upstream
//! taxonomy changed and a human needs to add a matching flair, so every
//! insertion is logged at WARN and persisted immediately.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::fs;
use tracing::{error, instrument, warn};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default)]
pub struct CategoryRegistry {
    path: PathBuf,
    categories: BTreeMap<String, String>,
}

impl CategoryRegistry {
    /// Load the registry from `path`; a missing file yields an empty registry.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let categories = match fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_yaml::from_str(&text).map_err(|source| ConfigError::Invalid {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Category registry not available; starting empty");
                BTreeMap::new()
            }
            Err(source) => return Err(ConfigError::Unreadable { path, source }),
        };
        Ok(Self { path, categories })
    }

    pub fn get(&self, slug: &str) -> Option<&str> {
        self.categories.get(slug).map(String::as_str)
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.categories.contains_key(slug)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.categories.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    /// Register `slug` if unseen. Returns `true` when it was added.
    ///
    /// A failure to persist is logged; the category stays registered in memory.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure(&mut self, slug: &str, name: &str) -> bool {
        let added = if self.contains(slug) {
            false
        } else {
            warn!(category = slug, category_name = name, "New category");
            self.categories.insert(slug.to_string(), name.to_string());
            if let Err(e) = self.save().await {
                error!(category = slug, error = %e, "Unable to add new category");
            }
            true
        };
        if self.get(slug) != Some(name) {
            warn!(
                category = slug,
                category_name = name,
                registered = ?self.get(slug),
                "Unexpected category name"
            );
        }
        added
    }

    async fn save(&self) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::Write {
            path: self.path.clone(),
            reason,
        };
        let text = serde_yaml::to_string(&self.categories).map_err(|e| write_err(e.to_string()))?;
        fs::write(&self.path, text)
            .await
            .map_err(|e| write_err(e.to_string()))
    }
}
