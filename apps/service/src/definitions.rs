use std::{fs, io, path};

use dynaprobe::{CheckDefinition, DefinitionStore};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read definitions {path}: {source}")]
    Read {
        path: path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse definitions {path}: {source}")]
    Parse {
        path: path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Read a JSON array of check definitions
pub fn load(path: &path::Path) -> Result<Vec<CheckDefinition>, LoadError> {
    let raw = fs::read_to_string(path).map_err(|source| LoadError::Read { path: path.to_path_buf(), source })?;
    serde_json::from_str(&raw).map_err(|source| LoadError::Parse { path: path.to_path_buf(), source })
}

/// Reload the store from disk, keeping the current set when the file is unusable
pub fn refresh(store: &DefinitionStore, path: &path::Path) {
    match load(path) {
        Ok(definitions) => {
            if definitions.len() != store.len() {
                info!("Loaded {} check definitions from {}", definitions.len(), path.display());
            }
            store.replace(definitions);
        }
        Err(e) => warn!("{e}, keeping {} previously loaded definitions", store.len()),
    }
}
