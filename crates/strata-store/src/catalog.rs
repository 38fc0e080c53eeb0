//! Script discovery.
//!
//! A [`Catalog`] is built from a directory tree of files named
//! `<version>.<name>.<direction>.sql`. Files that do not follow the
//! convention are ignored so READMEs and editor leftovers can live alongside
//! the scripts.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::CatalogError;
use crate::models::{Direction, MigrationScript};

/// Extension a script file must carry.
pub const SCRIPT_EXTENSION: &str = "sql";

/// Every script discovered for one invocation, keyed by version and direction.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    scripts: BTreeMap<(String, Direction), MigrationScript>,
}

/// The parts of a script file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptName {
    pub version: String,
    pub name: String,
    pub direction: Direction,
}

/// Split a file name into version, name and direction.
///
/// Returns `None` when the name does not follow the convention.
pub fn parse_file_name(file_name: &str) -> Option<ScriptName> {
    let parts: Vec<&str> = file_name.split('.').collect();
    if parts.len() < 3 || parts[parts.len() - 1] != SCRIPT_EXTENSION {
        return None;
    }

    let version = parts[0];
    if version.is_empty() {
        return None;
    }
    let direction = Direction::from_token(parts[parts.len() - 2])?;

    Some(ScriptName {
        version: version.to_string(),
        name: parts[1..parts.len() - 2].join("."),
        direction,
    })
}

impl Catalog {
    /// Read every script under `source`, recursing into subdirectories.
    pub fn load(source: &Path) -> Result<Self, CatalogError> {
        let mut files = Vec::new();
        collect_files(source, &mut files)?;
        files.sort();

        let mut catalog = Self::default();
        for path in files {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(parsed) = parse_file_name(file_name) else {
                debug!(path = %path.display(), "skipping non-migration file");
                continue;
            };

            let body = fs::read_to_string(&path).map_err(|source| CatalogError::Io {
                path: path.clone(),
                source,
            })?;

            catalog.insert(MigrationScript {
                version: parsed.version,
                name: parsed.name,
                direction: parsed.direction,
                body,
                path,
            })?;
        }

        debug!(
            source = %source.display(),
            scripts = catalog.len(),
            "loaded migration catalog"
        );

        Ok(catalog)
    }

    /// Add a script, rejecting a second one for the same version and direction.
    pub fn insert(&mut self, script: MigrationScript) -> Result<(), CatalogError> {
        match self
            .scripts
            .entry((script.version.clone(), script.direction))
        {
            Entry::Occupied(existing) => Err(CatalogError::Duplicate {
                version: script.version,
                direction: script.direction,
                first: existing.get().path.clone(),
                second: script.path,
            }),
            Entry::Vacant(slot) => {
                slot.insert(script);
                Ok(())
            }
        }
    }

    pub fn get(&self, version: &str, direction: Direction) -> Option<&MigrationScript> {
        self.scripts.get(&(version.to_string(), direction))
    }

    pub fn forward(&self, version: &str) -> Option<&MigrationScript> {
        self.get(version, Direction::Forward)
    }

    pub fn backward(&self, version: &str) -> Option<&MigrationScript> {
        self.get(version, Direction::Backward)
    }

    /// Versions that have a forward script, ascending.
    pub fn forward_versions(&self) -> impl Iterator<Item = &str> {
        self.scripts
            .iter()
            .filter(|((_, direction), _)| *direction == Direction::Forward)
            .map(|((version, _), _)| version.as_str())
    }

    /// All scripts ordered by version, forward before backward.
    pub fn iter(&self) -> impl Iterator<Item = &MigrationScript> {
        self.scripts.values()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), CatalogError> {
    let io_err = |source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    };

    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        // file_type() does not follow symlinks: linked directories are not walked
        let file_type = entry.file_type().map_err(io_err)?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() || (file_type.is_symlink() && path.is_file()) {
            out.push(path);
        }
    }
    Ok(())
}
