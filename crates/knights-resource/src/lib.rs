//! Resource loading: rooted, normalized access to the game data
//! directory.
//!
//! Resource paths use `/` or `\` as separators; `:` is forbidden, `.`
//! and empty components are dropped, and `..` pops a component, or
//! rejects the path outright if it would escape the root. Every path
//! either fails validation or resolves to a normalized sequence of plain
//! components, so nothing opened through a [`ResourceDir`] can reach
//! outside it.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Errors from resource path handling and opening.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("invalid resource path {0:?}")]
    InvalidPath(String),

    #[error("could not open resource {path:?}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Normalizes a resource path into its components.
///
/// Returns the cleaned components; an empty result means the path named
/// the root itself (callers usually treat that as invalid for files).
pub fn normalize_path(path: &str) -> Result<Vec<String>, ResourceError> {
    let mut components: Vec<String> = Vec::new();
    for raw in path.split(['/', '\\']) {
        if raw.contains(':') {
            return Err(ResourceError::InvalidPath(path.to_owned()));
        }
        match raw {
            "" | "." => {} // dropped
            ".." => {
                // popping past the root would escape it
                if components.pop().is_none() {
                    return Err(ResourceError::InvalidPath(path.to_owned()));
                }
            }
            comp => components.push(comp.to_owned()),
        }
    }
    Ok(components)
}

/// A keyed byte-stream opener rooted at a directory.
#[derive(Debug, Clone)]
pub struct ResourceDir {
    base: PathBuf,
}

impl ResourceDir {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        ResourceDir { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves a resource path inside the root.
    pub fn resolve(&self, resource_path: &str) -> Result<PathBuf, ResourceError> {
        let components = normalize_path(resource_path)?;
        if components.is_empty() {
            return Err(ResourceError::InvalidPath(resource_path.to_owned()));
        }
        let mut full = self.base.clone();
        for comp in components {
            full.push(comp);
        }
        Ok(full)
    }

    pub fn exists(&self, resource_path: &str) -> bool {
        self.resolve(resource_path)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Opens a resource for reading.
    pub fn open(&self, resource_path: &str) -> Result<File, ResourceError> {
        let full = self.resolve(resource_path)?;
        File::open(&full).map_err(|source| ResourceError::Open {
            path: resource_path.to_owned(),
            source,
        })
    }

    /// Reads a whole resource into memory.
    pub fn read(&self, resource_path: &str) -> Result<Vec<u8>, ResourceError> {
        let mut file = self.open(resource_path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|source| ResourceError::Open {
                path: resource_path.to_owned(),
                source,
            })?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(path: &str) -> Option<Vec<String>> {
        normalize_path(path).ok()
    }

    #[test]
    fn plain_paths_pass_through() {
        assert_eq!(norm("gfx/knight.png"), Some(vec!["gfx".into(), "knight.png".into()]));
        assert_eq!(norm("gfx\\knight.png"), Some(vec!["gfx".into(), "knight.png".into()]));
    }

    #[test]
    fn dot_and_empty_components_are_dropped() {
        assert_eq!(norm("./a//b/./c"), Some(vec!["a".into(), "b".into(), "c".into()]));
        assert_eq!(norm(""), Some(vec![]));
    }

    #[test]
    fn dotdot_pops_but_cannot_escape() {
        assert_eq!(norm("a/b/../c"), Some(vec!["a".into(), "c".into()]));
        assert!(norm("..").is_none());
        assert!(norm("a/../../b").is_none());
    }

    #[test]
    fn colons_are_forbidden() {
        assert!(norm("c:/windows").is_none());
        assert!(norm("RES:file").is_none());
    }

    #[test]
    fn normalized_output_never_contains_specials() {
        for path in ["a/./b/../c", "x//y", "deep/../../"] {
            if let Some(components) = norm(path) {
                for comp in components {
                    assert!(!comp.is_empty());
                    assert_ne!(comp, ".");
                    assert_ne!(comp, "..");
                }
            }
        }
    }
}
