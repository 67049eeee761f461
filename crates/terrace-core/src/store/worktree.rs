use super::{RepoFs, RepoRead};
use crate::error::{Result, TerraceError};
use crate::paths;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Filesystem-backed working tree. Paths are store-relative; the VCS
/// metadata directory is never addressable.
#[derive(Debug, Clone)]
pub struct WorkTree {
    root: PathBuf,
}

impl WorkTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf)> {
        let rel = paths::normalize(path)?;
        if rel == ".git" || rel.starts_with(".git/") {
            return Err(TerraceError::InvalidPath(path.to_string()));
        }
        let abs = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&rel)
        };
        Ok((rel, abs))
    }
}

impl RepoRead for WorkTree {
    fn reader(&self, path: &str) -> Result<Box<dyn Read>> {
        let (rel, abs) = self.resolve(path)?;
        match File::open(&abs) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TerraceError::FileNotFound(rel))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let (_, abs) = self.resolve(path)?;
        Ok(abs.exists())
    }
}

impl RepoFs for WorkTree {
    fn writer(&self, path: &str) -> Result<Box<dyn Write>> {
        let (rel, abs) = self.resolve(path)?;
        if rel.is_empty() {
            return Err(TerraceError::InvalidPath(path.to_string()));
        }
        if let Some(parent) = abs.parent() {
            crate::io::ensure_dir(parent)?;
        }
        Ok(Box::new(File::create(&abs)?))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let (rel, abs) = self.resolve(path)?;
        if rel.is_empty() {
            return Err(TerraceError::InvalidPath(path.to_string()));
        }
        crate::io::atomic_write(&abs, data)
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        let (_, abs) = self.resolve(path)?;
        crate::io::ensure_dir(&abs)
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        let (rel, abs) = self.resolve(path)?;
        if rel.is_empty() {
            return Err(TerraceError::InvalidPath(path.to_string()));
        }
        crate::io::remove_dir_all_if_exists(&abs)
    }
}
