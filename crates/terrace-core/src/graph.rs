//! Resource graph: one `kustomization.yaml` per directory listing the
//! child resources that directory contributes.
//!
//! Every directory that lists something must itself be listed by its
//! parent, all the way up to the store root. [`add_resource`] maintains
//! that chain; [`remove_resource`] only edits the one manifest it is given.

use crate::error::Result;
use crate::paths;
use crate::store::{read_yaml, write_yaml, RepoFs, RepoRead};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const API_VERSION: &str = "kustomize.config.k8s.io/v1beta1";
pub const KIND: &str = "Kustomization";

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

/// A kustomize manifest. Only `resources` is managed here; every other key
/// is carried through `extra` so hand-written settings survive a rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for Kustomization {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            resources: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl Kustomization {
    pub fn with_resources<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut k = Self::default();
        k.add_resources(names);
        k
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.iter().any(|r| r == name)
    }

    /// Append names not already listed. Returns true if anything changed.
    pub fn add_resources<I, S>(&mut self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for name in names {
            let name = name.into();
            if !self.contains(&name) {
                self.resources.push(name);
                changed = true;
            }
        }
        changed
    }

    /// Returns true if anything changed.
    pub fn remove_resources(&mut self, names: &[&str]) -> bool {
        let before = self.resources.len();
        self.resources.retain(|r| !names.contains(&r.as_str()));
        before != self.resources.len()
    }
}

/// Read the manifest of `dir`.
pub fn read_manifest<R: RepoRead + ?Sized>(fs: &R, dir: &str) -> Result<Kustomization> {
    let dir = paths::normalize(dir)?;
    read_yaml(fs, &paths::manifest_path(&dir))
}

/// Read the manifest of `dir`, or an empty one if there is none yet.
fn load_or_default<R: RepoRead + ?Sized>(fs: &R, dir: &str) -> Result<Kustomization> {
    match read_manifest(fs, dir) {
        Ok(k) => Ok(k),
        Err(e) if e.is_not_found() => Ok(Kustomization::default()),
        Err(e) => Err(e),
    }
}

pub fn write_manifest<W: RepoFs + ?Sized>(fs: &W, dir: &str, k: &Kustomization) -> Result<()> {
    let dir = paths::normalize(dir)?;
    write_yaml(fs, &paths::manifest_path(&dir), k)
}

/// Make sure `dir` has a manifest, creating an empty one if needed.
pub fn ensure_manifest<W: RepoFs + ?Sized>(fs: &W, dir: &str) -> Result<()> {
    let dir = paths::normalize(dir)?;
    if !fs.exists(&paths::manifest_path(&dir))? {
        write_manifest(fs, &dir, &Kustomization::default())?;
    }
    Ok(())
}

/// List `name` in `dir`'s manifest and link `dir` into every ancestor up
/// to the store root. Idempotent.
pub fn add_resource<W: RepoFs + ?Sized>(fs: &W, dir: &str, name: &str) -> Result<()> {
    let dir = paths::normalize(dir)?;
    let mut k = load_or_default(fs, &dir)?;
    if k.add_resources([name]) || !fs.exists(&paths::manifest_path(&dir))? {
        write_manifest(fs, &dir, &k)?;
        debug!(path = %dir, resource = name, "added resource");
    }
    link_ancestors(fs, &dir)
}

/// Ensure every ancestor of `dir` lists the next segment down.
pub fn link_ancestors<W: RepoFs + ?Sized>(fs: &W, dir: &str) -> Result<()> {
    let dir = paths::normalize(dir)?;
    let mut current = dir.as_str();
    while let Some((parent, child)) = paths::split_last(current) {
        let mut k = load_or_default(fs, parent)?;
        if k.add_resources([child]) || !fs.exists(&paths::manifest_path(parent))? {
            write_manifest(fs, parent, &k)?;
            debug!(path = %parent, resource = child, "linked directory");
        }
        current = parent;
    }
    Ok(())
}

/// Remove `name` from `dir`'s manifest. Ancestors are left untouched, even
/// when `dir` ends up listing nothing.
pub fn remove_resource<W: RepoFs + ?Sized>(fs: &W, dir: &str, name: &str) -> Result<()> {
    let dir = paths::normalize(dir)?;
    let mut k = match read_manifest(fs, &dir) {
        Ok(k) => k,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if k.remove_resources(&[name]) {
        write_manifest(fs, &dir, &k)?;
        debug!(path = %dir, resource = name, "removed resource");
    }
    Ok(())
}
