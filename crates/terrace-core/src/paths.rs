use crate::error::{Result, TerraceError};
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// File name constants
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_FILE: &str = "config.yaml";
pub const INSTANCE_CONFIG_YAML: &str = "config.yaml";
pub const INSTANCE_CONFIG_JSON: &str = "config.json";
pub const MANIFEST_FILE: &str = "kustomization.yaml";
pub const RESOURCES_DIR: &str = "resources";

/// Names an app's extra data files may never use.
pub const RESERVED_INSTANCE_FILES: [&str; 3] = [INSTANCE_CONFIG_JSON, MANIFEST_FILE, RESOURCES_DIR];

pub fn is_reserved_instance_file(name: &str) -> bool {
    RESERVED_INSTANCE_FILES.contains(&name)
}

// ---------------------------------------------------------------------------
// Store-relative path helpers
//
// Store paths are '/'-separated and relative to the working tree root. The
// root itself is the empty string.
// ---------------------------------------------------------------------------

/// Normalize a store path: strips leading/trailing slashes, collapses `.`
/// and empty segments, and rejects `..`.
pub fn normalize(path: &str) -> Result<String> {
    let mut segments = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return Err(TerraceError::InvalidPath(path.to_string())),
            s if s.contains('\\') || s.contains('\0') => {
                return Err(TerraceError::InvalidPath(path.to_string()))
            }
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

pub fn join(dir: &str, name: &str) -> String {
    match (dir.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{dir}/{name}"),
    }
}

/// Split a normalized path into `(parent, last segment)`.
/// Returns `None` for the root.
pub fn split_last(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    Some(match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    })
}

pub fn manifest_path(dir: &str) -> String {
    join(dir, MANIFEST_FILE)
}

pub fn instance_dir(app_root: &str, id: &str) -> String {
    join(app_root, id)
}

pub fn instance_config_json(app_root: &str, id: &str) -> String {
    join(&instance_dir(app_root, id), INSTANCE_CONFIG_JSON)
}

// ---------------------------------------------------------------------------
// Instance ids
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

pub fn validate_instance_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 63 || !id_re().is_match(id) {
        return Err(TerraceError::InvalidInstanceId(id.to_string()));
    }
    Ok(())
}

const ID_SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate an instance id of the form `<app>-<3 random chars>`.
pub fn generate_instance_id(app: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..3)
        .map(|_| ID_SUFFIX_CHARS[rng.gen_range(0..ID_SUFFIX_CHARS.len())] as char)
        .collect();
    format!("{app}-{suffix}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
