use std::path::{Path, PathBuf};

/// Resolve the config repository working tree.
///
/// Priority:
/// 1. `--root` flag / `TERRACE_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for a directory with both
///    `config.yaml` and `kustomization.yaml`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd, is_store_root)
        .or_else(|| find_upward(&cwd, |d| d.join(".git").is_dir()))
        .unwrap_or(cwd)
}

fn is_store_root(dir: &Path) -> bool {
    dir.join("config.yaml").is_file() && dir.join("kustomization.yaml").is_file()
}

fn find_upward(start: &Path, matches: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| matches(dir))
        .map(Path::to_path_buf)
}
