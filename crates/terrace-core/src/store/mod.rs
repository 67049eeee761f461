//! Versioned config store.
//!
//! The store is a working tree plus a [`Transport`] that knows how to pull
//! from and push to the upstream copy. Every mutation goes through
//! [`Store::transact`], which holds the store's lock across
//! pull → mutate → commit → push so that at most one mutation runs per store.
//!
//! Reads ([`RepoRead`]) are available outside a transaction; they see
//! whatever the working tree holds at that moment.

mod git;
mod local;
mod worktree;

pub use git::GitCli;
pub use local::LocalTransport;
pub use worktree::WorkTree;

use crate::error::{Result, TerraceError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Path-addressed file access
// ---------------------------------------------------------------------------

/// Read access to a store-relative file tree.
pub trait RepoRead: Send + Sync {
    fn reader(&self, path: &str) -> Result<Box<dyn Read>>;

    fn exists(&self, path: &str) -> Result<bool>;

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader(path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Write access to a store-relative file tree. Only handed out inside
/// [`Store::transact`].
pub trait RepoFs: RepoRead {
    /// Open `path` for writing, creating parent directories as needed.
    fn writer(&self, path: &str) -> Result<Box<dyn Write>>;

    fn create_dir(&self, path: &str) -> Result<()>;

    /// Remove `path` and everything below it. Missing is not an error.
    fn remove_dir(&self, path: &str) -> Result<()>;

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut w = self.writer(path)?;
        w.write_all(data)?;
        w.flush()?;
        Ok(())
    }
}

pub fn read_yaml<T, R>(fs: &R, path: &str) -> Result<T>
where
    T: DeserializeOwned,
    R: RepoRead + ?Sized,
{
    let data = fs.read(path)?;
    Ok(serde_yaml::from_slice(&data)?)
}

pub fn write_yaml<T, W>(fs: &W, path: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    W: RepoFs + ?Sized,
{
    let data = serde_yaml::to_string(value)?;
    fs.write(path, data.as_bytes())
}

pub fn read_json<T, R>(fs: &R, path: &str) -> Result<T>
where
    T: DeserializeOwned,
    R: RepoRead + ?Sized,
{
    let data = fs.read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_json<T, W>(fs: &W, path: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    W: RepoFs + ?Sized,
{
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    fs.write(path, &data)
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Commit author recorded on every store commit.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub name: &'static str,
    pub email: &'static str,
}

pub const SERVICE_AUTHOR: Signature = Signature {
    name: "terrace-installer",
    email: "installer@terrace.local",
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Updated,
    UpToDate,
    /// The upstream could not be reached; the local state is used as-is.
    Unavailable(String),
}

/// Moves commits between the working tree and its upstream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address of the upstream repository, as handed to deployed apps.
    fn full_address(&self) -> String;

    async fn pull(&self, worktree: &Path) -> Result<PullOutcome>;

    /// Stage everything, commit as `author`, and push.
    async fn commit_and_push(&self, worktree: &Path, message: &str, author: &Signature)
        -> Result<()>;

    /// Drop the uncommitted changes a failed mutation made to `touched`.
    /// Changes elsewhere in the working tree, such as those of an earlier
    /// uncommitted transaction, are kept.
    async fn discard(&self, _worktree: &Path, _touched: &[String]) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct DoOptions {
    /// Apply the mutation to the working tree but skip commit and push.
    pub no_commit: bool,
}

impl DoOptions {
    pub fn no_commit() -> Self {
        Self { no_commit: true }
    }
}

pub struct Store {
    tree: WorkTree,
    transport: Arc<dyn Transport>,
    lock: Mutex<()>,
}

impl Store {
    pub fn new(root: impl AsRef<Path>, transport: Arc<dyn Transport>) -> Result<Self> {
        crate::io::ensure_dir(root.as_ref())?;
        Ok(Self {
            tree: WorkTree::new(root.as_ref()),
            transport,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        self.tree.root()
    }

    pub fn full_address(&self) -> String {
        self.transport.full_address()
    }

    /// Refresh the working tree from upstream.
    ///
    /// Takes the store lock for the duration of the pull, but gives no
    /// isolation to reads that follow it.
    pub async fn pull(&self) -> PullOutcome {
        let _guard = self.lock.lock().await;
        self.pull_locked().await
    }

    async fn pull_locked(&self) -> PullOutcome {
        match self.transport.pull(self.tree.root()).await {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "pulled store");
                outcome
            }
            Err(e) => {
                warn!(error = %e, "pull failed, continuing with local state");
                PullOutcome::Unavailable(e.to_string())
            }
        }
    }

    /// Commit everything in the working tree and push it upstream.
    pub async fn commit_and_push(&self, message: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.commit_and_push_locked(message).await
    }

    async fn commit_and_push_locked(&self, message: &str) -> Result<()> {
        // A failed push leaves the local commit in place; the next pull
        // reconciles with upstream.
        self.transport
            .commit_and_push(self.tree.root(), message, &SERVICE_AUTHOR)
            .await?;
        info!(message, "committed and pushed store");
        Ok(())
    }

    /// Run `op` against the working tree as one transaction.
    ///
    /// Pulls first, then applies `op`. Unless `opts.no_commit` is set, the
    /// commit message returned by `op` is used to commit and push the result.
    /// If `op` fails, uncommitted changes are discarded and the error is
    /// returned unchanged.
    pub async fn transact<F>(&self, op: F, opts: DoOptions) -> Result<()>
    where
        F: FnOnce(&dyn RepoFs) -> Result<String>,
    {
        let _guard = self.lock.lock().await;
        self.pull_locked().await;
        let recorded = Recorded::new(&self.tree);
        let outcome = op(&recorded);
        let message = match outcome {
            Ok(message) => message,
            Err(e) => {
                let touched = recorded.into_touched();
                if let Err(discard_err) = self.transport.discard(self.tree.root(), &touched).await {
                    warn!(error = %discard_err, "could not discard failed mutation");
                }
                return Err(e);
            }
        };
        if opts.no_commit {
            debug!(message, "mutation applied without commit");
            return Ok(());
        }
        self.commit_and_push_locked(&message).await
    }
}

/// Working-tree view that remembers every path a mutation changes.
struct Recorded<'a> {
    tree: &'a WorkTree,
    touched: std::sync::Mutex<Vec<String>>,
}

impl<'a> Recorded<'a> {
    fn new(tree: &'a WorkTree) -> Self {
        Self {
            tree,
            touched: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn touch(&self, path: &str) {
        let rel = crate::paths::normalize(path).unwrap_or_else(|_| path.to_string());
        if let Ok(mut touched) = self.touched.lock() {
            if !touched.contains(&rel) {
                touched.push(rel);
            }
        }
    }

    fn into_touched(self) -> Vec<String> {
        self.touched.into_inner().unwrap_or_default()
    }
}

impl RepoRead for Recorded<'_> {
    fn reader(&self, path: &str) -> Result<Box<dyn Read>> {
        self.tree.reader(path)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.tree.exists(path)
    }
}

impl RepoFs for Recorded<'_> {
    fn writer(&self, path: &str) -> Result<Box<dyn Write>> {
        self.touch(path);
        self.tree.writer(path)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.touch(path);
        self.tree.write(path, data)
    }

    fn create_dir(&self, path: &str) -> Result<()> {
        self.touch(path);
        self.tree.create_dir(path)
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        self.touch(path);
        self.tree.remove_dir(path)
    }
}

impl RepoRead for Store {
    fn reader(&self, path: &str) -> Result<Box<dyn Read>> {
        self.tree.reader(path)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.tree.exists(path)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.tree.root())
            .field("address", &self.transport.full_address())
            .finish()
    }
}

pub(crate) fn transport_error(context: &str, err: impl std::fmt::Display) -> TerraceError {
    TerraceError::Transport(format!("{context}: {err}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, Arc<LocalTransport>, Store) {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::new("ssh://local/config"));
        let store = Store::new(dir.path(), transport.clone()).unwrap();
        (dir, transport, store)
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        fn full_address(&self) -> String {
            "ssh://unreachable/config".into()
        }

        async fn pull(&self, _worktree: &Path) -> Result<PullOutcome> {
            Err(TerraceError::Transport("connection refused".into()))
        }

        async fn commit_and_push(&self, _: &Path, _: &str, _: &Signature) -> Result<()> {
            Err(TerraceError::Transport("push rejected".into()))
        }
    }

    #[tokio::test]
    async fn transact_commits_with_returned_message() {
        let (_dir, transport, store) = open_tmp();
        store
            .transact(
                |fs| {
                    fs.write("a/b.txt", b"hello")?;
                    Ok("write b".into())
                },
                DoOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(store.read("a/b.txt").unwrap(), b"hello");
        assert_eq!(transport.commits(), vec!["write b".to_string()]);
    }

    #[tokio::test]
    async fn no_commit_skips_commit() {
        let (_dir, transport, store) = open_tmp();
        store
            .transact(|fs| fs.create_dir("x").map(|_| "x".into()), DoOptions::no_commit())
            .await
            .unwrap();
        assert!(store.exists("x").unwrap());
        assert!(transport.commits().is_empty());
    }

    #[tokio::test]
    async fn failed_mutation_is_not_committed() {
        let (_dir, transport, store) = open_tmp();
        let err = store
            .transact(
                |_| Err(TerraceError::Validation("nope".into())),
                DoOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::Validation(_)));
        assert!(transport.commits().is_empty());
    }

    #[tokio::test]
    async fn pull_failure_is_not_fatal_but_push_failure_is() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path(), Arc::new(FailingTransport)).unwrap();
        assert!(matches!(store.pull().await, PullOutcome::Unavailable(_)));

        let err = store
            .transact(
                |fs| fs.write("f", b"1").map(|_| "m".into()),
                DoOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::Transport(_)));
        // The mutation itself was applied before the push failed.
        assert_eq!(store.read("f").unwrap(), b"1");
    }

    #[tokio::test]
    async fn yaml_and_json_helpers() {
        let (_dir, _t, store) = open_tmp();
        let mut m = BTreeMap::new();
        m.insert("domain".to_string(), "example.com".to_string());
        store
            .transact(
                |fs| {
                    write_yaml(fs, "config.yaml", &m)?;
                    write_json(fs, "config.json", &m)?;
                    Ok("cfg".into())
                },
                DoOptions::default(),
            )
            .await
            .unwrap();
        let y: BTreeMap<String, String> = read_yaml(&store, "config.yaml").unwrap();
        let j: BTreeMap<String, String> = read_json(&store, "/config.json").unwrap();
        assert_eq!(y, m);
        assert_eq!(j, m);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mutations_never_overlap() {
        let (_dir, transport, store) = open_tmp();
        let store = Arc::new(store);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transact(
                        move |fs| {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(5));
                            fs.write(&format!("f/{i}"), b"x")?;
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(format!("write {i}"))
                        },
                        DoOptions::default(),
                    )
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(transport.commits().len(), 16);
    }
}
