use super::{PullOutcome, Signature, Transport};
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;

/// Transport with no upstream. Pulls are always up to date and commits are
/// only recorded in memory; used for offline operation and in tests.
#[derive(Debug, Default)]
pub struct LocalTransport {
    address: String,
    commits: Mutex<Vec<String>>,
}

impl LocalTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            commits: Mutex::new(Vec::new()),
        }
    }

    /// Commit messages recorded so far, oldest first.
    pub fn commits(&self) -> Vec<String> {
        self.commits
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn full_address(&self) -> String {
        self.address.clone()
    }

    async fn pull(&self, _worktree: &Path) -> Result<PullOutcome> {
        Ok(PullOutcome::UpToDate)
    }

    async fn commit_and_push(
        &self,
        _worktree: &Path,
        message: &str,
        _author: &Signature,
    ) -> Result<()> {
        if let Ok(mut commits) = self.commits.lock() {
            commits.push(message.to_string());
        }
        Ok(())
    }
}
