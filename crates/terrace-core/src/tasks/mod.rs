//! Task trees.
//!
//! A [`Task`] is a leaf action or a named group of child tasks. Sequential
//! groups run children in order and stop at the first failure; concurrent
//! groups start every child, wait for all of them, and report every failure
//! together. Tasks are built once and consumed by [`Task::execute`].

mod environment;
mod retry;
mod wait;

pub use environment::{setup_environment, EnvSetup};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use wait::{
    dns_propagated, https_reachable, poll_until, wait_for, Resolver, SystemResolver,
    DEFAULT_POLL_INTERVAL,
};

use crate::error::{Result, TaskFailure, TerraceError};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::future::Future;
use tracing::{error, info};

pub type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub enum Task {
    Leaf { name: String, action: Action },
    Sequential { name: String, children: Vec<Task> },
    Concurrent { name: String, children: Vec<Task> },
}

impl Task {
    pub fn leaf<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Task::Leaf {
            name: name.into(),
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn sequential(name: impl Into<String>, children: Vec<Task>) -> Self {
        Task::Sequential {
            name: name.into(),
            children,
        }
    }

    pub fn concurrent(name: impl Into<String>, children: Vec<Task>) -> Self {
        Task::Concurrent {
            name: name.into(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Task::Leaf { name, .. } | Task::Sequential { name, .. } | Task::Concurrent { name, .. } => {
                name
            }
        }
    }

    pub fn children(&self) -> &[Task] {
        match self {
            Task::Leaf { .. } => &[],
            Task::Sequential { children, .. } | Task::Concurrent { children, .. } => children,
        }
    }

    /// Indented outline of the tree, one task per line.
    pub fn outline(&self) -> String {
        fn walk(task: &Task, depth: usize, out: &mut String) {
            out.push_str(&"  ".repeat(depth));
            out.push_str(task.name());
            out.push('\n');
            for child in task.children() {
                walk(child, depth + 1, out);
            }
        }
        let mut out = String::new();
        walk(self, 0, &mut out);
        out
    }

    pub fn execute(self) -> BoxFuture<'static, Result<()>> {
        async move {
            match self {
                Task::Leaf { name, action } => {
                    info!(task = %name, "running");
                    let res = action().await;
                    match &res {
                        Ok(()) => info!(task = %name, "done"),
                        Err(e) => error!(task = %name, error = %e, "failed"),
                    }
                    res
                }
                Task::Sequential { name, children } => {
                    info!(task = %name, children = children.len(), "running in sequence");
                    for child in children {
                        let child_name = child.name().to_string();
                        child.execute().await.map_err(|e| TerraceError::TaskFailed {
                            task: child_name,
                            source: Box::new(e),
                        })?;
                    }
                    Ok(())
                }
                Task::Concurrent { name, children } => {
                    info!(task = %name, children = children.len(), "running concurrently");
                    let (names, handles): (Vec<_>, Vec<_>) = children
                        .into_iter()
                        .map(|child| (child.name().to_string(), tokio::spawn(child.execute())))
                        .unzip();
                    let failures: Vec<TaskFailure> = join_all(handles)
                        .await
                        .into_iter()
                        .zip(names)
                        .filter_map(|(joined, task)| match joined {
                            Ok(Ok(())) => None,
                            Ok(Err(error)) => Some(TaskFailure { task, error }),
                            Err(e) => Some(TaskFailure {
                                task,
                                error: TerraceError::external("task", e),
                            }),
                        })
                        .collect();
                    if failures.is_empty() {
                        Ok(())
                    } else {
                        Err(TerraceError::Aggregate(failures))
                    }
                }
            }
        }
        .boxed()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Task::Leaf { .. } => "Leaf",
            Task::Sequential { .. } => "Sequential",
            Task::Concurrent { .. } => "Concurrent",
        };
        f.debug_struct(kind)
            .field("name", &self.name())
            .field("children", &self.children())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn step(log: &Log, name: &str, fail: Option<&str>) -> Task {
        let log = log.clone();
        let label = name.to_string();
        let fail = fail.map(str::to_string);
        Task::leaf(name, move || async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            log.lock().unwrap().push(label);
            match fail {
                Some(msg) => Err(TerraceError::Validation(msg)),
                None => Ok(()),
            }
        })
    }

    #[tokio::test]
    async fn sequential_stops_at_first_failure() {
        let log = Log::default();
        let task = Task::sequential(
            "seq",
            vec![
                step(&log, "A", None),
                step(&log, "B", Some("x")),
                step(&log, "C", None),
            ],
        );
        let err = task.execute().await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
        let msg = err.to_string();
        assert!(msg.contains('x'), "{msg}");
        assert!(matches!(err, TerraceError::TaskFailed { ref task, .. } if task == "B"));
    }

    #[tokio::test]
    async fn concurrent_runs_everything_and_aggregates() {
        let log = Log::default();
        let task = Task::concurrent(
            "con",
            vec![
                step(&log, "A", Some("x")),
                step(&log, "B", None),
                step(&log, "C", Some("y")),
            ],
        );
        let err = task.execute().await.unwrap_err();
        let mut ran = log.lock().unwrap().clone();
        ran.sort();
        assert_eq!(ran, vec!["A", "B", "C"]);
        match &err {
            TerraceError::Aggregate(failures) => {
                let names: Vec<_> = failures.iter().map(|f| f.task.as_str()).collect();
                assert_eq!(names, vec!["A", "C"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("x") && msg.contains("y"), "{msg}");
    }

    #[tokio::test]
    async fn nested_groups_succeed() {
        let log = Log::default();
        let task = Task::sequential(
            "root",
            vec![
                step(&log, "first", None),
                Task::concurrent("pair", vec![step(&log, "l", None), step(&log, "r", None)]),
                step(&log, "last", None),
            ],
        );
        task.execute().await.unwrap();
        let ran = log.lock().unwrap().clone();
        assert_eq!(ran.first().map(String::as_str), Some("first"));
        assert_eq!(ran.last().map(String::as_str), Some("last"));
        assert_eq!(ran.len(), 4);
    }

    #[test]
    fn outline_indents_children() {
        let log = Log::default();
        let task = Task::sequential("root", vec![Task::concurrent("group", vec![step(&log, "a", None)])]);
        assert_eq!(task.outline(), "root\n  group\n    a\n");
    }
}
