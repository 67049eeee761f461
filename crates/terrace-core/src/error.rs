use thiserror::Error;

/// One failed child of a task tree, as reported by a concurrent group.
#[derive(Debug)]
pub struct TaskFailure {
    pub task: String,
    pub error: TerraceError,
}

fn describe_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.task, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum TerraceError {
    #[error("app instance not found: {0}")]
    InstanceNotFound(String),

    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("file not found in store: {0}")]
    FileNotFound(String),

    #[error("{0} is a reserved instance file name")]
    NameConflict(String),

    #[error("template error in {name}: {message}")]
    Template { name: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not allocate port {port}: {reason}")]
    Allocation { port: u16, reason: String },

    #[error("invalid instance id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidInstanceId(String),

    #[error("invalid store path '{0}'")]
    InvalidPath(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("malformed resource {name}: {message}")]
    ResourceMetadata { name: String, message: String },

    #[error("{collaborator}: {message}")]
    External {
        collaborator: &'static str,
        message: String,
    },

    #[error("{task}: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: Box<TerraceError>,
    },

    #[error("{} of the tasks failed: {}", .0.len(), describe_failures(.0))]
    Aggregate(Vec<TaskFailure>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TerraceError {
    pub fn external(collaborator: &'static str, message: impl ToString) -> Self {
        Self::External {
            collaborator,
            message: message.to_string(),
        }
    }

    /// True for the NotFound family, including a missing file in the store.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::InstanceNotFound(_) | Self::AppNotFound(_) | Self::FileNotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TerraceError>;
