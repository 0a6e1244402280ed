// Remote module - batch cluster access over SSH

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::output::errors::SylvaError;

pub mod queue;
pub mod session;
pub mod ssh;

pub use queue::{parse_job_id, parse_queue, parse_queue_strict, QueueEntry};
pub use session::{RemoteLayout, SessionManager};
pub use ssh::{ScpTransfer, SshConnector};

/// An established interactive connection to the cluster login node
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Execute a command and collect its output
    async fn exec(&self, command: &str) -> Result<CommandResult, SylvaError>;

    /// False once the underlying connection has been lost
    fn is_alive(&self) -> bool;

    /// Get the host name for this connection
    fn host_name(&self) -> &str;
}

/// Opens interactive connections. Called lazily by the session manager.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteShell>, SylvaError>;
}

/// Single-file transfers on a channel independent of the interactive session
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copy a local file into a remote directory, keeping its file name
    async fn upload(&self, local_path: &Path, remote_dir: &str) -> Result<(), SylvaError>;

    /// Copy a remote file into a local directory, keeping its file name
    async fn download(&self, remote_path: &str, local_dir: &Path) -> Result<(), SylvaError>;
}

/// Result of executing a command
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
