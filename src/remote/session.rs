// Remote session manager: one shared interactive connection to the cluster
//
// Callers that arrive while the connection is down are queued (FIFO, bounded)
// and released in order once the connection attempt completes. Each waiter
// gives up after `wait_timeout` with `ConnectionTimeout`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use super::queue::{self, QueueEntry};
use super::{CommandResult, FileTransfer, RemoteConnector, RemoteShell};
use crate::config::RemoteConfig;
use crate::output::errors::SylvaError;

type ShellResult = Result<Arc<dyn RemoteShell>, SylvaError>;

/// Remote staging layout and scheduler commands
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    pub scratch_root: String,
    pub input_subpath: String,
    pub output_subpath: String,
    pub submit_command: String,
    pub queue_command: String,
}

impl RemoteLayout {
    pub fn from_config(config: &RemoteConfig) -> Self {
        RemoteLayout {
            scratch_root: config.scratch_root.clone(),
            input_subpath: config.input_subpath.clone(),
            output_subpath: config.output_subpath.clone(),
            submit_command: config.submit_command.clone(),
            queue_command: config.queue_command.clone(),
        }
    }

    pub fn input_dir(&self) -> String {
        format!("{}{}", self.scratch_root, self.input_subpath)
    }

    pub fn output_dir(&self) -> String {
        format!("{}{}", self.scratch_root, self.output_subpath)
    }

    /// Prefix every output file of a scenario starts with
    pub fn output_prefix(&self, scenario_id: &str) -> String {
        format!("{}/{}_", self.output_dir(), scenario_id)
    }
}

struct SessionState {
    shell: Option<Arc<dyn RemoteShell>>,
    connecting: bool,
    waiters: VecDeque<oneshot::Sender<ShellResult>>,
}

/// Shared between the manager and its background connect task
struct SessionInner {
    connector: Arc<dyn RemoteConnector>,
    state: Mutex<SessionState>,
    ready: watch::Sender<bool>,
}

impl SessionInner {
    fn mark_lost(&self, state: &mut SessionState) {
        if state.shell.take().is_some() {
            tracing::warn!("remote session lost, will reconnect on next request");
        }
        self.ready.send_replace(false);
    }

    async fn connect_and_release(self: Arc<Self>) {
        let result = self.connector.connect().await;

        let waiters = {
            let mut state = self.state.lock();
            state.connecting = false;
            match &result {
                Ok(shell) => {
                    state.shell = Some(shell.clone());
                    self.ready.send_replace(true);
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        waiters = state.waiters.len(),
                        "remote connection failed"
                    );
                }
            }
            std::mem::take(&mut state.waiters)
        };

        // Release in arrival order; waiters that timed out have dropped their receiver
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Owner of the single interactive connection plus the transfer channel
pub struct SessionManager {
    inner: Arc<SessionInner>,
    transfer: Arc<dyn FileTransfer>,
    layout: RemoteLayout,
    max_waiters: usize,
    wait_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        transfer: Arc<dyn FileTransfer>,
        layout: RemoteLayout,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        SessionManager {
            inner: Arc::new(SessionInner {
                connector,
                state: Mutex::new(SessionState {
                    shell: None,
                    connecting: false,
                    waiters: VecDeque::new(),
                }),
                ready,
            }),
            transfer,
            layout,
            max_waiters: 64,
            wait_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_max_waiters(mut self, max: usize) -> Self {
        self.max_waiters = max.max(1);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    /// Observe connection readiness
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Get the live shell, connecting lazily and queueing behind a pending attempt
    async fn shell(&self) -> ShellResult {
        let receiver = {
            let mut state = self.inner.state.lock();

            if let Some(shell) = &state.shell {
                if shell.is_alive() {
                    return Ok(shell.clone());
                }
                self.inner.mark_lost(&mut state);
            }

            state.waiters.retain(|w| !w.is_closed());
            if state.waiters.len() >= self.max_waiters {
                return Err(SylvaError::QueueFull {
                    capacity: self.max_waiters,
                });
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);

            if !state.connecting {
                state.connecting = true;
                tracing::debug!("opening remote session");
                tokio::spawn(self.inner.clone().connect_and_release());
            }

            rx
        };

        match tokio::time::timeout(self.wait_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SylvaError::Transport {
                host: String::new(),
                message: "connection attempt was abandoned".to_string(),
                suggestion: None,
            }),
            Err(_) => Err(SylvaError::ConnectionTimeout {
                waited_secs: self.wait_timeout.as_secs(),
            }),
        }
    }

    /// Run a command and hand its result to `parse`.
    ///
    /// Output on stderr is logged, not treated as failure; `parse` decides.
    pub async fn execute<T, F>(&self, command: &str, parse: F) -> Result<T, SylvaError>
    where
        F: FnOnce(&CommandResult) -> Result<T, SylvaError>,
    {
        let shell = self.shell().await?;

        let result = match shell.exec(command).await {
            Ok(result) => result,
            Err(e) => {
                if !shell.is_alive() {
                    let mut state = self.inner.state.lock();
                    self.inner.mark_lost(&mut state);
                }
                return Err(e);
            }
        };

        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            tracing::warn!(
                command,
                host = shell.host_name(),
                exit_code = result.exit_code,
                stderr,
                "remote command wrote to stderr"
            );
        }

        parse(&result)
    }

    /// Stage a local file in the remote input directory
    pub async fn upload(&self, local_path: &Path) -> Result<(), SylvaError> {
        let remote_dir = self.layout.input_dir();
        tracing::info!(local = %local_path.display(), remote_dir = %remote_dir, "uploading");
        self.transfer.upload(local_path, &remote_dir).await
    }

    /// Fetch a file from the remote output directory into `local_dir`
    pub async fn download(&self, remote_name: &str, local_dir: &Path) -> Result<(), SylvaError> {
        let remote_path = format!("{}/{}", self.layout.output_dir(), remote_name);
        tracing::info!(remote = %remote_path, local_dir = %local_dir.display(), "downloading");
        self.transfer.download(&remote_path, local_dir).await
    }

    /// Submit a staged job configuration, returning the scheduler's job id
    pub async fn submit(&self, config_file: &str, scenario_id: &str) -> Result<String, SylvaError> {
        let command = format!(
            "{} {}/{} {}",
            self.layout.submit_command,
            self.layout.input_dir(),
            config_file,
            scenario_id
        );

        let job_id = self
            .execute(&command, |result| Ok(queue::parse_job_id(&result.stdout)?))
            .await?;

        tracing::info!(scenario_id, job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    /// List the live batch queue
    pub async fn list_queue(&self) -> Result<Vec<QueueEntry>, SylvaError> {
        let command = self.layout.queue_command.clone();
        self.execute(&command, |result| {
            if !result.success() {
                return Err(SylvaError::Transport {
                    host: String::new(),
                    message: format!(
                        "queue command exited with {}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    ),
                    suggestion: None,
                });
            }
            Ok(queue::parse_queue_strict(&result.stdout)?)
        })
        .await
    }

    /// Drop the connection; the next request reconnects
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shell = None;
        self.inner.ready.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fakes::{FakeConnector, FakeShell, FakeTransfer};
    use std::sync::atomic::Ordering;

    const QUEUE: &str = "JOBID PARTITION NAME USER ST TIME NODES NODELIST\n            42   batch   sim1   alice   R   0:05   1      node01\n";

    fn manager(connector: Arc<FakeConnector>) -> SessionManager {
        SessionManager::new(connector, Arc::new(FakeTransfer::default()), RemoteLayout {
            scratch_root: "/scratch".to_string(),
            input_subpath: "/in".to_string(),
            output_subpath: "/out".to_string(),
            submit_command: "sbatch launch.sh".to_string(),
            queue_command: "squeue".to_string(),
        })
    }

    #[tokio::test]
    async fn test_connects_lazily_once() {
        let shell = FakeShell::new();
        shell.respond("squeue", QUEUE);
        let connector = FakeConnector::new(shell.clone());
        let manager = manager(connector.clone());

        assert!(!manager.is_ready());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);

        let entries = manager.list_queue().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(manager.is_ready());

        manager.list_queue().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(shell.ran("squeue"), 2);
    }

    #[tokio::test]
    async fn test_queued_callers_share_one_connection() {
        let shell = FakeShell::new();
        shell.respond("squeue", QUEUE);
        let connector = FakeConnector::with_delay(shell.clone(), Duration::from_millis(50));
        let manager = Arc::new(manager(connector.clone()));

        let mut readiness = manager.readiness();
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.list_queue().await })
            })
            .collect();

        readiness.wait_for(|ready| *ready).await.unwrap();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let shell = FakeShell::new();
        let connector = FakeConnector::with_delay(shell, Duration::from_secs(5));
        let manager = manager(connector).with_wait_timeout(Duration::from_millis(20));

        let err = manager.list_queue().await.unwrap_err();
        assert!(matches!(err, SylvaError::ConnectionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_queue_is_bounded() {
        let shell = FakeShell::new();
        shell.respond("squeue", QUEUE);
        let connector = FakeConnector::with_delay(shell, Duration::from_millis(200));
        let manager = Arc::new(manager(connector).with_max_waiters(1));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.list_queue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = manager.list_queue().await.unwrap_err();
        assert!(matches!(err, SylvaError::QueueFull { capacity: 1 }));

        // The queued caller still gets its answer
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_reaches_waiters_and_retries() {
        let shell = FakeShell::new();
        shell.respond("squeue", QUEUE);
        let connector = FakeConnector::new(shell);
        connector.fail.store(true, Ordering::SeqCst);
        let manager = manager(connector.clone());

        let err = manager.list_queue().await.unwrap_err();
        assert!(matches!(err, SylvaError::Transport { .. }));
        assert!(!manager.is_ready());

        connector.fail.store(false, Ordering::SeqCst);
        assert!(manager.list_queue().await.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        let shell = FakeShell::new();
        shell.respond("squeue", QUEUE);
        let connector = FakeConnector::new(shell.clone());
        let manager = manager(connector.clone());

        manager.list_queue().await.unwrap();
        shell.alive.store(false, Ordering::SeqCst);

        manager.list_queue().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_submit_parses_job_id() {
        let shell = FakeShell::new();
        shell.respond("sbatch", "Submitted batch job 42\n");
        let manager = manager(FakeConnector::new(shell.clone()));

        let job_id = manager.submit("scenario_1.json", "abc").await.unwrap();
        assert_eq!(job_id, "42");
        assert_eq!(
            shell.commands.lock().last().unwrap(),
            "sbatch launch.sh /scratch/in/scenario_1.json abc"
        );
    }

    #[tokio::test]
    async fn test_submit_without_job_line_is_parse_error() {
        let shell = FakeShell::new();
        shell.respond_with(
            "sbatch",
            CommandResult {
                stdout: String::new(),
                stderr: "sbatch: error: invalid partition\n".to_string(),
                exit_code: 1,
            },
        );
        let manager = manager(FakeConnector::new(shell));

        let err = manager.submit("scenario_1.json", "abc").await.unwrap_err();
        assert!(matches!(err, SylvaError::Parse(_)));
    }

    #[tokio::test]
    async fn test_failed_queue_command_is_not_an_empty_queue() {
        let shell = FakeShell::new();
        shell.respond_with(
            "squeue",
            CommandResult {
                stdout: String::new(),
                stderr: "squeue: error: slurm_load_jobs error\n".to_string(),
                exit_code: 1,
            },
        );
        let manager = manager(FakeConnector::new(shell));

        assert!(manager.list_queue().await.is_err());
    }

    #[test]
    fn test_layout_paths() {
        let layout = RemoteLayout {
            scratch_root: "/scratch".to_string(),
            input_subpath: "/in".to_string(),
            output_subpath: "/out".to_string(),
            submit_command: String::new(),
            queue_command: String::new(),
        };
        assert_eq!(layout.input_dir(), "/scratch/in");
        assert_eq!(layout.output_prefix("abc"), "/scratch/out/abc_");
    }
}
