// SSH transport: interactive shell sessions and scp transfers via ssh2

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{KeyboardInteractivePrompt, Session};

use super::{CommandResult, FileTransfer, RemoteConnector, RemoteShell};
use crate::config::RemoteConfig;
use crate::output::errors::{connection_suggestion, SylvaError};

/// Credentials and timeouts shared by the shell connector and the transfer channel
#[derive(Clone)]
pub struct SshTarget {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    private_key: Option<PathBuf>,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
}

impl SshTarget {
    pub fn from_config(config: &RemoteConfig) -> Self {
        SshTarget {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            private_key: config.private_key.clone(),
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
        }
    }

    fn transport_error(&self, message: String, suggestion: Option<String>) -> SylvaError {
        SylvaError::Transport {
            host: self.host.clone(),
            message,
            suggestion,
        }
    }

    /// Open and authenticate a new session. Blocking.
    fn open_session(&self) -> Result<Session, SylvaError> {
        let address = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                self.transport_error(
                    format!("Invalid address: {}", e),
                    Some("Check the remote host and port".to_string()),
                )
            })?
            .next()
            .ok_or_else(|| self.transport_error("Host did not resolve".to_string(), None))?;

        let tcp = TcpStream::connect_timeout(&address, self.connect_timeout).map_err(|e| {
            self.transport_error(format!("Connection failed: {}", e), connection_suggestion(&e))
        })?;

        let mut session = Session::new().map_err(|e| {
            self.transport_error(format!("Failed to create SSH session: {}", e), None)
        })?;

        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);

        session.handshake().map_err(|e| {
            self.transport_error(
                format!("SSH handshake failed: {}", e),
                Some("Check SSH service is running on the cluster".to_string()),
            )
        })?;

        self.authenticate(&session)?;

        // After login the timeout governs individual commands and transfers
        let command_ms = self.command_timeout.map(|d| d.as_millis() as u32).unwrap_or(0);
        session.set_timeout(command_ms);
        session.set_keepalive(true, 30);

        Ok(session)
    }

    fn authenticate(&self, session: &Session) -> Result<(), SylvaError> {
        let user = if self.user.is_empty() {
            std::env::var("USER").unwrap_or_else(|_| "root".to_string())
        } else {
            self.user.clone()
        };

        // Explicit key first, then the agent, then password
        if let Some(key) = &self.private_key {
            if key.exists() && session.userauth_pubkey_file(&user, None, key, None).is_ok() {
                return Ok(());
            }
        }

        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                agent.list_identities().ok();
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(&user, &identity).is_ok() {
                        return Ok(());
                    }
                }
            }
        }

        if let Some(password) = &self.password {
            if session.userauth_password(&user, password).is_ok() {
                return Ok(());
            }
            // Keyboard-interactive is what some PAM setups offer instead
            let mut prompter = PasswordPrompter(password.clone());
            if session
                .userauth_keyboard_interactive(&user, &mut prompter)
                .is_ok()
            {
                return Ok(());
            }
        }

        Err(self.transport_error(
            "Authentication failed".to_string(),
            Some("Configure remote.private_key, an SSH agent, or SYLVA_SSH_PASSWORD".to_string()),
        ))
    }
}

/// Opens the long-lived interactive session
pub struct SshConnector {
    target: SshTarget,
}

impl SshConnector {
    pub fn new(config: &RemoteConfig) -> Self {
        SshConnector {
            target: SshTarget::from_config(config),
        }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteShell>, SylvaError> {
        let target = self.target.clone();
        let host = target.host.clone();
        let session = tokio::task::spawn_blocking(move || target.open_session())
            .await
            .map_err(|e| SylvaError::Transport {
                host: host.clone(),
                message: format!("connect task failed: {}", e),
                suggestion: None,
            })??;

        tracing::info!(host = %host, "SSH session established");

        Ok(Arc::new(SshShell {
            session: Arc::new(Mutex::new(session)),
            host,
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

/// An authenticated ssh2 session used for command execution
pub struct SshShell {
    session: Arc<Mutex<Session>>,
    host: String,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<CommandResult, SylvaError> {
        let session = self.session.clone();
        let alive = self.alive.clone();
        let host = self.host.clone();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || {
            let session = session.lock();
            let result = exec_blocking(&session, &host, &command);
            if let Err(SylvaError::Transport { .. }) = &result {
                // Channel failures mean the connection is unusable
                alive.store(false, Ordering::SeqCst);
            }
            result
        })
        .await
        .map_err(|e| SylvaError::Transport {
            host: self.host.clone(),
            message: format!("exec task failed: {}", e),
            suggestion: None,
        })?
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn host_name(&self) -> &str {
        &self.host
    }
}

fn exec_blocking(session: &Session, host: &str, command: &str) -> Result<CommandResult, SylvaError> {
    let mut channel = session.channel_session().map_err(|e| SylvaError::Transport {
        host: host.to_string(),
        message: format!("Failed to open channel: {}", e),
        suggestion: Some("Connection will be re-established on the next request".to_string()),
    })?;

    channel.exec(command).map_err(|e| SylvaError::Transport {
        host: host.to_string(),
        message: format!("Failed to execute command: {}", e),
        suggestion: None,
    })?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    let read_stdout = channel.read_to_string(&mut stdout).map(|_| ());
    let read_stderr = channel.stderr().read_to_string(&mut stderr).map(|_| ());
    let closed = channel.wait_close().map_err(std::io::Error::from);
    let exit_status = channel.exit_status().map_err(std::io::Error::from);

    command_result(
        host,
        stdout,
        stderr,
        [read_stdout, read_stderr, closed],
        exit_status,
    )
}

/// Assemble a command's result; any failed read, close or exit status read
/// fails the whole command, since partial output cannot be trusted
fn command_result(
    host: &str,
    stdout: String,
    stderr: String,
    steps: [std::io::Result<()>; 3],
    exit_status: std::io::Result<i32>,
) -> Result<CommandResult, SylvaError> {
    let transport = |e: std::io::Error| SylvaError::Transport {
        host: host.to_string(),
        message: format!("Command output incomplete: {}", e),
        suggestion: Some("Raise remote.command_timeout_secs if the command is slow".to_string()),
    };

    for step in steps {
        step.map_err(transport)?;
    }
    let exit_code = exit_status.map_err(transport)?;

    Ok(CommandResult {
        stdout,
        stderr,
        exit_code,
    })
}

/// scp transfers, each on its own freshly authenticated session
pub struct ScpTransfer {
    target: SshTarget,
}

impl ScpTransfer {
    pub fn new(config: &RemoteConfig) -> Self {
        ScpTransfer {
            target: SshTarget::from_config(config),
        }
    }
}

#[async_trait]
impl FileTransfer for ScpTransfer {
    async fn upload(&self, local_path: &Path, remote_dir: &str) -> Result<(), SylvaError> {
        let target = self.target.clone();
        let local_path = local_path.to_path_buf();
        let remote_dir = remote_dir.to_string();

        tokio::task::spawn_blocking(move || upload_blocking(&target, &local_path, &remote_dir))
            .await
            .map_err(|e| SylvaError::Transport {
                host: self.target.host.clone(),
                message: format!("upload task failed: {}", e),
                suggestion: None,
            })?
    }

    async fn download(&self, remote_path: &str, local_dir: &Path) -> Result<(), SylvaError> {
        let target = self.target.clone();
        let remote_path = remote_path.to_string();
        let local_dir = local_dir.to_path_buf();

        tokio::task::spawn_blocking(move || download_blocking(&target, &remote_path, &local_dir))
            .await
            .map_err(|e| SylvaError::Transport {
                host: self.target.host.clone(),
                message: format!("download task failed: {}", e),
                suggestion: None,
            })?
    }
}

fn upload_blocking(target: &SshTarget, local_path: &Path, remote_dir: &str) -> Result<(), SylvaError> {
    let content = std::fs::read(local_path)
        .map_err(|e| SylvaError::io(format!("Failed to read local file: {}", e), local_path))?;
    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SylvaError::io("Local path has no file name", local_path))?;
    let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), file_name);

    tracing::debug!(local = %local_path.display(), remote = %remote_path, "scp upload");

    let session = target.open_session()?;
    let mut channel = session
        .scp_send(Path::new(&remote_path), 0o644, content.len() as u64, None)
        .map_err(|e| {
            target.transport_error(format!("Failed to create remote file {}: {}", remote_path, e), None)
        })?;

    channel.write_all(&content).map_err(|e| {
        target.transport_error(format!("Failed to write remote file {}: {}", remote_path, e), None)
    })?;

    channel.send_eof().ok();
    channel.wait_eof().ok();
    channel.close().ok();
    channel.wait_close().ok();

    Ok(())
}

fn download_blocking(target: &SshTarget, remote_path: &str, local_dir: &Path) -> Result<(), SylvaError> {
    let file_name = remote_path.rsplit('/').next().unwrap_or(remote_path);
    let local_path = local_dir.join(file_name);

    tracing::debug!(remote = %remote_path, local = %local_path.display(), "scp download");

    let session = target.open_session()?;
    let (mut channel, _stat) = session.scp_recv(Path::new(remote_path)).map_err(|e| {
        target.transport_error(
            format!("Failed to open remote file {}: {}", remote_path, e),
            Some("The job may have exited before writing its archive".to_string()),
        )
    })?;

    let mut content = Vec::new();
    channel.read_to_end(&mut content).map_err(|e| {
        target.transport_error(format!("Failed to read remote file {}: {}", remote_path, e), None)
    })?;

    channel.send_eof().ok();
    channel.wait_eof().ok();
    channel.close().ok();
    channel.wait_close().ok();

    std::fs::write(&local_path, content)
        .map_err(|e| SylvaError::io(format!("Failed to write local file: {}", e), &local_path))
}

/// Helper for keyboard-interactive authentication
struct PasswordPrompter(String);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}
