//! SSH transport for remote command execution
//!
//! This module runs actions on remote hosts over SSH with the following features:
//! - Key, password or agent authentication
//! - Host key verification against `~/.ssh/known_hosts`
//! - One multiplexed exec channel per command on a long-lived session
//! - SCP file transfer for scripts, tasks, uploads and downloads
//!
//! # Connection Management
//!
//! A [`SshConnection`] owns one authenticated session. The connection pool
//! keeps it for the lifetime of an invocation, so sequential plan steps reuse
//! it. Any I/O error on an established session marks it dead and the pool
//! reopens it on next use. Blocking socket calls are bounded by `io-timeout`
//! seconds (0 disables the bound), so a silent peer cannot pin a worker
//! thread forever.
//!
//! # Example
//!
//! ```no_run
//! use tether::transports::ssh::SshTransport;
//! use tether::transports::{RunOptions, Transport};
//! use tether::target::{Target, TransportConfig, TransportKind};
//! use tether::models::Action;
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = SshTransport::new(TransportConfig::new(), Path::new("."));
//! let target = Target::parse("ssh://deploy@example.com", TransportKind::Ssh)?;
//! let mut conn = transport.connect(&target).await?;
//! let payload = transport
//!     .run(conn.as_mut(), &Action::command("uptime"), &RunOptions::default())
//!     .await?;
//! println!("{:?}", payload);
//! # Ok(())
//! # }
//! ```

use crate::error::TransportError;
use crate::models::{Action, ActionKind, CommandOutput, MAX_COMMAND_LEN, MAX_OUTPUT_SIZE};
use crate::result::Payload;
use crate::target::{Target, TransportConfig, TransportKind};
use crate::transports::exec::{run_action, CommandLine, RemoteShell, ShellFamily};
use crate::transports::{
    effective_config, opt, truncate_output_bytes, Connection, OptionSpec, OptionType, RunOptions,
    Transport,
};
use async_trait::async_trait;
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

type TResult<T> = std::result::Result<T, TransportError>;

/// Seconds between keepalives sent by [`SshConnection::ping`]
const KEEPALIVE_INTERVAL: u32 = 30;

pub const OPTIONS: &[OptionSpec] = &[
    opt("host", OptionType::String, true),
    opt("port", OptionType::Integer, true),
    opt("user", OptionType::String, true),
    opt("password", OptionType::String, true),
    opt("private-key", OptionType::String, true),
    opt("connect-timeout", OptionType::Integer, true),
    opt("io-timeout", OptionType::Integer, true),
    opt("host-key-check", OptionType::Boolean, true),
    opt("tmpdir", OptionType::String, false),
    opt("apply-command", OptionType::String, false),
];

pub fn defaults() -> TransportConfig {
    let mut config = TransportConfig::new();
    config.insert("port", 22);
    config.insert("connect-timeout", 10);
    config.insert("io-timeout", 300);
    config.insert("host-key-check", true);
    config.insert("tmpdir", "/tmp");
    config.insert("apply-command", "tether-apply");
    config
}

/// SSH transport
#[derive(Debug, Clone)]
pub struct SshTransport {
    defaults: TransportConfig,
    project_root: PathBuf,
}

impl SshTransport {
    pub fn new(options: TransportConfig, project_root: &Path) -> Self {
        let mut defaults = defaults();
        defaults.merge(&options);
        Self {
            defaults,
            project_root: project_root.to_path_buf(),
        }
    }

    /// Private keys given relative to the project resolve against it
    fn resolve_key(&self, key: &str) -> PathBuf {
        let path = PathBuf::from(shellexpand_home(key));
        if path.is_absolute() {
            path
        } else {
            self.project_root.join(path)
        }
    }
}

fn shellexpand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home, rest),
        _ => path.to_string(),
    }
}

/// Resolved connection parameters for one target
#[derive(Debug, Clone)]
struct SshParams {
    target: String,
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    private_key: Option<PathBuf>,
    connect_timeout: u64,
    io_timeout: u64,
    host_key_check: bool,
}

impl SshParams {
    fn validate(&self) -> TResult<()> {
        if self.host.is_empty() {
            return Err(TransportError::Connection {
                target: self.target.clone(),
                message: "SSH host cannot be empty".to_string(),
            });
        }
        if self.user.is_empty() {
            return Err(TransportError::Connection {
                target: self.target.clone(),
                message: "SSH user cannot be empty".to_string(),
            });
        }
        if let Some(key) = &self.private_key {
            if !key.exists() {
                return Err(TransportError::Authentication {
                    target: self.target.clone(),
                    message: format!("SSH key file not found: {}", key.display()),
                });
            }
        }
        Ok(())
    }
}

/// Create a new SSH session
///
/// This establishes a TCP connection, performs the SSH handshake, checks the
/// host key and authenticates.
fn create_session(params: &SshParams) -> TResult<Session> {
    let address = format!("{}:{}", params.host, params.port);
    let connection_error = |message: String| TransportError::Connection {
        target: params.target.clone(),
        message,
    };

    debug!("Creating SSH session to {}", address);

    let socket = address
        .to_socket_addrs()
        .map_err(|e| connection_error(format!("Could not resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| connection_error(format!("No address found for {}", address)))?;

    let tcp = TcpStream::connect_timeout(&socket, Duration::from_secs(params.connect_timeout))
        .map_err(|e| connection_error(format!("Failed to connect: {}", e)))?;

    let io_timeout = (params.io_timeout > 0).then(|| Duration::from_secs(params.io_timeout));
    tcp.set_read_timeout(io_timeout)
        .map_err(|e| connection_error(format!("Failed to set read timeout: {}", e)))?;
    tcp.set_write_timeout(io_timeout)
        .map_err(|e| connection_error(format!("Failed to set write timeout: {}", e)))?;

    let mut session =
        Session::new().map_err(|e| connection_error(format!("Failed to create SSH session: {}", e)))?;
    // Milliseconds; 0 blocks without limit
    session.set_timeout(u32::try_from(params.io_timeout.saturating_mul(1000)).unwrap_or(u32::MAX));
    session.set_keepalive(false, KEEPALIVE_INTERVAL);
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| connection_error(format!("SSH handshake failed: {}", e)))?;

    if params.host_key_check {
        verify_host_key(&session, params)?;
    }

    let auth_error = |message: String| TransportError::Authentication {
        target: params.target.clone(),
        message,
    };
    if let Some(password) = &params.password {
        session
            .userauth_password(&params.user, password)
            .map_err(|e| auth_error(format!("Password authentication failed: {}", e)))?;
    } else if let Some(key) = &params.private_key {
        debug!("Authenticating with key: {}", key.display());
        session
            .userauth_pubkey_file(&params.user, None, key, None)
            .map_err(|e| auth_error(format!("Key authentication failed: {}", e)))?;
    } else {
        session
            .userauth_agent(&params.user)
            .map_err(|e| auth_error(format!("Agent authentication failed: {}", e)))?;
    }

    if !session.authenticated() {
        return Err(auth_error("Authentication failed".to_string()));
    }

    info!("SSH session established to {}", address);
    Ok(session)
}

fn verify_host_key(session: &Session, params: &SshParams) -> TResult<()> {
    let reject = |message: String| TransportError::Connection {
        target: params.target.clone(),
        message,
    };
    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| reject(format!("Cannot load known hosts: {}", e)))?;
    let file = PathBuf::from(shellexpand_home("~/.ssh/known_hosts"));
    known_hosts
        .read_file(&file, KnownHostFileKind::OpenSSH)
        .map_err(|e| reject(format!("Cannot read {}: {}", file.display(), e)))?;
    let (key, _) = session
        .host_key()
        .ok_or_else(|| reject("Server did not present a host key".to_string()))?;

    match known_hosts.check_port(&params.host, params.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound => Err(reject(format!(
            "Host key for {} not found in known_hosts; add it with ssh-keyscan or set host-key-check: false",
            params.host
        ))),
        CheckResult::Mismatch => Err(reject(format!(
            "Host key for {} does not match known_hosts",
            params.host
        ))),
        CheckResult::Failure => Err(reject("Host key check failed".to_string())),
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn supports(&self, _action: ActionKind) -> bool {
        true
    }

    async fn connect(&self, target: &Target) -> TResult<Box<dyn Connection>> {
        let config = effective_config(&self.defaults, target);
        let params = SshParams {
            target: target.name.clone(),
            host: config.get_str("host").unwrap_or_default().to_string(),
            port: config
                .get_u64("port")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(22),
            user: config
                .get_str("user")
                .map(str::to_string)
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "root".to_string()),
            password: config.get_str("password").map(str::to_string),
            private_key: config.get_str("private-key").map(|k| self.resolve_key(k)),
            connect_timeout: config.get_u64("connect-timeout").unwrap_or(10),
            io_timeout: config.get_u64("io-timeout").unwrap_or(300),
            host_key_check: config.get_bool("host-key-check").unwrap_or(true),
        };
        params.validate()?;

        // ssh2 is synchronous, so the handshake runs on the blocking pool
        let blocking_params = params.clone();
        let session = tokio::task::spawn_blocking(move || create_session(&blocking_params))
            .await
            .map_err(|e| TransportError::Connection {
                target: target.name.clone(),
                message: format!("Task join error: {}", e),
            })??;

        Ok(Box::new(SshConnection {
            target: target.clone(),
            config,
            session: Arc::new(Mutex::new(session)),
            alive: true,
        }))
    }
}

/// One authenticated SSH session
pub struct SshConnection {
    target: Target,
    config: TransportConfig,
    session: Arc<Mutex<Session>>,
    alive: bool,
}

impl SshConnection {
    /// Run a blocking closure against the session; I/O failures kill it
    async fn blocking<T, F>(&mut self, what: &'static str, f: F) -> TResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> std::result::Result<T, String> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let joined = tokio::task::spawn_blocking(move || {
            let session = session
                .lock()
                .map_err(|_| "SSH session lock poisoned".to_string())?;
            f(&session)
        })
        .await;

        let lost = |message: String| TransportError::ConnectionLost {
            target: self.target.name.clone(),
            message: format!("{}: {}", what, message),
        };
        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => {
                self.alive = false;
                Err(lost(message))
            }
            Err(e) => {
                self.alive = false;
                Err(lost(format!("Task join error: {}", e)))
            }
        }
    }
}

fn exec_blocking(session: &Session, command: &str, stdin: Option<&str>) -> std::result::Result<CommandOutput, String> {
    let start = std::time::Instant::now();
    let mut channel = session
        .channel_session()
        .map_err(|e| format!("Failed to open channel: {}", e))?;
    channel
        .exec(command)
        .map_err(|e| format!("Failed to execute command: {}", e))?;

    if let Some(input) = stdin {
        channel
            .write_all(input.as_bytes())
            .map_err(|e| format!("Failed to write stdin: {}", e))?;
    }
    channel
        .send_eof()
        .map_err(|e| format!("Failed to close stdin: {}", e))?;

    let mut stdout = Vec::new();
    channel
        .read_to_end(&mut stdout)
        .map_err(|e| format!("Failed to read stdout: {}", e))?;
    let mut stderr = Vec::new();
    channel
        .stderr()
        .read_to_end(&mut stderr)
        .map_err(|e| format!("Failed to read stderr: {}", e))?;

    channel
        .wait_close()
        .map_err(|e| format!("Failed to close channel: {}", e))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| format!("Failed to get exit status: {}", e))?;

    let (stdout, stdout_truncated) = truncate_output_bytes(&stdout);
    let (stderr, stderr_truncated) = truncate_output_bytes(&stderr);
    let truncated = stdout_truncated || stderr_truncated;
    if truncated {
        warn!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        truncated,
        duration: start.elapsed(),
    })
}

#[async_trait]
impl RemoteShell for SshConnection {
    fn family(&self) -> ShellFamily {
        ShellFamily::Posix
    }

    fn tmpdir(&self) -> String {
        self.config.get_str("tmpdir").unwrap_or("/tmp").to_string()
    }

    fn apply_command(&self) -> String {
        self.config
            .get_str("apply-command")
            .unwrap_or("tether-apply")
            .to_string()
    }

    async fn exec(&mut self, line: &CommandLine) -> TResult<CommandOutput> {
        let command = ShellFamily::Posix.render(line);
        if command.len() > MAX_COMMAND_LEN {
            return Err(TransportError::Execution(format!(
                "SSH command exceeds maximum length of {} bytes",
                MAX_COMMAND_LEN
            )));
        }
        debug!("Executing command on {}: {}", self.target, command);
        let stdin = line.stdin.clone();
        let output = self
            .blocking("exec", move |session| {
                exec_blocking(session, &command, stdin.as_deref())
            })
            .await?;
        debug!(
            "SSH command exit code on {}: {}",
            self.target, output.exit_code
        );
        Ok(output)
    }

    async fn put_file(&mut self, local: &Path, remote: &str) -> TResult<()> {
        let data = tokio::fs::read(local).await?;
        let remote = remote.to_string();
        self.blocking("upload", move |session| {
            let mut channel = session
                .scp_send(Path::new(&remote), 0o644, data.len() as u64, None)
                .map_err(|e| format!("Failed to start upload of {}: {}", remote, e))?;
            channel
                .write_all(&data)
                .map_err(|e| format!("Failed to write {}: {}", remote, e))?;
            channel.send_eof().map_err(|e| e.to_string())?;
            channel.wait_eof().map_err(|e| e.to_string())?;
            channel.close().map_err(|e| e.to_string())?;
            channel.wait_close().map_err(|e| e.to_string())
        })
        .await
    }

    async fn get_file(&mut self, remote: &str, local: &Path) -> TResult<()> {
        let remote = remote.to_string();
        let data = self
            .blocking("download", move |session| {
                let (mut channel, _stat) = session
                    .scp_recv(Path::new(&remote))
                    .map_err(|e| format!("Failed to start download of {}: {}", remote, e))?;
                let mut data = Vec::new();
                channel
                    .read_to_end(&mut data)
                    .map_err(|e| format!("Failed to read {}: {}", remote, e))?;
                channel.send_eof().map_err(|e| e.to_string())?;
                channel.wait_eof().map_err(|e| e.to_string())?;
                channel.close().map_err(|e| e.to_string())?;
                channel.wait_close().map_err(|e| e.to_string())?;
                Ok(data)
            })
            .await?;
        tokio::fs::write(local, data).await?;
        Ok(())
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn run(&mut self, action: &Action, options: &RunOptions) -> TResult<Payload> {
        let target = self.target.clone();
        run_action(self, &target, action, options.noop).await
    }

    /// Send a keepalive before the session is reused
    ///
    /// A session still locked by an abandoned blocking call is treated as
    /// dead rather than waited on.
    async fn ping(&mut self) -> TResult<()> {
        let session = Arc::clone(&self.session);
        let sent = tokio::task::spawn_blocking(move || {
            let session = session
                .try_lock()
                .map_err(|_| "session is still busy with an abandoned call".to_string())?;
            session
                .keepalive_send()
                .map(|_| ())
                .map_err(|e| format!("keepalive failed: {}", e))
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))
        .and_then(|sent| sent);

        sent.map_err(|message| {
            self.alive = false;
            TransportError::ConnectionLost {
                target: self.target.name.clone(),
                message,
            }
        })
    }

    async fn close(self: Box<Self>) {
        let session = Arc::clone(&self.session);
        let target = self.target.name.clone();
        let name = target.clone();
        let closed = tokio::task::spawn_blocking(move || match session.try_lock() {
            Ok(session) => {
                let _ = session.disconnect(None, "tether closing session", None);
            }
            // The abandoned call drops the last reference once its socket
            // read returns or times out
            Err(_) => debug!("SSH session to {} is busy; dropping without disconnect", name),
        })
        .await;
        if closed.is_err() {
            warn!("Failed to close SSH session to {}", target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SshParams {
        SshParams {
            target: "web1".to_string(),
            host: "web1".to_string(),
            port: 22,
            user: "deploy".to_string(),
            password: None,
            private_key: None,
            connect_timeout: 1,
            io_timeout: 1,
            host_key_check: false,
        }
    }

    #[test]
    fn test_validate_params_empty_host() {
        let mut p = params();
        p.host = String::new();
        assert!(matches!(p.validate(), Err(TransportError::Connection { .. })));
    }

    #[test]
    fn test_validate_params_missing_key_is_auth_error() {
        let mut p = params();
        p.private_key = Some(PathBuf::from("/nonexistent/id_rsa"));
        assert!(matches!(
            p.validate(),
            Err(TransportError::Authentication { .. })
        ));
    }

    #[test]
    fn test_validate_params_valid() {
        assert!(params().validate().is_ok());
    }

    #[test]
    fn test_relative_key_resolves_against_project() {
        let transport = SshTransport::new(TransportConfig::new(), Path::new("/srv/project"));
        assert_eq!(
            transport.resolve_key("keys/id_ed25519"),
            PathBuf::from("/srv/project/keys/id_ed25519")
        );
        assert_eq!(
            transport.resolve_key("/etc/keys/id"),
            PathBuf::from("/etc/keys/id")
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let transport = SshTransport::new(TransportConfig::new(), Path::new("."));
        let mut target = Target::parse("ssh://deploy@127.0.0.1:1", TransportKind::Ssh).unwrap();
        target.config.insert("connect-timeout", 1);
        let result = transport.connect(&target).await;
        assert!(matches!(result, Err(TransportError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_silent_server_is_bounded_by_io_timeout() {
        // Accepts into the backlog and never speaks
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = SshTransport::new(TransportConfig::new(), Path::new("."));
        let mut target =
            Target::parse(&format!("ssh://deploy@127.0.0.1:{}", port), TransportKind::Ssh).unwrap();
        target.config.insert("io-timeout", 1);
        target.config.insert("host-key-check", false);

        let started = std::time::Instant::now();
        let result = transport.connect(&target).await;

        assert!(matches!(result, Err(TransportError::Connection { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
        drop(listener);
    }
}
