//! Action runner shared by every shell-capable transport
//!
//! ssh, local, docker and winrm differ only in how they execute one command
//! line and move one file. They implement [`RemoteShell`] and
//! [`run_action`] builds commands, scripts, tasks, transfers and catalog
//! application on top of those primitives.

use crate::error::TransportError;
use crate::models::{Action, CommandOutput, InputMethod, TaskSpec, TransferredFile};
use crate::result::Payload;
use crate::target::Target;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type TResult<T> = std::result::Result<T, TransportError>;

/// Command syntax spoken on the far side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFamily {
    Posix,
    PowerShell,
}

impl ShellFamily {
    pub fn join(self, dir: &str, name: &str) -> String {
        match self {
            ShellFamily::Posix => format!("{}/{}", dir.trim_end_matches('/'), name),
            ShellFamily::PowerShell => format!("{}\\{}", dir.trim_end_matches('\\'), name),
        }
    }

    fn quote(self, s: &str) -> String {
        match self {
            ShellFamily::Posix => shell_words::quote(s).to_string(),
            ShellFamily::PowerShell => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Render a command line as a single string in this shell's syntax
    pub fn render(self, line: &CommandLine) -> String {
        let mut out = String::new();
        for (key, value) in &line.env {
            match self {
                ShellFamily::Posix => {
                    out.push_str(&format!("{}={} ", key, self.quote(value)));
                }
                ShellFamily::PowerShell => {
                    out.push_str(&format!("$env:{}={}; ", key, self.quote(value)));
                }
            }
        }
        match &line.program {
            Program::Shell(command) => match self {
                ShellFamily::Posix if line.env.is_empty() => out.push_str(command),
                ShellFamily::Posix => {
                    out.push_str("sh -c ");
                    out.push_str(&self.quote(command));
                }
                ShellFamily::PowerShell => out.push_str(command),
            },
            Program::Exec { program, args } => {
                if self == ShellFamily::PowerShell {
                    out.push_str("& ");
                }
                let parts: Vec<String> = std::iter::once(program)
                    .chain(args.iter())
                    .map(|p| self.quote(p))
                    .collect();
                out.push_str(&parts.join(" "));
            }
        }
        out
    }
}

/// What to run: a shell snippet or a program with argv
#[derive(Debug, Clone, PartialEq)]
pub enum Program {
    Shell(String),
    Exec { program: String, args: Vec<String> },
}

/// A fully described invocation on the remote side
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    pub program: Program,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
}

impl CommandLine {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            program: Program::Shell(command.into()),
            env: BTreeMap::new(),
            stdin: None,
        }
    }

    pub fn exec(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: Program::Exec {
                program: program.into(),
                args,
            },
            env: BTreeMap::new(),
            stdin: None,
        }
    }
}

/// Primitive operations a transport session must provide
#[async_trait]
pub trait RemoteShell: Send {
    fn family(&self) -> ShellFamily;

    /// Parent directory for per-action temp dirs
    fn tmpdir(&self) -> String;

    /// Command that applies a catalog file
    fn apply_command(&self) -> String;

    async fn exec(&mut self, line: &CommandLine) -> TResult<CommandOutput>;

    async fn put_file(&mut self, local: &Path, remote: &str) -> TResult<()>;

    async fn get_file(&mut self, remote: &str, local: &Path) -> TResult<()>;

    async fn make_dir(&mut self, remote: &str) -> TResult<()> {
        let line = match self.family() {
            ShellFamily::Posix => {
                CommandLine::exec("mkdir", vec!["-p".to_string(), remote.to_string()])
            }
            ShellFamily::PowerShell => CommandLine::shell(format!(
                "New-Item -ItemType Directory -Force -Path {} | Out-Null",
                ShellFamily::PowerShell.quote(remote)
            )),
        };
        expect_success(self.exec(&line).await?, "create directory")
    }

    async fn remove_dir(&mut self, remote: &str) -> TResult<()> {
        let line = match self.family() {
            ShellFamily::Posix => {
                CommandLine::exec("rm", vec!["-rf".to_string(), remote.to_string()])
            }
            ShellFamily::PowerShell => CommandLine::shell(format!(
                "Remove-Item -Recurse -Force -Path {}",
                ShellFamily::PowerShell.quote(remote)
            )),
        };
        expect_success(self.exec(&line).await?, "remove directory")
    }

    async fn make_executable(&mut self, remote: &str) -> TResult<()> {
        match self.family() {
            ShellFamily::Posix => {
                let line = CommandLine::exec("chmod", vec!["u+x".to_string(), remote.to_string()]);
                expect_success(self.exec(&line).await?, "make executable")
            }
            ShellFamily::PowerShell => Ok(()),
        }
    }

    /// Upload a directory tree file by file
    async fn put_dir(&mut self, local: &Path, remote: &str) -> TResult<Vec<TransferredFile>> {
        let family = self.family();
        let mut moved = Vec::new();
        let mut pending = vec![(local.to_path_buf(), remote.to_string())];
        while let Some((dir, remote_dir)) = pending.pop() {
            self.make_dir(&remote_dir).await?;
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let remote_path = family.join(&remote_dir, &name);
                if entry.file_type()?.is_dir() {
                    pending.push((entry.path(), remote_path));
                } else {
                    self.put_file(&entry.path(), &remote_path).await?;
                    moved.push(TransferredFile {
                        source: entry.path().display().to_string(),
                        destination: remote_path,
                    });
                }
            }
        }
        Ok(moved)
    }
}

fn expect_success(output: CommandOutput, what: &str) -> TResult<()> {
    if output.success() {
        Ok(())
    } else {
        Err(TransportError::Execution(format!(
            "Could not {}: {}",
            what,
            output.stderr.trim()
        )))
    }
}

/// Run one action over a shell session
pub async fn run_action<S: RemoteShell + ?Sized>(
    shell: &mut S,
    target: &Target,
    action: &Action,
    noop: bool,
) -> TResult<Payload> {
    match action {
        Action::Command { command, env } => {
            let mut line = CommandLine::shell(command.clone());
            line.env = env.clone();
            debug!("Running command on {}: {}", target, command);
            Ok(Payload::Command(shell.exec(&line).await?))
        }
        Action::Script { path, args, env } => {
            let tmp = make_tmpdir(shell).await?;
            let result = run_script(shell, &tmp, path, args, env).await;
            cleanup(shell, &tmp, target).await;
            result.map(Payload::Command)
        }
        Action::Task { task, params } => {
            let tmp = make_tmpdir(shell).await?;
            let result = run_task(shell, &tmp, task, params, noop).await;
            cleanup(shell, &tmp, target).await;
            result
        }
        Action::Upload {
            source,
            destination,
        } => {
            let files = if source.is_dir() {
                shell.put_dir(source, destination).await?
            } else {
                shell.put_file(source, destination).await?;
                vec![TransferredFile {
                    source: source.display().to_string(),
                    destination: destination.clone(),
                }]
            };
            Ok(Payload::Transfer(files))
        }
        Action::Download {
            source,
            destination,
        } => {
            let local = download_path(destination, target, source);
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            shell.get_file(source, &local).await?;
            Ok(Payload::Transfer(vec![TransferredFile {
                source: source.clone(),
                destination: local.display().to_string(),
            }]))
        }
        Action::Apply { catalog } => {
            let tmp = make_tmpdir(shell).await?;
            let result = run_apply(shell, &tmp, target, catalog, noop).await;
            cleanup(shell, &tmp, target).await;
            result
        }
    }
}

/// Where a downloaded file lands locally: `<dest>/<target>/<basename>`
pub fn download_path(destination: &Path, target: &Target, source: &str) -> PathBuf {
    let target_dir: String = target
        .name
        .chars()
        .map(|c| if c.is_alphanumeric() || "-_.@".contains(c) { c } else { '_' })
        .collect();
    let basename = source
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or("download");
    destination.join(target_dir).join(basename)
}

async fn make_tmpdir<S: RemoteShell + ?Sized>(shell: &mut S) -> TResult<String> {
    let dir = shell
        .family()
        .join(&shell.tmpdir(), &format!("tether-{}", uuid::Uuid::new_v4()));
    shell.make_dir(&dir).await?;
    Ok(dir)
}

async fn cleanup<S: RemoteShell + ?Sized>(shell: &mut S, tmp: &str, target: &Target) {
    if let Err(e) = shell.remove_dir(tmp).await {
        warn!("Failed to clean up {} on {}: {}", tmp, target, e);
    }
}

async fn upload_executable<S: RemoteShell + ?Sized>(
    shell: &mut S,
    tmp: &str,
    local: &Path,
) -> TResult<String> {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "script".to_string());
    let remote = shell.family().join(tmp, &name);
    shell.put_file(local, &remote).await?;
    shell.make_executable(&remote).await?;
    Ok(remote)
}

async fn run_script<S: RemoteShell + ?Sized>(
    shell: &mut S,
    tmp: &str,
    path: &Path,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> TResult<CommandOutput> {
    let remote = upload_executable(shell, tmp, path).await?;
    let mut line = CommandLine::exec(remote, args.to_vec());
    line.env = env.clone();
    shell.exec(&line).await
}

/// Parameters as the task sees them, with the reserved keys added
pub fn task_input(task: &TaskSpec, params: &Map<String, Value>, noop: bool) -> Map<String, Value> {
    let mut input = params.clone();
    input.insert("_task".to_string(), Value::from(task.name.clone()));
    if noop {
        input.insert("_noop".to_string(), Value::Bool(true));
    }
    input
}

/// `PT_<name>` variables for environment input
pub fn task_env(input: &Map<String, Value>) -> BTreeMap<String, String> {
    input
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (format!("PT_{}", key), rendered)
        })
        .collect()
}

/// Task stdout is its result when it parses as a JSON object
pub fn task_value(stdout: &str) -> Value {
    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(value @ Value::Object(_)) => value,
        _ => serde_json::json!({ "_output": stdout }),
    }
}

async fn run_task<S: RemoteShell + ?Sized>(
    shell: &mut S,
    tmp: &str,
    task: &TaskSpec,
    params: &Map<String, Value>,
    noop: bool,
) -> TResult<Payload> {
    let remote = upload_executable(shell, tmp, &task.executable).await?;
    let input = task_input(task, params, noop);

    let mut line = CommandLine::exec(remote, Vec::new());
    let method = match (shell.family(), task.metadata.input_method) {
        // WinRM shells cannot feed stdin to a child process
        (ShellFamily::PowerShell, _) => InputMethod::Environment,
        (_, method) => method,
    };
    if matches!(method, InputMethod::Environment | InputMethod::Both) {
        line.env = task_env(&input);
    }
    if matches!(method, InputMethod::Stdin | InputMethod::Both) {
        line.stdin = Some(Value::Object(input).to_string());
    }

    let output = shell.exec(&line).await?;
    Ok(Payload::Task {
        value: task_value(&output.stdout),
        output,
    })
}

async fn run_apply<S: RemoteShell + ?Sized>(
    shell: &mut S,
    tmp: &str,
    target: &Target,
    catalog: &[Value],
    noop: bool,
) -> TResult<Payload> {
    let document = serde_json::json!({
        "target": target.name,
        "resources": catalog,
    });
    let staged = tempfile::NamedTempFile::new()?;
    std::fs::write(staged.path(), document.to_string())?;

    let remote = shell.family().join(tmp, "catalog.json");
    shell.put_file(staged.path(), &remote).await?;

    let mut command = format!("{} {}", shell.apply_command(), shell.family().quote(&remote));
    if noop {
        command.push_str(" --noop");
    }
    let output = shell.exec(&CommandLine::shell(command)).await?;
    Ok(Payload::Task {
        value: task_value(&output.stdout),
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TransportKind;

    #[test]
    fn test_posix_render_exec_quotes_args() {
        let line = CommandLine::exec("/tmp/x/run.sh", vec!["a b".to_string(), "c".to_string()]);
        assert_eq!(ShellFamily::Posix.render(&line), "/tmp/x/run.sh 'a b' c");
    }

    #[test]
    fn test_posix_render_env_wraps_shell() {
        let mut line = CommandLine::shell("echo $GREETING");
        line.env.insert("GREETING".to_string(), "hi there".to_string());
        assert_eq!(
            ShellFamily::Posix.render(&line),
            "GREETING='hi there' sh -c 'echo $GREETING'"
        );
    }

    #[test]
    fn test_powershell_render() {
        let mut line = CommandLine::exec("C:\\tmp\\task.ps1", vec!["it's".to_string()]);
        line.env.insert("PT_name".to_string(), "x".to_string());
        assert_eq!(
            ShellFamily::PowerShell.render(&line),
            "$env:PT_name='x'; & 'C:\\tmp\\task.ps1' 'it''s'"
        );
    }

    #[test]
    fn test_task_value_parsing() {
        assert_eq!(task_value(r#"{"a": 1}"#)["a"], 1);
        assert_eq!(task_value("plain text")["_output"], "plain text");
        assert_eq!(task_value("[1, 2]")["_output"], "[1, 2]");
    }

    #[test]
    fn test_task_input_reserved_keys() {
        let task = TaskSpec {
            name: "package::status".to_string(),
            executable: PathBuf::from("/p/tasks/status.sh"),
            metadata: Default::default(),
        };
        let mut params = Map::new();
        params.insert("name".to_string(), Value::from("openssl"));
        let input = task_input(&task, &params, true);
        assert_eq!(input["_task"], "package::status");
        assert_eq!(input["_noop"], true);

        let env = task_env(&input);
        assert_eq!(env["PT_name"], "openssl");
        assert_eq!(env["PT__noop"], "true");
    }

    #[test]
    fn test_download_path_per_target() {
        let target = Target::parse("ssh://root@web1:22", TransportKind::Ssh).unwrap();
        let path = download_path(Path::new("downloads"), &target, "/var/log/syslog");
        assert_eq!(path, PathBuf::from("downloads/ssh___root@web1_22/syslog"));
    }
}
