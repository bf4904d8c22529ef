//! Local transport: runs actions as subprocesses of this process

use crate::error::TransportError;
use crate::models::{Action, ActionKind, CommandOutput, MAX_OUTPUT_SIZE};
use crate::result::Payload;
use crate::target::{Target, TransportConfig, TransportKind};
use crate::transports::exec::{run_action, CommandLine, Program, RemoteShell, ShellFamily};
use crate::transports::{
    effective_config, opt, truncate_output_bytes, Connection, OptionSpec, OptionType, RunOptions,
    Transport,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub const OPTIONS: &[OptionSpec] = &[
    opt("host", OptionType::String, false),
    opt("tmpdir", OptionType::String, false),
    opt("apply-command", OptionType::String, false),
    opt("env", OptionType::Hash, false),
];

pub fn defaults() -> TransportConfig {
    let mut config = TransportConfig::new();
    config.insert("tmpdir", std::env::temp_dir().display().to_string());
    config.insert("apply-command", "tether-apply");
    config
}

/// Local executor transport
#[derive(Debug, Clone)]
pub struct LocalTransport {
    defaults: TransportConfig,
    project_root: PathBuf,
}

impl LocalTransport {
    pub fn new(options: TransportConfig, project_root: &Path) -> Self {
        let mut defaults = defaults();
        defaults.merge(&options);
        Self {
            defaults,
            project_root: project_root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn supports(&self, _action: ActionKind) -> bool {
        true
    }

    async fn connect(
        &self,
        target: &Target,
    ) -> std::result::Result<Box<dyn Connection>, TransportError> {
        let config = effective_config(&self.defaults, target);
        debug!("Opening local session for {}", target);
        Ok(Box::new(LocalConnection {
            target: target.clone(),
            config,
            workdir: self.project_root.clone(),
        }))
    }
}

/// Session state for one local target
pub struct LocalConnection {
    target: Target,
    config: TransportConfig,
    workdir: PathBuf,
}

impl LocalConnection {
    fn command_for(&self, line: &CommandLine) -> Command {
        let mut cmd = match &line.program {
            Program::Shell(command) => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(command);
                cmd
            }
            Program::Exec { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };

        if self.workdir.is_dir() {
            cmd.current_dir(&self.workdir);
        }

        if let Some(env) = self.config.get("env").and_then(|v| v.as_object()) {
            for (key, value) in env {
                if let Some(value) = value.as_str() {
                    cmd.env(key, value);
                }
            }
        }
        for (key, value) in &line.env {
            cmd.env(key, value);
        }

        cmd.stdin(if line.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // Ensure child process is killed when the future is dropped (e.g. on timeout).
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteShell for LocalConnection {
    fn family(&self) -> ShellFamily {
        ShellFamily::Posix
    }

    fn tmpdir(&self) -> String {
        self.config
            .get_str("tmpdir")
            .map(str::to_string)
            .unwrap_or_else(|| std::env::temp_dir().display().to_string())
    }

    fn apply_command(&self) -> String {
        self.config
            .get_str("apply-command")
            .unwrap_or("tether-apply")
            .to_string()
    }

    async fn exec(&mut self, line: &CommandLine) -> std::result::Result<CommandOutput, TransportError> {
        let start = std::time::Instant::now();
        let mut child = self.command_for(line).spawn()?;

        if let Some(input) = &line.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        let (stdout, stdout_truncated) = truncate_output_bytes(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output_bytes(&output.stderr);
        let truncated = stdout_truncated || stderr_truncated;
        if truncated {
            debug!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
        }

        // A signal-terminated child has no exit code
        let exit_code = output.status.code().unwrap_or(-1);
        info!(
            "Local command on {} completed with exit code {}",
            self.target, exit_code
        );

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            truncated,
            duration: start.elapsed(),
        })
    }

    async fn put_file(&mut self, local: &Path, remote: &str) -> std::result::Result<(), TransportError> {
        if let Some(parent) = Path::new(remote).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, remote).await?;
        Ok(())
    }

    async fn get_file(&mut self, remote: &str, local: &Path) -> std::result::Result<(), TransportError> {
        tokio::fs::copy(remote, local).await?;
        Ok(())
    }

    async fn make_dir(&mut self, remote: &str) -> std::result::Result<(), TransportError> {
        tokio::fs::create_dir_all(remote).await?;
        Ok(())
    }

    async fn remove_dir(&mut self, remote: &str) -> std::result::Result<(), TransportError> {
        tokio::fs::remove_dir_all(remote).await?;
        Ok(())
    }

    async fn make_executable(&mut self, remote: &str) -> std::result::Result<(), TransportError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(remote).await?.permissions();
            perms.set_mode(perms.mode() | 0o700);
            tokio::fs::set_permissions(remote, perms).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn run(
        &mut self,
        action: &Action,
        options: &RunOptions,
    ) -> std::result::Result<Payload, TransportError> {
        let target = self.target.clone();
        run_action(self, &target, action, options.noop).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InputMethod, TaskMetadata, TaskSpec};
    use serde_json::{Map, Value};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn connect(dir: &TempDir) -> Box<dyn Connection> {
        let transport = LocalTransport::new(TransportConfig::new(), dir.path());
        let target = Target::parse("localhost", TransportKind::Ssh).unwrap();
        transport.connect(&target).await.unwrap()
    }

    #[tokio::test]
    async fn test_local_command_success() {
        let dir = TempDir::new().unwrap();
        let mut conn = connect(&dir).await;
        let payload = conn
            .run(&Action::command("echo hello"), &RunOptions::default())
            .await
            .unwrap();
        match payload {
            Payload::Command(output) => {
                assert_eq!(output.exit_code, 0);
                assert!(output.stdout.contains("hello"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_command_failure_keeps_exit_code() {
        let dir = TempDir::new().unwrap();
        let mut conn = connect(&dir).await;
        let payload = conn
            .run(&Action::command("exit 3"), &RunOptions::default())
            .await
            .unwrap();
        assert!(matches!(payload, Payload::Command(o) if o.exit_code == 3));
    }

    #[tokio::test]
    async fn test_local_command_with_env() {
        let dir = TempDir::new().unwrap();
        let mut conn = connect(&dir).await;
        let mut env = BTreeMap::new();
        env.insert("TEST_VAR".to_string(), "test_value".to_string());
        let action = Action::Command {
            command: "echo $TEST_VAR".to_string(),
            env,
        };
        let payload = conn.run(&action, &RunOptions::default()).await.unwrap();
        assert!(matches!(payload, Payload::Command(o) if o.stdout.contains("test_value")));
    }

    #[tokio::test]
    async fn test_local_task_receives_stdin_and_env() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("echo_params.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nread input\necho \"{\\\"stdin\\\": $input, \\\"env\\\": \\\"$PT_name\\\"}\"\n",
        )
        .unwrap();

        let task = TaskSpec {
            name: "echo_params".to_string(),
            executable: script,
            metadata: TaskMetadata {
                input_method: InputMethod::Both,
                ..Default::default()
            },
        };
        let mut params = Map::new();
        params.insert("name".to_string(), Value::from("openssl"));

        let mut conn = connect(&dir).await;
        let payload = conn
            .run(&Action::Task { task, params }, &RunOptions::default())
            .await
            .unwrap();
        match payload {
            Payload::Task { value, output } => {
                assert_eq!(output.exit_code, 0, "stderr: {}", output.stderr);
                assert_eq!(value["env"], "openssl");
                assert_eq!(value["stdin"]["name"], "openssl");
                assert_eq!(value["stdin"]["_task"], "echo_params");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_upload_and_download() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.txt");
        std::fs::write(&source, "payload").unwrap();
        let remote = dir.path().join("remote").join("copied.txt");

        let mut conn = connect(&dir).await;
        let upload = Action::Upload {
            source: source.clone(),
            destination: remote.display().to_string(),
        };
        conn.run(&upload, &RunOptions::default()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&remote).unwrap(), "payload");

        let download = Action::Download {
            source: remote.display().to_string(),
            destination: dir.path().join("downloads"),
        };
        let payload = conn.run(&download, &RunOptions::default()).await.unwrap();
        let Payload::Transfer(files) = payload else {
            panic!("expected transfer payload");
        };
        let landed = PathBuf::from(&files[0].destination);
        assert!(landed.ends_with("localhost/copied.txt"));
        assert_eq!(std::fs::read_to_string(landed).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_local_script_cleans_tmpdir() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        let script = dir.path().join("hello.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"args: $@\"\n").unwrap();

        let mut options = TransportConfig::new();
        options.insert("tmpdir", tmp.display().to_string());
        let transport = LocalTransport::new(options, dir.path());
        let target = Target::parse("localhost", TransportKind::Ssh).unwrap();
        let mut conn = transport.connect(&target).await.unwrap();

        let action = Action::Script {
            path: script,
            args: vec!["one".to_string(), "two".to_string()],
            env: BTreeMap::new(),
        };
        let payload = conn.run(&action, &RunOptions::default()).await.unwrap();
        assert!(matches!(payload, Payload::Command(o) if o.stdout.contains("args: one two")));
        assert_eq!(std::fs::read_dir(&tmp).unwrap().count(), 0);
    }
}
