//! Docker transport: runs actions inside a running container
//!
//! Commands go through `docker exec`, files through `docker cp`. The target's
//! host component names the container.

use crate::error::TransportError;
use crate::models::{Action, ActionKind, CommandOutput};
use crate::result::Payload;
use crate::target::{Target, TransportConfig, TransportKind};
use crate::transports::exec::{run_action, CommandLine, Program, RemoteShell, ShellFamily};
use crate::transports::{
    effective_config, opt, truncate_output_bytes, Connection, OptionSpec, OptionType, RunOptions,
    Transport,
};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

type TResult<T> = std::result::Result<T, TransportError>;

pub const OPTIONS: &[OptionSpec] = &[
    opt("host", OptionType::String, true),
    opt("service-url", OptionType::String, true),
    opt("tmpdir", OptionType::String, false),
    opt("shell-command", OptionType::String, false),
    opt("apply-command", OptionType::String, false),
];

pub fn defaults() -> TransportConfig {
    let mut config = TransportConfig::new();
    config.insert("tmpdir", "/tmp");
    config.insert("shell-command", "sh -c");
    config.insert("apply-command", "tether-apply");
    config
}

#[derive(Debug, Clone)]
pub struct DockerTransport {
    defaults: TransportConfig,
}

impl DockerTransport {
    pub fn new(options: TransportConfig, _project_root: &Path) -> Self {
        let mut defaults = defaults();
        defaults.merge(&options);
        Self { defaults }
    }
}

#[async_trait]
impl Transport for DockerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Docker
    }

    fn supports(&self, _action: ActionKind) -> bool {
        true
    }

    async fn connect(&self, target: &Target) -> TResult<Box<dyn Connection>> {
        let config = effective_config(&self.defaults, target);
        let container = config
            .get_str("host")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::Connection {
                target: target.name.clone(),
                message: "Docker target needs a container name".to_string(),
            })?
            .to_string();

        let mut connection = DockerConnection {
            target: target.clone(),
            config,
            container,
        };

        // Resolve the container once so a typo fails as a connection error
        let name = connection.container.clone();
        let output = connection
            .docker(&["inspect", "--format", "{{.State.Running}}", &name], None)
            .await
            .map_err(|e| TransportError::Connection {
                target: target.name.clone(),
                message: e.to_string(),
            })?;
        if !output.success() || output.stdout.trim() != "true" {
            return Err(TransportError::Connection {
                target: target.name.clone(),
                message: format!(
                    "Container {} is not running: {}",
                    connection.container,
                    output.stderr.trim()
                ),
            });
        }
        debug!("Attached to container {}", connection.container);
        Ok(Box::new(connection))
    }
}

pub struct DockerConnection {
    target: Target,
    config: TransportConfig,
    container: String,
}

impl DockerConnection {
    async fn docker(&mut self, args: &[&str], stdin: Option<&str>) -> TResult<CommandOutput> {
        let start = std::time::Instant::now();
        let mut cmd = Command::new("docker");
        cmd.args(args);
        if let Some(url) = self.config.get_str("service-url") {
            cmd.env("DOCKER_HOST", url);
        }
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Execution(format!("Failed to run docker: {}", e))
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        let (stdout, stdout_truncated) = truncate_output_bytes(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output_bytes(&output.stderr);
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: output.status.code().unwrap_or(-1),
            truncated: stdout_truncated || stderr_truncated,
            duration: start.elapsed(),
        })
    }

    /// Arguments for `docker exec` running `line` in the container
    fn exec_args(&self, line: &CommandLine) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if line.stdin.is_some() {
            args.push("-i".to_string());
        }
        for (key, value) in &line.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.container.clone());
        match &line.program {
            Program::Shell(command) => {
                let shell = self.config.get_str("shell-command").unwrap_or("sh -c");
                args.extend(shell.split_whitespace().map(str::to_string));
                args.push(command.clone());
            }
            Program::Exec { program, args: argv } => {
                args.push(program.clone());
                args.extend(argv.iter().cloned());
            }
        }
        args
    }
}

#[async_trait]
impl RemoteShell for DockerConnection {
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
        let args = self.exec_args(line);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!("docker {}", refs.join(" "));
        self.docker(&refs, line.stdin.as_deref()).await
    }

    async fn put_file(&mut self, local: &Path, remote: &str) -> TResult<()> {
        let local = local.display().to_string();
        let dest = format!("{}:{}", self.container, remote);
        let output = self.docker(&["cp", &local, &dest], None).await?;
        copy_result(output, "copy into container")
    }

    async fn get_file(&mut self, remote: &str, local: &Path) -> TResult<()> {
        let source = format!("{}:{}", self.container, remote);
        let local = local.display().to_string();
        let output = self.docker(&["cp", &source, &local], None).await?;
        copy_result(output, "copy from container")
    }
}

fn copy_result(output: CommandOutput, what: &str) -> TResult<()> {
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

#[async_trait]
impl Connection for DockerConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn run(&mut self, action: &Action, options: &RunOptions) -> TResult<Payload> {
        let target = self.target.clone();
        run_action(self, &target, action, options.noop).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> DockerConnection {
        let target = Target::parse("docker://app", TransportKind::Docker).unwrap();
        DockerConnection {
            config: effective_config(&defaults(), &target),
            target,
            container: "app".to_string(),
        }
    }

    #[test]
    fn test_exec_args_shell_command() {
        let conn = connection();
        let args = conn.exec_args(&CommandLine::shell("ls /etc"));
        assert_eq!(args, vec!["exec", "app", "sh", "-c", "ls /etc"]);
    }

    #[test]
    fn test_exec_args_task_with_env_and_stdin() {
        let conn = connection();
        let mut line = CommandLine::exec("/tmp/t/task.sh", vec![]);
        line.env.insert("PT_name".to_string(), "nginx".to_string());
        line.stdin = Some("{}".to_string());
        let args = conn.exec_args(&line);
        assert_eq!(
            args,
            vec!["exec", "-i", "-e", "PT_name=nginx", "app", "/tmp/t/task.sh"]
        );
    }

    #[test]
    fn test_custom_shell_command() {
        let mut conn = connection();
        conn.config.insert("shell-command", "bash -lc");
        let args = conn.exec_args(&CommandLine::shell("true"));
        assert_eq!(args[2..], ["bash", "-lc", "true"]);
    }
}
