//! WinRM transport over WS-Management SOAP
//!
//! One remote shell is created per connection. Every command line is sent as
//! a PowerShell `-EncodedCommand`, and the base64 stdout/stderr streams are
//! polled with Receive requests until the command reports `Done`. Files move
//! through PowerShell in base64 chunks since WS-Management has no file
//! channel.

use crate::error::TransportError;
use crate::models::{Action, ActionKind, CommandOutput, MAX_OUTPUT_SIZE};
use crate::result::Payload;
use crate::target::{Target, TransportConfig, TransportKind};
use crate::transports::exec::{run_action, CommandLine, RemoteShell, ShellFamily};
use crate::transports::{
    effective_config, opt, truncate_output_bytes, Connection, OptionSpec, OptionType, RunOptions,
    Transport,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

type TResult<T> = std::result::Result<T, TransportError>;

pub const OPTIONS: &[OptionSpec] = &[
    opt("host", OptionType::String, true),
    opt("port", OptionType::Integer, true),
    opt("ssl", OptionType::Boolean, true),
    opt("user", OptionType::String, true),
    opt("password", OptionType::String, true),
    opt("connect-timeout", OptionType::Integer, true),
    opt("tmpdir", OptionType::String, false),
];

pub fn defaults() -> TransportConfig {
    let mut config = TransportConfig::new();
    config.insert("ssl", false);
    config.insert("connect-timeout", 10);
    config.insert("tmpdir", "C:\\Windows\\Temp");
    config
}

/// Raw bytes per upload chunk; keeps the encoded command under the
/// 8191-character command line limit
const UPLOAD_CHUNK: usize = 1500;

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";
const WSMAN_TIMED_OUT_CODE: &str = "2150858793";

#[derive(Debug, Clone)]
pub struct WinrmTransport {
    defaults: TransportConfig,
}

impl WinrmTransport {
    pub fn new(options: TransportConfig, _project_root: &Path) -> Self {
        let mut defaults = defaults();
        defaults.merge(&options);
        Self { defaults }
    }
}

/// WS-Management endpoint URL for a resolved option set
fn endpoint(config: &TransportConfig) -> Option<String> {
    let host = config.get_str("host").filter(|h| !h.is_empty())?;
    let ssl = config.get_bool("ssl").unwrap_or(false);
    let port = config
        .get_u64("port")
        .unwrap_or(if ssl { 5986 } else { 5985 });
    let scheme = if ssl { "https" } else { "http" };
    Some(format!("{}://{}:{}/wsman", scheme, host, port))
}

#[async_trait]
impl Transport for WinrmTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Winrm
    }

    fn supports(&self, action: ActionKind) -> bool {
        action != ActionKind::Apply
    }

    async fn connect(&self, target: &Target) -> TResult<Box<dyn Connection>> {
        let config = effective_config(&self.defaults, target);
        let connection_error = |message: String| TransportError::Connection {
            target: target.name.clone(),
            message,
        };
        let url = endpoint(&config)
            .ok_or_else(|| connection_error("WinRM target needs a host".to_string()))?;
        let user = config
            .get_str("user")
            .ok_or_else(|| TransportError::Authentication {
                target: target.name.clone(),
                message: "WinRM requires a user".to_string(),
            })?
            .to_string();
        let password = config.get_str("password").map(str::to_string);
        let connect_timeout = config.get_u64("connect-timeout").unwrap_or(10);

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .build()
            .map_err(|e| connection_error(format!("Failed to build HTTP client: {}", e)))?;

        let mut connection = WinrmConnection {
            target: target.clone(),
            config,
            client,
            url,
            user,
            password,
            shell_id: String::new(),
            alive: true,
        };

        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
                    <rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        let response = connection
            .soap(ACTION_CREATE, None, body)
            .await
            .map_err(|e| match e {
                TransportError::ConnectionLost { target, message } => {
                    TransportError::Connection { target, message }
                }
                other => other,
            })?;
        connection.shell_id = elements(&response, "ShellId")
            .first()
            .map(|(_, text)| text.trim().to_string())
            .or_else(|| selector(&response, "ShellId"))
            .ok_or_else(|| connection_error("No ShellId in Create response".to_string()))?;

        info!("WinRM shell {} opened on {}", connection.shell_id, target);
        Ok(Box::new(connection))
    }
}

pub struct WinrmConnection {
    target: Target,
    config: TransportConfig,
    client: reqwest::Client,
    url: String,
    user: String,
    password: Option<String>,
    shell_id: String,
    alive: bool,
}

impl WinrmConnection {
    fn envelope(&self, action: &str, shell_id: Option<&str>, body: &str) -> String {
        let selector = shell_id
            .map(|id| {
                format!(
                    "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                    id
                )
            })
            .unwrap_or_default();
        format!(
            concat!(
                "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\" ",
                "xmlns:a=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\" ",
                "xmlns:w=\"http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd\" ",
                "xmlns:rsp=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell\">",
                "<s:Header>",
                "<a:To>{url}</a:To>",
                "<a:ReplyTo><a:Address s:mustUnderstand=\"true\">",
                "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
                "</a:Address></a:ReplyTo>",
                "<w:ResourceURI s:mustUnderstand=\"true\">{resource}</w:ResourceURI>",
                "<a:Action s:mustUnderstand=\"true\">{action}</a:Action>",
                "<a:MessageID>uuid:{id}</a:MessageID>",
                "<w:MaxEnvelopeSize s:mustUnderstand=\"true\">153600</w:MaxEnvelopeSize>",
                "<w:OperationTimeout>PT60S</w:OperationTimeout>",
                "{selector}",
                "</s:Header>",
                "<s:Body>{body}</s:Body>",
                "</s:Envelope>"
            ),
            url = self.url,
            resource = RESOURCE_CMD,
            action = action,
            id = uuid::Uuid::new_v4(),
            selector = selector,
            body = body,
        )
    }

    /// POST one SOAP request and return the status with the response document
    async fn post(
        &mut self,
        action: &str,
        shell_id: Option<&str>,
        body: &str,
    ) -> TResult<(reqwest::StatusCode, String)> {
        let envelope = self.envelope(action, shell_id, body);
        let response = self
            .client
            .post(self.url.as_str())
            .basic_auth(&self.user, self.password.as_deref())
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| {
                self.alive = false;
                TransportError::ConnectionLost {
                    target: self.target.name.clone(),
                    message: format!("WinRM request failed: {}", e),
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::Authentication {
                target: self.target.name.clone(),
                message: "WinRM rejected the credentials".to_string(),
            });
        }
        let text = response.text().await.map_err(|e| {
            self.alive = false;
            TransportError::ConnectionLost {
                target: self.target.name.clone(),
                message: format!("Failed to read WinRM response: {}", e),
            }
        })?;
        Ok((status, text))
    }

    /// POST one SOAP request; any fault is an error
    async fn soap(&mut self, action: &str, shell_id: Option<&str>, body: &str) -> TResult<String> {
        let (status, text) = self.post(action, shell_id, body).await?;
        if !status.is_success() {
            return Err(fault(status, &text));
        }
        Ok(text)
    }

    async fn run_powershell(&mut self, script: &str) -> TResult<CommandOutput> {
        let start = std::time::Instant::now();
        let shell_id = self.shell_id.clone();
        let body = format!(
            "<rsp:CommandLine><rsp:Command>powershell.exe</rsp:Command>\
             <rsp:Arguments>-NoProfile -NonInteractive -ExecutionPolicy Bypass -EncodedCommand {}</rsp:Arguments>\
             </rsp:CommandLine>",
            encode_powershell(script)
        );
        let response = self.soap(ACTION_COMMAND, Some(&shell_id), &body).await?;
        let command_id = elements(&response, "CommandId")
            .first()
            .map(|(_, t)| t.trim().to_string())
            .ok_or_else(|| TransportError::Execution("No CommandId in response".to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit_code = loop {
            let body = format!(
                "<rsp:Receive><rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream></rsp:Receive>",
                command_id
            );
            let (status, response) = self.post(ACTION_RECEIVE, Some(&shell_id), &body).await?;
            if !status.is_success() {
                if is_timed_out(&response) {
                    debug!("No output from {} within the operation timeout, polling again", self.target);
                    continue;
                }
                return Err(fault(status, &response));
            }
            for (attrs, text) in elements(&response, "Stream") {
                let decoded = match BASE64.decode(text.trim()) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("Dropping undecodable output chunk from {}: {}", self.target, e);
                        continue;
                    }
                };
                if attrs.contains("Name=\"stderr\"") {
                    stderr.extend(decoded);
                } else {
                    stdout.extend(decoded);
                }
            }
            let done = elements(&response, "CommandState")
                .iter()
                .any(|(attrs, _)| attrs.contains(STATE_DONE));
            if done {
                break elements(&response, "ExitCode")
                    .first()
                    .and_then(|(_, t)| t.trim().parse::<i32>().ok())
                    .unwrap_or(-1);
            }
            if stdout.len() > MAX_OUTPUT_SIZE || stderr.len() > MAX_OUTPUT_SIZE {
                warn!("Output from {} exceeds limit, stopping receive", self.target);
                break -1;
            }
        };

        let signal = format!(
            "<rsp:Signal CommandId=\"{}\"><rsp:Code>{}</rsp:Code></rsp:Signal>",
            command_id, SIGNAL_TERMINATE
        );
        if let Err(e) = self.soap(ACTION_SIGNAL, Some(&shell_id), &signal).await {
            debug!("Terminate signal failed on {}: {}", self.target, e);
        }

        let (stdout, stdout_truncated) = truncate_output_bytes(&stdout);
        let (stderr, stderr_truncated) = truncate_output_bytes(&stderr);
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            truncated: stdout_truncated || stderr_truncated,
            duration: start.elapsed(),
        })
    }
}

fn fault(status: reqwest::StatusCode, text: &str) -> TransportError {
    let reason = elements(text, "Text")
        .first()
        .map(|(_, t)| t.trim().to_string())
        .unwrap_or_else(|| status.to_string());
    TransportError::Execution(format!("WinRM fault: {}", reason))
}

/// A Receive that saw no output within `OperationTimeout` faults with
/// `w:TimedOut`; the command is still running
fn is_timed_out(text: &str) -> bool {
    text.contains(WSMAN_TIMED_OUT_CODE)
        || elements(text, "Value")
            .iter()
            .any(|(_, value)| value.trim().ends_with(":TimedOut"))
}

/// `-EncodedCommand` takes base64 of UTF-16LE
fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    BASE64.encode(bytes)
}

fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Every `<prefix:name attrs>text</prefix:name>` element, as (attrs, text)
fn elements<'a>(xml: &'a str, name: &str) -> Vec<(&'a str, &'a str)> {
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        let Some(end) = after.find('>') else { break };
        let tag = &after[..end];
        let (tag_name, attrs) = tag.split_once(char::is_whitespace).unwrap_or((tag, ""));
        let local = tag_name.rsplit(':').next().unwrap_or(tag_name);
        rest = &after[end + 1..];
        if local != name || tag_name.starts_with('/') {
            continue;
        }
        if attrs.ends_with('/') {
            found.push((attrs, ""));
            continue;
        }
        let close = format!("</{}>", tag_name);
        if let Some(stop) = rest.find(&close) {
            found.push((attrs, &rest[..stop]));
            rest = &rest[stop + close.len()..];
        }
    }
    found
}

fn selector(xml: &str, name: &str) -> Option<String> {
    let wanted = format!("Name=\"{}\"", name);
    elements(xml, "Selector")
        .into_iter()
        .find(|(attrs, _)| attrs.contains(&wanted))
        .map(|(_, text)| text.trim().to_string())
}

#[async_trait]
impl RemoteShell for WinrmConnection {
    fn family(&self) -> ShellFamily {
        ShellFamily::PowerShell
    }

    fn tmpdir(&self) -> String {
        self.config
            .get_str("tmpdir")
            .unwrap_or("C:\\Windows\\Temp")
            .to_string()
    }

    fn apply_command(&self) -> String {
        String::new()
    }

    async fn exec(&mut self, line: &CommandLine) -> TResult<CommandOutput> {
        if line.stdin.is_some() {
            debug!("WinRM ignores stdin for {}", self.target);
        }
        let script = ShellFamily::PowerShell.render(line);
        debug!("Executing on {}: {}", self.target, script);
        // Cmdlets leave $LASTEXITCODE unset, which exits 0
        self.run_powershell(&format!("{}\nexit $LASTEXITCODE", script))
            .await
    }

    async fn put_file(&mut self, local: &Path, remote: &str) -> TResult<()> {
        let data = tokio::fs::read(local).await?;
        let path = ps_quote(remote);
        let mut chunks: Vec<&[u8]> = data.chunks(UPLOAD_CHUNK).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mode = if index == 0 { "Create" } else { "Append" };
            let script = format!(
                "$b = [Convert]::FromBase64String('{}'); \
                 $f = [IO.File]::Open({}, [IO.FileMode]::{}); \
                 $f.Write($b, 0, $b.Length); $f.Close()",
                BASE64.encode(chunk),
                path,
                mode
            );
            let output = self.run_powershell(&script).await?;
            if !output.stderr.trim().is_empty() {
                return Err(TransportError::Execution(format!(
                    "Upload to {} failed: {}",
                    remote,
                    output.stderr.trim()
                )));
            }
        }
        Ok(())
    }

    async fn get_file(&mut self, remote: &str, local: &Path) -> TResult<()> {
        let script = format!(
            "[Convert]::ToBase64String([IO.File]::ReadAllBytes({}))",
            ps_quote(remote)
        );
        let output = self.run_powershell(&script).await?;
        if !output.stderr.trim().is_empty() {
            return Err(TransportError::Execution(format!(
                "Download of {} failed: {}",
                remote,
                output.stderr.trim()
            )));
        }
        let data = BASE64
            .decode(output.stdout.trim())
            .map_err(|e| TransportError::Execution(format!("Bad download encoding: {}", e)))?;
        tokio::fs::write(local, data).await?;
        Ok(())
    }
}

#[async_trait]
impl Connection for WinrmConnection {
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

    async fn close(mut self: Box<Self>) {
        let shell_id = self.shell_id.clone();
        if let Err(e) = self.soap(ACTION_DELETE, Some(&shell_id), "").await {
            warn!("Failed to delete WinRM shell on {}: {}", self.target, e);
        }
    }
}
