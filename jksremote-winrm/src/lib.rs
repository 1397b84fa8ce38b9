//! WinRM transport.
//!
//! Speaks WS-Management over HTTP: one remote shell is created at
//! `initialize` and every command runs inside it as an encoded PowerShell
//! script.  Output and errors come back through the shell's stdout/stderr
//! streams.

pub mod soap;

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use tracing::debug;
use zeroize::Zeroizing;

use jksremote_core::{RemoteError, RemoteHandler, RemoteTarget, contains_keytool_error, mask_secrets};

use crate::soap::ParseError;

const DEFAULT_PORT: u16 = 5985;
const HTTP_TIMEOUT: Duration = Duration::from_secs(90);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Base64 characters per stdin Send message; keeps envelopes well below the
/// negotiated maximum size.
const STDIN_CHUNK: usize = 64 * 1024;

const IGNORED_ERROR_PREFIX: &str = "importing keystore";
const IGNORED_ERROR_WARNING: &str = "warning:";
const IGNORED_ERROR_ADDED: &str = "certificate was added to keystore";

#[derive(Debug, Clone, Copy, Default)]
pub struct WinRmOptions {
    pub use_negotiate_auth: bool,
}

pub struct WinRmHandler {
    server: String,
    endpoint: String,
    username: String,
    password: Zeroizing<String>,
    options: WinRmOptions,
    http: Option<reqwest::Client>,
    shell_id: Option<String>,
}

impl std::fmt::Debug for WinRmHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmHandler")
            .field("server", &self.server)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("options", &self.options)
            .field("shell_id", &self.shell_id)
            .finish()
    }
}

impl From<ParseError> for RemoteError {
    fn from(e: ParseError) -> Self {
        RemoteError::Protocol(e.to_string())
    }
}

struct ScriptOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

impl WinRmHandler {
    pub fn new(target: &RemoteTarget, options: WinRmOptions) -> Self {
        Self {
            server: target.server.clone(),
            endpoint: endpoint_for(&target.server),
            username: target.username.clone(),
            password: target.secret.clone(),
            options,
            http: None,
            shell_id: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn shell_id(&self) -> Result<&str, RemoteError> {
        self.shell_id.as_deref().ok_or(RemoteError::NotConnected)
    }

    async fn post(&self, body: String) -> Result<String, RemoteError> {
        let http = self.http.as_ref().ok_or(RemoteError::NotConnected)?;
        let response = http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(self.password.as_str()))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/soap+xml;charset=UTF-8",
            )
            .body(body)
            .send()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Auth {
                server: self.server.clone(),
                user: self.username.clone(),
            });
        }
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        // WS-Man reports faults with HTTP 500 and a SOAP body; let the
        // envelope parser surface those.
        if !status.is_success() && !text.contains("Fault") {
            return Err(RemoteError::Protocol(format!("HTTP {status}: {text}")));
        }
        Ok(text)
    }

    /// Run `script` in the shell, optionally feeding `stdin`, and wait for it
    /// to finish.
    async fn run_script(&self, script: &str, stdin: Option<&[u8]>) -> Result<ScriptOutput, RemoteError> {
        let shell_id = self.shell_id()?;
        let arguments = format!(
            "-NoProfile -NonInteractive -EncodedCommand {}",
            encode_powershell(script)
        );
        let response = self
            .post(soap::command(&self.endpoint, shell_id, "powershell", &arguments))
            .await?;
        let command_id = soap::parse_command_id(&response)?;

        let result = self.drive_command(shell_id, &command_id, stdin).await;

        if let Err(e) = self
            .post(soap::signal_terminate(&self.endpoint, shell_id, &command_id))
            .await
        {
            debug!(error = %e, command_id, "signal terminate failed");
        }
        result
    }

    async fn drive_command(
        &self,
        shell_id: &str,
        command_id: &str,
        stdin: Option<&[u8]>,
    ) -> Result<ScriptOutput, RemoteError> {
        if let Some(input) = stdin {
            let chunks: Vec<&[u8]> = if input.is_empty() {
                vec![input]
            } else {
                input.chunks(STDIN_CHUNK).collect()
            };
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let response = self
                    .post(soap::send(&self.endpoint, shell_id, command_id, chunk, i == last))
                    .await?;
                soap::check_fault(&response)?;
            }
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let response = self
                .post(soap::receive(&self.endpoint, shell_id, command_id))
                .await?;
            match soap::parse_receive(&response) {
                Ok(chunk) => {
                    stdout.extend_from_slice(&chunk.stdout);
                    stderr.extend_from_slice(&chunk.stderr);
                    if chunk.done {
                        return Ok(ScriptOutput {
                            stdout: String::from_utf8_lossy(&stdout).into_owned(),
                            stderr: String::from_utf8_lossy(&stderr).into_owned(),
                            exit_code: chunk.exit_code,
                        });
                    }
                }
                Err(ParseError::Fault(msg)) if msg.contains(soap::TIMED_OUT_FAULT_CODE) => {
                    debug!(command_id, "receive timed out, polling again");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// `http://<host>:5985/wsman` unless the server already names a scheme or
/// port.
pub fn endpoint_for(server: &str) -> String {
    let server = server.trim_end_matches('/');
    if server.contains("://") {
        format!("{server}/wsman")
    } else if has_port(server) {
        format!("http://{server}/wsman")
    } else {
        format!("http://{server}:{DEFAULT_PORT}/wsman")
    }
}

fn has_port(server: &str) -> bool {
    server
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.contains(':') && port.parse::<u16>().is_ok())
}

/// `-EncodedCommand` payload: base64 of the UTF-16LE script text.
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    B64.encode(bytes)
}

/// Make a keytool invocation runnable from PowerShell.
///
/// The program path is wrapped in the call operator so a prefix containing
/// spaces survives, and an empty line is piped in to answer any prompt.
/// Commands that don't invoke keytool pass through unchanged.
pub fn rewrite_keytool_command(command: &str) -> String {
    let lower = command.to_ascii_lowercase();
    if !lower.contains("keytool ") {
        return command.to_string();
    }
    match lower.find("keytool") {
        Some(idx) => {
            let split = idx + "keytool".len();
            format!("echo '' | & '{}'{}", &command[..split], &command[split..])
        }
        None => command.to_string(),
    }
}

/// Single-quoted PowerShell string literal.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The error text to raise for `records`, or `None` when the records are
/// absent or one of them marks the whole stream as informational.
///
/// keytool writes its progress and warnings to stderr; any such record means
/// the command actually succeeded.
pub fn significant_errors(records: &[String]) -> Option<String> {
    let mut errors = Vec::with_capacity(records.len());
    for record in records {
        let lower = record.to_lowercase();
        if native_message(&lower).starts_with(IGNORED_ERROR_PREFIX)
            || lower.contains(IGNORED_ERROR_WARNING)
            || lower.contains(IGNORED_ERROR_ADDED)
        {
            return None;
        }
        errors.push(record.as_str());
    }
    if errors.is_empty() {
        None
    } else {
        Some(errors.join("   "))
    }
}

/// Strip the `keytool.exe : ` prefix PowerShell puts on native stderr lines.
fn native_message(record: &str) -> &str {
    record
        .split_once(" : ")
        .filter(|(program, _)| {
            let program = program.trim_end();
            program.ends_with("keytool") || program.ends_with("keytool.exe")
        })
        .map_or(record, |(_, message)| message)
}

fn upload_script(destination: &str) -> String {
    format!(
        "$contents = [Console]::In.ReadToEnd()\n\
         [System.IO.File]::WriteAllBytes({}, [System.Convert]::FromBase64String($contents.Trim()))\n",
        ps_quote(destination)
    )
}

#[async_trait]
impl RemoteHandler for WinRmHandler {
    fn server(&self) -> &str {
        &self.server
    }

    async fn initialize(&mut self) -> Result<(), RemoteError> {
        if self.options.use_negotiate_auth {
            return Err(RemoteError::Unsupported(format!(
                "Negotiate authentication is not available for {}; disable use_negotiate_auth to use Basic",
                self.server
            )));
        }
        debug!(server = %self.server, endpoint = %self.endpoint, "WinRM authentication mechanism: Basic");

        let http = reqwest::Client::builder()
            .user_agent(format!("jksremote/{}", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Connect {
                server: self.server.clone(),
                reason: e.to_string(),
            })?;
        self.http = Some(http);

        let shell = match self.post(soap::create_shell(&self.endpoint)).await {
            Ok(response) => soap::parse_shell_id(&response).map_err(RemoteError::from),
            Err(e) => Err(e),
        };
        match shell {
            Ok(id) => {
                debug!(server = %self.server, shell_id = %id, "remote shell created");
                self.shell_id = Some(id);
                Ok(())
            }
            Err(e) => {
                self.http = None;
                Err(match e {
                    RemoteError::Protocol(reason) => RemoteError::Connect {
                        server: self.server.clone(),
                        reason,
                    },
                    other => other,
                })
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), RemoteError> {
        let Some(shell_id) = self.shell_id.take() else {
            self.http = None;
            return Ok(());
        };
        debug!(server = %self.server, shell_id = %shell_id, "deleting remote shell");
        let result = self
            .post(soap::delete_shell(&self.endpoint, &shell_id))
            .await
            .and_then(|response| soap::check_fault(&response).map_err(RemoteError::from));
        self.http = None;
        result
    }

    async fn run_command(
        &self,
        command: &str,
        _with_sudo: bool,
        secrets_to_mask: &[&str],
    ) -> Result<String, RemoteError> {
        debug!(server = %self.server, "run_command");
        let command = rewrite_keytool_command(command);
        let masked = mask_secrets(&command, secrets_to_mask);
        debug!(command = %masked, "winrm script");

        let output = match self.run_script(&command, None).await {
            Ok(output) => output,
            Err(e) => {
                debug!(command = %masked, error = %mask_secrets(&e.to_string(), secrets_to_mask), "winrm script failed");
                return Err(e);
            }
        };

        let records = soap::error_records(&output.stderr)?;
        if let Some(errors) = significant_errors(&records) {
            let errors = mask_secrets(&errors, secrets_to_mask);
            debug!(command = %masked, errors = %errors, "winrm errors");
            return Err(RemoteError::Command(errors));
        }
        debug!(
            command = %masked,
            result = %mask_secrets(&output.stdout, secrets_to_mask),
            exit_code = ?output.exit_code,
            "winrm results"
        );

        if contains_keytool_error(&output.stdout) {
            return Err(RemoteError::Keytool(output.stdout));
        }
        Ok(output.stdout)
    }

    async fn upload_file(&self, path: &str, file_name: &str, bytes: &[u8]) -> Result<(), RemoteError> {
        debug!(path, file_name, "upload_file");
        let destination = format!("{path}{file_name}");
        let payload = B64.encode(bytes);
        let output = self
            .run_script(&upload_script(&destination), Some(payload.as_bytes()))
            .await
            .map_err(|e| RemoteError::Transfer {
                path: destination.clone(),
                reason: e.to_string(),
            })?;

        let records = soap::error_records(&output.stderr)?;
        if !records.is_empty() {
            let reason = records.join("   ");
            debug!(path = %destination, reason = %reason, "upload failed");
            return Err(RemoteError::Transfer {
                path: destination,
                reason,
            });
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str, file_name: &str) -> Result<(), RemoteError> {
        debug!(path, file_name, "remove_file");
        self.run_command(&format!("rm {}", ps_quote(&format!("{path}{file_name}"))), false, &[])
            .await
            .map(|_| ())
    }

    async fn store_exists(&self, path: &str, file_name: &str) -> Result<bool, RemoteError> {
        debug!(path, file_name, "store_exists");
        let command = format!("dir {}", ps_quote(&format!("{path}{file_name}")));
        match self.run_command(&command, false, &[]).await {
            Ok(result) => Ok(!result.to_lowercase().contains("file not found")),
            Err(RemoteError::Command(msg)) if msg.to_lowercase().contains("does not exist") => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
