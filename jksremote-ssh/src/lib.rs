//! SSH shell transport.
//!
//! Commands run over `exec` channels on a single `russh` session; staged files
//! travel over SFTP, or SCP when the host has no SFTP subsystem.

pub mod auth;
mod scp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key, ssh_key};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use jksremote_core::{RemoteError, RemoteHandler, RemoteTarget, contains_keytool_error, mask_secrets};

pub use auth::Credential;

const SUDO_PREFIX: &str = "sudo -i -S ";
/// Feeds an empty line to any prompt the remote command raises.
const PACIFIER_PREFIX: &str = "echo -e '\\n' | ";
const DEFAULT_PORT: u16 = 22;
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Default)]
pub struct SshOptions {
    pub use_sudo: bool,
    pub use_scp: bool,
}

struct ClientHandler {
    server: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            server = %self.server,
            fingerprint = %server_public_key.fingerprint(Default::default()),
            "accepting server host key"
        );
        Ok(true)
    }
}

pub struct SshHandler {
    server: String,
    username: String,
    credential: Credential,
    options: SshOptions,
    session: Option<Handle<ClientHandler>>,
}

impl std::fmt::Debug for SshHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshHandler")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("credential", &self.credential)
            .field("options", &self.options)
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl SshHandler {
    pub fn new(target: &RemoteTarget, options: SshOptions) -> Self {
        Self {
            server: target.server.clone(),
            username: target.username.clone(),
            credential: Credential::from_secret(&target.secret),
            options,
            session: None,
        }
    }

    fn session(&self) -> Result<&Handle<ClientHandler>, RemoteError> {
        self.session.as_ref().ok_or(RemoteError::NotConnected)
    }

    fn connect_error(&self, reason: impl std::fmt::Display) -> RemoteError {
        RemoteError::Connect {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }

    async fn authenticate(&self, session: &mut Handle<ClientHandler>) -> Result<bool, RemoteError> {
        let result = match &self.credential {
            Credential::Password(password) => session
                .authenticate_password(&self.username, password.as_str())
                .await
                .map_err(|e| self.connect_error(e))?,
            Credential::PrivateKey(pem) => {
                let key = decode_secret_key(pem.as_str(), None).map_err(|e| self.connect_error(e))?;
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| self.connect_error(e))?
                    .flatten();
                session
                    .authenticate_publickey(
                        &self.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| self.connect_error(e))?
            }
        };
        Ok(result.success())
    }

    /// Run an exec channel to completion, collecting stdout and stderr.
    async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        let session = self.session()?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))?;

        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, .. } => output.stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                _ => {}
            }
        }
        Ok(output)
    }

    async fn upload_sftp(&self, path: &str, file_name: &str, bytes: &[u8]) -> Result<(), RemoteError> {
        let target = format!("{path}{file_name}");
        let transfer = |reason: String| RemoteError::Transfer {
            path: target.clone(),
            reason,
        };

        let channel = self
            .session()?
            .channel_open_session()
            .await
            .map_err(|e| transfer(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| transfer(e.to_string()))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| transfer(e.to_string()))?;

        let mut file = sftp
            .create(target.as_str())
            .await
            .map_err(|e| transfer(e.to_string()))?;
        file.write_all(bytes)
            .await
            .map_err(|e| transfer(e.to_string()))?;
        file.shutdown().await.map_err(|e| transfer(e.to_string()))?;

        if let Err(e) = sftp.close().await {
            debug!(error = %e, "sftp session close failed");
        }
        Ok(())
    }
}

#[derive(Default)]
struct ExecOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
}

/// Prefix a command with the privilege escalation (optional) and prompt
/// pacifier (always) that every remote invocation gets.
pub fn decorate_command(command: &str, with_sudo: bool) -> String {
    let command = if with_sudo {
        format!("{SUDO_PREFIX}{command}")
    } else {
        command.to_string()
    };
    format!("{PACIFIER_PREFIX}{command}")
}

/// SFTP/SCP want absolute forward-slash paths.
pub fn format_ftp_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path.replace('\\', "/"))
    }
}

/// Split `host[:port]`, defaulting to port 22.
pub fn split_host_port(server: &str) -> (&str, u16) {
    if let Some((host, port)) = server.rsplit_once(':')
        && !host.contains(':')
        && let Ok(port) = port.parse()
    {
        return (host, port);
    }
    (server, DEFAULT_PORT)
}

#[async_trait]
impl RemoteHandler for SshHandler {
    fn server(&self) -> &str {
        &self.server
    }

    async fn initialize(&mut self) -> Result<(), RemoteError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        });
        let (host, port) = split_host_port(&self.server);
        debug!(server = %self.server, user = %self.username, "opening ssh session");

        let mut session = client::connect(
            config,
            (host, port),
            ClientHandler {
                server: self.server.clone(),
            },
        )
        .await
        .map_err(|e| self.connect_error(e))?;

        if !self.authenticate(&mut session).await? {
            return Err(RemoteError::Auth {
                server: self.server.clone(),
                user: self.username.clone(),
            });
        }

        self.session = Some(session);
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), RemoteError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        debug!(server = %self.server, "closing ssh session");
        session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| RemoteError::Protocol(e.to_string()))
    }

    async fn run_command(
        &self,
        command: &str,
        with_sudo: bool,
        secrets_to_mask: &[&str],
    ) -> Result<String, RemoteError> {
        debug!(server = %self.server, "run_command");
        let command = decorate_command(command, with_sudo);
        let masked = mask_secrets(&command, secrets_to_mask);
        debug!(command = %masked, "ssh exec");

        let output = match self.exec(&command).await {
            Ok(output) => output,
            Err(e) => {
                debug!(command = %masked, error = %mask_secrets(&e.to_string(), secrets_to_mask), "ssh exec failed");
                return Err(e);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            command = %masked,
            stdout = %mask_secrets(&stdout, secrets_to_mask),
            stderr = %mask_secrets(&stderr, secrets_to_mask),
            exit_status = ?output.exit_status,
            "ssh results"
        );

        if contains_keytool_error(&stdout) {
            return Err(RemoteError::Keytool(stdout));
        }
        Ok(stdout)
    }

    async fn upload_file(&self, path: &str, file_name: &str, bytes: &[u8]) -> Result<(), RemoteError> {
        debug!(path, file_name, scp = self.options.use_scp, "upload_file");
        let path = format_ftp_path(path);

        let result = if self.options.use_scp {
            let channel = self
                .session()?
                .channel_open_session()
                .await
                .map_err(|e| RemoteError::Transfer {
                    path: format!("{path}{file_name}"),
                    reason: e.to_string(),
                })?;
            scp::upload(channel, &path, file_name, bytes).await
        } else {
            self.upload_sftp(&path, file_name, bytes).await
        };

        if let Err(e) = &result {
            debug!(error = %e, "upload failed");
        }
        result
    }

    async fn remove_file(&self, path: &str, file_name: &str) -> Result<(), RemoteError> {
        debug!(path, file_name, "remove_file");
        self.run_command(&format!("rm '{path}{file_name}'"), self.options.use_sudo, &[])
            .await
            .map(|_| ())
    }

    async fn store_exists(&self, path: &str, file_name: &str) -> Result<bool, RemoteError> {
        debug!(path, file_name, "store_exists");
        let result = self
            .run_command(
                &format!("test -f '{path}{file_name}' && echo 'true' || echo 'false'"),
                self.options.use_sudo,
                &[],
            )
            .await?;
        Ok(result.trim() == "true")
    }
}
