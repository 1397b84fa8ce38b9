//! Remote Java keystore engine.
//!
//! [`JksStore`] binds one remote keystore to a live transport and exposes the
//! inventory, discovery and mutation operations; [`jobs`] turns host job
//! requests into calls on it.

pub mod discovery;
pub mod jobs;
pub mod pkcs12;
mod resolve;
pub mod store;

#[cfg(test)]
mod testing;

use jksremote_core::config::AppConfig;
use jksremote_core::{RemoteError, RemoteHandler, RemoteTarget, ServerType};
use jksremote_ssh::{SshHandler, SshOptions};
use jksremote_winrm::{WinRmHandler, WinRmOptions};
use zeroize::Zeroizing;

pub use discovery::DiscoveryRequest;
pub use store::{JksStore, MODIFY_STORE};

#[derive(thiserror::Error, Debug)]
pub enum JksError {
    #[error("Error attempting to connect to the remote server.")]
    Connect(#[source] RemoteError),
    #[error(
        "Java is either not installed on the server or is not in the $PATH environment variable for store path={path}, file name={file_name}."
    )]
    KeytoolNotFound { path: String, file_name: String },
    #[error("keystore session is not initialized")]
    NotInitialized,
    #[error("Java Keystore {0} cannot be found.")]
    StoreNotFound(String),
    #[error("Alias {0} already exists in certificate store.")]
    AliasExists(String),
    #[error("Error attempting to upload certificate file to the remote server.")]
    Upload(#[source] RemoteError),
    #[error("Error attempting to add certificate for store path={path}, file name={file_name}.")]
    Add {
        path: String,
        file_name: String,
        #[source]
        source: Box<JksError>,
    },
    #[error("Error attempting to remove certificate for store path={path}, file name={file_name}.")]
    Remove {
        path: String,
        file_name: String,
        #[source]
        source: RemoteError,
    },
    #[error("Error attempting to create certificate store path={path}, file name={file_name}.")]
    Create {
        path: String,
        file_name: String,
        #[source]
        source: RemoteError,
    },
    #[error("Error attempting to find certificate stores for path={paths}.")]
    Discovery {
        paths: String,
        #[source]
        source: RemoteError,
    },
    #[error("Error attempting to parse certificate store path {0}.")]
    PathParse(String),
    #[error("pre-run script returned unreadable output")]
    PrerunOutput(#[source] serde_json::Error),
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Host address and login for one job.
#[derive(Clone)]
pub struct ServerCredentials {
    pub server: String,
    pub username: String,
    pub secret: Zeroizing<String>,
}

impl std::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("secret", &"[redacted]")
            .finish()
    }
}

impl ServerCredentials {
    pub fn new(server: &str, username: &str, secret: &str) -> Self {
        Self {
            server: server.to_string(),
            username: username.to_string(),
            secret: Zeroizing::new(secret.to_string()),
        }
    }

    pub(crate) fn target(&self, server_type: ServerType) -> RemoteTarget {
        RemoteTarget {
            server: self.server.clone(),
            username: self.username.clone(),
            secret: self.secret.clone(),
            server_type,
        }
    }
}

/// Builds the transport for a target.  The store asks for exactly one per
/// session.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, target: &RemoteTarget, config: &AppConfig) -> Box<dyn RemoteHandler>;
}

/// SSH for Linux hosts, WinRM for Windows hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandlerFactory;

impl HandlerFactory for DefaultHandlerFactory {
    fn create(&self, target: &RemoteTarget, config: &AppConfig) -> Box<dyn RemoteHandler> {
        match target.server_type {
            ServerType::Linux => Box::new(SshHandler::new(
                target,
                SshOptions {
                    use_sudo: config.use_sudo,
                    use_scp: config.use_scp,
                },
            )),
            ServerType::Windows => Box::new(WinRmHandler::new(
                target,
                WinRmOptions {
                    use_negotiate_auth: config.use_negotiate_auth,
                },
            )),
        }
    }
}
