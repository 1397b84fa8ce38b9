use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub mod config;
pub mod keytool;

/// Substring keytool prints when a store (or source store) password is wrong.
///
/// Both transports treat a result containing this as a failure, even when the
/// remote side reported no stream-level error.
pub const KEYTOOL_ERROR: &str = "password was incorrect";

/// Replacement text for secrets in log lines.
pub const PASSWORD_MASK_VALUE: &str = "[PASSWORD]";

/// Server secrets at or above this length are treated as private key material
/// rather than a password.
pub const PASSWORD_LENGTH_MAX: usize = 100;

/// Host family of a remote keystore, derived once from the store path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    Linux,
    Windows,
}

impl ServerType {
    /// A leading `/` is unique to Unix-style absolute paths.
    pub fn from_path(path: &str) -> Self {
        if path.starts_with('/') {
            Self::Linux
        } else {
            Self::Windows
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => f.write_str("linux"),
            Self::Windows => f.write_str("windows"),
        }
    }
}

/// Addressing and credentials for one remote host.
///
/// `Debug` is manually implemented so the secret never reaches a log line.
#[derive(Clone)]
pub struct RemoteTarget {
    pub server: String,
    pub username: String,
    /// Login password, or private key material when longer than
    /// [`PASSWORD_LENGTH_MAX`].
    pub secret: Zeroizing<String>,
    pub server_type: ServerType,
}

impl std::fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("secret", &"[redacted]")
            .field("server_type", &self.server_type)
            .finish()
    }
}

/// One materialised inventory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateEntry {
    pub alias: String,
    /// PEM blocks, leaf first.
    pub certificates: Vec<String>,
    pub private_key_entry: bool,
    pub use_chain_level: bool,
}

impl CertificateEntry {
    pub fn new(alias: String, certificates: Vec<String>, private_key_entry: bool) -> Self {
        let use_chain_level = certificates.len() > 1;
        Self {
            alias,
            certificates,
            private_key_entry,
            use_chain_level,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("unable to connect to {server}: {reason}")]
    Connect { server: String, reason: String },
    #[error("authentication failed for {user}@{server}")]
    Auth { server: String, user: String },
    #[error("{0}")]
    Command(String),
    /// The keytool output contained [`KEYTOOL_ERROR`].
    #[error("{0}")]
    Keytool(String),
    #[error("file transfer failed for {path}: {reason}")]
    Transfer { path: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("remote session is not connected")]
    NotConnected,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A live command channel to one remote host.
///
/// Implementations own exactly one connection handle.  `initialize` and
/// `terminate` bracket its lifetime; every other call assumes exclusive use of
/// the handle for the duration of the round trip.
#[async_trait::async_trait]
pub trait RemoteHandler: Send + Sync {
    fn server(&self) -> &str;

    async fn initialize(&mut self) -> Result<(), RemoteError>;

    /// Release the connection.  Calling this on an already-closed handler is a
    /// no-op.
    async fn terminate(&mut self) -> Result<(), RemoteError>;

    /// Run `command` and return its standard output.
    ///
    /// `secrets_to_mask` are replaced with [`PASSWORD_MASK_VALUE`] in every log
    /// line the handler emits for this call.
    async fn run_command(
        &self,
        command: &str,
        with_sudo: bool,
        secrets_to_mask: &[&str],
    ) -> Result<String, RemoteError>;

    /// Write `bytes` to `<path><file_name>` on the remote host.
    async fn upload_file(&self, path: &str, file_name: &str, bytes: &[u8])
    -> Result<(), RemoteError>;

    async fn remove_file(&self, path: &str, file_name: &str) -> Result<(), RemoteError>;

    async fn store_exists(&self, path: &str, file_name: &str) -> Result<bool, RemoteError>;
}

/// Replace each non-empty secret in `text` with [`PASSWORD_MASK_VALUE`].
///
/// Literal substring replacement only: a secret that was quoted or escaped
/// while building the command will not be found.
pub fn mask_secrets(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, secret| {
            acc.replace(secret, PASSWORD_MASK_VALUE)
        })
}

/// Whether `output` carries the keytool wrong-password sentinel.
pub fn contains_keytool_error(output: &str) -> bool {
    output.to_lowercase().contains(KEYTOOL_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_type_from_path() {
        assert_eq!(ServerType::from_path("/opt/certs/"), ServerType::Linux);
        assert_eq!(ServerType::from_path("C:\\certs\\"), ServerType::Windows);
        assert_eq!(ServerType::from_path("certs/"), ServerType::Windows);
        assert_eq!(ServerType::from_path(""), ServerType::Windows);
    }

    #[test]
    fn certificate_entry_derives_chain_flag() {
        let single = CertificateEntry::new("a".into(), vec!["pem".into()], false);
        assert!(!single.use_chain_level);
        let chain = CertificateEntry::new("b".into(), vec!["leaf".into(), "root".into()], false);
        assert!(chain.use_chain_level);
    }

    #[test]
    fn mask_secrets_replaces_every_occurrence() {
        let masked = mask_secrets(
            "keytool -storepass 'hunter2' -srcstorepass 'hunter2' -alias x",
            &["hunter2"],
        );
        assert!(!masked.contains("hunter2"));
        assert_eq!(masked.matches(PASSWORD_MASK_VALUE).count(), 2);
    }

    #[test]
    fn mask_secrets_skips_empty_secret() {
        let masked = mask_secrets("keytool -list", &[""]);
        assert_eq!(masked, "keytool -list");
    }

    #[test]
    fn mask_secrets_is_literal_only() {
        // A secret altered by quoting is not recognised.
        let masked = mask_secrets("-storepass 'it'\\''s'", &["it's"]);
        assert!(masked.contains("it'\\''s"));
    }

    #[test]
    fn keytool_error_detection_is_case_insensitive() {
        assert!(contains_keytool_error(
            "keytool error: java.io.IOException: Keystore was tampered with, or Password was incorrect"
        ));
        assert!(!contains_keytool_error("Alias name: web01"));
    }

    #[test]
    fn remote_target_debug_redacts_secret() {
        let target = RemoteTarget {
            server: "host".into(),
            username: "root".into(),
            secret: Zeroizing::new("s3cr3t".into()),
            server_type: ServerType::Linux,
        };
        let debug = format!("{target:?}");
        assert!(debug.contains("[redacted]"));
        assert!(!debug.contains("s3cr3t"));
    }
}
