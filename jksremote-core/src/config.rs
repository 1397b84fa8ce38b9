//! Process-wide settings, loaded once at job start.
//!
//! The file is TOML.  Every required key must be present; a missing key fails
//! the job before any remote contact, and all missing keys are reported at
//! once.

use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_LINUX_PERMISSION_SETTING: &str = "600";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("the following configuration items are missing from the config file: {}", .0.join(", "))]
    MissingKeys(Vec<&'static str>),
    #[error("use_negotiate_auth = true is not supported; only Basic authentication is available for WinRM")]
    NegotiateAuthUnsupported,
    #[error("unable to read pre-run script {path}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk shape.  Everything is optional here so validation can report the
/// full set of missing keys instead of failing on the first one.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    use_sudo: Option<bool>,
    use_prerun_script: Option<bool>,
    prerun_script: Option<String>,
    prerun_script_destination_path: Option<String>,
    use_separate_upload_file_path: Option<bool>,
    separate_upload_file_path: Option<String>,
    find_keytool_path_on_windows: Option<bool>,
    use_negotiate_auth: Option<bool>,
    use_scp: Option<bool>,
    default_linux_permissions_on_store_creation: Option<String>,
}

/// Validated settings.
#[derive(Clone, Default)]
pub struct AppConfig {
    pub use_sudo: bool,
    pub use_prerun_script: bool,
    /// Script file name as configured (relative to the config file).
    pub prerun_script: String,
    /// Body of the pre-run script; empty unless `use_prerun_script` is set.
    pub script: String,
    /// Remote directory the pre-run script is staged in (trailing `/`).
    pub prerun_script_destination_path: String,
    pub use_separate_upload_file_path: bool,
    /// Remote staging directory for certificate files (trailing `/`).
    pub separate_upload_file_path: String,
    pub find_keytool_path_on_windows: bool,
    pub use_negotiate_auth: bool,
    pub use_scp: bool,
    pub default_linux_permissions_on_store_creation: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("use_sudo", &self.use_sudo)
            .field("use_prerun_script", &self.use_prerun_script)
            .field("prerun_script", &self.prerun_script)
            .field("script", &format_args!("[{} bytes]", self.script.len()))
            .field(
                "prerun_script_destination_path",
                &self.prerun_script_destination_path,
            )
            .field(
                "use_separate_upload_file_path",
                &self.use_separate_upload_file_path,
            )
            .field("separate_upload_file_path", &self.separate_upload_file_path)
            .field(
                "find_keytool_path_on_windows",
                &self.find_keytool_path_on_windows,
            )
            .field("use_negotiate_auth", &self.use_negotiate_auth)
            .field("use_scp", &self.use_scp)
            .field(
                "default_linux_permissions_on_store_creation",
                &self.default_linux_permissions_on_store_creation,
            )
            .finish()
    }
}

impl AppConfig {
    /// Load and validate the config file at `path`.
    ///
    /// When the pre-run script is enabled its body is read from a file named
    /// by `prerun_script`, resolved against the config file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;

        if config.use_prerun_script {
            let script_path = path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(&config.prerun_script);
            config.script =
                std::fs::read_to_string(&script_path).map_err(|source| ConfigError::Script {
                    path: script_path.clone(),
                    source,
                })?;
            tracing::debug!(path = %script_path.display(), "loaded pre-run script");
        }

        Ok(config)
    }

    /// Parse and validate settings without touching the filesystem.
    ///
    /// The pre-run script body is left empty.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        if raw.use_sudo.is_none() {
            missing.push("use_sudo");
        }
        if raw.use_prerun_script.is_none() {
            missing.push("use_prerun_script");
        }
        if raw.prerun_script.is_none() {
            missing.push("prerun_script");
        }
        if raw.prerun_script_destination_path.is_none() {
            missing.push("prerun_script_destination_path");
        }
        if raw.use_separate_upload_file_path.is_none() {
            missing.push("use_separate_upload_file_path");
        }
        if raw.separate_upload_file_path.is_none() {
            missing.push("separate_upload_file_path");
        }
        if raw.find_keytool_path_on_windows.is_none() {
            missing.push("find_keytool_path_on_windows");
        }
        if raw.use_negotiate_auth.is_none() {
            missing.push("use_negotiate_auth");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing));
        }
        if raw.use_negotiate_auth == Some(true) {
            return Err(ConfigError::NegotiateAuthUnsupported);
        }

        Ok(Self {
            use_sudo: raw.use_sudo.unwrap_or_default(),
            use_prerun_script: raw.use_prerun_script.unwrap_or_default(),
            prerun_script: raw.prerun_script.unwrap_or_default(),
            script: String::new(),
            prerun_script_destination_path: add_trailing_slash(
                &raw.prerun_script_destination_path.unwrap_or_default(),
            ),
            use_separate_upload_file_path: raw.use_separate_upload_file_path.unwrap_or_default(),
            separate_upload_file_path: add_trailing_slash(
                &raw.separate_upload_file_path.unwrap_or_default(),
            ),
            find_keytool_path_on_windows: raw.find_keytool_path_on_windows.unwrap_or_default(),
            use_negotiate_auth: raw.use_negotiate_auth.unwrap_or_default(),
            use_scp: raw.use_scp.unwrap_or(false),
            default_linux_permissions_on_store_creation: raw
                .default_linux_permissions_on_store_creation
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LINUX_PERMISSION_SETTING.to_string()),
        })
    }
}

fn add_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// `$XDG_CONFIG_HOME/jksremote/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!(
                "neither XDG_CONFIG_HOME nor HOME are set; using current directory for config"
            );
            PathBuf::from(".")
        });
    base.join("jksremote").join("config.toml")
}
