//! Searching a host for keystore files.

use tracing::debug;

use jksremote_core::ServerType;

use crate::resolve::format_windows_path;
use crate::{JksError, JksStore};

/// Extension token for files without an extension.
pub const NO_EXTENSION: &str = "noext";
/// Windows search root meaning every fixed drive.
pub const FULL_SCAN: &str = "fullscan";

/// Normalised discovery inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub roots: Vec<String>,
    pub extensions: Vec<String>,
    pub patterns: Vec<String>,
    pub ignored: Vec<String>,
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl DiscoveryRequest {
    /// Build from the comma-separated job fields.
    pub fn from_lists(dirs: &str, extensions: &str, ignored: &str, patterns: &str) -> Result<Self, JksError> {
        let roots = split_list(dirs);
        if roots.is_empty() {
            return Err(JksError::InvalidRequest(
                "Blank or missing search directories for Discovery.".into(),
            ));
        }
        let extensions = split_list(extensions);
        if extensions.is_empty() {
            return Err(JksError::InvalidRequest(
                "Blank or missing search extensions for Discovery.".into(),
            ));
        }
        let mut patterns = split_list(patterns);
        if patterns.is_empty() {
            patterns.push("*".into());
        }
        Ok(Self {
            roots,
            extensions,
            patterns,
            ignored: split_list(ignored),
        })
    }

    /// Linux hosts are recognised by an absolute first root.
    pub fn server_type(&self) -> ServerType {
        self.roots
            .first()
            .map_or(ServerType::Windows, |root| ServerType::from_path(root))
    }
}

fn is_no_extension(extension: &str) -> bool {
    extension.eq_ignore_ascii_case(NO_EXTENSION)
}

/// `find` over every root; `None` when there is nothing to match.
pub fn linux_find_command(roots: &[String], extensions: &[String], patterns: &[String]) -> Option<String> {
    if extensions.iter().all(|e| is_no_extension(e)) {
        return None;
    }
    let mut clauses = Vec::with_capacity(extensions.len() * patterns.len());
    for extension in extensions {
        for pattern in patterns {
            if is_no_extension(extension) {
                clauses.push(format!("-iname '{pattern}' ! -iname '*.*'"));
            } else {
                clauses.push(format!("-iname '{pattern}.{extension}'"));
            }
        }
    }
    Some(format!("find {} {}", roots.join(" "), clauses.join(" -or ")))
}

/// The `-Include` globs; `noext` has no glob form and is skipped.
pub fn windows_include_list(extensions: &[String], patterns: &[String]) -> Option<String> {
    let globs: Vec<String> = extensions
        .iter()
        .filter(|e| !is_no_extension(e))
        .flat_map(|e| patterns.iter().map(move |p| format!("{p}.{e}")))
        .collect();
    (!globs.is_empty()).then(|| globs.join(","))
}

pub fn windows_search_command(root: &str, include: &str) -> String {
    format!(
        "(Get-ChildItem -Path {} -Recurse -ErrorAction SilentlyContinue -Include {include}).fullname",
        format_windows_path(root)
    )
}

/// Drop every location under an ignored prefix.
pub fn filter_ignored(locations: Vec<String>, ignored: &[String]) -> Vec<String> {
    locations
        .into_iter()
        .filter(|location| !ignored.iter().any(|prefix| location.starts_with(prefix.as_str())))
        .collect()
}

impl JksStore {
    /// Candidate files, before filtering.
    pub async fn find_stores(&self, request: &DiscoveryRequest) -> Result<Vec<String>, JksError> {
        if let Some(found) = &self.discovered_stores {
            debug!(count = found.len(), "using pre-run script discovery results");
            return Ok(found.clone());
        }

        let result = match self.server_type {
            ServerType::Linux => self.find_stores_linux(request).await,
            ServerType::Windows => self.find_stores_windows(request).await,
        };
        result.map_err(|e| JksError::Discovery {
            paths: request.roots.join(" "),
            source: match e {
                JksError::Remote(remote) => remote,
                other => jksremote_core::RemoteError::Other(anyhow::Error::new(other)),
            },
        })
    }

    async fn find_stores_linux(&self, request: &DiscoveryRequest) -> Result<Vec<String>, JksError> {
        let Some(command) = linux_find_command(&request.roots, &request.extensions, &request.patterns) else {
            return Ok(Vec::new());
        };
        let output = self
            .handler()?
            .run_command(&command, self.config.use_sudo, &[])
            .await?;
        Ok(output
            .split('\n')
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn find_stores_windows(&self, request: &DiscoveryRequest) -> Result<Vec<String>, JksError> {
        let Some(include) = windows_include_list(&request.extensions, &request.patterns) else {
            debug!("no searchable extensions for windows host");
            return Ok(Vec::new());
        };

        let mut roots = Vec::new();
        for root in &request.roots {
            if root.eq_ignore_ascii_case(FULL_SCAN) {
                roots.extend(self.available_drives().await?);
            } else {
                roots.push(root.clone());
            }
        }

        let mut found = Vec::new();
        for root in roots {
            let output = self
                .handler()?
                .run_command(&windows_search_command(&root, &include), false, &[])
                .await?;
            found.extend(
                output
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }
        Ok(found)
    }

    /// Find, drop ignored paths and, on Linux, keep only files keytool can
    /// read.
    pub async fn discover(&self, request: &DiscoveryRequest) -> Result<Vec<String>, JksError> {
        let found = filter_ignored(self.find_stores(request).await?, &request.ignored);
        if self.server_type != ServerType::Linux {
            return Ok(found);
        }

        let mut valid = Vec::with_capacity(found.len());
        for path in found {
            match self.is_valid_store(&path).await {
                Ok(true) => valid.push(path),
                Ok(false) => debug!(path = %path, "not a keystore"),
                Err(e) => debug!(path = %path, error = %e, "keystore probe failed"),
            }
        }
        Ok(valid)
    }
}
