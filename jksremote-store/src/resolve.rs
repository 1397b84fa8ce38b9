//! Locating keytool on the remote host.
//!
//! Three strategies, chosen by configuration: trust `$PATH` (after checking
//! keytool answers), run an operator-supplied script on Linux that reports
//! the path (and optionally pre-computes discovery), or walk every fixed
//! drive on Windows looking for `keytool.exe`.

use serde::Deserialize;
use tracing::{debug, info};

use jksremote_core::ServerType;

use crate::store::staged_file_stem;
use crate::{JksError, JksStore};

pub(crate) const GET_DRIVES_COMMAND: &str =
    r#"Get-WmiObject Win32_Logicaldisk -Filter "DriveType = '3'" | % {$_.DeviceId}"#;

/// What the pre-run script prints on stdout.
#[derive(Debug, Default, Deserialize)]
struct PrerunEnvelope {
    #[serde(rename = "KeyToolPath", default)]
    key_tool_path: Option<String>,
    #[serde(rename = "DiscoveredFiles", default)]
    discovered_files: serde_json::Value,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PrerunResult {
    pub keytool_path: String,
    /// `None` when the script did not provide a usable list.
    pub discovered: Option<Vec<String>>,
}

pub(crate) fn parse_prerun_output(output: &str, want_discovery: bool) -> Result<PrerunResult, JksError> {
    let envelope: PrerunEnvelope =
        serde_json::from_str(output.trim()).map_err(JksError::PrerunOutput)?;
    let discovered = if want_discovery {
        serde_json::from_value::<Vec<String>>(envelope.discovered_files).ok()
    } else {
        None
    };
    Ok(PrerunResult {
        keytool_path: envelope.key_tool_path.unwrap_or_default(),
        discovered,
    })
}

/// Append `\` unless already present.
pub(crate) fn format_windows_path(path: &str) -> String {
    if path.ends_with('\\') {
        path.to_string()
    } else {
        format!("{path}\\")
    }
}

/// Drive roots (`C:\`) from the drive enumeration output.
pub(crate) fn parse_drive_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(format_windows_path)
        .collect()
}

pub(crate) fn keytool_search_command(drive: &str) -> String {
    format!(
        "(Get-ChildItem -Path {} -Recurse -ErrorAction SilentlyContinue -Include keytool.exe).fullname",
        format_windows_path(drive)
    )
}

/// Directory of the first hit, with trailing `\`.
pub(crate) fn keytool_prefix_from_search(output: &str) -> Option<String> {
    let first = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let dir = first.rfind('\\').map_or(first, |idx| &first[..idx]);
    Some(format_windows_path(dir))
}

impl JksStore {
    pub(crate) async fn is_keytool_installed(&self) -> Result<bool, JksError> {
        let command = match self.server_type {
            ServerType::Linux => "which keytool",
            ServerType::Windows => "java -version 2>&1",
        };
        let result = self
            .handler()?
            .run_command(command, self.use_sudo(), &[])
            .await?;
        Ok(!result.is_empty())
    }

    /// Upload, run and remove the configured pre-run script.
    pub(crate) async fn run_prerun_script(&mut self, extensions: &str) -> Result<(), JksError> {
        let handler = self.handler()?;
        let dest = self.config.prerun_script_destination_path.clone();
        let file_name = staged_file_stem();
        let script_path = format!("{dest}{file_name}");
        let sudo = self.config.use_sudo;

        let outcome = async {
            handler
                .upload_file(&dest, &file_name, self.config.script.as_bytes())
                .await
                .map_err(JksError::Upload)?;
            handler
                .run_command(&format!("dos2unix '{script_path}'"), sudo, &[])
                .await?;
            handler
                .run_command(&format!("chmod +x '{script_path}'"), sudo, &[])
                .await?;

            let command = if extensions.is_empty() {
                format!("'{script_path}'")
            } else {
                format!("'{script_path}' '{extensions}'")
            };
            let output = handler.run_command(&command, sudo, &[]).await?;
            parse_prerun_output(&output, !extensions.is_empty())
        }
        .await;

        if let Err(e) = handler.remove_file(&dest, &file_name).await {
            debug!(path = %script_path, error = %e, "pre-run script cleanup failed");
        }

        let result = outcome?;
        debug!(
            keytool_path = %result.keytool_path,
            discovered = ?result.discovered.as_ref().map(Vec::len),
            "pre-run script complete"
        );
        self.keytool_path = result.keytool_path;
        self.discovered_stores = result.discovered;
        Ok(())
    }

    pub(crate) async fn available_drives(&self) -> Result<Vec<String>, JksError> {
        let output = self
            .handler()?
            .run_command(GET_DRIVES_COMMAND, false, &[])
            .await?;
        Ok(parse_drive_list(&output))
    }

    /// Search fixed drives in order; the first drive with a hit wins.
    pub(crate) async fn find_keytool_on_windows(&mut self) -> Result<(), JksError> {
        for drive in self.available_drives().await? {
            let output = self
                .handler()?
                .run_command(&keytool_search_command(&drive), self.use_sudo(), &[])
                .await?;
            if let Some(prefix) = keytool_prefix_from_search(&output) {
                info!(drive = %drive, keytool_path = %prefix, "found keytool");
                self.keytool_path = prefix;
                return Ok(());
            }
        }
        debug!("keytool.exe not found on any fixed drive; relying on PATH");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ServerCredentials;
    use crate::testing::{Call, ScriptedFactory, linux_config, respond};

    #[test]
    fn prerun_envelope_with_discovery() {
        let out = r#"{"KeyToolPath":"/usr/lib/jvm/bin/","DiscoveredFiles":["/opt/a.jks","/opt/b.jks"]}"#;
        let result = parse_prerun_output(out, true).unwrap();
        assert_eq!(result.keytool_path, "/usr/lib/jvm/bin/");
        assert_eq!(
            result.discovered,
            Some(vec!["/opt/a.jks".to_string(), "/opt/b.jks".to_string()])
        );
    }

    #[test]
    fn prerun_discovery_ignored_without_extensions() {
        let out = r#"{"KeyToolPath":"/x/","DiscoveredFiles":["/opt/a.jks"]}"#;
        assert_eq!(parse_prerun_output(out, false).unwrap().discovered, None);
    }

    #[test]
    fn prerun_missing_or_ill_typed_discovery_is_not_provided() {
        let out = r#"{"KeyToolPath":"/x/"}"#;
        assert_eq!(parse_prerun_output(out, true).unwrap().discovered, None);
        let out = r#"{"KeyToolPath":"/x/","DiscoveredFiles":"oops"}"#;
        assert_eq!(parse_prerun_output(out, true).unwrap().discovered, None);
        let out = r#"{"KeyToolPath":"/x/","DiscoveredFiles":[1,2]}"#;
        assert_eq!(parse_prerun_output(out, true).unwrap().discovered, None);
    }

    #[test]
    fn prerun_missing_keytool_path_is_empty() {
        let result = parse_prerun_output("{}\n", false).unwrap();
        assert_eq!(result.keytool_path, "");
    }

    #[test]
    fn prerun_garbage_is_error() {
        assert!(matches!(
            parse_prerun_output("bash: dos2unix: command not found", false),
            Err(JksError::PrerunOutput(_))
        ));
    }

    #[test]
    fn drive_list_parsing() {
        assert_eq!(
            parse_drive_list("C:\r\nD:\r\n\r\n"),
            vec!["C:\\".to_string(), "D:\\".to_string()]
        );
        assert!(parse_drive_list("").is_empty());
    }

    #[test]
    fn keytool_search_parsing() {
        let out = "C:\\Program Files\\Java\\jdk-17\\bin\\keytool.exe\r\nC:\\Other\\bin\\keytool.exe\r\n";
        assert_eq!(
            keytool_prefix_from_search(out).unwrap(),
            "C:\\Program Files\\Java\\jdk-17\\bin\\"
        );
        assert_eq!(keytool_prefix_from_search("\r\n"), None);
        assert_eq!(
            keytool_search_command("C:"),
            "(Get-ChildItem -Path C:\\ -Recurse -ErrorAction SilentlyContinue -Include keytool.exe).fullname"
        );
    }

    #[tokio::test]
    async fn prerun_script_flow() {
        let factory = Arc::new(ScriptedFactory::new(respond(|command| {
            if command.starts_with("'/tmp/") {
                Ok(r#"{"KeyToolPath":"/opt/jdk/bin/","DiscoveredFiles":["/opt/a.jks"]}"#.to_string())
            } else {
                Ok(String::new())
            }
        })));
        let mut config = linux_config();
        config.use_prerun_script = true;
        config.script = "#!/bin/sh\r\necho '{}'\r\n".into();
        let mut store = JksStore::for_discovery(
            ServerCredentials::new("web01", "root", "pw"),
            ServerType::Linux,
            Arc::new(config),
            factory.clone(),
        );
        store.initialize(&["jks".to_string(), "keystore".to_string()]).await.unwrap();

        assert_eq!(store.keytool_path(), "/opt/jdk/bin/");
        assert_eq!(store.discovered_stores, Some(vec!["/opt/a.jks".to_string()]));

        let calls = factory.operation_calls();
        let Call::Upload { path, file_name } = &calls[0] else {
            panic!("expected upload first: {calls:?}");
        };
        assert_eq!(path, "/tmp/");
        assert_eq!(calls[1], Call::Run(format!("dos2unix '/tmp/{file_name}'")));
        assert_eq!(calls[2], Call::Run(format!("chmod +x '/tmp/{file_name}'")));
        assert_eq!(calls[3], Call::Run(format!("'/tmp/{file_name}' 'jks,keystore'")));
        assert_eq!(
            calls[4],
            Call::Remove {
                path: "/tmp/".into(),
                file_name: file_name.clone()
            }
        );
        // No PATH probe when the script is in charge.
        assert!(!factory.runs().iter().any(|c| c == "which keytool"));
        assert_eq!(factory.uploads()[0], b"#!/bin/sh\r\necho '{}'\r\n");
    }

    #[tokio::test]
    async fn prerun_script_removed_even_on_failure() {
        let factory = Arc::new(ScriptedFactory::new(respond(|_| Ok("not json".to_string()))));
        let mut config = linux_config();
        config.use_prerun_script = true;
        let mut store = JksStore::for_discovery(
            ServerCredentials::new("web01", "root", "pw"),
            ServerType::Linux,
            Arc::new(config),
            factory.clone(),
        );
        let err = store.initialize(&[]).await.unwrap_err();
        assert!(matches!(err, JksError::PrerunOutput(_)));
        assert!(matches!(factory.operation_calls().last(), Some(Call::Remove { .. })));
    }

    #[tokio::test]
    async fn windows_drive_search_sets_prefix() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|command| {
            if command.starts_with("Get-WmiObject") {
                Ok("C:\r\nD:\r\n".to_string())
            } else if command.contains("-Path D:\\ ") {
                Ok("D:\\jdk\\bin\\keytool.exe\r\n".to_string())
            } else {
                Ok(String::new())
            }
        }));
        let mut config = linux_config();
        config.find_keytool_path_on_windows = true;
        let mut store = JksStore::new(
            ServerCredentials::new("win01", "Administrator", "pw"),
            "C:\\certs\\app.jks",
            None,
            Arc::new(config),
            factory.clone(),
        )
        .unwrap();
        store.initialize(&[]).await.unwrap();

        assert_eq!(store.keytool_path(), "D:\\jdk\\bin\\");
        let runs = factory.runs();
        assert_eq!(runs[0], "java -version 2>&1");
        assert!(runs.iter().any(|c| c.contains("-Path C:\\ -Recurse")));
    }
}
