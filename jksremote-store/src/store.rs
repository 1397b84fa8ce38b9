//! The remote keystore entity.

use std::sync::{Arc, LazyLock};

use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

use jksremote_core::config::AppConfig;
use jksremote_core::keytool::{self, Keytool};
use jksremote_core::{CertificateEntry, RemoteHandler, ServerType};

use crate::{HandlerFactory, JksError, ServerCredentials};

/// Serialises every mutating sequence in the process, across all stores.
///
/// keytool edits are read-modify-write on the remote file and staged files
/// share an upload directory, so two mutations must never interleave.
pub static MODIFY_STORE: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Terminated,
}

pub struct JksStore {
    pub(crate) credentials: ServerCredentials,
    pub(crate) server_type: ServerType,
    /// Directory of the keystore, with trailing separator.
    pub(crate) store_path: String,
    pub(crate) store_file_name: String,
    store_password: Option<Zeroizing<String>>,
    pub(crate) upload_path: String,
    pub(crate) config: Arc<AppConfig>,
    factory: Arc<dyn HandlerFactory>,
    pub(crate) handler: Option<Box<dyn RemoteHandler>>,
    lifecycle: Lifecycle,
    /// Directory prefix for the keytool binary; empty means `$PATH`.
    pub(crate) keytool_path: String,
    /// Candidate paths pre-computed by the pre-run script.
    pub(crate) discovered_stores: Option<Vec<String>>,
}

impl std::fmt::Debug for JksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JksStore")
            .field("credentials", &self.credentials)
            .field("server_type", &self.server_type)
            .field("store_path", &self.store_path)
            .field("store_file_name", &self.store_file_name)
            .field("store_password", &self.store_password.as_ref().map(|_| "[redacted]"))
            .field("upload_path", &self.upload_path)
            .field("lifecycle", &self.lifecycle)
            .field("keytool_path", &self.keytool_path)
            .finish()
    }
}

/// Split `path_and_file` at its last `/` or `\`.
pub fn split_store_path(path_and_file: &str) -> Result<(String, String), JksError> {
    let idx = path_and_file
        .rfind(['/', '\\'])
        .ok_or_else(|| JksError::PathParse(path_and_file.to_string()))?;
    let (path, file) = path_and_file.split_at(idx + 1);
    if file.is_empty() {
        return Err(JksError::PathParse(path_and_file.to_string()));
    }
    Ok((path.to_string(), file.to_string()))
}

impl JksStore {
    /// A store bound to one keystore file.  The server class follows from the
    /// path shape and never changes afterwards.
    pub fn new(
        credentials: ServerCredentials,
        store_path_and_file: &str,
        store_password: Option<&str>,
        config: Arc<AppConfig>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<Self, JksError> {
        let (store_path, store_file_name) = split_store_path(store_path_and_file)?;
        let server_type = ServerType::from_path(&store_path);
        let upload_path = if config.use_separate_upload_file_path && server_type == ServerType::Linux {
            config.separate_upload_file_path.clone()
        } else {
            store_path.clone()
        };

        Ok(Self {
            credentials,
            server_type,
            store_path,
            store_file_name,
            store_password: store_password
                .filter(|p| !p.is_empty())
                .map(|p| Zeroizing::new(p.to_string())),
            upload_path,
            config,
            factory,
            handler: None,
            lifecycle: Lifecycle::Uninitialized,
            keytool_path: String::new(),
            discovered_stores: None,
        })
    }

    /// A store with no keystore file, used to search a host.
    pub fn for_discovery(
        credentials: ServerCredentials,
        server_type: ServerType,
        config: Arc<AppConfig>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        Self {
            credentials,
            server_type,
            store_path: String::new(),
            store_file_name: String::new(),
            store_password: None,
            upload_path: String::new(),
            config,
            factory,
            handler: None,
            lifecycle: Lifecycle::Uninitialized,
            keytool_path: String::new(),
            discovered_stores: None,
        }
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn store_path(&self) -> &str {
        &self.store_path
    }

    pub fn store_file_name(&self) -> &str {
        &self.store_file_name
    }

    pub fn keytool_path(&self) -> &str {
        &self.keytool_path
    }

    pub fn upload_path(&self) -> &str {
        &self.upload_path
    }

    fn keystore(&self) -> String {
        format!("{}{}", self.store_path, self.store_file_name)
    }

    fn store_password(&self) -> Option<&str> {
        self.store_password.as_ref().map(|p| p.as_str())
    }

    pub(crate) fn use_sudo(&self) -> bool {
        self.server_type == ServerType::Linux && self.config.use_sudo
    }

    pub(crate) fn handler(&self) -> Result<&dyn RemoteHandler, JksError> {
        match (&self.handler, self.lifecycle) {
            (Some(handler), Lifecycle::Initialized) => Ok(handler.as_ref()),
            _ => Err(JksError::NotInitialized),
        }
    }

    /// Connect the transport and resolve where keytool lives.
    ///
    /// `extensions` is only used by the pre-run script, which may pre-compute
    /// discovery results for them.
    pub async fn initialize(&mut self, extensions: &[String]) -> Result<(), JksError> {
        let target = self.credentials.target(self.server_type);
        let mut handler = self.factory.create(&target, &self.config);
        debug!(server = %self.credentials.server, server_type = %self.server_type, "connecting");
        handler.initialize().await.map_err(JksError::Connect)?;
        self.handler = Some(handler);
        self.lifecycle = Lifecycle::Initialized;

        if !self.config.use_prerun_script && !self.is_keytool_installed().await? {
            return Err(JksError::KeytoolNotFound {
                path: self.store_path.clone(),
                file_name: self.store_file_name.clone(),
            });
        }

        if self.config.use_prerun_script && self.server_type == ServerType::Linux {
            self.run_prerun_script(&extensions.join(",")).await?;
        }

        if self.config.find_keytool_path_on_windows && self.server_type == ServerType::Windows {
            self.find_keytool_on_windows().await?;
        }

        info!(
            server = %self.credentials.server,
            keytool_path = %self.keytool_path,
            "keystore session ready"
        );
        Ok(())
    }

    /// Release the transport.  Safe to call in any state, any number of
    /// times; disconnect failures are logged only.
    pub async fn terminate(&mut self) {
        if let Some(mut handler) = self.handler.take()
            && let Err(e) = handler.terminate().await
        {
            debug!(server = %self.credentials.server, error = %e, "disconnect failed");
        }
        self.lifecycle = Lifecycle::Terminated;
    }

    fn keytool<'a>(&'a self, keystore: &'a str) -> Keytool<'a> {
        Keytool::new(&self.keytool_path, keystore, self.store_password())
            .for_server(self.server_type)
    }

    async fn run_keytool(&self, command: &str, extra_secrets: &[&str]) -> Result<String, JksError> {
        let mut secrets: Vec<&str> = extra_secrets.to_vec();
        if let Some(password) = self.store_password() {
            secrets.push(password);
        }
        // Quoting rewrites a secret holding `'`; mask that form as well.
        let escaped: Vec<String> = secrets
            .iter()
            .filter(|s| s.contains('\''))
            .map(|s| keytool::escape_single_quotes(self.server_type, s))
            .collect();
        secrets.extend(escaped.iter().map(String::as_str));
        Ok(self
            .handler()?
            .run_command(command, self.use_sudo(), &secrets)
            .await?)
    }

    pub async fn does_store_exist(&self) -> Result<bool, JksError> {
        Ok(self
            .handler()?
            .store_exists(&self.store_path, &self.store_file_name)
            .await?)
    }

    /// A candidate counts as a keystore when keytool can list at least one
    /// alias from it without a password.
    pub async fn is_valid_store(&self, path: &str) -> Result<bool, JksError> {
        let command = keytool::validate_store_command(&self.keytool_path, path);
        let result = self
            .handler()?
            .run_command(&command, self.config.use_sudo, &[])
            .await?;
        Ok(result.contains(keytool::ALIAS_DELIM))
    }

    async fn list_verbose(&self) -> Result<String, JksError> {
        let keystore = self.keystore();
        let command = self.keytool(&keystore).list_aliases();
        self.run_keytool(&command, &[]).await
    }

    pub async fn get_all_store_aliases(&self) -> Result<Vec<String>, JksError> {
        Ok(keytool::parse_aliases(&self.list_verbose().await?))
    }

    pub async fn get_certificate_chain_for_alias(&self, alias: &str) -> Result<Vec<String>, JksError> {
        let keystore = self.keystore();
        let command = self.keytool(&keystore).chain_for_alias(alias);
        Ok(keytool::parse_chain(&self.run_keytool(&command, &[]).await?))
    }

    pub async fn does_certificate_alias_exist(&self, alias: &str) -> Result<bool, JksError> {
        let keystore = self.keystore();
        let command = self.keytool(&keystore).alias_exists(alias);
        Ok(keytool::alias_exists(&self.run_keytool(&command, &[]).await?))
    }

    /// Every alias with at least one certificate, with its chain.
    pub async fn inventory(&self) -> Result<Vec<CertificateEntry>, JksError> {
        let listing = self.list_verbose().await?;
        let aliases = keytool::parse_aliases(&listing);
        let key_aliases = keytool::parse_private_key_aliases(&listing);

        let mut entries = Vec::with_capacity(aliases.len());
        for alias in aliases {
            let chain = self.get_certificate_chain_for_alias(&alias).await?;
            let Some(leaf) = chain.first() else {
                debug!(alias = %alias, "alias has no certificates; skipping");
                continue;
            };
            let private_key_entry = keytool::has_private_key(leaf) || key_aliases.contains(&alias);
            entries.push(CertificateEntry::new(alias, chain, private_key_entry));
        }
        Ok(entries)
    }

    pub async fn delete_certificate_by_alias(&self, alias: &str) -> Result<(), JksError> {
        self.handler()?;
        let _guard = MODIFY_STORE.lock().await;
        self.delete_locked(alias).await
    }

    /// Caller must hold [`MODIFY_STORE`].
    async fn delete_locked(&self, alias: &str) -> Result<(), JksError> {
        let keystore = self.keystore();
        let command = self.keytool(&keystore).delete(alias);
        self.run_keytool(&command, &[])
            .await
            .map(|_| ())
            .map_err(|e| JksError::Remove {
                path: self.store_path.clone(),
                file_name: self.store_file_name.clone(),
                source: into_remote(e),
            })
    }

    /// keytool has no empty-store command; a throwaway keypair stands in.
    pub async fn create_certificate_store(&self) -> Result<(), JksError> {
        self.handler()?;
        let _guard = MODIFY_STORE.lock().await;
        let keystore = self.keystore();
        let create_error = |e: JksError| JksError::Create {
            path: self.store_path.clone(),
            file_name: self.store_file_name.clone(),
            source: into_remote(e),
        };

        let command = self.keytool(&keystore).create();
        self.run_keytool(&command, &[]).await.map_err(create_error)?;

        if self.server_type == ServerType::Linux {
            let chmod = format!(
                "chmod {} '{keystore}'",
                self.config.default_linux_permissions_on_store_creation
            );
            self.run_keytool(&chmod, &[]).await.map_err(create_error)?;
        }
        info!(store = %keystore, "certificate store created");
        Ok(())
    }

    pub async fn add_certificate(&self, alias: &str, cert_bytes: &[u8], overwrite: bool) -> Result<(), JksError> {
        self.handler()?;
        let _guard = MODIFY_STORE.lock().await;
        let file_name = format!("{}.pem", staged_file_stem());
        let staged = format!("{}{file_name}", self.upload_path);
        let keystore = self.keystore();
        let command = self.keytool(&keystore).import_certificate(alias, &staged);

        self.add_entry(alias, &command, &file_name, cert_bytes, overwrite, &[])
            .await
            .map_err(|e| self.add_error(e))
    }

    pub async fn add_pkcs12_certificate(
        &self,
        source_alias: &str,
        dest_alias: &str,
        cert_bytes: &[u8],
        pfx_password: &str,
        entry_password: Option<&str>,
        overwrite: bool,
    ) -> Result<(), JksError> {
        self.handler()?;
        let _guard = MODIFY_STORE.lock().await;
        let file_name = format!("{}.p12", staged_file_stem());
        let staged = format!("{}{file_name}", self.upload_path);
        let keystore = self.keystore();
        let command = self.keytool(&keystore).import_pkcs12(
            source_alias,
            dest_alias,
            &staged,
            pfx_password,
            entry_password,
        );

        let mut secrets = vec![pfx_password];
        if let Some(entry) = entry_password {
            secrets.push(entry);
        }
        self.add_entry(dest_alias, &command, &file_name, cert_bytes, overwrite, &secrets)
            .await
            .map_err(|e| self.add_error(e))
    }

    fn add_error(&self, source: JksError) -> JksError {
        JksError::Add {
            path: self.store_path.clone(),
            file_name: self.store_file_name.clone(),
            source: Box::new(source),
        }
    }

    /// Caller must hold [`MODIFY_STORE`].
    async fn add_entry(
        &self,
        alias: &str,
        command: &str,
        file_name: &str,
        bytes: &[u8],
        overwrite: bool,
        extra_secrets: &[&str],
    ) -> Result<(), JksError> {
        if self.does_certificate_alias_exist(alias).await? {
            if !overwrite {
                return Err(JksError::AliasExists(alias.to_string()));
            }
            self.delete_locked(alias).await?;
        }

        let handler = self.handler()?;
        let result = match handler.upload_file(&self.upload_path, file_name, bytes).await {
            Ok(()) => self.run_keytool(command, extra_secrets).await.map(|_| ()),
            Err(e) => Err(JksError::Upload(e)),
        };

        if let Err(e) = handler.remove_file(&self.upload_path, file_name).await {
            debug!(path = %self.upload_path, file_name, error = %e, "staged file cleanup failed");
        }
        result
    }
}

/// Random name for a staged file (no extension).
pub(crate) fn staged_file_stem() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn into_remote(e: JksError) -> jksremote_core::RemoteError {
    match e {
        JksError::Remote(remote) => remote,
        other => jksremote_core::RemoteError::Other(anyhow::Error::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, ScriptedFactory, linux_config, respond};

    fn creds() -> ServerCredentials {
        ServerCredentials::new("web01", "root", "pw")
    }

    async fn open(factory: &Arc<ScriptedFactory>, path: &str, password: Option<&str>) -> JksStore {
        let mut store = JksStore::new(
            creds(),
            path,
            password,
            Arc::new(linux_config()),
            factory.clone(),
        )
        .unwrap();
        store.initialize(&[]).await.unwrap();
        store
    }

    #[test]
    fn store_path_split_at_last_separator() {
        assert_eq!(
            split_store_path("/opt/certs/app.jks").unwrap(),
            ("/opt/certs/".to_string(), "app.jks".to_string())
        );
        assert_eq!(
            split_store_path("C:\\certs\\app.jks").unwrap(),
            ("C:\\certs\\".to_string(), "app.jks".to_string())
        );
        assert_eq!(
            split_store_path("C:\\certs/sub\\app.jks").unwrap(),
            ("C:\\certs/sub\\".to_string(), "app.jks".to_string())
        );
        assert!(matches!(split_store_path("app.jks"), Err(JksError::PathParse(_))));
        assert!(matches!(split_store_path("/opt/certs/"), Err(JksError::PathParse(_))));
    }

    #[test]
    fn server_type_and_upload_path() {
        let mut config = linux_config();
        config.use_separate_upload_file_path = true;
        config.separate_upload_file_path = "/var/tmp/".into();
        let config = Arc::new(config);
        let factory = Arc::new(ScriptedFactory::new(respond(|_| Ok(String::new()))));

        let linux = JksStore::new(creds(), "/opt/certs/app.jks", None, config.clone(), factory.clone()).unwrap();
        assert_eq!(linux.server_type(), ServerType::Linux);
        assert_eq!(linux.upload_path(), "/var/tmp/");

        let windows = JksStore::new(creds(), "C:\\certs\\app.jks", None, config, factory).unwrap();
        assert_eq!(windows.server_type(), ServerType::Windows);
        assert_eq!(windows.upload_path(), "C:\\certs\\");
    }

    #[tokio::test]
    async fn operations_before_initialize_fail() {
        let factory = Arc::new(ScriptedFactory::new(respond(|_| Ok(String::new()))));
        let store = JksStore::new(
            creds(),
            "/opt/certs/app.jks",
            None,
            Arc::new(linux_config()),
            factory.clone(),
        )
        .unwrap();
        assert!(matches!(store.does_store_exist().await, Err(JksError::NotInitialized)));
        assert!(matches!(
            store.add_certificate("a", b"x", false).await,
            Err(JksError::NotInitialized)
        ));
        assert!(factory.calls().is_empty());
    }

    #[tokio::test]
    async fn connect_failure_is_wrapped() {
        let factory = Arc::new(ScriptedFactory::new(respond(|_| Ok(String::new()))).failing_connect());
        let mut store = JksStore::new(
            creds(),
            "/opt/certs/app.jks",
            None,
            Arc::new(linux_config()),
            factory,
        )
        .unwrap();
        let err = store.initialize(&[]).await.unwrap_err();
        assert!(matches!(err, JksError::Connect(_)));
        store.terminate().await;
    }

    #[tokio::test]
    async fn missing_keytool_is_fatal() {
        let factory = Arc::new(ScriptedFactory::new(respond(|_| Ok(String::new()))));
        let mut store = JksStore::new(
            creds(),
            "/opt/certs/app.jks",
            None,
            Arc::new(linux_config()),
            factory.clone(),
        )
        .unwrap();
        let err = store.initialize(&[]).await.unwrap_err();
        assert!(matches!(err, JksError::KeytoolNotFound { .. }));
        assert!(err.to_string().contains("store path=/opt/certs/, file name=app.jks"));
        store.terminate().await;
        assert!(factory.calls().contains(&Call::Terminate));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let factory = Arc::new(ScriptedFactory::keytool_installed());
        let mut store = open(&factory, "/opt/certs/app.jks", None).await;
        store.terminate().await;
        store.terminate().await;
        assert_eq!(store.lifecycle(), Lifecycle::Terminated);
        let terminates = factory.calls().iter().filter(|c| **c == Call::Terminate).count();
        assert_eq!(terminates, 1);
        assert!(matches!(store.does_store_exist().await, Err(JksError::NotInitialized)));
    }

    #[tokio::test]
    async fn inventory_builds_entries_with_chains() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|command| {
            if command.contains("-list -v") {
                Ok("Your keystore contains 2 entries\n\n\
                    Alias name: web01\nEntry type: PrivateKeyEntry\n\n\
                    Alias name: empty\nEntry type: trustedCertEntry\n"
                    .to_string())
            } else if command.contains("-rfc") && command.contains("'web01'") {
                Ok(format!(
                    "Alias name: web01\nCertificate chain length: 2\nCertificate[1]:\n{}\nCertificate[2]:\n{}\n",
                    crate::testing::pem("LEAF"),
                    crate::testing::pem("ROOT")
                ))
            } else {
                Ok("keytool error: java.lang.Exception: Alias <empty> has no certificate".to_string())
            }
        }));
        let store = open(&factory, "/opt/certs/app.jks", Some("changeit")).await;

        let entries = store.inventory().await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.alias, "web01");
        assert_eq!(entry.certificates.len(), 2);
        assert!(entry.use_chain_level);
        assert!(entry.private_key_entry);
        assert!(entry.certificates[0].contains("LEAF"));
    }

    #[tokio::test]
    async fn keytool_commands_mask_store_password() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|_| Ok(String::new())));
        let store = open(&factory, "/opt/certs/app.jks", Some("changeit")).await;
        store.get_all_store_aliases().await.unwrap();
        let masked = factory.masks_for("-list -v");
        assert_eq!(masked, vec!["changeit".to_string()]);
    }

    #[tokio::test]
    async fn quoted_store_password_is_escaped_and_masked() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|_| Ok(String::new())));
        let store = open(&factory, "/opt/certs/app.jks", Some("it's")).await;
        store.get_all_store_aliases().await.unwrap();

        assert!(
            factory
                .runs()
                .iter()
                .any(|c| c.ends_with("-storepass 'it'\\''s'"))
        );
        let mask = mask_secrets_for(&factory, "-list -v");
        assert!(!mask.contains("it"), "{mask}");
    }

    fn mask_secrets_for(factory: &ScriptedFactory, fragment: &str) -> String {
        let command = factory
            .runs()
            .into_iter()
            .find(|c| c.contains(fragment))
            .unwrap();
        let masks = factory.masks_for(fragment);
        let masks: Vec<&str> = masks.iter().map(String::as_str).collect();
        jksremote_core::mask_secrets(&command, &masks)
    }

    #[tokio::test]
    async fn add_uploads_imports_and_cleans_up_in_order() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|command| {
            if command.contains("-list -keystore") {
                Ok("keytool error: java.lang.Exception: Alias <web01> does not exist".to_string())
            } else {
                Ok("Certificate was added to keystore".to_string())
            }
        }));
        let store = open(&factory, "/opt/certs/app.jks", Some("changeit")).await;
        store.add_certificate("web01", b"DER", false).await.unwrap();

        let calls = factory.operation_calls();
        assert_eq!(calls.len(), 4, "{calls:?}");
        assert!(matches!(&calls[0], Call::Run(c) if c.contains("-list -keystore")));
        let Call::Upload { path, file_name } = &calls[1] else {
            panic!("expected upload, got {:?}", calls[1]);
        };
        assert_eq!(path, "/opt/certs/");
        assert!(file_name.ends_with(".pem"));
        assert!(
            matches!(&calls[2], Call::Run(c) if c.contains("-import -alias 'web01'") && c.contains(&format!("-file '/opt/certs/{file_name}'")))
        );
        assert_eq!(
            calls[3],
            Call::Remove {
                path: "/opt/certs/".into(),
                file_name: file_name.clone()
            }
        );
    }

    #[tokio::test]
    async fn add_existing_alias_without_overwrite_fails() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|_| {
            Ok("web01, Jan 1, 2024, trustedCertEntry,".to_string())
        }));
        let store = open(&factory, "/opt/certs/app.jks", None).await;
        let err = store.add_certificate("web01", b"DER", false).await.unwrap_err();
        let JksError::Add { source, .. } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert!(matches!(source.as_ref(), JksError::AliasExists(a) if a == "web01"));
        assert!(
            crate::jobs::flatten_error_messages(&err, "x")
                .contains("Alias web01 already exists in certificate store.")
        );
        assert!(!factory.operation_calls().iter().any(|c| matches!(c, Call::Upload { .. })));
    }

    #[tokio::test]
    async fn overwrite_deletes_before_import() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|_| {
            Ok("web01, Jan 1, 2024, trustedCertEntry,".to_string())
        }));
        let store = open(&factory, "/opt/certs/app.jks", None).await;
        store.add_certificate("web01", b"DER", true).await.unwrap();

        let calls = factory.operation_calls();
        assert!(matches!(&calls[1], Call::Run(c) if c.contains("-delete -alias 'web01'")));
        assert!(matches!(&calls[2], Call::Upload { .. }));
    }

    #[tokio::test]
    async fn upload_failure_still_cleans_up() {
        let factory = Arc::new(
            ScriptedFactory::keytool_installed_with(|_| Ok("does not exist".to_string())).failing_upload(),
        );
        let store = open(&factory, "/opt/certs/app.jks", None).await;
        let err = store.add_certificate("web01", b"DER", false).await.unwrap_err();
        let JksError::Add { source, .. } = &err else {
            panic!("unexpected error {err:?}");
        };
        assert!(matches!(source.as_ref(), JksError::Upload(_)));
        assert!(matches!(factory.operation_calls().last(), Some(Call::Remove { .. })));
        assert!(!factory.operation_calls().iter().any(|c| matches!(c, Call::Run(c) if c.contains("-import"))));
    }

    #[tokio::test]
    async fn import_failure_still_cleans_up_from_upload_path() {
        let mut config = linux_config();
        config.use_separate_upload_file_path = true;
        config.separate_upload_file_path = "/var/tmp/".into();
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|command| {
            if command.contains("-import") {
                Ok("keytool error: java.io.IOException: Keystore was tampered with, or password was incorrect".to_string())
            } else {
                Ok("does not exist".to_string())
            }
        }));
        let mut store = JksStore::new(
            creds(),
            "/opt/certs/app.jks",
            Some("wrong"),
            Arc::new(config),
            factory.clone(),
        )
        .unwrap();
        store.initialize(&[]).await.unwrap();

        let err = store.add_certificate("web01", b"DER", false).await.unwrap_err();
        assert!(crate::jobs::flatten_error_messages(&err, "x").contains("password was incorrect"));
        assert!(matches!(
            factory.operation_calls().last(),
            Some(Call::Remove { path, .. }) if path == "/var/tmp/"
        ));
    }

    #[tokio::test]
    async fn pkcs12_import_masks_all_passwords() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|_| Ok("does not exist".to_string())));
        let store = open(&factory, "/opt/certs/app.jks", Some("storepw")).await;
        store
            .add_pkcs12_certificate("1", "web01", b"PFX", "pfxpw", Some("entrypw"), false)
            .await
            .unwrap();

        let masks = factory.masks_for("-importkeystore");
        for secret in ["storepw", "pfxpw", "entrypw"] {
            assert!(masks.iter().any(|m| m == secret), "{secret} not masked");
        }
        assert!(
            factory
                .operation_calls()
                .iter()
                .any(|c| matches!(c, Call::Upload { file_name, .. } if file_name.ends_with(".p12")))
        );
    }

    #[tokio::test]
    async fn create_runs_genkeypair_then_chmod() {
        let factory = Arc::new(ScriptedFactory::keytool_installed_with(|_| Ok(String::new())));
        let store = open(&factory, "/opt/certs/new.jks", Some("changeit")).await;
        store.create_certificate_store().await.unwrap();

        let calls = factory.operation_calls();
        assert!(matches!(&calls[0], Call::Run(c) if c.contains("-genkeypair") && c.contains("'/opt/certs/new.jks'")));
        assert_eq!(calls[1], Call::Run("chmod 600 '/opt/certs/new.jks'".into()));
    }

    #[tokio::test]
    async fn concurrent_mutations_never_interleave() {
        let factory = Arc::new(
            ScriptedFactory::keytool_installed_with(|_| Ok("does not exist".to_string())).with_yield(),
        );
        let a = open(&factory, "/opt/certs/a.jks", None).await;
        let b = open(&factory, "/opt/certs/b.jks", None).await;
        factory.clear();

        let (ra, rb) = tokio::join!(
            a.add_certificate("one", b"1", false),
            b.add_certificate("two", b"2", false)
        );
        ra.unwrap();
        rb.unwrap();

        // Each add is probe, upload, import, remove; the two runs of four
        // must not overlap.
        let calls = factory.operation_calls();
        assert_eq!(calls.len(), 8, "{calls:?}");
        let mut owners = Vec::new();
        for chunk in calls.chunks(4) {
            let Call::Run(probe) = &chunk[0] else {
                panic!("sequence must start with the alias probe: {chunk:?}");
            };
            let keystore = if probe.contains("a.jks") { "a.jks" } else { "b.jks" };
            let Call::Upload { file_name, .. } = &chunk[1] else {
                panic!("expected upload in {chunk:?}");
            };
            assert!(matches!(
                &chunk[2],
                Call::Run(c) if c.contains(file_name.as_str()) && c.contains(keystore)
            ));
            assert!(matches!(&chunk[3], Call::Remove { file_name: f, .. } if f == file_name));
            owners.push(keystore);
        }
        owners.sort();
        assert_eq!(owners, vec!["a.jks", "b.jks"]);
    }
}
