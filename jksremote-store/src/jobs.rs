//! Job adapters: one request in, one [`JobResult`] out.
//!
//! Every job opens a single [`JksStore`], always terminates it, and reports
//! failures as `"<prefix> <cause> <cause> ..."` rather than as errors.  A
//! failure while handing results to the caller is reported separately from
//! a failure while collecting them.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jksremote_core::CertificateEntry;
use jksremote_core::config::AppConfig;

use crate::{DefaultHandlerFactory, DiscoveryRequest, HandlerFactory, JksError, JksStore, ServerCredentials, pkcs12};

#[derive(Clone, Deserialize)]
pub struct DiscoveryJob {
    pub client_machine: String,
    pub server_username: String,
    pub server_password: String,
    pub dirs: String,
    pub extensions: String,
    #[serde(default)]
    pub ignored_dirs: String,
    #[serde(default)]
    pub patterns: String,
}

impl std::fmt::Debug for DiscoveryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryJob")
            .field("client_machine", &self.client_machine)
            .field("server_username", &self.server_username)
            .field("server_password", &"[redacted]")
            .field("dirs", &self.dirs)
            .field("extensions", &self.extensions)
            .field("ignored_dirs", &self.ignored_dirs)
            .field("patterns", &self.patterns)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct InventoryJob {
    pub client_machine: String,
    pub server_username: String,
    pub server_password: String,
    /// Full path of the keystore file.
    pub store_path: String,
    #[serde(default)]
    pub store_password: Option<String>,
}

impl std::fmt::Debug for InventoryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryJob")
            .field("client_machine", &self.client_machine)
            .field("server_username", &self.server_username)
            .field("server_password", &"[redacted]")
            .field("store_path", &self.store_path)
            .field("store_password", &self.store_password.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Add,
    Remove,
    Create,
}

#[derive(Clone, Deserialize)]
pub struct JobCertificate {
    /// Base64 DER/PEM, or a PKCS#12 bundle when a password is present.
    #[serde(default)]
    pub contents: String,
    #[serde(default)]
    pub private_key_password: Option<String>,
    #[serde(default)]
    pub alias: String,
}

impl std::fmt::Debug for JobCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCertificate")
            .field("contents_len", &self.contents.len())
            .field(
                "private_key_password",
                &self.private_key_password.as_ref().map(|_| "[redacted]"),
            )
            .field("alias", &self.alias)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
pub struct ManagementJob {
    pub client_machine: String,
    pub server_username: String,
    pub server_password: String,
    pub store_path: String,
    #[serde(default)]
    pub store_password: Option<String>,
    pub operation: Operation,
    pub certificate: JobCertificate,
    #[serde(default)]
    pub entry_password: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub job_history_id: Option<u64>,
}

impl std::fmt::Debug for ManagementJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementJob")
            .field("client_machine", &self.client_machine)
            .field("server_username", &self.server_username)
            .field("server_password", &"[redacted]")
            .field("store_path", &self.store_path)
            .field("store_password", &self.store_password.as_ref().map(|_| "[redacted]"))
            .field("operation", &self.operation)
            .field("certificate", &self.certificate)
            .field("entry_password", &self.entry_password.as_ref().map(|_| "[redacted]"))
            .field("overwrite", &self.overwrite)
            .field("job_history_id", &self.job_history_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub result: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_history_id: Option<u64>,
}

impl JobResult {
    pub fn success(job_history_id: Option<u64>) -> Self {
        Self {
            result: JobStatus::Success,
            failure_message: None,
            job_history_id,
        }
    }

    pub fn failure(
        err: &(dyn std::error::Error + 'static),
        prefix: &str,
        job_history_id: Option<u64>,
    ) -> Self {
        Self {
            result: JobStatus::Failure,
            failure_message: Some(flatten_error_messages(err, prefix)),
            job_history_id,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == JobStatus::Success
    }
}

/// `prefix` followed by the message of `err` and of every source below it.
pub fn flatten_error_messages(err: &(dyn std::error::Error + 'static), prefix: &str) -> String {
    let mut message = prefix.to_string();
    let mut current = Some(err);
    while let Some(e) = current {
        let text = e.to_string();
        if !text.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&text);
        }
        current = e.source();
    }
    message
}

fn empty_to_none(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn site_prefix(store_path: &str, server: &str) -> String {
    format!("Site {store_path} on server {server}:")
}

pub struct JobRunner {
    config: Arc<AppConfig>,
    factory: Arc<dyn HandlerFactory>,
}

impl JobRunner {
    /// Real transports: SSH for Linux hosts, WinRM for Windows hosts.
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self::with_factory(config, Arc::new(DefaultHandlerFactory))
    }

    pub fn with_factory(config: Arc<AppConfig>, factory: Arc<dyn HandlerFactory>) -> Self {
        Self { config, factory }
    }

    pub async fn discovery<F>(&self, job: &DiscoveryJob, submit: F) -> JobResult
    where
        F: FnOnce(Vec<String>) -> anyhow::Result<()>,
    {
        info!(server = %job.client_machine, dirs = %job.dirs, "begin discovery");
        let prefix = format!("Server {}:", job.client_machine);

        let request = match DiscoveryRequest::from_lists(&job.dirs, &job.extensions, &job.ignored_dirs, &job.patterns)
        {
            Ok(request) => request,
            Err(e) => return JobResult::failure(&e, &prefix, None),
        };

        let mut store = JksStore::for_discovery(
            ServerCredentials::new(&job.client_machine, &job.server_username, &job.server_password),
            request.server_type(),
            self.config.clone(),
            self.factory.clone(),
        );
        let outcome = async {
            store.initialize(&request.extensions).await?;
            store.discover(&request).await
        }
        .await;
        store.terminate().await;

        let locations = match outcome {
            Ok(locations) => locations,
            Err(e) => {
                warn!(server = %job.client_machine, error = %e, "discovery failed");
                return JobResult::failure(&e, &prefix, None);
            }
        };

        info!(server = %job.client_machine, count = locations.len(), "discovery complete");
        match submit(locations) {
            Ok(()) => JobResult::success(None),
            Err(e) => JobResult::failure(&*e, &prefix, None),
        }
    }

    pub async fn inventory<F>(&self, job: &InventoryJob, submit: F) -> JobResult
    where
        F: FnOnce(Vec<CertificateEntry>) -> anyhow::Result<()>,
    {
        info!(server = %job.client_machine, store = %job.store_path, "begin inventory");
        let prefix = site_prefix(&job.store_path, &job.client_machine);

        let mut store = match self.open(
            &job.client_machine,
            &job.server_username,
            &job.server_password,
            &job.store_path,
            empty_to_none(&job.store_password),
        ) {
            Ok(store) => store,
            Err(e) => return JobResult::failure(&e, &prefix, None),
        };
        let outcome = async {
            store.initialize(&[]).await?;
            ensure_store_exists(&store).await?;
            store.inventory().await
        }
        .await;
        store.terminate().await;

        let entries = match outcome {
            Ok(entries) => entries,
            Err(e) => {
                warn!(server = %job.client_machine, store = %job.store_path, error = %e, "inventory failed");
                return JobResult::failure(&e, &prefix, None);
            }
        };

        info!(store = %job.store_path, count = entries.len(), "inventory complete");
        match submit(entries) {
            Ok(()) => JobResult::success(None),
            Err(e) => JobResult::failure(&*e, &prefix, None),
        }
    }

    pub async fn management(&self, job: &ManagementJob) -> JobResult {
        info!(
            server = %job.client_machine,
            store = %job.store_path,
            operation = ?job.operation,
            alias = %job.certificate.alias,
            "begin management"
        );
        let prefix = site_prefix(&job.store_path, &job.client_machine);

        let mut store = match self.open(
            &job.client_machine,
            &job.server_username,
            &job.server_password,
            &job.store_path,
            empty_to_none(&job.store_password),
        ) {
            Ok(store) => store,
            Err(e) => return JobResult::failure(&e, &prefix, job.job_history_id),
        };
        let outcome = async {
            store.initialize(&[]).await?;
            apply_operation(&store, job).await
        }
        .await;
        store.terminate().await;

        match outcome {
            Ok(()) => {
                info!(store = %job.store_path, operation = ?job.operation, "management complete");
                JobResult::success(job.job_history_id)
            }
            Err(e) => {
                warn!(store = %job.store_path, operation = ?job.operation, error = %e, "management failed");
                JobResult::failure(&e, &prefix, job.job_history_id)
            }
        }
    }

    fn open(
        &self,
        server: &str,
        username: &str,
        password: &str,
        store_path: &str,
        store_password: Option<&str>,
    ) -> Result<JksStore, JksError> {
        JksStore::new(
            ServerCredentials::new(server, username, password),
            store_path,
            store_password,
            self.config.clone(),
            self.factory.clone(),
        )
    }
}

async fn ensure_store_exists(store: &JksStore) -> Result<(), JksError> {
    if store.does_store_exist().await? {
        Ok(())
    } else {
        Err(JksError::StoreNotFound(format!(
            "{}{}",
            store.store_path(),
            store.store_file_name()
        )))
    }
}

async fn apply_operation(store: &JksStore, job: &ManagementJob) -> Result<(), JksError> {
    let certificate = &job.certificate;
    match job.operation {
        Operation::Add => {
            ensure_store_exists(store).await?;
            let bytes = STANDARD
                .decode(certificate.contents.trim())
                .map_err(|e| JksError::InvalidCertificate(format!("contents are not valid base64: {e}")))?;

            match empty_to_none(&certificate.private_key_password) {
                Some(pfx_password) => {
                    let source_alias = pkcs12::first_key_alias(&bytes, pfx_password)?;
                    debug!(source_alias = %source_alias, "importing PKCS#12 entry");
                    store
                        .add_pkcs12_certificate(
                            &source_alias,
                            &certificate.alias,
                            &bytes,
                            pfx_password,
                            empty_to_none(&job.entry_password),
                            job.overwrite,
                        )
                        .await
                }
                None => {
                    store
                        .add_certificate(&certificate.alias, &bytes, job.overwrite)
                        .await
                }
            }
        }
        Operation::Remove => {
            ensure_store_exists(store).await?;
            store.delete_certificate_by_alias(&certificate.alias).await
        }
        Operation::Create => {
            if store.does_store_exist().await? {
                debug!(store = %job.store_path, "certificate store already exists; nothing to do");
                return Ok(());
            }
            store.create_certificate_store().await
        }
    }
}
