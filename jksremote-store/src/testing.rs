//! Scripted in-memory transport for engine and job tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use jksremote_core::config::AppConfig;
use jksremote_core::keytool::{BEG_DELIM, END_DELIM};
use jksremote_core::{RemoteError, RemoteHandler, RemoteTarget, contains_keytool_error};

use crate::HandlerFactory;

pub type Responder = Arc<dyn Fn(&str) -> Result<String, RemoteError> + Send + Sync>;

pub fn respond(f: impl Fn(&str) -> Result<String, RemoteError> + Send + Sync + 'static) -> Responder {
    Arc::new(f)
}

pub fn pem(body: &str) -> String {
    format!("{BEG_DELIM}\n{body}\n{END_DELIM}")
}

pub fn linux_config() -> AppConfig {
    AppConfig {
        prerun_script_destination_path: "/tmp/".into(),
        separate_upload_file_path: "/tmp/".into(),
        default_linux_permissions_on_store_creation: "600".into(),
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Initialize,
    Terminate,
    Run(String),
    Upload { path: String, file_name: String },
    Remove { path: String, file_name: String },
    StoreExists { path: String, file_name: String },
}

fn is_keytool_probe(command: &str) -> bool {
    command == "which keytool" || command.starts_with("java -version")
}

#[derive(Default)]
struct Journal {
    calls: Vec<Call>,
    masks: Vec<(String, Vec<String>)>,
    uploads: Vec<Vec<u8>>,
}

/// Hands out handlers that share one journal and one responder.
pub struct ScriptedFactory {
    responder: Responder,
    journal: Arc<Mutex<Journal>>,
    fail_connect: bool,
    fail_upload: bool,
    store_exists: bool,
    yield_each_call: bool,
}

impl ScriptedFactory {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            journal: Arc::new(Mutex::new(Journal::default())),
            fail_connect: false,
            fail_upload: false,
            store_exists: true,
            yield_each_call: false,
        }
    }

    /// Answers the keytool probes and nothing else.
    pub fn keytool_installed() -> Self {
        Self::keytool_installed_with(|_| Ok(String::new()))
    }

    pub fn keytool_installed_with(
        f: impl Fn(&str) -> Result<String, RemoteError> + Send + Sync + 'static,
    ) -> Self {
        Self::new(respond(move |command| {
            if is_keytool_probe(command) {
                Ok("/usr/bin/keytool\n".to_string())
            } else {
                f(command)
            }
        }))
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_upload(mut self) -> Self {
        self.fail_upload = true;
        self
    }

    pub fn without_store(mut self) -> Self {
        self.store_exists = false;
        self
    }

    /// Yield to the scheduler on every call so concurrent callers get a
    /// chance to interleave.
    pub fn with_yield(mut self) -> Self {
        self.yield_each_call = true;
        self
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.journal().calls.clone()
    }

    /// Calls minus session setup and teardown.
    pub fn operation_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| match c {
                Call::Initialize | Call::Terminate => false,
                Call::Run(command) => !is_keytool_probe(command),
                _ => true,
            })
            .collect()
    }

    pub fn runs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Run(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Secrets passed for masking with the first command containing
    /// `fragment`.
    pub fn masks_for(&self, fragment: &str) -> Vec<String> {
        self.journal()
            .masks
            .iter()
            .find(|(command, _)| command.contains(fragment))
            .map(|(_, masks)| masks.clone())
            .unwrap_or_default()
    }

    pub fn uploads(&self) -> Vec<Vec<u8>> {
        self.journal().uploads.clone()
    }

    pub fn clear(&self) {
        *self.journal() = Journal::default();
    }
}

impl HandlerFactory for ScriptedFactory {
    fn create(&self, target: &RemoteTarget, _config: &AppConfig) -> Box<dyn RemoteHandler> {
        Box::new(ScriptedHandler {
            server: target.server.clone(),
            responder: self.responder.clone(),
            journal: self.journal.clone(),
            fail_connect: self.fail_connect,
            fail_upload: self.fail_upload,
            store_exists: self.store_exists,
            yield_each_call: self.yield_each_call,
        })
    }
}

struct ScriptedHandler {
    server: String,
    responder: Responder,
    journal: Arc<Mutex<Journal>>,
    fail_connect: bool,
    fail_upload: bool,
    store_exists: bool,
    yield_each_call: bool,
}

impl ScriptedHandler {
    async fn record(&self, call: Call) {
        self.journal.lock().unwrap().calls.push(call);
        if self.yield_each_call {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl RemoteHandler for ScriptedHandler {
    fn server(&self) -> &str {
        &self.server
    }

    async fn initialize(&mut self) -> Result<(), RemoteError> {
        if self.fail_connect {
            return Err(RemoteError::Connect {
                server: self.server.clone(),
                reason: "connection refused".into(),
            });
        }
        self.record(Call::Initialize).await;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), RemoteError> {
        self.record(Call::Terminate).await;
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        _with_sudo: bool,
        secrets_to_mask: &[&str],
    ) -> Result<String, RemoteError> {
        self.journal.lock().unwrap().masks.push((
            command.to_string(),
            secrets_to_mask.iter().map(|s| s.to_string()).collect(),
        ));
        self.record(Call::Run(command.to_string())).await;
        let output = (self.responder)(command)?;
        if contains_keytool_error(&output) {
            return Err(RemoteError::Keytool(output));
        }
        Ok(output)
    }

    async fn upload_file(&self, path: &str, file_name: &str, bytes: &[u8]) -> Result<(), RemoteError> {
        self.journal.lock().unwrap().uploads.push(bytes.to_vec());
        self.record(Call::Upload {
            path: path.into(),
            file_name: file_name.into(),
        })
        .await;
        if self.fail_upload {
            return Err(RemoteError::Transfer {
                path: format!("{path}{file_name}"),
                reason: "permission denied".into(),
            });
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str, file_name: &str) -> Result<(), RemoteError> {
        self.record(Call::Remove {
            path: path.into(),
            file_name: file_name.into(),
        })
        .await;
        Ok(())
    }

    async fn store_exists(&self, path: &str, file_name: &str) -> Result<bool, RemoteError> {
        self.record(Call::StoreExists {
            path: path.into(),
            file_name: file_name.into(),
        })
        .await;
        Ok(self.store_exists)
    }
}
