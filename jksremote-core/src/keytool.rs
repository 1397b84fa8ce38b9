//! keytool command construction and output parsing.
//!
//! Everything here is pure: commands are built as strings for a transport to
//! run, and responses are decoded from the tool's free-text output.  The
//! parsers depend on a handful of literals the tool prints verbatim; if a tool
//! version changes them, parsing degrades to empty/false rather than erroring.

use crate::ServerType;

pub const BEG_DELIM: &str = "-----BEGIN CERTIFICATE-----";
pub const END_DELIM: &str = "-----END CERTIFICATE-----";
pub const ALIAS_DELIM: &str = "Alias name: ";
pub const NOT_EXIST: &str = "not exist";
const PRIVATE_KEY_ENTRY: &str = "Entry type: PrivateKeyEntry";
const PRIVATE_KEY_MARKER: &str = "PRIVATE KEY-----";

const NEW_STORE_DNAME: &str = "cn=New Certificate Store";
const NEW_STORE_ALIAS: &str = "NewCertStore";

/// Builder for invocations against one keystore file.
///
/// `prefix` is the resolved directory of the keytool binary (with trailing
/// separator) or empty to rely on `$PATH`.  Arguments are single-quoted for
/// the shell of `server_type` (POSIX unless set with [`Keytool::for_server`]).
#[derive(Clone, Copy)]
pub struct Keytool<'a> {
    pub prefix: &'a str,
    pub keystore: &'a str,
    pub store_password: Option<&'a str>,
    pub server_type: ServerType,
}

impl std::fmt::Debug for Keytool<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keytool")
            .field("prefix", &self.prefix)
            .field("keystore", &self.keystore)
            .field("store_password", &self.store_password.map(|_| "[redacted]"))
            .field("server_type", &self.server_type)
            .finish()
    }
}

impl<'a> Keytool<'a> {
    pub fn new(prefix: &'a str, keystore: &'a str, store_password: Option<&'a str>) -> Self {
        Self {
            prefix,
            keystore,
            store_password,
            server_type: ServerType::Linux,
        }
    }

    pub fn for_server(self, server_type: ServerType) -> Self {
        Self {
            server_type,
            ..self
        }
    }

    fn quote(&self, value: &str) -> String {
        quote(self.server_type, value)
    }

    fn password_flag(&self, flag: &str, password: Option<&str>) -> Option<String> {
        password
            .filter(|p| !p.is_empty())
            .map(|p| format!("{flag} {}", self.quote(p)))
    }

    fn program(&self) -> String {
        format!("{}keytool", self.prefix)
    }

    /// `-storepass '<pw>'`, or nothing when the store has no password.
    fn store_pass_flag(&self) -> Option<String> {
        self.password_flag("-storepass", self.store_password)
    }

    pub fn list_aliases(&self) -> String {
        join([
            Some(self.program()),
            Some("-list -v".to_string()),
            Some(format!("-keystore {}", self.quote(self.keystore))),
            self.store_pass_flag(),
        ])
    }

    pub fn chain_for_alias(&self, alias: &str) -> String {
        join([
            Some(self.program()),
            Some("-list -rfc".to_string()),
            Some(format!("-keystore {}", self.quote(self.keystore))),
            self.store_pass_flag(),
            Some(format!("-alias {}", self.quote(alias))),
        ])
    }

    pub fn alias_exists(&self, alias: &str) -> String {
        join([
            Some(self.program()),
            Some("-list".to_string()),
            Some(format!("-keystore {}", self.quote(self.keystore))),
            Some(format!("-alias {}", self.quote(alias))),
            self.store_pass_flag(),
        ])
    }

    pub fn delete(&self, alias: &str) -> String {
        join([
            Some(self.program()),
            Some(format!("-delete -alias {}", self.quote(alias))),
            Some(format!("-keystore {}", self.quote(self.keystore))),
            self.store_pass_flag(),
        ])
    }

    /// keytool cannot create an empty store, so a throwaway self-signed keypair
    /// with one day of validity stands in for it.
    pub fn create(&self) -> String {
        join([
            Some(self.program()),
            Some("-genkeypair -keyalg RSA".to_string()),
            Some(format!("-keystore {}", self.quote(self.keystore))),
            self.store_pass_flag(),
            Some(format!(
                "-dname \"{NEW_STORE_DNAME}\" -validity 1 -alias \"{NEW_STORE_ALIAS}\""
            )),
        ])
    }

    pub fn import_certificate(&self, alias: &str, staged_file: &str) -> String {
        join([
            Some(self.program()),
            Some(format!("-import -alias {}", self.quote(alias))),
            Some(format!("-keystore {}", self.quote(self.keystore))),
            Some(format!("-file {}", self.quote(staged_file))),
            self.store_pass_flag(),
            Some("-noprompt".to_string()),
        ])
    }

    /// Import the key entry `source_alias` of a staged PKCS12 container as
    /// `dest_alias`.  The entry password falls back to the store password.
    pub fn import_pkcs12(
        &self,
        source_alias: &str,
        dest_alias: &str,
        staged_file: &str,
        pfx_password: &str,
        entry_password: Option<&str>,
    ) -> String {
        let key_password = entry_password
            .filter(|p| !p.is_empty())
            .or(self.store_password);
        join([
            Some(self.program()),
            Some(format!("-importkeystore -srckeystore {}", self.quote(staged_file))),
            Some("-srcstoretype PKCS12".to_string()),
            Some(format!("-srcstorepass {}", self.quote(pfx_password))),
            Some(format!("-srcalias {}", self.quote(source_alias))),
            Some(format!("-destkeystore {}", self.quote(self.keystore))),
            Some(format!("-destalias {}", self.quote(dest_alias))),
            Some("-deststoretype JKS".to_string()),
            self.password_flag("-destkeypass", key_password),
            self.password_flag("-deststorepass", self.store_password),
            Some("-noprompt".to_string()),
        ])
    }
}

/// Probe used by discovery: a genuine keystore lists at least one alias even
/// without its password.
pub fn validate_store_command(prefix: &str, path: &str) -> String {
    format!("{prefix}keytool -v -list -keystore {}", quote(ServerType::Linux, path))
}

/// `value` as it appears between the quotes of a single-quoted argument.
///
/// POSIX shells have no escape inside single quotes, so a `'` closes the
/// string, is emitted as `\'` and reopens it.  PowerShell doubles it.
pub fn escape_single_quotes(server_type: ServerType, value: &str) -> String {
    match server_type {
        ServerType::Linux => value.replace('\'', "'\\''"),
        ServerType::Windows => value.replace('\'', "''"),
    }
}

fn quote(server_type: ServerType, value: &str) -> String {
    format!("'{}'", escape_single_quotes(server_type, value))
}

fn join<const N: usize>(parts: [Option<String>; N]) -> String {
    parts.into_iter().flatten().collect::<Vec<_>>().join(" ")
}

/// Aliases from `-list -v` output, in listing order.
pub fn parse_aliases(output: &str) -> Vec<String> {
    alias_segments(output)
        .map(|segment| first_line(segment).to_string())
        .collect()
}

/// Aliases whose verbose listing reports a private key entry.
pub fn parse_private_key_aliases(output: &str) -> Vec<String> {
    alias_segments(output)
        .filter(|segment| segment.contains(PRIVATE_KEY_ENTRY))
        .map(|segment| first_line(segment).to_string())
        .collect()
}

fn alias_segments(output: &str) -> impl Iterator<Item = &str> {
    let start = output.find(ALIAS_DELIM).unwrap_or(output.len());
    output[start..]
        .split(ALIAS_DELIM)
        .filter(|segment| !segment.is_empty())
}

fn first_line(segment: &str) -> &str {
    let line = segment.split('\n').next().unwrap_or(segment);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Number of PEM certificates in `output`.
pub fn chain_length(output: &str) -> usize {
    output.matches(BEG_DELIM).count()
}

/// PEM blocks from `-list -rfc` output, in document order.
pub fn parse_chain(output: &str) -> Vec<String> {
    let mut chain = Vec::new();
    if !output.contains(BEG_DELIM) {
        return chain;
    }

    let mut remaining = output;
    for _ in 0..chain_length(output) {
        let Some(start) = remaining.find(BEG_DELIM) else {
            break;
        };
        let Some(end) = remaining[start..].find(END_DELIM) else {
            break;
        };
        let end = start + end + END_DELIM.len();
        chain.push(remaining[start..end].to_string());
        remaining = &remaining[end..];
    }

    chain
}

/// Interpret the output of [`Keytool::alias_exists`].
pub fn alias_exists(output: &str) -> bool {
    !output.contains(NOT_EXIST)
}

/// Whether a PEM block carries private key material alongside the
/// certificate.
pub fn has_private_key(pem: &str) -> bool {
    pem.contains(PRIVATE_KEY_MARKER)
}
