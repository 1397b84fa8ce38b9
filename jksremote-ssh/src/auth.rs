//! Credential interpretation for the shell transport.
//!
//! The job host hands over a single secret field.  Short values are login
//! passwords; anything at or above [`PASSWORD_LENGTH_MAX`] is a private key
//! whose line breaks were flattened to spaces on the way in.

use jksremote_core::PASSWORD_LENGTH_MAX;
use zeroize::Zeroizing;

const RSA_MARKER: &str = " RSA PRIVATE ";
const RSA_PLACEHOLDER: &str = "^^^";

#[derive(Clone)]
pub enum Credential {
    Password(Zeroizing<String>),
    PrivateKey(Zeroizing<String>),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Credential::Password([redacted])"),
            Self::PrivateKey(_) => f.write_str("Credential::PrivateKey([redacted])"),
        }
    }
}

impl Credential {
    pub fn from_secret(secret: &str) -> Self {
        if secret.len() < PASSWORD_LENGTH_MAX {
            Self::Password(Zeroizing::new(secret.to_string()))
        } else {
            Self::PrivateKey(restore_key_line_breaks(secret))
        }
    }
}

/// Turn a space-flattened PEM key back into its multi-line form.
///
/// Every space becomes `\n` except those inside the `-----BEGIN RSA PRIVATE
/// KEY-----` style header and footer.
pub fn restore_key_line_breaks(flattened: &str) -> Zeroizing<String> {
    let protected = Zeroizing::new(flattened.replace(RSA_MARKER, RSA_PLACEHOLDER));
    let split = Zeroizing::new(protected.replace(' ', "\n"));
    Zeroizing::new(split.replace(RSA_PLACEHOLDER, RSA_MARKER))
}
