//! Encryption at rest for OAuth tokens
//!
//! Tokens are encrypted to the public half of an age X25519 identity and
//! stored base64-encoded. The identity (the master key) is read from
//! `SYNDICATE_MASTER_KEY` or from the configured key file.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::SecretString;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::config::CredentialsConfig;
use crate::error::{CredentialError, Result};

pub const MASTER_KEY_ENV: &str = "SYNDICATE_MASTER_KEY";

pub struct TokenCipher {
    identity: age::x25519::Identity,
}

impl TokenCipher {
    /// Parse an `AGE-SECRET-KEY-1...` string
    pub fn from_secret_key(secret: &str) -> Result<Self> {
        let identity = age::x25519::Identity::from_str(secret.trim())
            .map_err(|e| CredentialError::InvalidMasterKey(e.to_string()))?;
        Ok(Self { identity })
    }

    /// Fresh random identity
    pub fn generate() -> Self {
        Self {
            identity: age::x25519::Identity::generate(),
        }
    }

    /// Master key from the environment, falling back to the key file
    pub fn from_config(config: &CredentialsConfig) -> Result<Self> {
        if let Ok(secret) = std::env::var(MASTER_KEY_ENV) {
            let secret = Zeroizing::new(secret);
            return Self::from_secret_key(&secret);
        }

        let path = config
            .master_key_file
            .as_deref()
            .ok_or(CredentialError::MasterKeyNotSet)?;
        let path = shellexpand::tilde(path).to_string();
        Self::from_key_file(Path::new(&path))
    }

    pub fn from_key_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CredentialError::MasterKeyNotSet.into());
        }
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(CredentialError::Io)?);
        let secret = contents
            .lines()
            .find(|line| line.starts_with("AGE-SECRET-KEY-"))
            .ok_or_else(|| {
                CredentialError::InvalidMasterKey(format!(
                    "no AGE-SECRET-KEY line in {}",
                    path.display()
                ))
            })?;
        Self::from_secret_key(secret)
    }

    /// Generate a key and write it to `path` (mode 600 on Unix). Refuses to
    /// overwrite an existing file. Returns the public recipient string.
    pub fn generate_key_file(path: &Path) -> Result<String> {
        if path.exists() {
            return Err(CredentialError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ))
            .into());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(CredentialError::Io)?;
            }
        }

        let cipher = Self::generate();
        let secret = Zeroizing::new(secret_key_string(&cipher.identity));
        let contents = Zeroizing::new(format!(
            "# public key: {}\n{}\n",
            cipher.recipient(),
            secret.as_str()
        ));

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(CredentialError::Io)?;
        file.write_all(contents.as_bytes())
            .map_err(CredentialError::Io)?;

        tracing::info!(path = %path.display(), "Generated master key");
        Ok(cipher.recipient())
    }

    /// Public recipient (`age1...`)
    pub fn recipient(&self) -> String {
        self.identity.to_public().to_string()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let recipients: Vec<Box<dyn age::Recipient + Send>> =
            vec![Box::new(self.identity.to_public())];
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| CredentialError::Encryption("no recipients".to_string()))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok(STANDARD.encode(encrypted))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<SecretString> {
        let bytes = STANDARD
            .decode(ciphertext)
            .map_err(|_| CredentialError::DecryptionFailed)?;

        let decryptor = match age::Decryptor::new(&bytes[..]) {
            Ok(age::Decryptor::Recipients(d)) => d,
            Ok(_) => {
                return Err(CredentialError::Encryption(
                    "expected recipient-encrypted data".to_string(),
                )
                .into())
            }
            Err(_) => return Err(CredentialError::DecryptionFailed.into()),
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|_| CredentialError::DecryptionFailed)?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        let text = std::str::from_utf8(&plaintext)
            .map_err(|e| CredentialError::Encryption(format!("Invalid UTF-8: {}", e)))?;
        Ok(SecretString::from(text.to_string()))
    }
}

fn secret_key_string(identity: &age::x25519::Identity) -> String {
    use age::secrecy::ExposeSecret;
    identity.to_string().expose_secret().to_string()
}
