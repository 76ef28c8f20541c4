use base64::{Engine as _, engine::general_purpose};
use keyring::Entry;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TokenStoreError {
    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Base64 error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    #[error("Keyring error: {0}")]
    KeyringError(#[from] keyring::Error),

    #[error("Token not found")]
    TokenNotFound,
}

pub type Result<T> = std::result::Result<T, TokenStoreError>;

const SERVICE_NAME: &str = "rentchat";

#[derive(Debug, Clone)]
enum Backend {
    Keyring { service: String },
    File { data_dir: PathBuf },
}

/// Bearer tokens per account, kept in the system keyring or, where no keyring
/// exists, in an obfuscated file under the data directory.
#[derive(Debug, Clone)]
pub struct TokenStore {
    backend: Backend,
}

impl TokenStore {
    /// Keyring everywhere except Android, which has no keyring service.
    pub fn for_platform(data_dir: &Path) -> Self {
        if cfg!(target_os = "android") {
            Self::file_backed(data_dir)
        } else {
            Self::keyring(SERVICE_NAME)
        }
    }

    pub fn keyring(service: impl Into<String>) -> Self {
        Self {
            backend: Backend::Keyring {
                service: service.into(),
            },
        }
    }

    pub fn file_backed(data_dir: &Path) -> Self {
        Self {
            backend: Backend::File {
                data_dir: data_dir.to_path_buf(),
            },
        }
    }

    /// Stores `token` for `account`, replacing any previous one.
    pub fn store_token(&self, account: &str, token: &str) -> Result<()> {
        match &self.backend {
            Backend::Keyring { service } => {
                Entry::new(service, account)?.set_password(token)?;
            }
            Backend::File { data_dir } => {
                let mut tokens = read_tokens_file(data_dir)?;
                tokens[account] = json!(obfuscate(token, data_dir)?);
                write_tokens_file(data_dir, &tokens)?;
            }
        }
        tracing::debug!(
            target: "rentchat::token_store::store_token",
            "Stored token for account {}",
            account
        );
        Ok(())
    }

    /// Returns the token for `account`, or [`TokenStoreError::TokenNotFound`].
    pub fn get_token(&self, account: &str) -> Result<String> {
        match &self.backend {
            Backend::Keyring { service } => {
                match Entry::new(service, account)?.get_password() {
                    Ok(token) => Ok(token),
                    Err(keyring::Error::NoEntry) => Err(TokenStoreError::TokenNotFound),
                    Err(e) => Err(e.into()),
                }
            }
            Backend::File { data_dir } => {
                let tokens = read_tokens_file(data_dir)?;
                let obfuscated = tokens[account]
                    .as_str()
                    .ok_or(TokenStoreError::TokenNotFound)?;
                deobfuscate(obfuscated, data_dir)
            }
        }
    }

    /// Removes the token for `account`. Removing a missing token is not an error.
    pub fn remove_token(&self, account: &str) -> Result<()> {
        match &self.backend {
            Backend::Keyring { service } => {
                match Entry::new(service, account)?.delete_credential() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Backend::File { data_dir } => {
                let mut tokens = read_tokens_file(data_dir)?;
                if let Some(map) = tokens.as_object_mut() {
                    map.remove(account);
                }
                write_tokens_file(data_dir, &tokens)?;
            }
        }
        Ok(())
    }
}

fn get_device_key(data_dir: &Path) -> Result<Vec<u8>> {
    let uuid_file = data_dir.join("rentchat_uuid");

    let uuid = if uuid_file.exists() {
        fs::read_to_string(&uuid_file)?.trim().parse::<Uuid>()?
    } else {
        let new_uuid = Uuid::new_v4();
        fs::create_dir_all(data_dir)?;
        fs::write(uuid_file, new_uuid.to_string())?;
        new_uuid
    };

    Ok(uuid.as_bytes().to_vec())
}

fn get_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("rentchat_tokens.json")
}

fn xor_with_device_key(data: &[u8], device_key: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(device_key.iter().cycle())
        .map(|(&x1, &x2)| x1 ^ x2)
        .collect()
}

fn obfuscate(data: &str, data_dir: &Path) -> Result<String> {
    let device_key = get_device_key(data_dir)?;
    Ok(general_purpose::STANDARD_NO_PAD.encode(xor_with_device_key(data.as_bytes(), &device_key)))
}

fn deobfuscate(data: &str, data_dir: &Path) -> Result<String> {
    let device_key = get_device_key(data_dir)?;
    let decoded = general_purpose::STANDARD_NO_PAD.decode(data)?;
    Ok(String::from_utf8(xor_with_device_key(&decoded, &device_key))?)
}

fn read_tokens_file(data_dir: &Path) -> Result<Value> {
    let content = match fs::read_to_string(get_file_path(data_dir)) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::from("{}"),
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_str(&content)?)
}

fn write_tokens_file(data_dir: &Path, tokens: &Value) -> Result<()> {
    fs::create_dir_all(data_dir)?;
    let content = serde_json::to_string_pretty(tokens)?;
    fs::write(get_file_path(data_dir), content)?;
    Ok(())
}
