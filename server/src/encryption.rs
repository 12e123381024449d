use std::io::{Cursor, Read, Write};
use std::iter;
use std::str::FromStr;
use std::sync::Arc;

use age::{x25519::Identity, Decryptor, Encryptor};
use base64::Engine as _;
use color_eyre::eyre::{eyre, Result};

/// age identity used to encrypt KV values at rest
#[derive(Clone)]
pub struct EncryptionConfig {
    pub key: Arc<Identity>,
}

impl EncryptionConfig {
    /// `None` when `ENCRYPTION_KEY` is unset; an unparseable key is an error.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var("ENCRYPTION_KEY") {
            Ok(key_str) if !key_str.trim().is_empty() => Self::from_key_str(key_str.trim()).map(Some),
            _ => Ok(None),
        }
    }

    pub fn from_key_str(key_str: &str) -> Result<Self> {
        let key = Identity::from_str(key_str)
            .map_err(|e| eyre!("Failed to parse ENCRYPTION_KEY: {}", e))?;

        Ok(Self { key: Arc::new(key) })
    }

    pub fn generate() -> Self {
        Self {
            key: Arc::new(Identity::generate()),
        }
    }
}

/// Encrypts a string to the identity's own recipient, returning base64.
pub async fn encrypt(data: &str, key: &Arc<Identity>) -> Result<String> {
    let data_vec = data.as_bytes().to_vec();
    let key_clone = key.clone();

    // age is CPU bound, keep it off the request executor
    let encrypted = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let recipient = key_clone.to_public();
        let recipients = iter::once(&recipient as &dyn age::Recipient);
        let encryptor = Encryptor::with_recipients(recipients)
            .map_err(|e| eyre!("Failed to create encryptor: {}", e))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| eyre!("Failed to create encrypted writer: {}", e))?;
        writer
            .write_all(&data_vec)
            .map_err(|e| eyre!("Failed to write data for encryption: {}", e))?;
        writer
            .finish()
            .map_err(|e| eyre!("Failed to finish encryption: {}", e))?;

        Ok(encrypted)
    })
    .await??;

    Ok(base64::engine::general_purpose::STANDARD.encode(&encrypted))
}

/// Inverse of [`encrypt`].
pub async fn decrypt(encrypted_base64: &str, key: &Arc<Identity>) -> Result<String> {
    let encrypted_data = base64::engine::general_purpose::STANDARD
        .decode(encrypted_base64)
        .map_err(|e| eyre!("Failed to decode base64 data: {}", e))?;
    let key_clone = key.clone();

    tokio::task::spawn_blocking(move || -> Result<String> {
        let decryptor = Decryptor::new(Cursor::new(encrypted_data))
            .map_err(|e| eyre!("Failed to create decryptor: {}", e))?;

        let identities = iter::once(key_clone.as_ref() as &dyn age::Identity);
        let mut reader = decryptor
            .decrypt(identities)
            .map_err(|e| eyre!("Failed to decrypt data: {}", e))?;

        let mut decrypted = String::new();
        reader
            .read_to_string(&mut decrypted)
            .map_err(|e| eyre!("Failed to read decrypted data: {}", e))?;

        Ok(decrypted)
    })
    .await?
}
