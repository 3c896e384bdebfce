use anyhow::Result;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::config::{AccountConfig, AuthMethod};
use crate::sync::state::Credentials;

const KEYRING_SERVICE: &str = "imap-adsync";
const ENV_PASSWORD: &str = "ADSYNC_PASSWORD";
const ENV_ACCESS_TOKEN: &str = "ADSYNC_ACCESS_TOKEN";

/// Debug information about credential storage backends
#[derive(Debug, Clone)]
pub struct CredentialDebugInfo {
    pub keyring_available: bool,
    pub env_var_set: bool,
    pub file_path: PathBuf,
    pub file_exists: bool,
}

impl std::fmt::Display for CredentialDebugInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Credential storage:")?;
        writeln!(
            f,
            "  Keyring: {}",
            if self.keyring_available {
                "available"
            } else {
                "unavailable"
            }
        )?;
        writeln!(
            f,
            "  Environment var ({}): {}",
            ENV_PASSWORD,
            if self.env_var_set { "set" } else { "not set" }
        )?;
        writeln!(f, "  File fallback: {}", self.file_path.display())?;
        writeln!(f, "  File exists: {}", self.file_exists)?;
        Ok(())
    }
}

/// Secrets of one account: environment first, then keyring, then a
/// private file next to the config.
pub struct CredentialStore {
    email: String,
    password_file: PathBuf,
}

impl CredentialStore {
    pub fn new(email: &str) -> Self {
        let safe_email = email.replace(['@', '.', '/', '\\', ':'], "_");
        let password_file = crate::config::Config::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(format!(".password_{}", safe_email));

        Self {
            email: email.to_string(),
            password_file,
        }
    }

    /// Resolve the secret matching the account's auth method.
    pub fn credentials_for(account: &AccountConfig) -> Result<Credentials> {
        let store = Self::new(&account.email);
        match account.auth {
            AuthMethod::Password => store.get_password().map(Credentials::Password),
            AuthMethod::OAuth2 => store.get_access_token().map(Credentials::AccessToken),
        }
    }

    pub fn debug_info(&self) -> CredentialDebugInfo {
        let test_key = format!("test:{}", self.email);
        let keyring_available =
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &test_key) {
                entry.set_password("__test__").is_ok()
                    && entry.get_password().is_ok()
                    && entry.delete_credential().is_ok()
            } else {
                false
            };

        CredentialDebugInfo {
            keyring_available,
            env_var_set: env_secret(ENV_PASSWORD).is_some(),
            file_path: self.password_file.clone(),
            file_exists: self.password_file.exists(),
        }
    }

    fn password_key(&self) -> String {
        format!("imap:{}", self.email)
    }

    fn token_key(&self) -> String {
        format!("oauth2:{}", self.email)
    }

    fn keyring_get(&self, key: &str) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key).ok()?;
        entry.get_password().ok()
    }

    fn keyring_set(&self, key: &str, secret: &str) -> bool {
        if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, key) {
            entry.set_password(secret).is_ok()
        } else {
            false
        }
    }

    fn file_get(&self) -> Option<String> {
        fs::read_to_string(&self.password_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Write the password file with owner-only permissions.
    fn file_set(&self, password: &str) -> Result<()> {
        if let Some(parent) = self.password_file.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.password_file)?;
            file.write_all(password.as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.password_file, password)?;
        }

        Ok(())
    }

    pub fn get_password(&self) -> Result<String> {
        if let Some(pwd) = env_secret(ENV_PASSWORD) {
            return Ok(pwd);
        }
        if let Some(pwd) = self.keyring_get(&self.password_key()) {
            return Ok(pwd);
        }
        if let Some(pwd) = self.file_get() {
            return Ok(pwd);
        }

        anyhow::bail!(
            "Password for {} not found. Set {} or run 'imap-adsync login'.",
            self.email,
            ENV_PASSWORD
        )
    }

    /// OAuth2 access token; obtaining and refreshing it is up to the caller.
    pub fn get_access_token(&self) -> Result<String> {
        if let Some(token) = env_secret(ENV_ACCESS_TOKEN) {
            return Ok(token);
        }
        if let Some(token) = self.keyring_get(&self.token_key()) {
            return Ok(token);
        }

        anyhow::bail!(
            "Access token for {} not found. Set {}.",
            self.email,
            ENV_ACCESS_TOKEN
        )
    }

    pub fn set_password(&self, password: &str) -> Result<()> {
        let key = self.password_key();
        if self.keyring_set(&key, password) && self.keyring_get(&key).is_some() {
            return Ok(());
        }

        tracing::warn!("Keyring unavailable, storing password in {}", self.password_file.display());
        eprintln!("Note: Keyring unavailable, using file-based storage.");
        self.file_set(password)
    }

    pub fn has_credentials(&self) -> bool {
        env_secret(ENV_PASSWORD).is_some()
            || self.keyring_get(&self.password_key()).is_some()
            || self.file_get().is_some()
    }

    /// Remove the password and token from the keyring and the password
    /// file. Secrets that were never stored are skipped.
    pub fn delete_all(&self) -> Result<()> {
        for key in [self.password_key(), self.token_key()] {
            if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &key)
                && entry.delete_credential().is_ok()
            {
                tracing::info!("Removed {} from the keyring", key);
            }
        }
        match fs::remove_file(&self.password_file) {
            Ok(()) => tracing::info!("Removed {}", self.password_file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to remove {}: {}",
                    self.password_file.display(),
                    e
                ));
            }
        }
        Ok(())
    }
}

fn env_secret(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}
