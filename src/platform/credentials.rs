use keyring::Entry;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{CredentialRef, CredentialSource};

/// `Ok(None)` for `none`; an error when the referenced secret is missing.
pub fn resolve(credential: &CredentialRef) -> Result<Option<String>> {
    match credential.source()? {
        CredentialSource::None => Ok(None),
        CredentialSource::Env(var) => {
            debug!("Resolving credential from environment variable {}", var);
            match std::env::var(&var) {
                Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
                Ok(_) => Err(Error::credential(format!("environment variable {} is empty", var))),
                Err(_) => Err(Error::credential(format!("environment variable {} is not set", var))),
            }
        }
        CredentialSource::Keyring { service, account } => {
            debug!("Resolving credential from keyring {}/{}", service, account);
            let entry = Entry::new(&service, &account)
                .map_err(|e| Error::credential(format!("keyring {}/{}: {}", service, account, e)))?;
            match entry.get_password() {
                Ok(password) => Ok(Some(password)),
                Err(keyring::Error::NoEntry) => Err(Error::credential(format!(
                    "no keyring entry for {}/{}",
                    service, account
                ))),
                Err(e) => Err(Error::credential(format!("keyring {}/{}: {}", service, account, e))),
            }
        }
    }
}

/// Stores a secret under `service/account`, for `ai-router` setup commands.
pub fn store(service: &str, account: &str, secret: &str) -> Result<()> {
    let entry = Entry::new(service, account)
        .map_err(|e| Error::credential(format!("keyring {}/{}: {}", service, account, e)))?;
    entry
        .set_password(secret)
        .map_err(|e| Error::credential(format!("keyring {}/{}: {}", service, account, e)))
}
