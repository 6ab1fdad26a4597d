use std::path::Path;
use std::sync::Arc;

use russh::keys::agent::client::AgentClient;
use russh::keys::{Error as KeyError, PrivateKey, PublicKey, load_secret_key};
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no usable credentials: agent has no identities and the key file is unusable")]
    NoUsableCredentials,
}

/// Signing identities resolved for a single connection attempt. Never cached:
/// the tunnel manager resolves afresh on every connect and reconnect.
pub struct Credentials {
    /// Open agent connection, kept for signing during authentication
    pub agent: Option<AgentClient<UnixStream>>,
    /// Identities held by the agent, tried first
    pub agent_keys: Vec<PublicKey>,
    /// Key-file identity, tried after the agent ones
    pub key: Option<Arc<PrivateKey>>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.agent_keys.is_empty() && self.key.is_none()
    }
}

/// Resolve usable SSH identities: query the agent, then parse the key file,
/// prompting once for a passphrase if the key is encrypted and none is
/// configured.
///
/// Only ever called from the tunnel manager's connect sequence, which is
/// serialized, so the blocking prompt cannot race with itself.
pub async fn resolve(
    key_path: &Path,
    passphrase: Option<&str>,
) -> Result<Credentials, CredentialError> {
    let (agent, agent_keys) = query_agent().await;
    let key = load_key_file(key_path, passphrase, prompt_passphrase).await;

    let credentials = Credentials {
        agent,
        agent_keys,
        key,
    };

    if credentials.is_empty() {
        return Err(CredentialError::NoUsableCredentials);
    }
    Ok(credentials)
}

/// Ask a running SSH agent for its identities. Agent absence is normal and
/// just moves resolution on to the key file.
async fn query_agent() -> (Option<AgentClient<UnixStream>>, Vec<PublicKey>) {
    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(_) => return (None, Vec::new()),
    };

    match agent.request_identities().await {
        Ok(keys) if !keys.is_empty() => {
            println!("[auth] agent offered {} identity(ies)", keys.len());
            (Some(agent), keys)
        }
        Ok(_) => (None, Vec::new()),
        Err(e) => {
            eprintln!("[auth] agent query failed: {}", e);
            (None, Vec::new())
        }
    }
}

/// Parse the key file, decrypting with the configured passphrase or a single
/// interactive prompt. Returns None when no identity could be produced.
async fn load_key_file<F>(
    key_path: &Path,
    passphrase: Option<&str>,
    prompt: F,
) -> Option<Arc<PrivateKey>>
where
    F: FnOnce() -> std::io::Result<String> + Send + 'static,
{
    match load_secret_key(key_path, None) {
        Ok(key) => {
            println!("[auth] loaded key file {}", key_path.display());
            return Some(Arc::new(key));
        }
        Err(KeyError::KeyIsEncrypted) => {
            println!("[auth] key file is passphrase protected");
        }
        Err(e) => {
            eprintln!("[auth] could not load key {}: {}", key_path.display(), e);
            return None;
        }
    }

    // Encrypted key: configured passphrase wins, otherwise prompt exactly
    // once on the blocking pool. A wrong secret is not retried.
    let secret = match passphrase {
        Some(secret) => secret.to_string(),
        None => match tokio::task::spawn_blocking(prompt).await {
            Ok(Ok(secret)) => secret,
            Ok(Err(e)) => {
                eprintln!("[auth] failed to read passphrase: {}", e);
                return None;
            }
            Err(e) => {
                eprintln!("[auth] passphrase prompt aborted: {}", e);
                return None;
            }
        },
    };

    match load_secret_key(key_path, Some(&secret)) {
        Ok(key) => {
            println!("[auth] decrypted key file {}", key_path.display());
            Some(Arc::new(key))
        }
        Err(e) => {
            eprintln!(
                "[auth] failed to decrypt key {}: {}",
                key_path.display(),
                e
            );
            None
        }
    }
}

fn prompt_passphrase() -> std::io::Result<String> {
    rpassword::prompt_password("Enter SSH key passphrase: ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static PROMPTS: AtomicUsize = AtomicUsize::new(0);

    fn counting_prompt() -> std::io::Result<String> {
        PROMPTS.fetch_add(1, Ordering::SeqCst);
        Ok("wrong".to_string())
    }

    #[tokio::test]
    async fn test_missing_key_file_yields_nothing() {
        let key = load_key_file(Path::new("/nonexistent/id_rsa"), None, counting_prompt).await;
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn test_garbage_key_file_does_not_prompt() {
        let before = PROMPTS.load(Ordering::SeqCst);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not a private key").unwrap();

        let key = load_key_file(file.path(), None, counting_prompt).await;
        assert!(key.is_none());
        // Unparseable (rather than encrypted) keys must not trigger a prompt
        assert_eq!(PROMPTS.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_empty_credentials() {
        let credentials = Credentials {
            agent: None,
            agent_keys: Vec::new(),
            key: None,
        };
        assert!(credentials.is_empty());
    }
}
