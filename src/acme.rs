//! Certificate-authority issuance over ACME with HTTP-01 challenges
//!
//! Pending challenge tokens live in a [`ChallengeStore`] that the plain-HTTP
//! listener answers from at `/.well-known/acme-challenge/{token}`.

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{Certificate, CertificateParams, DistinguishedName};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::persist::write_atomic;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 30;

/// HTTP-01 token to key-authorization map
#[derive(Default)]
pub struct ChallengeStore {
    tokens: DashMap<String, String>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, key_authorization: &str) {
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.clone())
    }

    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Persisted account, tagged with the directory it belongs to
#[derive(Serialize, Deserialize)]
struct StoredAccount {
    directory_url: String,
    credentials: serde_json::Value,
}

pub struct AcmeIssuer {
    directory_url: String,
    email: Option<String>,
    account_path: PathBuf,
    account: TokioMutex<Option<Account>>,
    challenges: Arc<ChallengeStore>,
}

impl AcmeIssuer {
    pub fn new(
        directory_url: &str,
        email: Option<String>,
        account_path: PathBuf,
        challenges: Arc<ChallengeStore>,
    ) -> Self {
        Self {
            directory_url: directory_url.to_string(),
            email,
            account_path,
            account: TokioMutex::new(None),
            challenges,
        }
    }

    /// Run a full order for `domain`; returns (certificate chain PEM, key PEM).
    /// Orders are serialized per process.
    pub async fn issue(&self, domain: &str) -> Result<(String, String)> {
        let mut guard = self.account.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_or_create_account().await?);
        }
        let account = guard
            .as_ref()
            .ok_or_else(|| anyhow!("ACME account unavailable"))?;

        info!(domain = %domain, directory = %self.directory_url, "Requesting certificate from ACME");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(domain.to_string())],
            })
            .await
            .context("Failed to create ACME order")?;

        let authorizations = order.authorizations().await?;
        let mut tokens = Vec::new();

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                ref status => {
                    return Err(anyhow!("Unexpected authorization status for {}: {:?}", domain, status));
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow!("No HTTP-01 challenge offered for {}", domain))?;

            let key_auth = order.key_authorization(challenge);
            self.challenges.insert(&challenge.token, key_auth.as_str());
            tokens.push(challenge.token.clone());

            debug!(domain = %domain, token = %challenge.token, "HTTP-01 challenge published");
            order.set_challenge_ready(&challenge.url).await?;
        }

        let result = self.finish_order(domain, &mut order).await;

        for token in tokens {
            self.challenges.remove(&token);
        }

        result
    }

    async fn finish_order(&self, domain: &str, order: &mut instant_acme::Order) -> Result<(String, String)> {
        let mut polls = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(anyhow!("ACME order became invalid for {}", domain));
                }
                _ => {
                    polls += 1;
                    if polls > MAX_POLLS {
                        return Err(anyhow!("ACME order timed out for {}", domain));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![domain.to_string()]);
        params.distinguished_name = DistinguishedName::new();
        let csr_key = Certificate::from_params(params)?;
        let csr_der = csr_key.serialize_request_der()?;

        order.finalize(&csr_der).await?;

        let mut polls = 0;
        let chain = loop {
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(chain) = order.certificate().await? {
                        break chain;
                    }
                }
                OrderStatus::Invalid => {
                    return Err(anyhow!("ACME order invalid after finalize for {}", domain));
                }
                _ => {}
            }
            polls += 1;
            if polls > MAX_POLLS {
                return Err(anyhow!("Certificate issuance timed out for {}", domain));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;
        };

        info!(domain = %domain, "Certificate issued by ACME");
        Ok((chain, csr_key.serialize_private_key_pem()))
    }

    async fn load_or_create_account(&self) -> Result<Account> {
        if let Ok(raw) = std::fs::read_to_string(&self.account_path) {
            match serde_json::from_str::<StoredAccount>(&raw) {
                Ok(stored) if stored.directory_url == self.directory_url => {
                    let credentials: AccountCredentials = serde_json::from_value(stored.credentials)?;
                    info!(path = %self.account_path.display(), "Loaded ACME account");
                    return Ok(Account::from_credentials(credentials).await?);
                }
                Ok(_) => warn!("Stored ACME account is for another directory, creating a new one"),
                Err(e) => warn!(error = %e, "Unreadable ACME account file, creating a new one"),
            }
        }

        let contact: Vec<String> = self
            .email
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact_refs: Vec<&str> = contact.iter().map(|c| c.as_str()).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .context("Failed to create ACME account")?;

        let stored = StoredAccount {
            directory_url: self.directory_url.clone(),
            credentials: serde_json::to_value(&credentials)?,
        };
        write_atomic(&self.account_path, &serde_json::to_vec_pretty(&stored)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.account_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(directory = %self.directory_url, "Created ACME account");
        Ok(account)
    }
}
