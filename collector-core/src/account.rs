use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::load_toml;
use crate::error::{ConfigError, Result};

/// Seller account the collector logs in as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    pub platform: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default, skip_serializing)]
    pub credentials: BTreeMap<String, String>,
    /// Data domains this account may export. Domains absent from the map are allowed.
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
}

impl AccountProfile {
    pub fn supports(&self, domain: &str) -> bool {
        self.capabilities.get(domain).copied().unwrap_or(true)
    }

    /// Splits `domains` into (supported, rejected), preserving order.
    pub fn filter_domains(&self, domains: &[String]) -> (Vec<String>, Vec<String>) {
        domains
            .iter()
            .cloned()
            .partition(|domain| self.supports(domain))
    }

    /// Placeholder values exposed to components as `{{account.*}}`.
    pub fn template_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("account.id".to_string(), self.id.clone());
        params.insert("account.platform".to_string(), self.platform.clone());
        if let Some(label) = &self.label {
            params.insert("account.label".to_string(), label.clone());
        }
        for (key, value) in &self.credentials {
            params.insert(format!("account.{key}"), value.clone());
        }
        params
    }
}

pub trait AccountResolver: Send + Sync {
    fn resolve(&self, platform: &str, account_id: &str) -> Option<AccountProfile>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountBook {
    #[serde(default)]
    pub accounts: Vec<AccountProfile>,
}

impl AccountBook {
    /// Loads the account file, rejecting two entries for the same
    /// platform and id.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let book: Self = load_toml(path)?;
        let mut seen = BTreeSet::new();
        for account in &book.accounts {
            if !seen.insert((account.platform.as_str(), account.id.as_str())) {
                return Err(ConfigError::DuplicateAccount {
                    platform: account.platform.clone(),
                    id: account.id.clone(),
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(book)
    }

    pub fn find(&self, platform: &str, account_id: &str) -> Option<&AccountProfile> {
        self.accounts
            .iter()
            .find(|account| account.platform == platform && account.id == account_id)
    }
}

impl AccountResolver for AccountBook {
    fn resolve(&self, platform: &str, account_id: &str) -> Option<AccountProfile> {
        self.find(platform, account_id).cloned()
    }
}
