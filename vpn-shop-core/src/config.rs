//! Shop configuration.
//!
//! The worker reads one TOML file. Secrets never appear in it: every
//! credential is referenced by the name of the environment variable holding
//! it and resolved with [`resolve_env`] when clients are built.
//!
//! ```toml
//! claim_lease_secs = 300
//! traffic_limit_bytes = 0
//!
//! [panel]
//! url = "https://panel.example.com"
//! token_env = "PANEL_TOKEN"
//!
//! [providers.crypto]
//! enabled = true
//! url = "https://pay.crypt.bot"
//! token_env = "CRYPTO_PAY_TOKEN"
//!
//! [[plans]]
//! months = 1
//! price = 150
//! stars_price = 100
//! ```

use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    error::{Result, ShopError},
    payment::{CompletionSettings, PlanCatalog},
    purchase::Provider,
    reconcile::PollSettings,
    transport::{HttpConfig, parse_base_url},
};

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShopConfig {
    /// Environment variable holding the Postgres URL.
    #[serde(default = "default_database_url_env")]
    pub database_url_env: String,

    /// Monthly traffic limit set on provisioned accounts; 0 is unlimited.
    #[serde(default)]
    pub traffic_limit_bytes: i64,

    /// Seconds a completion claim stays exclusive.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,

    /// Fiat currency of crypto, card and balance purchases.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Shared HTTP client settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// VPN panel connection.
    pub panel: PanelConfig,

    /// Income reporting; disabled when absent.
    #[serde(default)]
    pub tax: Option<TaxConfig>,

    /// Payment providers.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Plan prices.
    #[serde(default)]
    pub plans: PlanCatalog,
}

fn default_database_url_env() -> String {
    "DATABASE_URL".to_owned()
}

const fn default_claim_lease_secs() -> u64 {
    300
}

fn default_currency() -> String {
    "RUB".to_owned()
}

/// VPN panel connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanelConfig {
    /// Panel base URL.
    pub url: String,
    /// Environment variable holding the API token.
    pub token_env: String,
}

/// Tax service connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaxConfig {
    /// API base URL, e.g. `https://lknpd.nalog.ru/api/v1`.
    pub url: String,
    /// Environment variable holding the taxpayer login.
    pub username_env: String,
    /// Environment variable holding the password.
    pub password_env: String,
}

/// Per-provider sections; a missing section disables the provider.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
    /// Crypto invoices.
    pub crypto: Option<CryptoConfig>,
    /// Card payments.
    pub card: Option<CardConfig>,
    /// In-bot stars payments.
    pub stars: Option<StarsConfig>,
}

/// Reconciliation loop timing shared by pollable providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    /// Seconds between run starts.
    pub interval_secs: u64,
    /// Upper bound on one run, in seconds.
    pub run_timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_secs: 5, run_timeout_secs: 120 }
    }
}

impl PollConfig {
    /// Loop timing for the scheduler.
    #[must_use]
    pub const fn settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.interval_secs),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
        }
    }

    fn validate(&self, provider: Provider) -> Result<()> {
        if self.interval_secs == 0 || self.run_timeout_secs == 0 {
            return Err(ShopError::Config(format!(
                "providers.{provider}.poll: interval_secs and run_timeout_secs must be positive"
            )));
        }
        Ok(())
    }
}

const fn enabled() -> bool {
    true
}

/// Crypto provider section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CryptoConfig {
    /// Whether invoices are created and polled.
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// API base URL.
    pub url: String,
    /// Environment variable holding the API token.
    pub token_env: String,
    /// Reconciliation timing.
    #[serde(default)]
    pub poll: PollConfig,
}

/// Card gateway section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CardConfig {
    /// Whether payments are created and polled.
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// API base URL.
    pub url: String,
    /// Environment variable holding the shop id.
    pub shop_id_env: String,
    /// Environment variable holding the secret key.
    pub secret_key_env: String,
    /// Where the customer lands after paying.
    pub return_url: String,
    /// Reconciliation timing.
    #[serde(default)]
    pub poll: PollConfig,
}

/// Stars section. Stars payments are confirmed by callback, never polled.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StarsConfig {
    /// Whether invoices are created.
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Bot API base URL.
    pub url: String,
    /// Environment variable holding the bot token.
    pub bot_token_env: String,
}

impl ShopConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] for syntax errors, unknown keys and
    /// values rejected by [`validate`](Self::validate).
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] when the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ShopError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    /// Checks URLs, variable names, timings and plans.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        validate_env_var_name(&self.database_url_env)?;
        if self.traffic_limit_bytes < 0 {
            return Err(ShopError::Config("traffic_limit_bytes must not be negative".to_owned()));
        }
        if self.claim_lease_secs == 0 {
            return Err(ShopError::Config("claim_lease_secs must be positive".to_owned()));
        }
        if self.currency.trim().is_empty() {
            return Err(ShopError::Config("currency cannot be empty".to_owned()));
        }
        self.http.validate()?;

        parse_base_url(&self.panel.url)?;
        validate_env_var_name(&self.panel.token_env)?;

        if let Some(tax) = &self.tax {
            parse_base_url(&tax.url)?;
            validate_env_var_name(&tax.username_env)?;
            validate_env_var_name(&tax.password_env)?;
        }

        if let Some(crypto) = &self.providers.crypto {
            parse_base_url(&crypto.url)?;
            validate_env_var_name(&crypto.token_env)?;
            crypto.poll.validate(Provider::Crypto)?;
        }
        if let Some(card) = &self.providers.card {
            parse_base_url(&card.url)?;
            parse_base_url(&card.return_url)?;
            validate_env_var_name(&card.shop_id_env)?;
            validate_env_var_name(&card.secret_key_env)?;
            card.poll.validate(Provider::Card)?;
        }
        if let Some(stars) = &self.providers.stars {
            parse_base_url(&stars.url)?;
            validate_env_var_name(&stars.bot_token_env)?;
        }

        self.plans.validate()
    }

    /// Completion knobs derived from this configuration.
    #[must_use]
    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            traffic_limit_bytes: self.traffic_limit_bytes,
            claim_lease: Duration::from_secs(self.claim_lease_secs),
            currency: self.currency.clone(),
        }
    }

    /// Enabled pollable providers with their loop timing.
    #[must_use]
    pub fn poll_targets(&self) -> Vec<(Provider, PollSettings)> {
        let crypto = self
            .providers
            .crypto
            .as_ref()
            .filter(|c| c.enabled)
            .map(|c| (Provider::Crypto, c.poll.settings()));
        let card = self
            .providers
            .card
            .as_ref()
            .filter(|c| c.enabled)
            .map(|c| (Provider::Card, c.poll.settings()));
        crypto.into_iter().chain(card).collect()
    }
}

/// Reads a secret from the environment.
///
/// # Errors
///
/// Returns [`ShopError::Config`] when the variable is unset, empty or not
/// valid unicode.
pub fn resolve_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) => Err(ShopError::Config(format!("environment variable {name} is empty"))),
        Err(e) => Err(ShopError::Config(format!("environment variable {name}: {e}"))),
    }
}

/// Validates an environment variable name.
fn validate_env_var_name(name: &str) -> Result<()> {
    let Some(first) = name.chars().next() else {
        return Err(ShopError::Config("environment variable name cannot be empty".to_owned()));
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(ShopError::Config(format!(
            "environment variable name must start with letter or underscore: {name}"
        )));
    }
    if let Some(ch) = name.chars().find(|ch| !ch.is_ascii_alphanumeric() && *ch != '_') {
        return Err(ShopError::Config(format!(
            "environment variable name contains invalid character '{ch}': {name}"
        )));
    }
    Ok(())
}
