use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub mod catalog;

/// Retention can never be configured below this.
pub const MIN_RETENTION_HOURS: u64 = 24;
/// Upper bound on how long a mutation may sit unflushed.
pub const MAX_FLUSH_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_PAYSTACK_BASE_URL: &str = "https://api.paystack.co";
pub const DEFAULT_HUBNET_BASE_URL: &str =
    "https://console.hubnet.app/live/api/context/business/transaction";

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub public_base_url: String,
    pub frontend_origin: Option<String>,
    pub admin_api_key: Option<String>,

    pub paystack_secret_key: String,
    pub paystack_base_url: String,
    pub hubnet_api_key: String,
    pub hubnet_base_url: String,

    pub store_path: PathBuf,
    pub store_flush_interval: Duration,
    pub retention_hours: u64,
    pub retention_sweep_interval: Duration,

    pub payment_timeout: Duration,
    pub fulfillment_timeout: Duration,
    pub payment_max_retries: u32,
    pub fulfillment_max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_reset: Duration,
}

impl Config {
    /// Defaults for everything except the provider credentials.
    pub fn with_credentials(
        paystack_secret_key: impl Into<String>,
        hubnet_api_key: impl Into<String>,
    ) -> Self {
        Config {
            server_port: 3000,
            public_base_url: "http://localhost:3000".to_string(),
            frontend_origin: None,
            admin_api_key: None,
            paystack_secret_key: paystack_secret_key.into(),
            paystack_base_url: DEFAULT_PAYSTACK_BASE_URL.to_string(),
            hubnet_api_key: hubnet_api_key.into(),
            hubnet_base_url: DEFAULT_HUBNET_BASE_URL.to_string(),
            store_path: PathBuf::from("./data/transactions.json"),
            store_flush_interval: Duration::from_secs(5),
            retention_hours: 72,
            retention_sweep_interval: Duration::from_secs(3600),
            payment_timeout: Duration::from_secs(15),
            fulfillment_timeout: Duration::from_secs(45),
            payment_max_retries: 3,
            fulfillment_max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_millis(8000),
            breaker_failure_threshold: 5,
            breaker_reset: Duration::from_secs(30),
        }
    }

    pub fn from_env() -> Result<Self> {
        let config = Self::load(true)?;
        config.validate()?;
        Ok(config)
    }

    /// For the offline store commands, which never talk to a provider.
    pub fn from_env_offline() -> Result<Self> {
        let config = Self::load(false)?;
        config.validate_store()?;
        Ok(config)
    }

    fn load(require_credentials: bool) -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        let (paystack_secret_key, hubnet_api_key) = if require_credentials {
            (required("PAYSTACK_SECRET_KEY")?, required("HUBNET_API_KEY")?)
        } else {
            (
                optional("PAYSTACK_SECRET_KEY").unwrap_or_default(),
                optional("HUBNET_API_KEY").unwrap_or_default(),
            )
        };
        let mut config = Config::with_credentials(paystack_secret_key, hubnet_api_key);

        config.server_port = match env::var("PORT").or_else(|_| env::var("SERVER_PORT")) {
            Ok(port) => port.parse().context("PORT must be a valid port number")?,
            Err(_) => config.server_port,
        };
        config.public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", config.server_port));
        config.frontend_origin = optional("FRONTEND_ORIGIN");
        config.admin_api_key = optional("ADMIN_API_KEY");

        if let Some(url) = optional("PAYSTACK_BASE_URL") {
            config.paystack_base_url = url;
        }
        if let Some(url) = optional("HUBNET_BASE_URL") {
            config.hubnet_base_url = url;
        }
        if let Some(path) = optional("STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }

        config.store_flush_interval =
            Duration::from_secs(parsed("STORE_FLUSH_INTERVAL_SECS", 5u64)?);
        config.retention_hours = parsed("RETENTION_HOURS", config.retention_hours)?;
        config.retention_sweep_interval =
            Duration::from_secs(parsed("RETENTION_SWEEP_INTERVAL_SECS", 3600u64)?);
        config.payment_timeout = Duration::from_secs(parsed("PAYMENT_TIMEOUT_SECS", 15u64)?);
        config.fulfillment_timeout =
            Duration::from_secs(parsed("FULFILLMENT_TIMEOUT_SECS", 45u64)?);
        config.payment_max_retries = parsed("PAYMENT_MAX_RETRIES", config.payment_max_retries)?;
        config.fulfillment_max_retries =
            parsed("FULFILLMENT_MAX_RETRIES", config.fulfillment_max_retries)?;
        config.retry_base_delay = Duration::from_millis(parsed("RETRY_BASE_DELAY_MS", 500u64)?);
        config.retry_max_delay = Duration::from_millis(parsed("RETRY_MAX_DELAY_MS", 8000u64)?);
        config.breaker_failure_threshold =
            parsed("BREAKER_FAILURE_THRESHOLD", config.breaker_failure_threshold)?;
        config.breaker_reset = Duration::from_secs(parsed("BREAKER_RESET_SECS", 30u64)?);

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paystack_secret_key.trim().is_empty() {
            anyhow::bail!("PAYSTACK_SECRET_KEY is empty");
        }
        if self.hubnet_api_key.trim().is_empty() {
            anyhow::bail!("HUBNET_API_KEY is empty");
        }
        if self.server_port == 0 {
            anyhow::bail!("PORT must be greater than 0");
        }

        url::Url::parse(&self.public_base_url).context("PUBLIC_BASE_URL is not a valid URL")?;
        url::Url::parse(&self.paystack_base_url)
            .context("PAYSTACK_BASE_URL is not a valid URL")?;
        url::Url::parse(&self.hubnet_base_url).context("HUBNET_BASE_URL is not a valid URL")?;
        if let Some(origin) = &self.frontend_origin {
            url::Url::parse(origin).context("FRONTEND_ORIGIN is not a valid URL")?;
        }

        self.validate_store()?;
        if self.retry_base_delay > self.retry_max_delay {
            anyhow::bail!("RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_MS");
        }
        if self.breaker_failure_threshold == 0 {
            anyhow::bail!("BREAKER_FAILURE_THRESHOLD must be greater than 0");
        }

        Ok(())
    }

    /// The subset of [`Config::validate`] the store commands depend on.
    pub fn validate_store(&self) -> Result<()> {
        let flush_secs = self.store_flush_interval.as_secs();
        if flush_secs == 0 || flush_secs > MAX_FLUSH_INTERVAL_SECS {
            anyhow::bail!(
                "STORE_FLUSH_INTERVAL_SECS must be between 1 and {}",
                MAX_FLUSH_INTERVAL_SECS
            );
        }
        if self.retention_hours < MIN_RETENTION_HOURS {
            anyhow::bail!("RETENTION_HOURS must be at least {}", MIN_RETENTION_HOURS);
        }

        Ok(())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    /// Where the browser lands after the hosted checkout.
    pub fn payment_callback_url(&self) -> String {
        format!(
            "{}/api/payment-callback",
            self.public_base_url.trim_end_matches('/')
        )
    }

    pub fn fulfillment_webhook_url(&self) -> String {
        format!(
            "{}/api/webhooks/fulfillment",
            self.public_base_url.trim_end_matches('/')
        )
    }

    /// Base for the static result pages the browser is redirected to.
    pub fn frontend_base_url(&self) -> &str {
        self.frontend_origin
            .as_deref()
            .unwrap_or(&self.public_base_url)
            .trim_end_matches('/')
    }
}

fn required(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("{} must be set", name))?;
    if value.trim().is_empty() {
        anyhow::bail!("{} must not be empty", name);
    }
    Ok(value)
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}
