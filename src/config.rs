//! Client configuration.

use std::time::Duration;

/// Default base URL for the workflow API when nothing else is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Environment variable overriding the base URL.
pub const ENV_BASE_URL: &str = "DOCSIGHT_API_URL";

/// Environment variable carrying the API key.
pub const ENV_API_KEY: &str = "DOCSIGHT_API_KEY";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`ChatClient`](crate::client::ChatClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the workflow API, without a trailing slash
    pub base_url: String,
    /// Bearer token sent on every request when set
    pub api_key: Option<String>,
    /// Timeout for establishing the connection. Streams themselves have no
    /// internal timeout; a connection that ends without a terminal event is
    /// reported as an error by the exchange controller.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration with the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            api_key: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the API key (builder pattern).
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the connect timeout (builder pattern).
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build a configuration from `DOCSIGHT_API_URL` / `DOCSIGHT_API_KEY`,
    /// falling back to [`DEFAULT_BASE_URL`].
    pub fn from_env() -> Self {
        let base_url =
            std::env::var(ENV_BASE_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(base_url);
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }
        config
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}
