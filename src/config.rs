use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_API_BASE_URL: &str = "https://api.tekup.dk";
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
pub const DEFAULT_KEYRING_SERVICE: &str = "authflow";

/// Application directory name under the platform data dir
const APP_NAME: &str = "authflow";

/// Upper bound for TOKEN_REFRESH_THRESHOLD (one day)
pub const MAX_REFRESH_THRESHOLD_SECS: u64 = 24 * 3600;

/// Authenticated request pipeline CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// API base URL
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    pub base_url: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "API_TIMEOUT", default_value = "30")]
    pub timeout: u64,

    /// Secret storage backend (keyring, sqlite, memory)
    #[arg(short = 's', long, env = "AUTH_STORAGE", default_value = "keyring")]
    pub storage: String,

    /// Path to the SQLite secret database (sqlite backend only)
    #[arg(short = 'd', long, env = "AUTH_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the current session
    Status,

    /// Store an issued credential pair and sign in
    Login {
        /// Access token issued by the sign-in flow
        #[arg(long)]
        access_token: String,

        /// Refresh token; prompted for when omitted
        #[arg(long, env = "AUTH_REFRESH_TOKEN")]
        refresh_token: Option<String>,

        /// E-mail address of the signed-in user
        #[arg(long)]
        email: Option<String>,

        /// Access token lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,
    },

    /// Forget the stored credential
    Logout,

    /// Exchange the refresh token for a new access token now
    Refresh,

    /// Send an authenticated request and print the response
    Request {
        /// Path relative to the base URL
        path: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,

        /// Send even when signed out
        #[arg(long)]
        public: bool,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum StorageBackend {
    Keyring,
    Sqlite,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,
    pub refresh_path: String,

    // Timeouts
    pub request_timeout: u64,
    pub connect_timeout: u64,
    pub token_refresh_threshold: u64,

    // Secret storage
    pub storage_backend: StorageBackend,
    pub auth_db_file: PathBuf,
    pub keyring_service: String,

    // Logging
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout: 30,
            connect_timeout: 10,
            token_refresh_threshold: 300,
            storage_backend: StorageBackend::Keyring,
            auth_db_file: default_db_file(),
            keyring_service: DEFAULT_KEYRING_SERVICE.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let config = Self::from_args(&args)?;
        Ok((config, args.command))
    }

    /// Build configuration from parsed arguments plus env-only settings
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            api_base_url: args.base_url.clone(),

            refresh_path: std::env::var("AUTH_REFRESH_PATH").unwrap_or(defaults.refresh_path),

            request_timeout: args.timeout,

            connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.connect_timeout),

            token_refresh_threshold: std::env::var("TOKEN_REFRESH_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.token_refresh_threshold),

            storage_backend: parse_storage_backend(&args.storage)?,

            auth_db_file: args
                .db_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or(defaults.auth_db_file),

            keyring_service: std::env::var("KEYRING_SERVICE").unwrap_or(defaults.keyring_service),

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Configuration pointing at `base_url` with in-memory storage
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: base_url.into(),
            storage_backend: StorageBackend::Memory,
            ..Self::default()
        }
    }

    /// Full URL of the refresh endpoint
    pub fn refresh_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            self.refresh_path.trim_start_matches('/')
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;

        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_BASE_URL must use http or https: {}", self.api_base_url);
        }

        if self.request_timeout == 0 {
            anyhow::bail!("API_TIMEOUT must be greater than zero");
        }

        if self.token_refresh_threshold > MAX_REFRESH_THRESHOLD_SECS {
            anyhow::bail!(
                "TOKEN_REFRESH_THRESHOLD must be at most {} seconds, got {}",
                MAX_REFRESH_THRESHOLD_SECS,
                self.token_refresh_threshold
            );
        }

        if self.keyring_service.is_empty() {
            anyhow::bail!("KEYRING_SERVICE must not be empty");
        }

        Ok(())
    }
}

/// Default SQLite location: `<data dir>/authflow/auth.db`
fn default_db_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("auth.db")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse storage backend from string
fn parse_storage_backend(s: &str) -> Result<StorageBackend> {
    match s.to_lowercase().as_str() {
        "keyring" | "keychain" => Ok(StorageBackend::Keyring),
        "sqlite" => Ok(StorageBackend::Sqlite),
        "memory" => Ok(StorageBackend::Memory),
        other => anyhow::bail!(
            "Unknown AUTH_STORAGE backend '{}' (expected keyring, sqlite or memory)",
            other
        ),
    }
}
