//! Process configuration read from the environment.

use std::{collections::HashMap, str::FromStr};

use secrecy::SecretString;
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://postboard.db?mode=rwc";
pub const DEFAULT_PORT: u16 = 3000;
pub const MIN_SECRET_LEN: usize = 32;
const DEV_AUTH_SECRET: &str = "postboard-development-secret-not-for-production";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AppEnv {
    #[default]
    Development,
    Test,
    Production,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub auth_secret: SecretString,
    pub app_url: Url,
    pub app_env: AppEnv,
    pub host: String,
    pub port: u16,
    pub anthropic_api_key: Option<SecretString>,
    pub sentry_dsn: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_map(vars: &HashMap<&str, &str>) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| vars.get(name).map(|value| value.to_string()))
    }

    /// Build from any variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let skip_validation = var("SKIP_ENV_VALIDATION")
            .is_some_and(|value| !matches!(value.as_str(), "0" | "false"));

        let app_env = match var("APP_ENV") {
            Some(value) => AppEnv::from_str(&value).map_err(|_| ConfigError::Invalid {
                name: "APP_ENV",
                reason: format!("expected development, test or production, got {value:?}"),
            })?,
            None => AppEnv::default(),
        };
        let lenient = skip_validation || app_env == AppEnv::Development;

        let auth_secret = match var("AUTH_SECRET") {
            Some(secret) if secret.len() >= MIN_SECRET_LEN || lenient => secret,
            Some(_) => {
                return Err(ConfigError::Invalid {
                    name: "AUTH_SECRET",
                    reason: format!("must be at least {MIN_SECRET_LEN} characters"),
                });
            }
            None if lenient => {
                warn!("AUTH_SECRET is not set; using the development secret");
                DEV_AUTH_SECRET.to_string()
            }
            None => return Err(ConfigError::Missing("AUTH_SECRET")),
        };

        let port = match var("PORT") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                reason: format!("{value:?} is not a port number"),
            })?,
            None => DEFAULT_PORT,
        };
        let host = var("HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let app_url = match var("APP_URL") {
            Some(value) => match Url::parse(&value) {
                Ok(url) => url,
                Err(e) if !skip_validation => {
                    return Err(ConfigError::Invalid {
                        name: "APP_URL",
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring invalid APP_URL");
                    default_app_url(port)?
                }
            },
            None => default_app_url(port)?,
        };

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            auth_secret: SecretString::from(auth_secret),
            app_url,
            app_env,
            host,
            port,
            anthropic_api_key: var("ANTHROPIC_API_KEY").map(SecretString::from),
            sentry_dsn: var("SENTRY_DSN"),
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env == AppEnv::Production
    }

    /// Cookies carry `Secure` whenever the app is served over https.
    pub fn secure_cookies(&self) -> bool {
        self.app_url.scheme() == "https"
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_app_url(port: u16) -> Result<Url, ConfigError> {
    Url::parse(&format!("http://localhost:{port}")).map_err(|e| ConfigError::Invalid {
        name: "APP_URL",
        reason: e.to_string(),
    })
}
