use std::net::SocketAddr;
use std::time::Duration;

use crate::interpret::{InterpreterConfig, DEFAULT_MARKETPLACE, DEFAULT_TRACKING_ID};

// ── Defaults ─────────────────────────────────────────────────────────────────

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_MAX_IMAGES: usize = 5;
const DEFAULT_MAX_BODY_BYTES: usize = 25 * 1024 * 1024;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Service settings, read once at startup and handed to each component.
#[derive(Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub model: String,
    pub max_images: usize,
    pub max_body_bytes: usize,
    pub upstream_timeout: Duration,
    pub product_lookup: bool,
    pub interpreter: InterpreterConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr: SocketAddr = parse_var(
            "STYLESYNC_BIND",
            var("STYLESYNC_BIND"),
            DEFAULT_BIND.parse().ok(),
            "a socket address",
            |v| v.parse().ok(),
        )?;

        let max_images = parse_var(
            "STYLESYNC_MAX_IMAGES",
            var("STYLESYNC_MAX_IMAGES"),
            Some(DEFAULT_MAX_IMAGES),
            "a positive integer",
            |v| v.parse::<usize>().ok().filter(|n| *n > 0),
        )?;

        let max_body_bytes = parse_var(
            "STYLESYNC_MAX_BODY_BYTES",
            var("STYLESYNC_MAX_BODY_BYTES"),
            Some(DEFAULT_MAX_BODY_BYTES),
            "a positive integer",
            |v| v.parse::<usize>().ok().filter(|n| *n > 0),
        )?;

        let timeout_secs = parse_var(
            "STYLESYNC_UPSTREAM_TIMEOUT_SECS",
            var("STYLESYNC_UPSTREAM_TIMEOUT_SECS"),
            Some(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            "a positive integer",
            |v| v.parse::<u64>().ok().filter(|n| *n > 0),
        )?;

        let product_lookup = parse_var(
            "STYLESYNC_PRODUCT_LOOKUP",
            var("STYLESYNC_PRODUCT_LOOKUP"),
            Some(true),
            "a boolean",
            parse_bool,
        )?;

        let marketplace = var("STYLESYNC_MARKETPLACE").unwrap_or_else(|| DEFAULT_MARKETPLACE.into());
        let tracking_id =
            var("STYLESYNC_AFFILIATE_TAG").unwrap_or_else(|| DEFAULT_TRACKING_ID.into());

        Ok(Self {
            bind_addr,
            api_key: var("OPENAI_API_KEY"),
            api_base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            model: var("STYLESYNC_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            max_images,
            max_body_bytes,
            upstream_timeout: Duration::from_secs(timeout_secs),
            product_lookup,
            interpreter: InterpreterConfig::for_marketplace(&marketplace, &tracking_id),
        })
    }
}

fn parse_var<T>(
    name: &'static str,
    raw: Option<String>,
    default: Option<T>,
    expected: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    let invalid = |value: String| ConfigError::Invalid {
        name,
        expected,
        value,
    };
    match raw {
        Some(value) => parse(&value).ok_or_else(|| invalid(value)),
        None => default.ok_or_else(|| invalid(String::new())),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
