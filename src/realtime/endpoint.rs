//! Push endpoint derivation and the guard against shipping a build that points
//! a deployed client at a loopback address.

use crate::error::AppError;
use reqwest::Url;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHANNEL_PATH: &str = "/realtime";

const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "[::1]"];

/// Where the client itself is being served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    pub hostname: String,
    pub https: bool,
}

impl PageContext {
    pub fn new(hostname: impl Into<String>, https: bool) -> Self {
        Self {
            hostname: hostname.into(),
            https,
        }
    }

    /// Best-effort guess used only when no explicit deployment flag is set.
    /// IPv6 literals and dotless intranet names are treated as local.
    pub fn looks_deployed(&self) -> bool {
        let hostname = self.hostname.trim().to_ascii_lowercase();
        if hostname.is_empty() || is_loopback_host(&hostname) {
            return false;
        }
        if hostname.contains(':') || hostname.starts_with('[') {
            return false;
        }
        let private_lan = hostname.starts_with("192.168.") || hostname.starts_with("10.");
        self.https || (hostname.contains('.') && !private_lan)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentContext {
    Production,
    Development,
    Detect(PageContext),
}

impl DeploymentContext {
    pub fn is_deployed(&self) -> bool {
        match self {
            Self::Production => true,
            Self::Development => false,
            Self::Detect(page) => page.looks_deployed(),
        }
    }

    pub fn parse_flag(raw: &str) -> Result<Option<Self>, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "production" | "prod" | "true" => Ok(Some(Self::Production)),
            "development" | "dev" | "false" => Ok(Some(Self::Development)),
            other => Err(AppError::InvalidArgument(format!(
                "unknown deployment flag '{other}'"
            ))),
        }
    }
}

pub fn is_loopback_host(host: &str) -> bool {
    LOOPBACK_HOSTS
        .iter()
        .any(|loopback| host.eq_ignore_ascii_case(loopback))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoint {
    http_url: Url,
}

impl ChannelEndpoint {
    /// Derives the push endpoint from the configured base address and runs
    /// every validation rule. Any failure is a `ChannelBlocked` error.
    pub fn resolve(
        base_address: &str,
        channel_path: &str,
        deployment: &DeploymentContext,
    ) -> Result<Self, AppError> {
        let http_url = derive_endpoint(base_address, channel_path)?;
        validate_endpoint(&http_url, deployment)?;
        Ok(Self { http_url })
    }

    pub fn http_url(&self) -> &Url {
        &self.http_url
    }

    pub fn websocket_url(&self) -> Url {
        let mut websocket_url = self.http_url.clone();
        let scheme = if self.http_url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        // http <-> ws are both special schemes, so this cannot fail.
        let _ = websocket_url.set_scheme(scheme);
        websocket_url
    }
}

pub fn derive_endpoint(base_address: &str, channel_path: &str) -> Result<Url, AppError> {
    let base_address = base_address.trim();
    let mut endpoint = Url::parse(base_address).map_err(|error| {
        AppError::ChannelBlocked(format!(
            "push endpoint '{base_address}' is not a valid absolute url: {error}"
        ))
    })?;

    if !matches!(endpoint.scheme(), "http" | "https") {
        return Err(AppError::ChannelBlocked(format!(
            "push endpoint '{base_address}' must use http or https"
        )));
    }
    if endpoint.host_str().map_or(true, str::is_empty) {
        return Err(AppError::ChannelBlocked(format!(
            "push endpoint '{base_address}' has no host"
        )));
    }

    let path = channel_path.trim();
    if !path.is_empty() {
        endpoint.set_path(path);
    }
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    Ok(endpoint)
}

pub fn validate_endpoint(endpoint: &Url, deployment: &DeploymentContext) -> Result<(), AppError> {
    let host = endpoint.host_str().unwrap_or_default();
    if deployment.is_deployed() && is_loopback_host(host) {
        return Err(AppError::ChannelBlocked(format!(
            "deployed build points the push channel at {host} ({endpoint}); \
             set the channel base address at build time"
        )));
    }
    Ok(())
}
