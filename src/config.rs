use crate::error::AppError;
use crate::orders::intake::ExpiryPolicy;
use crate::orders::lifecycle::{DEFAULT_AUTO_READY_GRACE_MS, MAX_AUTO_READY_GRACE_MS};
use crate::orders::poll::DEFAULT_POLL_INTERVAL_MS;
use crate::realtime::channel::{
    ChannelConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_ERROR_LOG_WINDOW_MS,
    DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_RECONNECT_MAX_DELAY_MS,
};
use crate::realtime::endpoint::{DeploymentContext, PageContext, DEFAULT_CHANNEL_PATH};
use reqwest::Url;
use serde::Deserialize;
use std::str::FromStr;

pub const DEFAULT_STATUS_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_AUTO_READY_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_COUNTDOWN_TICK_MS: u64 = 1_000;
pub const DEFAULT_DECISION_WINDOW_SECS: u64 = 240;
pub const DEFAULT_PAGE_HOSTNAME: &str = "localhost";
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;
pub const MIN_STATUS_POLL_INTERVAL_MS: u64 = 1_000;
pub const MAX_STATUS_POLL_INTERVAL_MS: u64 = 120_000;
pub const MIN_AUTO_READY_INTERVAL_MS: u64 = 500;
pub const MAX_AUTO_READY_INTERVAL_MS: u64 = 30_000;
pub const MIN_DECISION_WINDOW_SECS: u64 = 30;
pub const MAX_DECISION_WINDOW_SECS: u64 = 1_800;
pub const MIN_RECONNECT_MAX_DELAY_MS: u64 = 1_000;
pub const MAX_RECONNECT_MAX_DELAY_MS: u64 = 60_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 1_000;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 120_000;

const ENV_PREFIX: &str = "INTAKE_";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartIntakeArgs {
    pub api_base_url: Option<String>,
    pub auth_token: Option<String>,
    pub channel_base_url: Option<String>,
    pub channel_path: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub status_poll_interval_ms: Option<u64>,
    pub auto_ready_interval_ms: Option<u64>,
    pub countdown_tick_ms: Option<u64>,
    pub decision_window_secs: Option<u64>,
    pub auto_ready_grace_ms: Option<i64>,
    pub reconnect_base_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub error_log_window_ms: Option<u64>,
    pub deployment: Option<String>,
    pub page_hostname: Option<String>,
    pub page_https: Option<bool>,
    pub expiry_policy: Option<String>,
    pub muted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntakeConfig {
    pub api_base_url: Url,
    pub auth_token: Option<String>,
    pub channel: ChannelConfig,
    pub poll_interval_ms: u64,
    pub status_poll_interval_ms: u64,
    pub auto_ready_interval_ms: u64,
    pub countdown_tick_ms: u64,
    pub decision_window_ms: i64,
    pub auto_ready_grace_ms: i64,
    pub expiry_policy: ExpiryPolicy,
    pub muted: bool,
}

impl StartIntakeArgs {
    /// Reads every field from `INTAKE_*` variables, e.g. `INTAKE_API_BASE_URL`.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let text = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Ok(Self {
            api_base_url: text("API_BASE_URL"),
            auth_token: text("AUTH_TOKEN"),
            channel_base_url: text("CHANNEL_BASE_URL"),
            channel_path: text("CHANNEL_PATH"),
            poll_interval_ms: parse_env_value("POLL_INTERVAL_MS", text("POLL_INTERVAL_MS"))?,
            status_poll_interval_ms: parse_env_value(
                "STATUS_POLL_INTERVAL_MS",
                text("STATUS_POLL_INTERVAL_MS"),
            )?,
            auto_ready_interval_ms: parse_env_value(
                "AUTO_READY_INTERVAL_MS",
                text("AUTO_READY_INTERVAL_MS"),
            )?,
            countdown_tick_ms: parse_env_value("COUNTDOWN_TICK_MS", text("COUNTDOWN_TICK_MS"))?,
            decision_window_secs: parse_env_value(
                "DECISION_WINDOW_SECS",
                text("DECISION_WINDOW_SECS"),
            )?,
            auto_ready_grace_ms: parse_env_value(
                "AUTO_READY_GRACE_MS",
                text("AUTO_READY_GRACE_MS"),
            )?,
            reconnect_base_delay_ms: parse_env_value(
                "RECONNECT_BASE_DELAY_MS",
                text("RECONNECT_BASE_DELAY_MS"),
            )?,
            reconnect_max_delay_ms: parse_env_value(
                "RECONNECT_MAX_DELAY_MS",
                text("RECONNECT_MAX_DELAY_MS"),
            )?,
            connect_timeout_ms: parse_env_value("CONNECT_TIMEOUT_MS", text("CONNECT_TIMEOUT_MS"))?,
            error_log_window_ms: parse_env_value(
                "ERROR_LOG_WINDOW_MS",
                text("ERROR_LOG_WINDOW_MS"),
            )?,
            deployment: text("DEPLOYMENT"),
            page_hostname: text("PAGE_HOSTNAME"),
            page_https: parse_env_value("PAGE_HTTPS", text("PAGE_HTTPS"))?,
            expiry_policy: text("EXPIRY_POLICY"),
            muted: parse_env_value("MUTED", text("MUTED"))?,
        })
    }

    pub fn normalize(self) -> Result<IntakeConfig, AppError> {
        let api_base_url = self.api_base_url.ok_or_else(|| {
            AppError::InvalidArgument("apiBaseUrl is required".to_string())
        })?;
        let api_base_url = Url::parse(api_base_url.trim()).map_err(|error| {
            AppError::InvalidArgument(format!("apiBaseUrl is not a valid url: {error}"))
        })?;
        if !matches!(api_base_url.scheme(), "http" | "https") {
            return Err(AppError::InvalidArgument(
                "apiBaseUrl must use http or https".to_string(),
            ));
        }

        let auth_token = self
            .auth_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        // Channel address problems are reported by the channel itself as a
        // blocked state, so it is passed through unvalidated.
        let channel_base_address = self
            .channel_base_url
            .map(|address| address.trim().to_string())
            .filter(|address| !address.is_empty())
            .unwrap_or_else(|| api_base_url.as_str().to_string());
        let channel_path = self
            .channel_path
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .unwrap_or_else(|| DEFAULT_CHANNEL_PATH.to_string());

        let poll_interval_ms = within(
            "pollIntervalMs",
            self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            MIN_POLL_INTERVAL_MS,
            MAX_POLL_INTERVAL_MS,
        )?;
        let status_poll_interval_ms = within(
            "statusPollIntervalMs",
            self.status_poll_interval_ms
                .unwrap_or(DEFAULT_STATUS_POLL_INTERVAL_MS),
            MIN_STATUS_POLL_INTERVAL_MS,
            MAX_STATUS_POLL_INTERVAL_MS,
        )?;
        let auto_ready_interval_ms = within(
            "autoReadyIntervalMs",
            self.auto_ready_interval_ms
                .unwrap_or(DEFAULT_AUTO_READY_INTERVAL_MS),
            MIN_AUTO_READY_INTERVAL_MS,
            MAX_AUTO_READY_INTERVAL_MS,
        )?;
        let countdown_tick_ms = self.countdown_tick_ms.unwrap_or(DEFAULT_COUNTDOWN_TICK_MS);
        if countdown_tick_ms == 0 {
            return Err(AppError::InvalidArgument(
                "countdownTickMs must be positive".to_string(),
            ));
        }
        let decision_window_secs = within(
            "decisionWindowSecs",
            self.decision_window_secs
                .unwrap_or(DEFAULT_DECISION_WINDOW_SECS),
            MIN_DECISION_WINDOW_SECS,
            MAX_DECISION_WINDOW_SECS,
        )?;
        let auto_ready_grace_ms = self
            .auto_ready_grace_ms
            .unwrap_or(DEFAULT_AUTO_READY_GRACE_MS);
        if !(0..=MAX_AUTO_READY_GRACE_MS).contains(&auto_ready_grace_ms) {
            return Err(AppError::InvalidArgument(format!(
                "autoReadyGraceMs must be between 0 and {MAX_AUTO_READY_GRACE_MS}"
            )));
        }

        let reconnect_max_delay_ms = within(
            "reconnectMaxDelayMs",
            self.reconnect_max_delay_ms
                .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS),
            MIN_RECONNECT_MAX_DELAY_MS,
            MAX_RECONNECT_MAX_DELAY_MS,
        )?;
        let reconnect_base_delay_ms = self
            .reconnect_base_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS);
        if reconnect_base_delay_ms == 0 || reconnect_base_delay_ms > reconnect_max_delay_ms {
            return Err(AppError::InvalidArgument(
                "reconnectBaseDelayMs must be positive and at most reconnectMaxDelayMs".to_string(),
            ));
        }
        let connect_timeout_ms = within(
            "connectTimeoutMs",
            self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            MIN_CONNECT_TIMEOUT_MS,
            MAX_CONNECT_TIMEOUT_MS,
        )?;
        let error_log_window_ms = self
            .error_log_window_ms
            .unwrap_or(DEFAULT_ERROR_LOG_WINDOW_MS);

        let deployment = match DeploymentContext::parse_flag(self.deployment.as_deref().unwrap_or(""))? {
            Some(deployment) => deployment,
            None => DeploymentContext::Detect(PageContext::new(
                self.page_hostname
                    .unwrap_or_else(|| DEFAULT_PAGE_HOSTNAME.to_string()),
                self.page_https.unwrap_or(false),
            )),
        };
        let expiry_policy = match self.expiry_policy.as_deref() {
            Some(raw) => ExpiryPolicy::parse_str(raw)?,
            None => ExpiryPolicy::default(),
        };

        Ok(IntakeConfig {
            api_base_url,
            auth_token,
            channel: ChannelConfig {
                base_address: channel_base_address,
                channel_path,
                deployment,
                connect_timeout_ms,
                reconnect_base_delay_ms,
                reconnect_max_delay_ms,
                error_log_window_ms,
            },
            poll_interval_ms,
            status_poll_interval_ms,
            auto_ready_interval_ms,
            countdown_tick_ms,
            decision_window_ms: (decision_window_secs * 1_000) as i64,
            auto_ready_grace_ms,
            expiry_policy,
            muted: self.muted.unwrap_or(false),
        })
    }
}

impl IntakeConfig {
    pub fn from_env() -> Result<Self, AppError> {
        StartIntakeArgs::from_env()?.normalize()
    }
}

fn within(field: &str, value: u64, min: u64, max: u64) -> Result<u64, AppError> {
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{field} must be between {min} and {max}"
        )));
    }
    Ok(value)
}

fn parse_env_value<T: FromStr>(name: &str, raw: Option<String>) -> Result<Option<T>, AppError> {
    raw.map(|raw| {
        raw.parse::<T>().map_err(|_| {
            AppError::InvalidArgument(format!("{ENV_PREFIX}{name} has invalid value '{raw}'"))
        })
    })
    .transpose()
}
