use crate::core::channel::ChannelConfig;
use crate::core::triage::TriageThresholds;
use crate::domain::ports::ConfigProvider;
use crate::utils::error::{PortalError, Result};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    pub api: ApiConfig,
    pub realtime: RealtimeConfig,
    pub calendar: Option<CalendarConfig>,
    pub session: Option<SessionConfig>,
    pub triage: Option<TriageThresholds>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub tenant_id: Option<String>,
    pub token: Option<String>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    pub reconnect_base_delay_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub heartbeat_interval_secs: Option<u64>,
    pub event_buffer: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub base_url: Option<String>,
    pub calendar_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub cookie_name: Option<String>,
    pub secret: String,
    pub registration_intent_ttl_minutes: Option<i64>,
}

pub const DEFAULT_CALENDAR_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
pub const DEFAULT_COOKIE_NAME: &str = "coach_session";
const MIN_SESSION_SECRET_LEN: usize = 32;

impl PortalConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(PortalError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| PortalError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${SESSION_SECRET})，未設定的變數保持原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| PortalError::ConfigError {
            message: format!("invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_url("api.base_url", &self.api.base_url)?;
        validation::validate_ws_url("realtime.url", &self.realtime.url)?;

        if let Some(attempts) = self.realtime.max_reconnect_attempts {
            validation::validate_positive_number(
                "realtime.max_reconnect_attempts",
                attempts as u64,
                1,
            )?;
        }
        if let Some(secs) = self.realtime.heartbeat_interval_secs {
            validation::validate_positive_number("realtime.heartbeat_interval_secs", secs, 1)?;
        }
        if let Some(ms) = self.realtime.reconnect_base_delay_ms {
            validation::validate_positive_number("realtime.reconnect_base_delay_ms", ms, 1)?;
        }

        if let Some(calendar) = &self.calendar {
            if let Some(base_url) = &calendar.base_url {
                validation::validate_url("calendar.base_url", base_url)?;
            }
        }

        if let Some(session) = &self.session {
            if let Some(name) = &session.cookie_name {
                validation::validate_non_empty_string("session.cookie_name", name)?;
            }
            if session.secret.contains("${") || session.secret.len() < MIN_SESSION_SECRET_LEN {
                return Err(PortalError::InvalidConfigValueError {
                    field: "session.secret".to_string(),
                    value: "<redacted>".to_string(),
                    reason: format!(
                        "Secret must be at least {} characters",
                        MIN_SESSION_SECRET_LEN
                    ),
                });
            }
        }

        if let Some(triage) = &self.triage {
            validation::validate_range("triage.critical_score", triage.critical_score, 0.0, 100.0)?;
            validation::validate_range("triage.warning_score", triage.warning_score, 0.0, 100.0)?;
            if triage.critical_score > triage.warning_score {
                return Err(PortalError::ConfigValidationError {
                    field: "triage.critical_score".to_string(),
                    message: "critical_score must not exceed warning_score".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        let defaults = ChannelConfig::default();
        ChannelConfig {
            url: self.realtime.url.clone(),
            reconnect_base_delay: self
                .realtime
                .reconnect_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_base_delay),
            max_reconnect_attempts: self
                .realtime
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            heartbeat_interval: self
                .realtime
                .heartbeat_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            event_buffer: self.realtime.event_buffer.unwrap_or(defaults.event_buffer),
        }
    }

    pub fn triage_thresholds(&self) -> TriageThresholds {
        self.triage.unwrap_or_default()
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api.token.as_deref().filter(|t| !t.contains("${"))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.api.timeout_seconds.map(Duration::from_secs)
    }

    pub fn calendar_base_url(&self) -> &str {
        self.calendar
            .as_ref()
            .and_then(|c| c.base_url.as_deref())
            .unwrap_or(DEFAULT_CALENDAR_BASE_URL)
    }

    pub fn calendar_id(&self) -> &str {
        self.calendar
            .as_ref()
            .and_then(|c| c.calendar_id.as_deref())
            .unwrap_or("primary")
    }

    pub fn cookie_name(&self) -> &str {
        self.session
            .as_ref()
            .and_then(|s| s.cookie_name.as_deref())
            .unwrap_or(DEFAULT_COOKIE_NAME)
    }

    pub fn registration_intent_ttl(&self) -> chrono::Duration {
        let minutes = self
            .session
            .as_ref()
            .and_then(|s| s.registration_intent_ttl_minutes)
            .unwrap_or(30);
        chrono::Duration::minutes(minutes)
    }
}

impl ConfigProvider for PortalConfig {
    fn api_base_url(&self) -> &str {
        &self.api.base_url
    }

    fn tenant_id(&self) -> Option<&str> {
        self.api.tenant_id.as_deref()
    }

    fn retry_attempts(&self) -> u32 {
        self.api.retry_attempts.unwrap_or(3)
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.api.retry_delay_ms.unwrap_or(1000))
    }

    fn realtime_url(&self) -> &str {
        &self.realtime.url
    }
}

impl Validate for PortalConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
