use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("HTTP {status} from {endpoint}: {message}")]
    HttpStatusError {
        status: u16,
        endpoint: String,
        message: String,
    },

    #[error("Authentication failed: {message}")]
    AuthError { message: String },

    #[error("Permission denied: {message}")]
    PermissionError { message: String },

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Real-time channel error: {message}")]
    ChannelError { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV export error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Session error: {message}")]
    SessionError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration field '{field}' is missing")]
    MissingConfigError { field: String },

    #[error("Configuration field '{field}' failed validation: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

pub type Result<T> = std::result::Result<T, PortalError>;

/// 錯誤分類，僅用於決定要顯示給使用者的提示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Auth,
    Validation,
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// CLI 結束代碼；任何錯誤都不回傳 0
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorSeverity::Low | ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Warning,
    Error,
}

/// 使用者可見的通知內容
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub level: ToastLevel,
    pub title: String,
    pub message: String,
}

impl PortalError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PortalError::ApiError(e) => match e.status() {
                Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                    ErrorCategory::Auth
                }
                Some(status) if status.is_client_error() => ErrorCategory::Validation,
                _ => ErrorCategory::Network,
            },
            PortalError::HttpStatusError { status, .. } => match status {
                401 | 403 => ErrorCategory::Auth,
                400 | 409 | 422 => ErrorCategory::Validation,
                s if *s >= 500 => ErrorCategory::Network,
                _ => ErrorCategory::Unexpected,
            },
            PortalError::WebSocketError(_) | PortalError::ChannelError { .. } => {
                ErrorCategory::Network
            }
            PortalError::AuthError { .. }
            | PortalError::PermissionError { .. }
            | PortalError::SessionError { .. } => ErrorCategory::Auth,
            PortalError::ValidationError { .. } => ErrorCategory::Validation,
            PortalError::IoError(_)
            | PortalError::SerializationError(_)
            | PortalError::CsvError(_)
            | PortalError::ConfigError { .. }
            | PortalError::MissingConfigError { .. }
            | PortalError::ConfigValidationError { .. }
            | PortalError::InvalidConfigValueError { .. } => ErrorCategory::Unexpected,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PortalError::ValidationError { .. } => ErrorSeverity::Low,
            PortalError::ApiError(_)
            | PortalError::HttpStatusError { .. }
            | PortalError::WebSocketError(_)
            | PortalError::ChannelError { .. } => ErrorSeverity::Medium,
            PortalError::AuthError { .. }
            | PortalError::PermissionError { .. }
            | PortalError::SessionError { .. }
            | PortalError::SerializationError(_)
            | PortalError::CsvError(_) => ErrorSeverity::High,
            PortalError::IoError(_)
            | PortalError::ConfigError { .. }
            | PortalError::MissingConfigError { .. }
            | PortalError::ConfigValidationError { .. }
            | PortalError::InvalidConfigValueError { .. } => ErrorSeverity::Critical,
        }
    }

    /// 僅傳輸層錯誤與 5xx 可以重試，4xx 一律不重試
    pub fn is_retryable(&self) -> bool {
        match self {
            PortalError::ApiError(e) => match e.status() {
                Some(status) => status.is_server_error(),
                None => e.is_connect() || e.is_timeout() || e.is_request(),
            },
            PortalError::HttpStatusError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Network => {
                "Unable to reach the server. Please check your connection.".to_string()
            }
            ErrorCategory::Auth => match self {
                PortalError::PermissionError { .. } => {
                    "You don't have permission to do that.".to_string()
                }
                PortalError::HttpStatusError { status: 403, .. } => {
                    "You don't have permission to do that.".to_string()
                }
                _ => "Your session has expired. Please sign in again.".to_string(),
            },
            ErrorCategory::Validation => self.validation_message(),
            ErrorCategory::Unexpected => {
                "An unexpected error occurred. Please try again.".to_string()
            }
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            PortalError::MissingConfigError { field }
            | PortalError::ConfigValidationError { field, .. }
            | PortalError::InvalidConfigValueError { field, .. } => {
                format!("Check the '{}' entry in your configuration file", field)
            }
            PortalError::ConfigError { .. } => {
                "Make sure the configuration file exists and is valid TOML".to_string()
            }
            PortalError::SessionError { .. } => {
                "Clear the session cookie and sign in again".to_string()
            }
            _ => match self.category() {
                ErrorCategory::Network => "Retry in a few moments".to_string(),
                ErrorCategory::Auth => "Sign in again or ask an administrator for access".to_string(),
                ErrorCategory::Validation => "Correct the highlighted fields and resubmit".to_string(),
                ErrorCategory::Unexpected => "Run with --verbose for details".to_string(),
            },
        }
    }

    pub fn to_toast(&self) -> Toast {
        let (level, title) = match self.category() {
            ErrorCategory::Network => (ToastLevel::Error, "Connection problem"),
            ErrorCategory::Auth => (ToastLevel::Error, "Not authorized"),
            ErrorCategory::Validation => (ToastLevel::Warning, "Please check your input"),
            ErrorCategory::Unexpected => (ToastLevel::Error, "Something went wrong"),
        };
        Toast {
            level,
            title: title.to_string(),
            message: self.user_friendly_message(),
        }
    }

    // 驗證錯誤的訊息原樣傳遞
    fn validation_message(&self) -> String {
        match self {
            PortalError::ValidationError { message } => message.clone(),
            PortalError::HttpStatusError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, message: &str) -> PortalError {
        PortalError::HttpStatusError {
            status,
            endpoint: "/clients".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_category_by_status() {
        assert_eq!(http(401, "").category(), ErrorCategory::Auth);
        assert_eq!(http(403, "").category(), ErrorCategory::Auth);
        assert_eq!(http(422, "").category(), ErrorCategory::Validation);
        assert_eq!(http(503, "").category(), ErrorCategory::Network);
        assert_eq!(http(404, "").category(), ErrorCategory::Unexpected);
    }

    #[test]
    fn test_validation_message_passes_through() {
        let err = http(422, "email is already registered");
        let toast = err.to_toast();
        assert_eq!(toast.level, ToastLevel::Warning);
        assert_eq!(toast.message, "email is already registered");

        let err = PortalError::ValidationError {
            message: "score must be between 0 and 100".to_string(),
        };
        assert_eq!(err.user_friendly_message(), "score must be between 0 and 100");
    }

    #[test]
    fn test_retryable_only_on_server_errors() {
        assert!(http(500, "").is_retryable());
        assert!(http(502, "").is_retryable());
        assert!(!http(400, "").is_retryable());
        assert!(!http(401, "").is_retryable());
        assert!(!PortalError::ValidationError { message: "x".into() }.is_retryable());
    }

    #[test]
    fn test_every_severity_exits_non_zero() {
        let validation = PortalError::ValidationError {
            message: "min-status must be a triage label".to_string(),
        };
        assert_eq!(validation.severity(), ErrorSeverity::Low);
        assert_eq!(validation.severity().exit_code(), 2);
        assert_eq!(http(503, "").severity().exit_code(), 2);
        assert_eq!(ErrorSeverity::High.exit_code(), 1);
        assert_eq!(ErrorSeverity::Critical.exit_code(), 3);
    }

    #[test]
    fn test_unexpected_toast() {
        let err = PortalError::ConfigError {
            message: "boom".to_string(),
        };
        let toast = err.to_toast();
        assert_eq!(toast.title, "Something went wrong");
        assert_eq!(
            toast.message,
            "An unexpected error occurred. Please try again."
        );
    }
}
