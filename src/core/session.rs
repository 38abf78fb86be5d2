//! Encrypted session cookie and the role gate in front of the dashboard and portal routes.
//!
//! Cookie value: `base64url(nonce || AES-256-GCM(json))`, key = SHA-256(secret).

use crate::domain::model::Role;
use crate::utils::error::{PortalError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationIntent {
    pub role: Role,
    pub tenant_slug: Option<String>,
    pub plan: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RegistrationIntent {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at > ttl
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: String,
    pub role: Role,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_intent: Option<RegistrationIntent>,
}

impl SessionRecord {
    pub fn new(user_id: impl Into<String>, role: Role, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            tenant_id: tenant_id.into(),
            access_token: None,
            registration_intent: None,
        }
    }

    /// 過期的註冊意圖視同不存在
    pub fn active_registration_intent(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Option<&RegistrationIntent> {
        self.registration_intent
            .as_ref()
            .filter(|intent| !intent.is_expired(now, ttl))
    }
}

pub struct SessionCodec {
    cipher: Aes256Gcm,
    cookie_name: String,
}

impl SessionCodec {
    pub fn new(secret: &str, cookie_name: impl Into<String>) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(PortalError::SessionError {
                message: format!("session secret must be at least {} characters", MIN_SECRET_LEN),
            });
        }
        let key = Sha256::digest(secret.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new(&key),
            cookie_name: cookie_name.into(),
        })
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn seal(&self, record: &SessionRecord) -> Result<String> {
        let plaintext = serde_json::to_vec(record)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| PortalError::SessionError {
                message: "failed to seal session".to_string(),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn open(&self, value: &str) -> Result<SessionRecord> {
        let sealed = URL_SAFE_NO_PAD
            .decode(value.trim())
            .map_err(|_| PortalError::SessionError {
                message: "session cookie is not valid base64".to_string(),
            })?;

        if sealed.len() <= NONCE_LEN {
            return Err(PortalError::SessionError {
                message: "session cookie is truncated".to_string(),
            });
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PortalError::SessionError {
                message: "session cookie failed authentication".to_string(),
            })?;

        Ok(serde_json::from_slice(&plaintext)?)
    }

    pub fn set_cookie_header(&self, record: &SessionRecord, max_age: Duration) -> Result<String> {
        Ok(format!(
            "{}={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
            self.cookie_name,
            self.seal(record)?,
            max_age.num_seconds()
        ))
    }

    pub fn clear_cookie_header(&self) -> String {
        format!(
            "{}=; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age=0",
            self.cookie_name
        )
    }

    /// 從 `Cookie` header 取出 session；無效的 cookie 只記錄警告
    pub fn from_cookie_header(&self, header: &str) -> Option<SessionRecord> {
        let value = header.split(';').find_map(|part| {
            part.trim()
                .strip_prefix(self.cookie_name.as_str())
                .and_then(|rest| rest.strip_prefix('='))
        })?;

        match self.open(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Ignoring session cookie: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Redirect(String),
}

pub fn home_for(role: Role) -> &'static str {
    match role {
        Role::Coach | Role::Admin => "/dashboard",
        Role::Client => "/portal",
    }
}

fn under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'))
}

fn required_roles(path: &str) -> Option<&'static [Role]> {
    if under(path, "/admin") {
        Some(&[Role::Admin])
    } else if under(path, "/dashboard") {
        Some(&[Role::Coach, Role::Admin])
    } else if under(path, "/portal") {
        Some(&[Role::Client])
    } else {
        None
    }
}

/// 合併重複的 `/` 並解析 `.`、`..` (含 `%2e` 編碼)，去掉 query 與 fragment
fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split(['/', '\\']) {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        match decoded.as_str() {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    format!("/{}", segments.join("/"))
}

/// Role gate for a requested path
pub fn gate(path: &str, session: Option<&SessionRecord>) -> GateDecision {
    let normalized = normalize_path(path);
    let Some(roles) = required_roles(&normalized) else {
        return GateDecision::Allow;
    };

    match session {
        None => {
            let query = path
                .split('#')
                .next()
                .and_then(|p| p.find('?').map(|i| &p[i..]))
                .unwrap_or_default();
            let target = format!("{}{}", normalized, query);
            let next: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
            GateDecision::Redirect(format!("/login?next={}", next))
        }
        Some(record) if roles.contains(&record.role) => GateDecision::Allow,
        Some(record) => {
            tracing::debug!(
                "Role {} may not access {}; redirecting",
                record.role,
                path
            );
            GateDecision::Redirect(home_for(record.role).to_string())
        }
    }
}
