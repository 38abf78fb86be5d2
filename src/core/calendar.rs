use crate::core::api::check_status;
use crate::domain::model::Appointment;
use crate::utils::error::{PortalError, Result};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    pub date_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<Attendee>,
}

impl CalendarEvent {
    pub fn from_appointment(appointment: &Appointment, summary: impl Into<String>) -> Self {
        Self {
            id: appointment.calendar_event_id.clone(),
            summary: summary.into(),
            description: appointment.notes.clone(),
            start: EventTime {
                date_time: appointment.starts_at,
                time_zone: None,
            },
            end: EventTime {
                date_time: appointment.ends_at,
                time_zone: None,
            },
            attendees: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<CalendarEvent>,
}

/// 單一上游行事曆的事件 CRUD，使用 session 內的 OAuth access token
#[derive(Debug, Clone)]
pub struct CalendarClient {
    client: reqwest::Client,
    base_url: Url,
    calendar_id: String,
    access_token: String,
}

impl CalendarClient {
    pub fn new(base_url: &str, calendar_id: &str, access_token: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| PortalError::InvalidConfigValueError {
            field: "calendar.base_url".to_string(),
            value: base_url.to_string(),
            reason: format!("Invalid URL format: {}", e),
        })?;

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            calendar_id: calendar_id.to_string(),
            access_token: access_token.to_string(),
        })
    }

    fn events_url(&self, event_id: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| PortalError::ConfigError {
                message: format!("Calendar base URL cannot be a base: {}", self.base_url),
            })?;
            segments
                .pop_if_empty()
                .extend(["calendars", self.calendar_id.as_str(), "events"]);
            if let Some(id) = event_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    pub async fn list_events(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        let url = self.events_url(None)?;
        tracing::debug!("📅 Listing events {} .. {}", time_min, time_max);

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("timeMin", time_min.to_rfc3339()),
                ("timeMax", time_max.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
            ])
            .send()
            .await?;
        let list: EventList = check_status(response).await?.json().await?;
        Ok(list.items)
    }

    pub async fn create_event(&self, event: &CalendarEvent) -> Result<CalendarEvent> {
        let url = self.events_url(None)?;
        self.write_event(Method::POST, url, event).await
    }

    pub async fn update_event(&self, event_id: &str, event: &CalendarEvent) -> Result<CalendarEvent> {
        let url = self.events_url(Some(event_id))?;
        self.write_event(Method::PATCH, url, event).await
    }

    pub async fn delete_event(&self, event_id: &str) -> Result<()> {
        let url = self.events_url(Some(event_id))?;
        tracing::debug!("📅 Deleting event {}", event_id);

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn write_event(&self, method: Method, url: Url, event: &CalendarEvent) -> Result<CalendarEvent> {
        tracing::debug!("📅 {} event '{}'", method, event.summary);

        let response = self
            .client
            .request(method, url)
            .bearer_auth(&self.access_token)
            .json(event)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}
