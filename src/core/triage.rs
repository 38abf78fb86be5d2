use crate::domain::model::{Client, CoherenceSnapshot, Trend};
use crate::utils::error::{PortalError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;

/// 分級結果，宣告順序即為緊急程度 (Critical 最緊急)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageStatus {
    Critical,
    Warning,
    Stable,
    Thriving,
    Breakthrough,
}

impl TriageStatus {
    pub const ALL: [TriageStatus; 5] = [
        TriageStatus::Critical,
        TriageStatus::Warning,
        TriageStatus::Stable,
        TriageStatus::Thriving,
        TriageStatus::Breakthrough,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriageStatus::Critical => "critical",
            TriageStatus::Warning => "warning",
            TriageStatus::Stable => "stable",
            TriageStatus::Thriving => "thriving",
            TriageStatus::Breakthrough => "breakthrough",
        }
    }

    /// 0 = most urgent
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn needs_attention(&self) -> bool {
        matches!(self, TriageStatus::Critical | TriageStatus::Warning)
    }
}

impl fmt::Display for TriageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriageStatus {
    type Err = PortalError;

    fn from_str(s: &str) -> Result<Self> {
        TriageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PortalError::ValidationError {
                message: format!("Unknown triage status: {}", s),
            })
    }
}

/// 分級門檻；規則的判斷順序固定，只有數值可調整
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageThresholds {
    pub critical_score: f64,
    pub warning_score: f64,
    pub critical_derivative: f64,
    pub warning_derivative: f64,
    pub stable_band: f64,
    pub thriving_derivative: f64,
    pub breakthrough_derivative: f64,
}

impl Default for TriageThresholds {
    fn default() -> Self {
        Self {
            critical_score: 40.0,
            warning_score: 60.0,
            critical_derivative: -0.05,
            warning_derivative: -0.02,
            stable_band: 0.02,
            thriving_derivative: 0.02,
            breakthrough_derivative: 0.05,
        }
    }
}

impl TriageThresholds {
    /// First matching rule wins. Never fails: NaN inputs fall through to `Stable`.
    pub fn classify(&self, snapshot: &CoherenceSnapshot) -> TriageStatus {
        let CoherenceSnapshot {
            current,
            derivative,
            trend,
        } = *snapshot;

        if current < self.critical_score
            || derivative < self.critical_derivative
            || trend == Trend::DecliningFast
        {
            return TriageStatus::Critical;
        }

        if current < self.warning_score
            || derivative < self.warning_derivative
            || trend == Trend::Declining
        {
            return TriageStatus::Warning;
        }

        if derivative.abs() < self.stable_band && trend == Trend::Stable {
            return TriageStatus::Stable;
        }

        if derivative > self.thriving_derivative || trend == Trend::Improving {
            return TriageStatus::Thriving;
        }

        if derivative > self.breakthrough_derivative || trend == Trend::Breakthrough {
            return TriageStatus::Breakthrough;
        }

        TriageStatus::Stable
    }
}

/// 使用預設門檻分級
pub fn classify(snapshot: &CoherenceSnapshot) -> TriageStatus {
    TriageThresholds::default().classify(snapshot)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub client_id: String,
    pub name: String,
    pub status: TriageStatus,
    pub current: f64,
    pub derivative: f64,
    pub trend: Trend,
}

/// 依緊急程度排序名單；沒有一致性資料的客戶會被略過
pub fn triage_roster(clients: &[Client], thresholds: &TriageThresholds) -> Vec<RosterEntry> {
    let mut entries: Vec<RosterEntry> = clients
        .iter()
        .filter_map(|client| {
            let snapshot = client.coherence.as_ref()?;
            Some(RosterEntry {
                client_id: client.id.clone(),
                name: client.name.clone(),
                status: thresholds.classify(snapshot),
                current: snapshot.current,
                derivative: snapshot.derivative,
                trend: snapshot.trend,
            })
        })
        .collect();

    let skipped = clients.len() - entries.len();
    if skipped > 0 {
        tracing::debug!("Skipped {} clients without coherence data", skipped);
    }

    entries.sort_by(|a, b| {
        a.status
            .cmp(&b.status)
            .then_with(|| a.current.total_cmp(&b.current))
            .then_with(|| a.name.cmp(&b.name))
    });
    entries
}

/// Keep entries at `threshold` urgency or worse
pub fn filter_at_least(entries: &[RosterEntry], threshold: TriageStatus) -> Vec<RosterEntry> {
    entries
        .iter()
        .filter(|entry| entry.status <= threshold)
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriageSummary {
    pub critical: usize,
    pub warning: usize,
    pub stable: usize,
    pub thriving: usize,
    pub breakthrough: usize,
}

impl TriageSummary {
    pub fn from_entries(entries: &[RosterEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            match entry.status {
                TriageStatus::Critical => summary.critical += 1,
                TriageStatus::Warning => summary.warning += 1,
                TriageStatus::Stable => summary.stable += 1,
                TriageStatus::Thriving => summary.thriving += 1,
                TriageStatus::Breakthrough => summary.breakthrough += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.critical + self.warning + self.stable + self.thriving + self.breakthrough
    }
}

/// 匯出名單為 CSV
pub fn write_roster_csv<W: Write>(entries: &[RosterEntry], writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for entry in entries {
        csv_writer.serialize(entry)?;
    }
    csv_writer.flush()?;
    Ok(())
}
