//! Persisted data model: targets, their log trail, and harvested records.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Keyword attributed to a record when the target has none configured.
pub const FALLBACK_KEYWORD: &str = "general";

/// How a target selects what to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMode {
    /// A single seed URL
    Targeted,
    /// Keyword sweep with no fixed URL
    Global,
}

/// Proxy routing for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Route through the simulated circuit
    #[default]
    Tor,
    /// Route through `proxy_url`
    Custom,
    Direct,
}

/// Lifecycle of a target.
///
/// ```text
/// pending ──► processing ──► completed
///    │            │              │
///    └────────────┴──► stopped ◄─┘ (forced by operator)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Processing,
    Completed,
    Stopped,
}

impl TargetStatus {
    /// Returns the lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Processing => "processing",
            TargetStatus::Completed => "completed",
            TargetStatus::Stopped => "stopped",
        }
    }

    /// Returns true if a target may move from `self` to `next`.
    ///
    /// Only `processing` may complete, so a target stopped by the operator
    /// can never be completed by a harvest cycle that raced the stop.
    /// Re-entering `processing` from `stopped` or `completed` is an
    /// operator re-run. `processing` and `stopped` may be re-entered, so
    /// repeated start and stop commands succeed.
    pub fn can_transition_to(&self, next: TargetStatus) -> bool {
        use TargetStatus::*;
        matches!(
            (*self, next),
            (Pending, Processing)
                | (Stopped, Processing)
                | (Completed, Processing)
                | (Processing, Completed)
                | (Pending, Stopped)
                | (Processing, Stopped)
                | (Completed, Stopped)
                | (Processing, Processing)
                | (Stopped, Stopped)
        )
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured collection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: u64,

    #[serde(rename = "type")]
    pub mode: CollectionMode,

    /// Seed URL, absent for global sweeps
    pub url: Option<String>,

    /// Comma-separated keyword filter
    pub keywords: String,

    pub proxy_mode: ProxyMode,
    pub proxy_url: Option<String>,

    /// When the target was last started or completed
    pub last_run: Option<Timestamp>,

    pub status: TargetStatus,
}

impl Target {
    /// Returns the trimmed, non-empty keywords of this target.
    pub fn keyword_list(&self) -> Vec<String> {
        parse_keywords(&self.keywords)
    }

    /// Returns the seed URL if one is set and non-blank.
    pub fn seed_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.trim().is_empty())
    }

    /// Human-readable label: the seed URL, or the keyword list.
    pub fn label(&self) -> &str {
        self.seed_url().unwrap_or(&self.keywords)
    }
}

/// Splits a comma-separated keyword list, trimming and dropping blanks.
pub fn parse_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fields supplied when creating a target. New targets start `pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTarget {
    #[serde(rename = "type")]
    pub mode: CollectionMode,
    pub url: Option<String>,
    pub keywords: String,
    #[serde(default)]
    pub proxy_mode: ProxyMode,
    pub proxy_url: Option<String>,
}

impl NewTarget {
    /// A targeted job against a single seed URL.
    pub fn targeted(url: impl Into<String>, keywords: impl Into<String>) -> Self {
        Self {
            mode: CollectionMode::Targeted,
            url: Some(url.into()),
            keywords: keywords.into(),
            proxy_mode: ProxyMode::default(),
            proxy_url: None,
        }
    }

    /// A global keyword sweep.
    pub fn global(keywords: impl Into<String>) -> Self {
        Self {
            mode: CollectionMode::Global,
            url: None,
            keywords: keywords.into(),
            proxy_mode: ProxyMode::default(),
            proxy_url: None,
        }
    }

    /// Routes the target through a custom proxy.
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_mode = ProxyMode::Custom;
        self.proxy_url = Some(proxy_url.into());
        self
    }
}

/// Severity of a harvest log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        };
        f.write_str(s)
    }
}

/// One line of a target's harvest trail. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub target_id: u64,
    pub timestamp: Timestamp,
    pub level: LogLevel,
    pub message: String,
}

/// A synthesized discovery attributed to a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestedRecord {
    pub id: u64,
    pub target_id: u64,
    pub url: String,
    pub content_snippet: String,
    pub matched_keywords: String,
    pub timestamp: Timestamp,
    pub video_url: Option<String>,
    pub video_title: Option<String>,
    pub tags: Vec<String>,
}

/// A record before the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub target_id: u64,
    pub url: String,
    pub content_snippet: String,
    pub matched_keywords: String,
    pub timestamp: Timestamp,
    pub video_url: Option<String>,
    pub video_title: Option<String>,
    pub tags: Vec<String>,
}

impl NewRecord {
    pub(crate) fn into_record(self, id: u64) -> HarvestedRecord {
        HarvestedRecord {
            id,
            target_id: self.target_id,
            url: self.url,
            content_snippet: self.content_snippet,
            matched_keywords: self.matched_keywords,
            timestamp: self.timestamp,
            video_url: self.video_url,
            video_title: self.video_title,
            tags: self.tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keywords_trims_and_drops_blanks() {
        assert_eq!(parse_keywords("credit cards, dumps"), vec!["credit cards", "dumps"]);
        assert_eq!(parse_keywords(" a ,, b ,"), vec!["a", "b"]);
        assert!(parse_keywords("").is_empty());
        assert!(parse_keywords(" , ").is_empty());
    }

    #[test]
    fn test_status_transitions() {
        use TargetStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Processing));

        assert!(!Stopped.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Pending));
        assert!(Stopped.can_transition_to(Stopped));
        assert!(Processing.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_target_label_prefers_url() {
        let mut target = Target {
            id: 1,
            mode: CollectionMode::Targeted,
            url: Some("http://darkmarket.onion".into()),
            keywords: "dumps".into(),
            proxy_mode: ProxyMode::Tor,
            proxy_url: None,
            last_run: None,
            status: TargetStatus::Pending,
        };
        assert_eq!(target.label(), "http://darkmarket.onion");

        target.url = Some("  ".into());
        assert_eq!(target.seed_url(), None);
        assert_eq!(target.label(), "dumps");
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_string(&TargetStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let json = serde_json::to_string(&LogLevel::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
        let json = serde_json::to_value(NewTarget::global("x")).unwrap();
        assert_eq!(json["type"], "global");
        assert_eq!(json["proxy_mode"], "tor");
    }
}
