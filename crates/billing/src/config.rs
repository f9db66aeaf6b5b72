//! Dunning and automation configuration
//!
//! All schedule and guardrail settings are explicit values handed to the
//! scheduler on each tick. Nothing here is read from global state; the
//! worker assembles these from the environment, and invalid admin input
//! degrades to the documented defaults instead of failing the tick.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Highest dunning level; reaching it cancels the subscription.
pub const TERMINAL_DUNNING_LEVEL: i16 = 4;

/// A single dunning escalation level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningLevelConfig {
    /// Level number (1-4)
    pub level: i16,
    /// Whether this level fires at all; disabled levels are skipped
    pub enabled: bool,
    /// Delay after the failed payment attempt before this level fires
    #[serde(with = "delay_seconds")]
    pub delay: Duration,
}

mod delay_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(delay: &Duration, s: S) -> Result<S::Ok, S::Error> {
        delay.num_seconds().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(d)?))
    }
}

/// The full dunning escalation schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DunningConfig {
    pub levels: Vec<DunningLevelConfig>,
}

impl Default for DunningConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                DunningLevelConfig {
                    level: 1,
                    enabled: true,
                    delay: Duration::zero(),
                },
                DunningLevelConfig {
                    level: 2,
                    enabled: true,
                    delay: Duration::days(3),
                },
                DunningLevelConfig {
                    level: 3,
                    enabled: true,
                    delay: Duration::days(7),
                },
                DunningLevelConfig {
                    level: 4,
                    enabled: true,
                    delay: Duration::days(10),
                },
            ],
        }
    }
}

impl DunningConfig {
    /// Look up a level's config; out-of-range levels are None
    pub fn level(&self, level: i16) -> Option<&DunningLevelConfig> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// The next enabled level strictly above `current`, if any
    pub fn next_enabled_level(&self, current: i16) -> Option<&DunningLevelConfig> {
        self.levels
            .iter()
            .filter(|l| l.level > current && l.enabled)
            .min_by_key(|l| l.level)
    }

    /// Override a level's delay from an admin-entered string such as
    /// `"3 days"`, `"12 hours"` or `"7d"`. Unparseable input leaves the
    /// default in place.
    pub fn set_delay_from_str(&mut self, level: i16, raw: &str) {
        match parse_delay(raw) {
            Some(delay) => {
                if let Some(cfg) = self.levels.iter_mut().find(|l| l.level == level) {
                    cfg.delay = delay;
                }
            }
            None => {
                tracing::warn!(
                    level = level,
                    raw = %raw,
                    "Unparseable dunning delay, keeping default"
                );
            }
        }
    }
}

/// Parse an admin-entered delay string. Accepts `"<n> day(s)"`,
/// `"<n> hour(s)"`, `"<n> minute(s)"` and the short forms `d`/`h`/`m`.
pub fn parse_delay(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return None;
    }

    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (num, unit) = trimmed.split_at(split_at);
    let value: i64 = num.parse().ok()?;
    if value < 0 {
        return None;
    }

    match unit.trim() {
        "" | "d" | "day" | "days" => Some(Duration::days(value)),
        "h" | "hour" | "hours" => Some(Duration::hours(value)),
        "m" | "min" | "minute" | "minutes" => Some(Duration::minutes(value)),
        _ => None,
    }
}

/// Guardrails checked before any automated dunning e-mail goes out.
/// Suppression skips the send without advancing dunning state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationGuardrails {
    /// Master switch for automated dunning
    pub automation_enabled: bool,
    /// Global cap on dunning e-mails per rolling 24 hours (0 = unlimited)
    pub max_emails_per_day: u32,
    /// User roles never contacted by automation
    pub excluded_roles: Vec<String>,
    /// Subscriptions charging less than this are not dunned automatically
    pub min_amount_cents: i64,
}

impl Default for AutomationGuardrails {
    fn default() -> Self {
        Self {
            automation_enabled: true,
            max_emails_per_day: 0,
            excluded_roles: Vec::new(),
            min_amount_cents: 0,
        }
    }
}

impl AutomationGuardrails {
    pub fn role_excluded(&self, role: Option<&str>) -> bool {
        match role {
            Some(r) => self.excluded_roles.iter().any(|e| e.eq_ignore_ascii_case(r)),
            None => false,
        }
    }
}

/// Renewal reminder windows, in days before `next_renewal_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Descending windows; the default sends at 3 days and 1 day out
    pub days_before: Vec<u32>,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            days_before: vec![3, 1],
        }
    }
}
