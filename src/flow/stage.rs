//! Automation stages of a contact in the flow.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One discrete state of a contact's automation flow.
///
/// Persisted as its snake_case name. A stored name this build does not know
/// decodes to [`Stage::Unknown`], which the engine treats as a flow error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Start,
    AwaitingOption,
    CollectingNameProducts,
    CollectingProductInterest,
    CollectingNameSupport,
    CollectingSupportIssue,
    AfterHoursInfo,
    #[serde(other)]
    Unknown,
}

impl Stage {
    /// Every recognized stage, in flow order.
    pub const KNOWN: [Stage; 7] = [
        Stage::Start,
        Stage::AwaitingOption,
        Stage::CollectingNameProducts,
        Stage::CollectingProductInterest,
        Stage::CollectingNameSupport,
        Stage::CollectingSupportIssue,
        Stage::AfterHoursInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AwaitingOption => "awaiting_option",
            Self::CollectingNameProducts => "collecting_name_products",
            Self::CollectingProductInterest => "collecting_product_interest",
            Self::CollectingNameSupport => "collecting_name_support",
            Self::CollectingSupportIssue => "collecting_support_issue",
            Self::AfterHoursInfo => "after_hours_info",
            Self::Unknown => "unknown",
        }
    }

    /// Decode a persisted stage name, mapping anything unrecognized to `Unknown`.
    pub fn from_db(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::KNOWN
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unrecognized stage: {s}"))
    }
}
