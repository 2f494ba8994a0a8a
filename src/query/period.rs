use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reporting window for a report card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportPeriod {
    Last7Days,
    #[default]
    Last30Days,
    Last90Days,
    LastYear,
    All,
}

impl ReportPeriod {
    /// Parse a period string.
    ///
    /// Supported formats (case-insensitive):
    /// - `last7Days` / `7d`
    /// - `last30Days` / `30d`
    /// - `last90Days` / `90d`
    /// - `lastYear` / `1y`
    /// - `all`
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "last7days" | "7d" => Ok(ReportPeriod::Last7Days),
            "last30days" | "30d" => Ok(ReportPeriod::Last30Days),
            "last90days" | "90d" => Ok(ReportPeriod::Last90Days),
            "lastyear" | "1y" | "365d" => Ok(ReportPeriod::LastYear),
            "all" => Ok(ReportPeriod::All),
            _ => Err(Error::InvalidInput(format!(
                "unrecognized period '{s}' (expected last7Days, last30Days, last90Days, lastYear or all)"
            ))),
        }
    }

    /// Canonical key, as accepted by [`ReportPeriod::parse`].
    pub fn to_key(&self) -> &'static str {
        match self {
            ReportPeriod::Last7Days => "last7Days",
            ReportPeriod::Last30Days => "last30Days",
            ReportPeriod::Last90Days => "last90Days",
            ReportPeriod::LastYear => "lastYear",
            ReportPeriod::All => "all",
        }
    }

    /// Length of the rolling window in days, `None` for `All`.
    pub fn days(&self) -> Option<i64> {
        match self {
            ReportPeriod::Last7Days => Some(7),
            ReportPeriod::Last30Days => Some(30),
            ReportPeriod::Last90Days => Some(90),
            ReportPeriod::LastYear => Some(365),
            ReportPeriod::All => None,
        }
    }

    /// Inclusive first day of the window ending on `as_of`.
    /// `last7Days` as of 2025-03-10 starts on 2025-03-04.
    pub fn window_start(&self, as_of: NaiveDate) -> Option<NaiveDate> {
        self.days().map(|n| as_of - Duration::days(n - 1))
    }
}

impl std::fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}
