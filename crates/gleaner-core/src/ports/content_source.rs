//! ContentSource port - 外部コンテンツソースへの検索
//!
//! ソースの時間フィルタは粗い（day/week/month/...）ので、返ってきた結果は
//! 呼び出し側で時間窓に絞り直す前提です。

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CandidateItem, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Day,
    Week,
    Month,
    Year,
    All,
}

impl TimeFilter {
    /// Narrowest filter that still reaches back to `since`.
    pub fn reaching_back_to(since: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let days_back = (now - since).num_days();
        if days_back <= 1 {
            TimeFilter::Day
        } else if days_back <= 7 {
            TimeFilter::Week
        } else if days_back <= 30 {
            TimeFilter::Month
        } else if days_back <= 365 {
            TimeFilter::Year
        } else {
            TimeFilter::All
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Day => "day",
            TimeFilter::Week => "week",
            TimeFilter::Month => "month",
            TimeFilter::Year => "year",
            TimeFilter::All => "all",
        }
    }
}

impl fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    New,
    Top,
    Relevance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub group: String,
    pub keyword: String,
    pub time_filter: TimeFilter,
    pub limit: u32,
    pub sort: SortOrder,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Top-level items for one group key. May over-return outside the window.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CandidateItem>, SourceError>;

    /// Child items (replies) of one top-level item.
    async fn replies(&self, item_id: &str, limit: usize)
    -> Result<Vec<CandidateItem>, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    #[rstest]
    #[case(0, TimeFilter::Day)]
    #[case(1, TimeFilter::Day)]
    #[case(2, TimeFilter::Week)]
    #[case(7, TimeFilter::Week)]
    #[case(30, TimeFilter::Month)]
    #[case(200, TimeFilter::Year)]
    #[case(366, TimeFilter::All)]
    fn time_filter_widens_with_distance(#[case] days: i64, #[case] expected: TimeFilter) {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(
            TimeFilter::reaching_back_to(now - Duration::days(days), now),
            expected
        );
    }
}
