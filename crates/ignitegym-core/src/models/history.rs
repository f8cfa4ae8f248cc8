use serde::{Deserialize, Serialize};

/// One completed exercise in the history list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub group: String,
    pub hour: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// History entries grouped under a day heading, as returned by `GET /history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct HistoryByDay {
    pub title: String,
    pub data: Vec<HistoryEntry>,
}
