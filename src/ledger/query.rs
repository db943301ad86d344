//! Filter, sort and pagination for ledger listings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::Serialize;

/// Column a call listing is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CallSort {
    #[default]
    Timestamp,
    Tokens,
    Cost,
    Latency,
}

impl CallSort {
    fn column(&self) -> &'static str {
        match self {
            // Ids are assigned in insertion order, which is also timestamp order.
            CallSort::Timestamp => "id",
            CallSort::Tokens => "total_tokens",
            CallSort::Cost => "cost",
            CallSort::Latency => "latency_ms",
        }
    }
}

impl FromStr for CallSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "timestamp" | "time" | "created" => Ok(CallSort::Timestamp),
            "tokens" => Ok(CallSort::Tokens),
            "cost" => Ok(CallSort::Cost),
            "latency" => Ok(CallSort::Latency),
            _ => Err(format!(
                "unknown sort key '{}' (expected timestamp, tokens, cost or latency)",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(format!("unknown sort order '{}' (expected asc or desc)", s)),
        }
    }
}

/// Listing request for model calls.
#[derive(Debug, Clone, PartialEq)]
pub struct CallQuery {
    pub run_id: Option<i64>,
    pub model: Option<String>,
    /// Matched against the prompt and response previews.
    pub text: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub sort: CallSort,
    pub order: SortOrder,
    /// 1-based page number.
    pub page: usize,
    pub per_page: usize,
}

impl Default for CallQuery {
    fn default() -> Self {
        Self {
            run_id: None,
            model: None,
            text: None,
            since: None,
            until: None,
            sort: CallSort::default(),
            order: SortOrder::default(),
            page: 1,
            per_page: 25,
        }
    }
}

impl CallQuery {
    pub fn for_run(run_id: i64) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }

    /// `WHERE` clause (possibly empty) and its positional parameters.
    pub(crate) fn where_clause(&self) -> (String, Vec<Value>) {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        if let Some(run_id) = self.run_id {
            conditions.push("run_id = ?".to_string());
            params.push(Value::Integer(run_id));
        }
        if let Some(model) = &self.model {
            conditions.push("model = ?".to_string());
            params.push(Value::Text(model.clone()));
        }
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            let pattern = format!("%{}%", escape_like(text.trim()));
            conditions.push(
                "(prompt_preview LIKE ? ESCAPE '\\' OR response_preview LIKE ? ESCAPE '\\')"
                    .to_string(),
            );
            params.push(Value::Text(pattern.clone()));
            params.push(Value::Text(pattern));
        }
        if let Some(since) = self.since {
            conditions.push("created_at >= ?".to_string());
            params.push(Value::Text(sql_timestamp(since)));
        }
        if let Some(until) = self.until {
            conditions.push("created_at <= ?".to_string());
            params.push(Value::Text(sql_timestamp(until)));
        }

        if conditions.is_empty() {
            (String::new(), params)
        } else {
            (format!("WHERE {}", conditions.join(" AND ")), params)
        }
    }

    pub(crate) fn order_clause(&self) -> String {
        let dir = self.order.keyword();
        format!("ORDER BY {} {}, id {}", self.sort.column(), dir, dir)
    }

    pub(crate) fn limit(&self) -> usize {
        self.per_page.max(1)
    }

    pub(crate) fn offset(&self) -> usize {
        (self.page.max(1) - 1) * self.limit()
    }
}

/// Same text layout rusqlite uses when binding a `DateTime<Utc>`, so range
/// comparisons against stored timestamps are lexicographically sound.
fn sql_timestamp(at: DateTime<Utc>) -> String {
    at.format("%F %T%.f%:z").to_string()
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    /// Matching rows across all pages.
    pub total: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(self.per_page)
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages()
    }
}

impl fmt::Display for CallSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallSort::Timestamp => "timestamp",
            CallSort::Tokens => "tokens",
            CallSort::Cost => "cost",
            CallSort::Latency => "latency",
        };
        f.write_str(s)
    }
}
