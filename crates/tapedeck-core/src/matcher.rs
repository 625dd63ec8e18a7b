//! In-order matching of live requests against recorded exchanges

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::exchange::Exchange;
use crate::normalize::{ComparisonKey, NormalizationRules};

/// How far ahead of the cursor a live request may match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPolicy {
    /// Only the next unconsumed exchange may answer
    #[default]
    Strict,
    /// Any of the next `n` unconsumed exchanges may answer; for clients that
    /// fan out parallel calls
    Window(usize),
}

impl OrderPolicy {
    fn window(self) -> usize {
        match self {
            OrderPolicy::Strict => 1,
            OrderPolicy::Window(n) => n.max(1),
        }
    }
}

impl fmt::Display for OrderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderPolicy::Strict => write!(f, "strict"),
            OrderPolicy::Window(n) => write!(f, "window:{n}"),
        }
    }
}

impl FromStr for OrderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "strict" {
            return Ok(OrderPolicy::Strict);
        }
        if let Some(n) = s.strip_prefix("window:") {
            return n
                .parse::<usize>()
                .map(OrderPolicy::Window)
                .map_err(|e| format!("Invalid order window '{n}': {e}"));
        }
        Err(format!("Unknown order policy '{s}' (expected 'strict' or 'window:<n>')"))
    }
}

/// Details of a failed match, kept so the subtest can be failed later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFailure {
    pub observed: String,
    pub expected: Option<String>,
    pub remaining: usize,
}

impl From<MatchFailure> for Error {
    fn from(failure: MatchFailure) -> Self {
        Error::NoMatch {
            observed: failure.observed,
            expected: failure.expected,
            remaining: failure.remaining,
        }
    }
}

struct Entry {
    key: ComparisonKey,
    exchange: Exchange,
    consumed: bool,
}

/// Serves recorded exchanges in order, each at most once
pub struct Matcher {
    entries: Vec<Entry>,
    /// Index of the first unconsumed entry
    cursor: usize,
    policy: OrderPolicy,
}

impl Matcher {
    pub fn new(exchanges: Vec<Exchange>, rules: &NormalizationRules, policy: OrderPolicy) -> Self {
        let entries = exchanges
            .into_iter()
            .map(|exchange| Entry {
                key: rules.comparison_key(&exchange.request),
                exchange,
                consumed: false,
            })
            .collect();

        Self {
            entries,
            cursor: 0,
            policy,
        }
    }

    /// Number of exchanges not yet served
    pub fn remaining(&self) -> usize {
        self.entries.iter().filter(|e| !e.consumed).count()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Find and consume the exchange answering `observed`
    pub fn next_match(&mut self, observed: &ComparisonKey) -> Result<Exchange, MatchFailure> {
        let window = self.policy.window();

        let candidate = self
            .entries
            .iter()
            .enumerate()
            .skip(self.cursor)
            .filter(|(_, e)| !e.consumed)
            .take(window)
            .find(|(_, e)| &e.key == observed)
            .map(|(idx, _)| idx);

        let Some(idx) = candidate else {
            return Err(MatchFailure {
                observed: observed.to_string(),
                expected: self
                    .entries
                    .get(self.cursor)
                    .filter(|e| !e.consumed)
                    .map(|e| e.key.to_string()),
                remaining: self.remaining(),
            });
        };

        self.entries[idx].consumed = true;
        while self.cursor < self.entries.len() && self.entries[self.cursor].consumed {
            self.cursor += 1;
        }

        Ok(self.entries[idx].exchange.clone())
    }
}
