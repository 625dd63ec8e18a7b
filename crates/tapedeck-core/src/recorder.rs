//! Captured exchange log
//!
//! The in-memory, append-only list of exchanges seen during the current
//! configuration window, whether they were forwarded live or replayed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::exchange::{Exchange, ExchangeRequest, ExchangeResponse};

/// Append-only exchange log
///
/// Clone-able because state sits behind `Arc<Mutex<>>`, so handlers and
/// streaming relay tasks can each hold a handle.
#[derive(Clone, Default)]
pub struct ExchangeLog {
    exchanges: Arc<Mutex<Vec<Exchange>>>,
}

impl ExchangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an exchange; the sequence index is its position in the log
    pub async fn record(&self, request: ExchangeRequest, response: ExchangeResponse) -> usize {
        let mut exchanges = self.exchanges.lock().await;
        let sequence_index = exchanges.len();
        exchanges.push(Exchange {
            sequence_index,
            request,
            response,
        });
        sequence_index
    }

    /// Copy of the log; callers can't mutate what was captured
    pub async fn snapshot(&self) -> Vec<Exchange> {
        self.exchanges.lock().await.clone()
    }

    /// Start a new window
    pub async fn reset(&self) {
        self.exchanges.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.exchanges.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get_stats(&self) -> LogStats {
        let exchanges = self.exchanges.lock().await;
        LogStats {
            exchange_count: exchanges.len(),
            streamed_count: exchanges
                .iter()
                .filter(|e| e.response.body.is_streamed())
                .count(),
        }
    }
}

/// Log statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    pub exchange_count: usize,
    pub streamed_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Payload, ResponseBody};
    use std::collections::BTreeMap;

    fn request(path: &str) -> ExchangeRequest {
        ExchangeRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    fn response(body: ResponseBody) -> ExchangeResponse {
        ExchangeResponse {
            status: 200,
            headers: BTreeMap::new(),
            body,
        }
    }

    #[tokio::test]
    async fn test_record_assigns_sequence() {
        let log = ExchangeLog::new();
        assert_eq!(log.record(request("/a"), response(ResponseBody::Empty)).await, 0);
        assert_eq!(log.record(request("/b"), response(ResponseBody::Empty)).await, 1);

        let exchanges = log.snapshot().await;
        assert_eq!(exchanges.len(), 2);
        assert_eq!(exchanges[1].request.path, "/b");
        assert_eq!(exchanges[1].sequence_index, 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let log = ExchangeLog::new();
        log.record(request("/a"), response(ResponseBody::Empty)).await;

        let mut copy = log.snapshot().await;
        copy.clear();
        assert_eq!(log.len().await, 1);
    }

    #[tokio::test]
    async fn test_reset_and_stats() {
        let log = ExchangeLog::new();
        log.record(
            request("/stream"),
            response(ResponseBody::Chunked(vec![Payload::Text("x".to_string())])),
        )
        .await;
        log.record(request("/plain"), response(ResponseBody::Empty)).await;

        let stats = log.get_stats().await;
        assert_eq!(stats.exchange_count, 2);
        assert_eq!(stats.streamed_count, 1);

        log.reset().await;
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_shared_between_clones() {
        let log = ExchangeLog::new();
        let handle = log.clone();
        tokio::spawn(async move {
            handle.record(request("/task"), response(ResponseBody::Empty)).await;
        })
        .await
        .unwrap();
        assert_eq!(log.len().await, 1);
    }
}
