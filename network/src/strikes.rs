//! Per-connection strike counter
//!
//! Messages that fail authorization or decoding are dropped silently; each
//! one earns the connection a strike. Reaching the threshold closes it.

use crate::connection::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum StrikeReason {
    Unauthorized { reason: String },
    MalformedEnvelope { reason: String },
    ProtocolViolation { reason: String },
}

impl std::fmt::Display for StrikeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StrikeReason::Unauthorized { reason } => write!(f, "Unauthorized: {}", reason),
            StrikeReason::MalformedEnvelope { reason } => {
                write!(f, "Malformed envelope: {}", reason)
            }
            StrikeReason::ProtocolViolation { reason } => {
                write!(f, "Protocol violation: {}", reason)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrikeEntry {
    pub connection: ConnectionId,
    pub last_reason: StrikeReason,
    pub first_strike_at: Instant,
    pub strikes: u32,
}

/// Result of recording a strike
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikeOutcome {
    pub strikes: u32,
    pub should_close: bool,
}

pub struct ConnectionStrikes {
    entries: Arc<RwLock<HashMap<ConnectionId, StrikeEntry>>>,
    threshold: u32,
    window: Duration,
}

impl ConnectionStrikes {
    /// Three strikes within ten minutes
    pub fn new() -> Self {
        Self::with_threshold(3, Duration::from_secs(600))
    }

    pub fn with_threshold(threshold: u32, window: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            threshold: threshold.max(1),
            window,
        }
    }

    /// Record a failure on a connection
    pub async fn record(&self, connection: ConnectionId, reason: StrikeReason) -> StrikeOutcome {
        let mut entries = self.entries.write().await;

        let entry = entries.entry(connection).or_insert(StrikeEntry {
            connection,
            last_reason: reason.clone(),
            first_strike_at: Instant::now(),
            strikes: 0,
        });

        if entry.first_strike_at.elapsed() > self.window {
            entry.strikes = 0;
            entry.first_strike_at = Instant::now();
        }

        entry.strikes += 1;
        entry.last_reason = reason.clone();

        let should_close = entry.strikes >= self.threshold;
        if should_close {
            warn!(
                connection = %connection,
                strikes = entry.strikes,
                reason = %reason,
                "Strike threshold reached, closing connection"
            );
        }

        StrikeOutcome {
            strikes: entry.strikes,
            should_close,
        }
    }

    /// Current strikes for a connection
    pub async fn strikes(&self, connection: ConnectionId) -> u32 {
        let entries = self.entries.read().await;
        entries
            .get(&connection)
            .filter(|e| e.first_strike_at.elapsed() <= self.window)
            .map(|e| e.strikes)
            .unwrap_or(0)
    }

    /// Drop state for a closed connection
    pub async fn release(&self, connection: ConnectionId) {
        self.entries.write().await.remove(&connection);
    }

    /// Remove entries whose window has passed
    pub async fn cleanup_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.first_strike_at.elapsed() <= self.window);
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for ConnectionStrikes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unauthorized() -> StrikeReason {
        StrikeReason::Unauthorized {
            reason: "replayed counter".to_string(),
        }
    }

    #[tokio::test]
    async fn test_threshold_closes() {
        let strikes = ConnectionStrikes::with_threshold(3, Duration::from_secs(60));
        let conn = ConnectionId(1);

        assert!(!strikes.record(conn, unauthorized()).await.should_close);
        assert!(!strikes.record(conn, unauthorized()).await.should_close);
        let outcome = strikes.record(conn, unauthorized()).await;
        assert_eq!(outcome.strikes, 3);
        assert!(outcome.should_close);
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let strikes = ConnectionStrikes::with_threshold(2, Duration::from_secs(60));
        strikes.record(ConnectionId(1), unauthorized()).await;
        strikes.record(ConnectionId(2), unauthorized()).await;

        assert_eq!(strikes.strikes(ConnectionId(1)).await, 1);
        assert_eq!(strikes.strikes(ConnectionId(2)).await, 1);
        assert_eq!(strikes.count().await, 2);
    }

    #[tokio::test]
    async fn test_window_expiry_resets() {
        let strikes = ConnectionStrikes::with_threshold(2, Duration::from_millis(50));
        let conn = ConnectionId(1);
        strikes.record(conn, unauthorized()).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(strikes.strikes(conn).await, 0);

        let outcome = strikes.record(conn, unauthorized()).await;
        assert_eq!(outcome.strikes, 1);
        assert!(!outcome.should_close);

        tokio::time::sleep(Duration::from_millis(80)).await;
        strikes.cleanup_expired().await;
        assert_eq!(strikes.count().await, 0);
    }

    #[tokio::test]
    async fn test_release() {
        let strikes = ConnectionStrikes::new();
        strikes.record(ConnectionId(9), unauthorized()).await;
        strikes.release(ConnectionId(9)).await;
        assert_eq!(strikes.count().await, 0);
    }
}
