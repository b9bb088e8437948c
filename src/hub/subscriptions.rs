//! Subscription Index
//!
//! Bidirectional map between downstream connections and symbols. Both
//! directions are mutated together under a single reader-writer lock so
//! broadcasts always observe a consistent view, and symbol entries are
//! dropped the moment their subscriber set empties.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::GatewayError;

#[derive(Default)]
struct IndexInner {
    by_conn: HashMap<String, HashSet<String>>,
    by_symbol: HashMap<String, HashSet<String>>,
    last_activity: HashMap<String, Instant>,
}

/// Aggregate index counters for the stats surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub connections: usize,
    pub symbols: usize,
    pub total_subscriptions: usize,
}

/// Bidirectional connection <-> symbol index
///
/// Invariants held at every quiescent point:
/// - `c` is in `by_symbol[s]` iff `s` is in `by_conn[c]`
/// - `by_symbol` never retains an entry with an empty subscriber set
pub struct SubscriptionIndex {
    inner: RwLock<IndexInner>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Registers a connection with no subscriptions
    pub fn add_conn(&self, conn_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.by_conn.entry(conn_id.to_string()).or_default();
        inner.last_activity.insert(conn_id.to_string(), Instant::now());
    }

    /// Removes a connection from every symbol set in one critical section
    ///
    /// Returns the symbols whose subscriber sets became empty, so the
    /// caller can release the matching upstream subscriptions.
    pub fn remove_conn(&self, conn_id: &str) -> Vec<String> {
        let mut inner = self.inner.write().unwrap();
        inner.last_activity.remove(conn_id);
        let Some(symbols) = inner.by_conn.remove(conn_id) else {
            return Vec::new();
        };
        let mut emptied = Vec::new();
        for symbol in symbols {
            if let Some(subscribers) = inner.by_symbol.get_mut(&symbol) {
                subscribers.remove(conn_id);
                if subscribers.is_empty() {
                    inner.by_symbol.remove(&symbol);
                    emptied.push(symbol);
                }
            }
        }
        emptied
    }

    /// Subscribes a connection to `symbols` (deduplicated within the call)
    ///
    /// Returns the symbols that gained their first subscriber; the caller
    /// uses those transitions to grow the upstream subscription set. The
    /// reference counting stays inside this lock, which serializes the
    /// transitions.
    pub fn subscribe(&self, conn_id: &str, symbols: &[String]) -> Result<Vec<String>, GatewayError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.by_conn.contains_key(conn_id) {
            return Err(GatewayError::NotFound(conn_id.to_string()));
        }
        let mut newly_active = Vec::new();
        let unique: HashSet<&String> = symbols.iter().collect();
        for symbol in unique {
            inner
                .by_conn
                .get_mut(conn_id)
                .expect("checked above")
                .insert(symbol.clone());
            let subscribers = inner.by_symbol.entry(symbol.clone()).or_default();
            let was_empty = subscribers.is_empty();
            subscribers.insert(conn_id.to_string());
            if was_empty {
                newly_active.push(symbol.clone());
            }
        }
        inner.last_activity.insert(conn_id.to_string(), Instant::now());
        Ok(newly_active)
    }

    /// Unsubscribes a connection from `symbols`
    ///
    /// Returns the symbols whose subscriber sets became empty (and were
    /// therefore dropped from the index).
    pub fn unsubscribe(
        &self,
        conn_id: &str,
        symbols: &[String],
    ) -> Result<Vec<String>, GatewayError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.by_conn.contains_key(conn_id) {
            return Err(GatewayError::NotFound(conn_id.to_string()));
        }
        let mut emptied = Vec::new();
        let unique: HashSet<&String> = symbols.iter().collect();
        for symbol in unique {
            inner
                .by_conn
                .get_mut(conn_id)
                .expect("checked above")
                .remove(symbol);
            if let Some(subscribers) = inner.by_symbol.get_mut(symbol) {
                subscribers.remove(conn_id);
                if subscribers.is_empty() {
                    inner.by_symbol.remove(symbol);
                    emptied.push(symbol.clone());
                }
            }
        }
        inner.last_activity.insert(conn_id.to_string(), Instant::now());
        Ok(emptied)
    }

    /// Connections subscribed to `symbol`, defensively copied
    pub fn subscribers(&self, symbol: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .by_symbol
            .get(symbol)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Symbols a connection is subscribed to, defensively copied
    pub fn subscriptions(&self, conn_id: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .by_conn
            .get(conn_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when the symbol currently has at least one subscriber
    pub fn has_subscribers(&self, symbol: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.by_symbol.contains_key(symbol)
    }

    /// Union of all subscribed symbols across connections
    pub fn active_symbols(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.by_symbol.keys().cloned().collect()
    }

    /// Marks activity on a connection (any inbound frame)
    pub fn touch(&self, conn_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(at) = inner.last_activity.get_mut(conn_id) {
            *at = Instant::now();
        }
    }

    /// Aggregate counters
    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read().unwrap();
        IndexStats {
            connections: inner.by_conn.len(),
            symbols: inner.by_symbol.len(),
            total_subscriptions: inner.by_conn.values().map(|set| set.len()).sum(),
        }
    }

    /// Connections idle for longer than `threshold`
    pub fn inactive_conns(&self, threshold: Duration) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .last_activity
            .iter()
            .filter(|(_, at)| at.elapsed() > threshold)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Removes every connection idle for longer than `threshold`
    ///
    /// Returns the removed connection ids.
    pub fn cleanup_inactive(&self, threshold: Duration) -> Vec<String> {
        let stale = self.inactive_conns(threshold);
        for conn_id in &stale {
            self.remove_conn(conn_id);
        }
        stale
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}
