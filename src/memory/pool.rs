use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AggregationError, Result};
use crate::memory::reservation::MemoryReservation;

/// Identifies the operator instance a reservation is charged to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorId(String);

impl OperatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for OperatorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTenant {
    /// Per-group aggregation buffers.
    AggregationState,
    /// The slot arrays indexed by group id.
    GroupSlots,
    /// Key to group id tables owned by the driver.
    BlockHash,
}

#[derive(Debug, Clone, Copy)]
struct TenantUsage {
    used_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoryKey {
    operator: OperatorId,
    tenant: MemoryTenant,
}

/// Byte accounting shared by every aggregation table of a worker.
///
/// Reservations are checked against a single hard limit. A refused reservation
/// leaves the pool untouched and surfaces as `ResourceLimitExceeded`.
#[derive(Debug)]
pub struct MemoryPool {
    limit_bytes: usize,
    used_total: AtomicUsize,
    peak_total: AtomicUsize,
    denied: AtomicU64,
    used_by_key: Mutex<HashMap<MemoryKey, TenantUsage>>,
}

impl MemoryPool {
    pub fn new(limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            limit_bytes: limit_bytes.max(1),
            used_total: AtomicUsize::new(0),
            peak_total: AtomicUsize::new(0),
            denied: AtomicU64::new(0),
            used_by_key: Mutex::new(HashMap::new()),
        })
    }

    /// A pool that never refuses; handy for tests and one-off evaluation.
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    /// Start an empty reservation charged to `operator`/`tenant`.
    pub fn reservation(
        self: &Arc<Self>,
        operator: impl Into<OperatorId>,
        tenant: MemoryTenant,
    ) -> MemoryReservation {
        MemoryReservation::new(self.clone(), operator.into(), tenant)
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    pub fn total_used(&self) -> usize {
        self.used_total.load(Ordering::Relaxed)
    }

    pub fn peak_used(&self) -> usize {
        self.peak_total.load(Ordering::Relaxed)
    }

    pub fn denied_reservations(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    pub fn used(&self, operator: &OperatorId, tenant: MemoryTenant) -> usize {
        let map = self.used_by_key.lock().expect("memory pool");
        map.get(&MemoryKey {
            operator: operator.clone(),
            tenant,
        })
        .map(|u| u.used_bytes)
        .unwrap_or(0)
    }

    pub fn used_for_tenant(&self, tenant: MemoryTenant) -> usize {
        let map = self.used_by_key.lock().expect("memory pool");
        map.iter()
            .filter(|(k, _)| k.tenant == tenant)
            .map(|(_, v)| v.used_bytes)
            .sum()
    }

    /// Reserve `bytes` within the pool limit, or fail without side effects.
    pub fn try_reserve(
        &self,
        operator: &OperatorId,
        tenant: MemoryTenant,
        bytes: usize,
    ) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut map = self.used_by_key.lock().expect("memory pool");
        let total_used = self.used_total.load(Ordering::Relaxed);
        if total_used.saturating_add(bytes) > self.limit_bytes {
            self.denied.fetch_add(1, Ordering::Relaxed);
            warn!(
                operator = %operator,
                ?tenant,
                requested = bytes,
                used = total_used,
                limit = self.limit_bytes,
                "memory reservation denied"
            );
            return Err(AggregationError::resource_limit(
                operator,
                bytes,
                total_used,
                self.limit_bytes,
            ));
        }
        let entry = map
            .entry(MemoryKey {
                operator: operator.clone(),
                tenant,
            })
            .or_insert(TenantUsage { used_bytes: 0 });
        entry.used_bytes = entry.used_bytes.saturating_add(bytes);
        let now = self.used_total.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_total.fetch_max(now, Ordering::Relaxed);
        Ok(())
    }

    pub fn release(&self, operator: &OperatorId, tenant: MemoryTenant, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut map = self.used_by_key.lock().expect("memory pool");
        let key = MemoryKey {
            operator: operator.clone(),
            tenant,
        };
        if let Some(entry) = map.get_mut(&key) {
            debug_assert!(entry.used_bytes >= bytes, "release exceeds reservation");
            entry.used_bytes = entry.used_bytes.saturating_sub(bytes);
            if entry.used_bytes == 0 {
                map.remove(&key);
            }
        }
        self.used_total.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MemoryPoolSnapshot {
        let map = self.used_by_key.lock().expect("memory pool");
        let mut consumers: Vec<TenantUsageSnapshot> = map
            .iter()
            .map(|(k, v)| TenantUsageSnapshot {
                operator: k.operator.clone(),
                tenant: k.tenant,
                used_bytes: v.used_bytes,
            })
            .collect();
        consumers.sort_by(|a, b| a.operator.as_str().cmp(b.operator.as_str()));
        MemoryPoolSnapshot {
            limit_bytes: self.limit_bytes,
            used_bytes: self.used_total.load(Ordering::Relaxed),
            peak_bytes: self.peak_total.load(Ordering::Relaxed),
            denied_reservations: self.denied.load(Ordering::Relaxed),
            consumers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantUsageSnapshot {
    pub operator: OperatorId,
    pub tenant: MemoryTenant,
    pub used_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPoolSnapshot {
    pub limit_bytes: usize,
    pub used_bytes: usize,
    pub peak_bytes: usize,
    pub denied_reservations: u64,
    pub consumers: Vec<TenantUsageSnapshot>,
}
