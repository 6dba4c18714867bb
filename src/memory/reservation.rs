use std::sync::Arc;

use crate::error::Result;
use crate::memory::pool::{MemoryPool, MemoryTenant, OperatorId};

/// Bytes claimed from a [`MemoryPool`] on behalf of one consumer.
///
/// Whatever is still held when the reservation is dropped goes back to the
/// pool, so an early return through `?` can never leak a charge.
#[derive(Debug)]
pub struct MemoryReservation {
    pool: Arc<MemoryPool>,
    operator: OperatorId,
    tenant: MemoryTenant,
    bytes: usize,
}

impl MemoryReservation {
    pub(crate) fn new(pool: Arc<MemoryPool>, operator: OperatorId, tenant: MemoryTenant) -> Self {
        Self {
            pool,
            operator,
            tenant,
            bytes: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes
    }

    pub fn operator(&self) -> &OperatorId {
        &self.operator
    }

    pub fn tenant(&self) -> MemoryTenant {
        self.tenant
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// A fresh empty reservation against the same pool and operator.
    pub fn sibling(&self, tenant: MemoryTenant) -> MemoryReservation {
        MemoryReservation::new(self.pool.clone(), self.operator.clone(), tenant)
    }

    pub fn try_grow(&mut self, bytes: usize) -> Result<()> {
        self.pool.try_reserve(&self.operator, self.tenant, bytes)?;
        self.bytes += bytes;
        Ok(())
    }

    pub fn shrink(&mut self, bytes: usize) {
        debug_assert!(
            bytes <= self.bytes,
            "shrink of {bytes} bytes exceeds reservation of {}",
            self.bytes
        );
        let bytes = bytes.min(self.bytes);
        self.pool.release(&self.operator, self.tenant, bytes);
        self.bytes -= bytes;
    }

    /// Reserve `bytes` into a separate scoped reservation.
    ///
    /// The scoped reservation is released on drop unless it is handed back
    /// through [`MemoryReservation::absorb`] once the allocation it covers is
    /// committed.
    pub fn try_scoped(&self, bytes: usize) -> Result<MemoryReservation> {
        let mut scoped = self.sibling(self.tenant);
        scoped.try_grow(bytes)?;
        Ok(scoped)
    }

    /// Take over the bytes held by `other`. Both must charge the same consumer.
    pub fn absorb(&mut self, mut other: MemoryReservation) {
        debug_assert!(
            other.operator == self.operator && other.tenant == self.tenant,
            "absorbing a reservation of another consumer"
        );
        self.bytes += other.bytes;
        other.bytes = 0;
    }

    /// Release everything, returning the number of bytes freed.
    pub fn free(&mut self) -> usize {
        let bytes = self.bytes;
        if bytes != 0 {
            self.pool.release(&self.operator, self.tenant, bytes);
            self.bytes = 0;
        }
        bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}
