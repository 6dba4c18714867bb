pub mod pool;
pub mod reservation;

pub use pool::{MemoryPool, MemoryPoolSnapshot, MemoryTenant, OperatorId, TenantUsageSnapshot};
pub use reservation::MemoryReservation;
