use std::collections::HashMap;
use std::mem::size_of;

use ahash::RandomState;
use arrow::array::{Array, Int64Array, UInt32Array, UInt32Builder};

use crate::error::{AggregationError, Result};
use crate::memory::MemoryReservation;

/// Bytes charged per distinct key: the map entry plus the key column slot.
const ENTRY_BYTES: usize = size_of::<(i64, u32)>() + size_of::<Option<i64>>();

/// Assigns dense group ids to `i64` keys in first-seen order.
///
/// The null key is a group of its own.
#[derive(Debug)]
pub struct LongBlockHash {
    ids: HashMap<i64, u32, RandomState>,
    null_id: Option<u32>,
    keys: Vec<Option<i64>>,
    reservation: MemoryReservation,
}

impl LongBlockHash {
    pub fn new(reservation: MemoryReservation) -> Self {
        Self {
            ids: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            null_id: None,
            keys: Vec::new(),
            reservation,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn memory_used(&self) -> usize {
        self.reservation.size()
    }

    fn next_id(&mut self, key: Option<i64>) -> Result<u32> {
        let id = u32::try_from(self.keys.len())
            .map_err(|_| AggregationError::input("more than u32::MAX groups"))?;
        self.reservation.try_grow(ENTRY_BYTES)?;
        self.keys.push(key);
        Ok(id)
    }

    pub fn find_or_insert(&mut self, key: Option<i64>) -> Result<u32> {
        match key {
            None => match self.null_id {
                Some(id) => Ok(id),
                None => {
                    let id = self.next_id(None)?;
                    self.null_id = Some(id);
                    Ok(id)
                }
            },
            Some(k) => match self.ids.get(&k) {
                Some(id) => Ok(*id),
                None => {
                    let id = self.next_id(Some(k))?;
                    self.ids.insert(k, id);
                    Ok(id)
                }
            },
        }
    }

    /// Group ids of every row of `keys`.
    pub fn add(&mut self, keys: &Int64Array) -> Result<UInt32Array> {
        let mut ids = UInt32Builder::with_capacity(keys.len());
        for key in keys.iter() {
            ids.append_value(self.find_or_insert(key)?);
        }
        Ok(ids.finish())
    }

    /// Keys in group id order.
    pub fn keys(&self) -> Int64Array {
        Int64Array::from(self.keys.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPool, MemoryTenant};

    #[test]
    fn test_ids_are_dense_in_first_seen_order() {
        let pool = MemoryPool::unbounded();
        let mut hash = LongBlockHash::new(pool.reservation("hash", MemoryTenant::BlockHash));
        let ids = hash
            .add(&Int64Array::from(vec![Some(7), None, Some(3), Some(7), None]))
            .unwrap();
        assert_eq!(ids, UInt32Array::from(vec![0, 1, 2, 0, 1]));
        assert_eq!(hash.keys(), Int64Array::from(vec![Some(7), None, Some(3)]));
        assert_eq!(pool.used_for_tenant(MemoryTenant::BlockHash), 3 * ENTRY_BYTES);
    }

    #[test]
    fn test_denied_key_is_not_inserted() {
        let pool = MemoryPool::new(ENTRY_BYTES);
        let mut hash = LongBlockHash::new(pool.reservation("hash", MemoryTenant::BlockHash));
        hash.find_or_insert(Some(1)).unwrap();
        let err = hash.find_or_insert(Some(2)).unwrap_err();
        assert!(err.is_resource_limit());
        assert_eq!(hash.len(), 1);
        assert_eq!(hash.find_or_insert(Some(1)).unwrap(), 0);
    }
}
