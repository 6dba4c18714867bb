//! Thin helpers over Arrow arrays: group id blocks and typed channel access.

use arrow::array::{
    Array, ArrayRef, AsArray, ListArray, PrimitiveArray, RecordBatch, UInt32Array,
};
use arrow::datatypes::{ArrowPrimitiveType, UInt32Type};

use crate::error::{AggregationError, Result};

/// Group ids aligned with the rows of a page.
#[derive(Debug, Clone, Copy)]
pub enum GroupIds<'a> {
    /// One group per row; a null row belongs to no group.
    Vector(&'a UInt32Array),
    /// Zero or more groups per row.
    Block {
        list: &'a ListArray,
        ids: &'a UInt32Array,
    },
}

impl<'a> GroupIds<'a> {
    pub fn vector(ids: &'a UInt32Array) -> Self {
        Self::Vector(ids)
    }

    pub fn block(list: &'a ListArray) -> Result<Self> {
        let ids = list
            .values()
            .as_primitive_opt::<UInt32Type>()
            .ok_or_else(|| {
                AggregationError::input(format!(
                    "group id block must contain u32 values, got {}",
                    list.values().data_type()
                ))
            })?;
        Ok(Self::Block { list, ids })
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Vector(ids) => ids.len(),
            Self::Block { list, .. } => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for every group id the row at `position` belongs to.
    #[inline]
    pub fn for_each_group<F>(&self, position: usize, mut f: F) -> Result<()>
    where
        F: FnMut(u32) -> Result<()>,
    {
        match self {
            Self::Vector(ids) => {
                if ids.is_valid(position) {
                    f(ids.value(position))?;
                }
            }
            Self::Block { list, ids } => {
                if list.is_null(position) {
                    return Ok(());
                }
                let offsets = list.value_offsets();
                let start = offsets[position] as usize;
                let end = offsets[position + 1] as usize;
                for i in start..end {
                    if ids.is_valid(i) {
                        f(ids.value(i))?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn ensure_aligned(&self, page: &RecordBatch) -> Result<()> {
        if self.len() != page.num_rows() {
            return Err(AggregationError::input(format!(
                "group ids cover {} rows but the page has {}",
                self.len(),
                page.num_rows()
            )));
        }
        Ok(())
    }
}

/// `0..count` as a selection vector.
pub fn selected_range(count: u32) -> UInt32Array {
    UInt32Array::from_iter_values(0..count)
}

fn column<'a>(page: &'a RecordBatch, channel: usize) -> Option<&'a ArrayRef> {
    page.columns().get(channel)
}

pub fn raw_primitive<'a, T: ArrowPrimitiveType>(
    page: &'a RecordBatch,
    channel: usize,
    what: &str,
) -> Result<&'a PrimitiveArray<T>> {
    let array = column(page, channel).ok_or_else(|| {
        AggregationError::input(format!("missing {what} channel {channel}"))
    })?;
    array.as_primitive_opt::<T>().ok_or_else(|| {
        AggregationError::input(format!(
            "{what} channel must be {}, got {}",
            T::DATA_TYPE,
            array.data_type()
        ))
    })
}

pub fn intermediate_column<'a>(page: &'a RecordBatch, channel: usize, what: &str) -> Result<&'a ArrayRef> {
    column(page, channel).ok_or_else(|| {
        AggregationError::intermediate(format!("missing {what} channel {channel}"))
    })
}

pub fn intermediate_primitive<'a, T: ArrowPrimitiveType>(
    page: &'a RecordBatch,
    channel: usize,
    what: &str,
) -> Result<&'a PrimitiveArray<T>> {
    let array = intermediate_column(page, channel, what)?;
    array.as_primitive_opt::<T>().ok_or_else(|| {
        AggregationError::intermediate(format!(
            "{what} channel must be {}, got {}",
            T::DATA_TYPE,
            array.data_type()
        ))
    })
}

pub fn intermediate_list<'a>(page: &'a RecordBatch, channel: usize, what: &str) -> Result<&'a ListArray> {
    let array = intermediate_column(page, channel, what)?;
    array.as_list_opt::<i32>().ok_or_else(|| {
        AggregationError::intermediate(format!(
            "{what} channel must be a list, got {}",
            array.data_type()
        ))
    })
}

/// The flattened values of a list channel, typed.
pub fn list_values<'a, T: ArrowPrimitiveType>(list: &'a ListArray, what: &str) -> Result<&'a PrimitiveArray<T>> {
    list.values().as_primitive_opt::<T>().ok_or_else(|| {
        AggregationError::intermediate(format!(
            "{what} list must contain {}, got {}",
            T::DATA_TYPE,
            list.values().data_type()
        ))
    })
}

/// `[start, end)` of the list entry at `position`, or `None` for a null entry.
#[inline]
pub fn list_range(list: &ListArray, position: usize) -> Option<(usize, usize)> {
    if list.is_null(position) {
        return None;
    }
    let offsets = list.value_offsets();
    Some((offsets[position] as usize, offsets[position + 1] as usize))
}
