use std::cmp::Ordering;
use std::fmt::Debug;

use arrow::datatypes::{ArrowPrimitiveType, DataType, Float32Type, Float64Type, Int32Type, Int64Type};
use serde::{Deserialize, Serialize};

/// Element types every grouping aggregator is instantiated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Int,
    Long,
    Float,
    Double,
}

impl ElementType {
    pub fn from_data_type(data_type: &DataType) -> Option<Self> {
        match data_type {
            DataType::Int32 => Some(Self::Int),
            DataType::Int64 => Some(Self::Long),
            DataType::Float32 => Some(Self::Float),
            DataType::Float64 => Some(Self::Double),
            _ => None,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int => DataType::Int32,
            Self::Long => DataType::Int64,
            Self::Float => DataType::Float32,
            Self::Double => DataType::Float64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
        }
    }
}

/// Arrow primitive types the aggregators are generic over.
///
/// Values stay in their native representation inside group states; only rate
/// evaluation widens them to `f64`.
pub trait NumericType: ArrowPrimitiveType + Debug + Send + Sync + 'static {
    const ELEMENT: ElementType;

    fn to_f64(value: Self::Native) -> f64;

    /// Total order; floats order NaN above every other value.
    fn total_cmp(a: Self::Native, b: Self::Native) -> Ordering;

    /// Bit pattern fed to hashing sketches.
    fn hash_bits(value: Self::Native) -> u64;
}

macro_rules! impl_integer_numeric {
    ($arrow:ty, $element:expr) => {
        impl NumericType for $arrow {
            const ELEMENT: ElementType = $element;

            #[inline]
            fn to_f64(value: Self::Native) -> f64 {
                value as f64
            }

            #[inline]
            fn total_cmp(a: Self::Native, b: Self::Native) -> Ordering {
                a.cmp(&b)
            }

            #[inline]
            fn hash_bits(value: Self::Native) -> u64 {
                value as i64 as u64
            }
        }
    };
}

macro_rules! impl_float_numeric {
    ($arrow:ty, $element:expr) => {
        impl NumericType for $arrow {
            const ELEMENT: ElementType = $element;

            #[inline]
            fn to_f64(value: Self::Native) -> f64 {
                value as f64
            }

            #[inline]
            fn total_cmp(a: Self::Native, b: Self::Native) -> Ordering {
                a.total_cmp(&b)
            }

            #[inline]
            fn hash_bits(value: Self::Native) -> u64 {
                if value.is_nan() {
                    f64::NAN.to_bits()
                } else {
                    (value as f64).to_bits()
                }
            }
        }
    };
}

impl_integer_numeric!(Int32Type, ElementType::Int);
impl_integer_numeric!(Int64Type, ElementType::Long);
impl_float_numeric!(Float32Type, ElementType::Float);
impl_float_numeric!(Float64Type, ElementType::Double);

/// Instantiate `$body` for the concrete arrow type matching `$element`.
///
/// `$t` is bound as a type alias inside the body.
#[macro_export]
macro_rules! dispatch_element_type {
    ($element:expr, $t:ident => $body:expr) => {
        match $element {
            $crate::aggregation::numeric::ElementType::Int => {
                type $t = ::arrow::datatypes::Int32Type;
                $body
            }
            $crate::aggregation::numeric::ElementType::Long => {
                type $t = ::arrow::datatypes::Int64Type;
                $body
            }
            $crate::aggregation::numeric::ElementType::Float => {
                type $t = ::arrow::datatypes::Float32Type;
                $body
            }
            $crate::aggregation::numeric::ElementType::Double => {
                type $t = ::arrow::datatypes::Float64Type;
                $body
            }
        }
    };
}
