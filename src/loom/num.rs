use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    U8,
    U16,
    U32,
}

impl DataType {
    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
        }
    }
}

pub trait Zero {
    fn zero() -> Self;
}

impl Zero for f32 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for f16 {
    fn zero() -> Self {
        Self::ZERO
    }
}

impl Zero for u8 {
    fn zero() -> Self {
        0
    }
}

impl Zero for u16 {
    fn zero() -> Self {
        0
    }
}

impl Zero for u32 {
    fn zero() -> Self {
        0
    }
}

pub trait Scalar:
    Sized + Zeroable + Pod + Zero + PartialEq + std::fmt::Debug + Send + Sync
{
    const DATA_TYPE: DataType;
}

/// Element types the reference kernels accumulate in `f32`.
pub trait Float: Scalar {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

impl Scalar for u16 {
    const DATA_TYPE: DataType = DataType::U16;
}

impl Scalar for u32 {
    const DATA_TYPE: DataType = DataType::U32;
}

impl Float for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Float for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::{DataType, Float, Scalar};

    #[test]
    fn test_data_type_size() {
        assert_eq!(DataType::F32.size(), size_of::<f32>());
        assert_eq!(DataType::F16.size(), size_of::<f16>());
        assert_eq!(<u16 as Scalar>::DATA_TYPE.size(), 2);
        assert_eq!(DataType::F16.to_string(), "F16");
    }

    #[test]
    fn test_float_round_trip() {
        let x = <f16 as Float>::from_f32(1.5);
        assert_eq!(Float::to_f32(x), 1.5);
        assert_eq!(<f32 as Float>::from_f32(-2.25), -2.25);
    }
}
