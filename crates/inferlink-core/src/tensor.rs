use std::fmt;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::arena::LiveToken;
use crate::error::{InferError, Result};

/// Maximum number of dimensions a descriptor may carry.
pub const MAX_RANK: usize = 8;

/// Maximum length, in bytes, of a tensor or signature name.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Float32,
    Float64,
    Int32,
    Uint8,
    Int16,
    Int8,
    String,
    Int64,
    Bool,
}

impl ElementType {
    /// Size of one element in bytes. Strings are sized per byte.
    pub fn size_of(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 => 8,
            Self::Int16 => 2,
            Self::Uint8 | Self::Int8 | Self::String | Self::Bool => 1,
        }
    }

    /// Whether the run path can hand this type to the engine.
    pub fn is_marshalable(self) -> bool {
        matches!(self, Self::Float32 | Self::Uint8 | Self::Int32)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int32 => "int32",
            Self::Uint8 => "uint8",
            Self::Int16 => "int16",
            Self::Int8 => "int8",
            Self::String => "string",
            Self::Int64 => "int64",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rust scalar types with a fixed [`ElementType`].
pub trait TensorElement: Pod {
    const ELEMENT_TYPE: ElementType;
}

macro_rules! tensor_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl TensorElement for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$variant;
        })*
    };
}

tensor_element! {
    f32 => Float32,
    f64 => Float64,
    i32 => Int32,
    u8 => Uint8,
    i16 => Int16,
    i8 => Int8,
    i64 => Int64,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Shape(pub SmallVec<[i64; MAX_RANK]>);

impl Shape {
    pub fn from_slice(d: &[i64]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn dims(&self) -> &[i64] {
        &self.0
    }
    /// Index of the first dimension that is not strictly positive.
    pub fn first_non_positive(&self) -> Option<usize> {
        self.0.iter().position(|d| *d <= 0)
    }
    /// Product of all dimensions; `None` on a negative dimension or overflow.
    pub fn numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, d| {
            let d = usize::try_from(*d).ok()?;
            acc.checked_mul(d)
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// A named, typed, shaped tensor description.
///
/// `element_count` and `byte_length` are derived from the shape and are kept
/// in sync by every mutating method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDescriptor {
    name: String,
    element_type: ElementType,
    shape: Shape,
    element_count: usize,
    byte_length: usize,
}

impl TensorDescriptor {
    pub fn new(name: impl Into<String>, element_type: ElementType, dims: &[i64]) -> Result<Self> {
        let name = name.into();
        check_name(&name)?;
        let mut desc = Self {
            name,
            element_type,
            shape: Shape::default(),
            element_count: 0,
            byte_length: 0,
        };
        desc.set_shape(dims)?;
        Ok(desc)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Replace the shape and recompute the derived sizes.
    ///
    /// Zero dimensions are accepted here; [`Self::require_positive`] rejects
    /// them before a run.
    pub fn set_shape(&mut self, dims: &[i64]) -> Result<()> {
        if dims.len() > MAX_RANK {
            return Err(InferError::failed(format!(
                "tensor `{}` has rank {}, maximum is {MAX_RANK}",
                self.name,
                dims.len()
            )));
        }
        if let Some(j) = dims.iter().position(|d| *d < 0) {
            return Err(InferError::failed(format!(
                "tensor `{}` shape[{j}] = {} is negative",
                self.name, dims[j]
            )));
        }
        self.shape = Shape::from_slice(dims);
        self.recompute()
    }

    /// Recompute `element_count` and `byte_length` from the current shape.
    pub fn recompute(&mut self) -> Result<()> {
        let overflow = || {
            InferError::failed(format!(
                "tensor `{}` with shape {} is too large",
                self.name, self.shape
            ))
        };
        let count = self.shape.numel().ok_or_else(overflow)?;
        let bytes = count
            .checked_mul(self.element_type.size_of())
            .ok_or_else(overflow)?;
        self.element_count = count;
        self.byte_length = bytes;
        Ok(())
    }

    /// Every dimension must be strictly positive.
    pub fn require_positive(&self) -> Result<()> {
        match self.shape.first_non_positive() {
            Some(j) => Err(InferError::failed(format!(
                "tensor `{}` shape[{j}] should be > 0, got {}",
                self.name, self.shape.0[j]
            ))),
            None => Ok(()),
        }
    }
}

pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(InferError::ParamNull("tensor name"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(InferError::failed(format!(
            "name of {} bytes exceeds the {MAX_NAME_LEN} byte limit",
            name.len()
        )));
    }
    Ok(())
}

/// A descriptor plus the bytes it describes.
#[derive(Debug)]
pub struct TensorBuffer {
    desc: TensorDescriptor,
    data: Vec<u8>,
    _token: Option<LiveToken>,
}

impl TensorBuffer {
    /// Allocate a zero-filled buffer of `desc.byte_length()` bytes.
    pub fn new(desc: TensorDescriptor) -> Result<Self> {
        let data = alloc_bytes(&desc)?;
        Ok(Self {
            desc,
            data,
            _token: None,
        })
    }

    pub(crate) fn tracked(desc: TensorDescriptor, token: LiveToken) -> Result<Self> {
        let mut buf = Self::new(desc)?;
        buf._token = Some(token);
        Ok(buf)
    }

    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.desc
    }

    pub fn name(&self) -> &str {
        self.desc.name()
    }

    pub fn element_type(&self) -> ElementType {
        self.desc.element_type()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Change the shape and resize storage to match. Existing bytes are
    /// preserved up to the new length; growth is zero-filled.
    pub fn reshape(&mut self, dims: &[i64]) -> Result<()> {
        let mut desc = self.desc.clone();
        desc.set_shape(dims)?;
        let target = desc.byte_length();
        if target > self.data.len() {
            self.data
                .try_reserve_exact(target - self.data.len())
                .map_err(|_| InferError::AllocFailed {
                    name: desc.name().to_string(),
                    bytes: target,
                })?;
        }
        self.data.resize(target, 0);
        self.desc = desc;
        Ok(())
    }

    /// Recompute the descriptor sizes; storage is left untouched.
    pub(crate) fn recompute(&mut self) -> Result<()> {
        self.desc.recompute()
    }

    /// Overwrite the buffer with `values`; the element count must match.
    pub fn copy_from_slice<T: TensorElement>(&mut self, values: &[T]) -> Result<()> {
        self.check_type::<T>()?;
        let src: &[u8] = bytemuck::cast_slice(values);
        if src.len() != self.data.len() {
            return Err(InferError::failed(format!(
                "tensor `{}` holds {} bytes, got {}",
                self.name(),
                self.data.len(),
                src.len()
            )));
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Copy the buffer out as typed values.
    pub fn to_vec<T: TensorElement>(&self) -> Result<Vec<T>> {
        self.check_type::<T>()?;
        Ok(self
            .data
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    fn check_type<T: TensorElement>(&self) -> Result<()> {
        if T::ELEMENT_TYPE != self.element_type() {
            return Err(InferError::failed(format!(
                "tensor `{}` is {}, accessed as {}",
                self.name(),
                self.element_type(),
                T::ELEMENT_TYPE
            )));
        }
        Ok(())
    }
}

fn alloc_bytes(desc: &TensorDescriptor) -> Result<Vec<u8>> {
    let len = desc.byte_length();
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| InferError::AllocFailed {
            name: desc.name().to_string(),
            bytes: len,
        })?;
    data.resize(len, 0);
    Ok(data)
}

/// Ordered buffers, matching the engine's node order, plus an optional
/// signature name.
#[derive(Debug, Default)]
pub struct TensorSet {
    buffers: Vec<TensorBuffer>,
    signature: Option<String>,
}

impl TensorSet {
    pub(crate) fn from_parts(buffers: Vec<TensorBuffer>, signature: Option<String>) -> Self {
        Self { buffers, signature }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn get(&self, index: usize) -> Option<&TensorBuffer> {
        self.buffers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TensorBuffer> {
        self.buffers.get_mut(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&TensorBuffer> {
        self.buffers.iter().find(|b| b.name() == name)
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut TensorBuffer> {
        self.buffers.iter_mut().find(|b| b.name() == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TensorBuffer> {
        self.buffers.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, TensorBuffer> {
        self.buffers.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buffers.iter().map(|b| b.name())
    }

    pub fn total_bytes(&self) -> usize {
        self.buffers.iter().map(TensorBuffer::len).sum()
    }
}

impl<'a> IntoIterator for &'a TensorSet {
    type Item = &'a TensorBuffer;
    type IntoIter = std::slice::Iter<'a, TensorBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn image_input_sizes() {
        let desc = TensorDescriptor::new("input_1", ElementType::Float32, &[1, 3, 224, 224]).unwrap();
        assert_eq!(desc.rank(), 4);
        assert_eq!(desc.element_count(), 150_528);
        assert_eq!(desc.byte_length(), 602_112);
    }

    #[test]
    fn scalar_has_one_element() {
        let desc = TensorDescriptor::new("scale", ElementType::Float64, &[]).unwrap();
        assert_eq!(desc.element_count(), 1);
        assert_eq!(desc.byte_length(), 8);
    }

    #[test]
    fn ingress_validation() {
        assert!(matches!(
            TensorDescriptor::new("", ElementType::Uint8, &[1]),
            Err(InferError::ParamNull(_))
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            TensorDescriptor::new(long, ElementType::Uint8, &[1]),
            Err(InferError::Failed(_))
        ));
        assert!(TensorDescriptor::new("deep", ElementType::Uint8, &[1; MAX_RANK + 1]).is_err());
        assert!(TensorDescriptor::new("neg", ElementType::Uint8, &[2, -1]).is_err());
    }

    #[test]
    fn zero_dims_allocate_but_fail_run_check() {
        let desc = TensorDescriptor::new("dyn", ElementType::Int32, &[0, 4]).unwrap();
        assert_eq!(desc.byte_length(), 0);
        assert!(desc.require_positive().is_err());
    }

    #[test]
    fn reshape_resizes_storage() {
        let desc = TensorDescriptor::new("x", ElementType::Int32, &[2]).unwrap();
        let mut buf = TensorBuffer::new(desc).unwrap();
        buf.copy_from_slice(&[7i32, 8]).unwrap();
        buf.reshape(&[2, 2]).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.to_vec::<i32>().unwrap(), vec![7, 8, 0, 0]);
    }

    #[test]
    fn typed_access_checks_type_and_length() {
        let desc = TensorDescriptor::new("x", ElementType::Float32, &[3]).unwrap();
        let mut buf = TensorBuffer::new(desc).unwrap();
        assert!(buf.copy_from_slice(&[1u8, 2, 3]).is_err());
        assert!(buf.copy_from_slice(&[1.0f32, 2.0]).is_err());
        buf.copy_from_slice(&[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(buf.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    fn element_type() -> impl Strategy<Value = ElementType> {
        prop_oneof![
            Just(ElementType::Float32),
            Just(ElementType::Float64),
            Just(ElementType::Int32),
            Just(ElementType::Uint8),
            Just(ElementType::Int16),
            Just(ElementType::Int8),
            Just(ElementType::String),
            Just(ElementType::Int64),
            Just(ElementType::Bool),
        ]
    }

    proptest! {
        #[test]
        fn sizes_follow_shape(ty in element_type(), dims in prop::collection::vec(1i64..32, 0..=MAX_RANK)) {
            let desc = TensorDescriptor::new("t", ty, &dims).unwrap();
            let count: i64 = dims.iter().product();
            prop_assert_eq!(desc.element_count(), count as usize);
            prop_assert_eq!(desc.byte_length(), count as usize * ty.size_of());
        }
    }
}
