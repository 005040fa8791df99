//! Host-side tensor representation used during conversion
//!
//! Values are mirrored as `f32` on the host regardless of the logical dtype;
//! casting rounds them through the narrower format so that the mirrored
//! values match what the device would hold. Meta tensors carry shape and
//! dtype only.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use half::{bf16, f16};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::parallel::SliceLayout;

/// Tensor data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    I8,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 => 1,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Round a value to what this dtype can represent
    pub fn round(&self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::BF16 => bf16::from_f32(value).to_f32(),
            DType::I32 => value.trunc(),
            DType::I8 => value.trunc().clamp(i8::MIN as f32, i8::MAX as f32),
        }
    }

    /// Decode little-endian raw bytes into host values
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() % self.size_bytes() != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "{} bytes is not a multiple of {:?} element size",
                bytes.len(),
                self
            )));
        }
        let values = match self {
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DType::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            DType::BF16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            DType::I32 => bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            DType::I8 => bytes.iter().map(|&b| b as i8 as f32).collect(),
        };
        Ok(values)
    }

    /// Parse dtype from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "f32" | "float32" | "fp32" | "float" => Some(DType::F32),
            "f16" | "float16" | "fp16" | "half" => Some(DType::F16),
            "bf16" | "bfloat16" => Some(DType::BF16),
            "i32" | "int32" => Some(DType::I32),
            "i8" | "int8" => Some(DType::I8),
            _ => None,
        }
    }
}

/// Device location for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    /// Shape/dtype only, no storage
    Meta,
    /// Accelerator, optionally with an explicit index
    Xpu(Option<usize>),
}

impl Device {
    pub fn is_meta(&self) -> bool {
        matches!(self, Device::Meta)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Meta => write!(f, "meta"),
            Device::Xpu(None) => write!(f, "xpu"),
            Device::Xpu(Some(idx)) => write!(f, "xpu:{}", idx),
        }
    }
}

impl FromStr for Device {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Device::Cpu),
            "meta" => Ok(Device::Meta),
            "xpu" => Ok(Device::Xpu(None)),
            other => {
                let idx = other
                    .strip_prefix("xpu:")
                    .and_then(|i| i.parse().ok())
                    .ok_or_else(|| CoreError::InvalidConfig(format!("unknown device '{}'", s)))?;
                Ok(Device::Xpu(Some(idx)))
            }
        }
    }
}

impl TryFrom<String> for Device {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Record left on a parameter once it has been reduced to a local shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMark {
    /// Partition axis
    pub axis: usize,
    /// Chunk layout along the axis
    pub layout: SliceLayout,
    /// Rank holding this shard
    pub rank: usize,
    /// Number of shards
    pub tp_size: usize,
    /// Shape before slicing
    pub full_shape: Vec<usize>,
}

/// Tensor with host-mirrored values
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    /// `None` for meta tensors
    data: Option<Vec<f32>>,
    shard: Option<ShardMark>,
}

impl Tensor {
    /// Create a tensor from host values, rounding them to `dtype`
    pub fn new(shape: Vec<usize>, dtype: DType, device: Device, mut data: Vec<f32>) -> Result<Self> {
        if device.is_meta() {
            return Ok(Self::meta(shape, dtype));
        }
        let numel = shape::numel(&shape);
        if data.len() != numel {
            return Err(CoreError::shape(
                "<new>",
                format!("{} values do not fill shape {:?}", data.len(), shape),
            ));
        }
        if dtype != DType::F32 {
            data.iter_mut().for_each(|v| *v = dtype.round(*v));
        }
        Ok(Self {
            shape,
            dtype,
            device,
            data: Some(data),
            shard: None,
        })
    }

    /// Create an f32 CPU tensor
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::new(shape, DType::F32, Device::Cpu, data)
    }

    /// Create a tensor filled with one value
    pub fn full(shape: Vec<usize>, value: f32, dtype: DType, device: Device) -> Self {
        if device.is_meta() {
            return Self::meta(shape, dtype);
        }
        let numel = shape::numel(&shape);
        Self {
            shape,
            dtype,
            device,
            data: Some(vec![dtype.round(value); numel]),
            shard: None,
        }
    }

    /// Create a storage-less tensor
    pub fn meta(shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            device: Device::Meta,
            data: None,
            shard: None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn shard(&self) -> Option<&ShardMark> {
        self.shard.as_ref()
    }

    /// Get the number of elements
    pub fn numel(&self) -> usize {
        shape::numel(&self.shape)
    }

    /// Get size in bytes
    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_bytes()
    }

    pub fn is_meta(&self) -> bool {
        self.data.is_none()
    }

    pub fn is_floating_point(&self) -> bool {
        self.dtype.is_floating_point()
    }

    /// Host values, `None` for meta tensors
    pub fn data(&self) -> Option<&[f32]> {
        self.data.as_deref()
    }

    /// Replace shape and values with a local shard and record the mark
    pub fn install_shard(&mut self, shape: Vec<usize>, data: Option<Vec<f32>>, mark: ShardMark) {
        self.shape = shape;
        self.data = data;
        self.shard = Some(mark);
    }

    /// Move to another device
    ///
    /// Leaving the meta device requires values, which a meta tensor does not
    /// have; load real weights first.
    pub fn to_device(&mut self, name: &str, device: Device) -> Result<()> {
        if self.is_meta() && !device.is_meta() {
            return Err(CoreError::NoStorage(name.to_string()));
        }
        if device.is_meta() {
            self.data = None;
        }
        self.device = device;
        Ok(())
    }

    /// Cast to another dtype, rounding the mirrored values
    pub fn to_dtype(&mut self, dtype: DType) {
        if let Some(data) = self.data.as_mut() {
            data.iter_mut().for_each(|v| *v = dtype.round(*v));
        }
        self.dtype = dtype;
    }

    /// Value-copy `values` into this tensor's storage
    ///
    /// A meta tensor is materialized on the CPU. The shard mark is kept.
    pub fn copy_values(&mut self, name: &str, values: &[f32]) -> Result<()> {
        if values.len() != self.numel() {
            return Err(CoreError::shape(
                name,
                format!("{} values for shape {:?}", values.len(), self.shape),
            ));
        }
        let dtype = self.dtype;
        match self.data.as_mut() {
            Some(data) => {
                for (dst, &src) in data.iter_mut().zip(values) {
                    *dst = dtype.round(src);
                }
            }
            None => {
                self.data = Some(values.iter().map(|&v| dtype.round(v)).collect());
                self.device = Device::Cpu;
            }
        }
        Ok(())
    }
}

/// Shared parameter handle
///
/// Every holder of a handle observes in-place mutations, which is what keeps
/// caller references valid across slicing, loading and replacement.
pub type Parameter = Arc<RwLock<Tensor>>;

/// Wrap a tensor in a parameter handle
pub fn parameter(tensor: Tensor) -> Parameter {
    Arc::new(RwLock::new(tensor))
}

/// Tensor shape utilities
pub mod shape {
    /// Calculate the product of dimensions
    pub fn numel(shape: &[usize]) -> usize {
        shape.iter().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let tensor = Tensor::full(vec![32, 32], 1.0, DType::F32, Device::Cpu);
        assert_eq!(tensor.numel(), 1024);
        assert_eq!(tensor.size_bytes(), 4096);
        assert!(!tensor.is_meta());
    }

    #[test]
    fn test_meta_tensor_has_no_storage() {
        let tensor = Tensor::full(vec![8, 4], 0.0, DType::F16, Device::Meta);
        assert!(tensor.is_meta());
        assert_eq!(tensor.data(), None);
        assert_eq!(tensor.dtype(), DType::F16);
        assert_eq!(tensor.shape(), &[8, 4]);
    }

    #[test]
    fn test_cast_rounds_values() {
        let mut tensor = Tensor::from_f32(vec![2], vec![1.0, 1.0 + 1e-4]).unwrap();
        tensor.to_dtype(DType::BF16);
        assert_eq!(tensor.dtype(), DType::BF16);
        assert_eq!(tensor.data().unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn test_meta_cannot_leave_meta() {
        let mut tensor = Tensor::meta(vec![4], DType::F32);
        assert!(matches!(
            tensor.to_device("w", Device::Xpu(None)),
            Err(CoreError::NoStorage(_))
        ));
    }

    #[test]
    fn test_copy_materializes_meta() {
        let mut tensor = Tensor::meta(vec![2], DType::F16);
        tensor.copy_values("w", &[0.5, 2.0]).unwrap();
        assert_eq!(tensor.device(), Device::Cpu);
        assert_eq!(tensor.data().unwrap(), &[0.5, 2.0]);
    }

    #[test]
    fn test_decode_bf16() {
        let bytes: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        assert_eq!(DType::BF16.decode(&bytes).unwrap(), vec![1.5, -2.0]);
        assert!(DType::F32.decode(&bytes[..3]).is_err());
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("xpu:3".parse::<Device>().unwrap(), Device::Xpu(Some(3)));
        assert_eq!("XPU".parse::<Device>().unwrap(), Device::Xpu(None));
        assert_eq!(Device::Xpu(Some(1)).to_string(), "xpu:1");
        assert!("cuda:0".parse::<Device>().is_err());
    }
}
