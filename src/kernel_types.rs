//! Shared types for the capacity-bounded dispatch kernels.
//!
//! Element-type resolution happens once, at specialization time, through the
//! closed [`ElementType`] enum. Kernels never branch on the element kind at
//! runtime; they are generated (CUDA) or monomorphized (CPU) per concrete
//! type.

use std::sync::atomic::{AtomicU32, Ordering};

use half::f16;
use thiserror::Error;

/// Width of one cooperating lane group (a warp).
pub const LANE_WIDTH: usize = 32;

/// Errors surfaced by the kernel-generation glue and the engine boundary.
///
/// The kernels themselves have no recoverable-error path: capacity overflow
/// is a defined drop, and out-of-range router output is a documented
/// precondition violation.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("unrecognized element type: {0}")]
    UnsupportedElementType(String),
    #[error("invalid kernel spec: {0}")]
    InvalidSpec(String),
    #[error("{name} length mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unbound template placeholder: @{0}@")]
    UnboundPlaceholder(String),
    #[cfg(feature = "cuda")]
    #[error("cuda driver error: {0}")]
    Cuda(String),
    #[cfg(feature = "cuda")]
    #[error("kernel compilation failed: {0}")]
    Compile(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Supported working element types, resolved once per specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Single-precision float.
    F32,
    /// Packed pair of half-precision floats (one 32-bit cell).
    F16x2,
}

impl ElementType {
    /// Resolve an external dtype tag. This is the fail-fast validation step
    /// that runs before any kernel generation.
    pub fn from_tag(tag: &str) -> KernelResult<Self> {
        match tag {
            "f32" | "float32" => Ok(ElementType::F32),
            "f16" | "float16" => Ok(ElementType::F16x2),
            other => Err(KernelError::UnsupportedElementType(other.to_string())),
        }
    }

    /// CUDA name of the working element type.
    pub const fn cuda_name(self) -> &'static str {
        match self {
            ElementType::F32 => "float",
            ElementType::F16x2 => "__half2",
        }
    }

    /// CUDA name of the scalar type used for gates and gate gradients.
    pub const fn cuda_scalar_name(self) -> &'static str {
        match self {
            ElementType::F32 => "float",
            ElementType::F16x2 => "__half",
        }
    }

    /// Whether the working type is the plain scalar float.
    pub const fn is_float(self) -> bool {
        matches!(self, ElementType::F32)
    }
}

/// Intra-group reduction strategy for the gate-gradient kernel.
///
/// Both strategies must produce the same value modulo floating-point
/// association order; which one is usable depends on the target hardware
/// family, so the choice is explicit rather than guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReduceStrategy {
    /// Register exchange between lanes (warp shuffle).
    #[default]
    LaneShuffle,
    /// Shared scratch memory with a barrier per halving step.
    SharedScratch,
}

/// A packed pair of half-precision values, the 32-bit working element of the
/// half-precision kernel specializations.
///
/// Alignment is forced to 4 so a buffer of pairs can be accumulated through
/// 32-bit atomic cells, matching the device-side `atomicAdd(__half2)`.
#[repr(C, align(4))]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Half2 {
    pub lo: f16,
    pub hi: f16,
}

impl Half2 {
    pub const ZERO: Half2 = Half2 {
        lo: f16::ZERO,
        hi: f16::ZERO,
    };

    pub fn new(lo: f16, hi: f16) -> Self {
        Half2 { lo, hi }
    }

    /// Broadcast one scalar into both components.
    pub fn splat(value: f16) -> Self {
        Half2 {
            lo: value,
            hi: value,
        }
    }

    pub fn from_f32s(lo: f32, hi: f32) -> Self {
        Half2 {
            lo: f16::from_f32(lo),
            hi: f16::from_f32(hi),
        }
    }
}

/// Marker tying element types to the device representation the CUDA backend
/// requires; a no-op bound for CPU-only builds.
#[cfg(feature = "cuda")]
pub trait BackendRepr: cudarc::driver::DeviceRepr {}
#[cfg(not(feature = "cuda"))]
pub trait BackendRepr {}

impl BackendRepr for f32 {}
impl BackendRepr for f16 {}
impl BackendRepr for Half2 {}

/// Element behavior the kernels are monomorphized over.
///
/// Implemented for `f32` and [`Half2`]. Both are 32-bit cells, which is what
/// makes the uniform atomic accumulation in dispatch possible.
pub trait DispatchElement: Copy + Default + PartialEq + Send + Sync + BackendRepr + 'static {
    /// Scalar type of gates and gate gradients.
    type Scalar: Copy + Default + PartialEq + Send + Sync + BackendRepr + 'static;

    const ELEMENT: ElementType;

    fn zero() -> Self;
    fn scalar_zero() -> Self::Scalar;

    /// Gate-weighted value: `gate * self`, with the gate broadcast across
    /// packed components.
    fn scale(self, gate: Self::Scalar) -> Self;
    fn add(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;

    /// Collapse the working accumulator to the scalar output type (sums the
    /// two components of a packed pair).
    fn collapse(self) -> Self::Scalar;

    fn to_bits(self) -> u32;
    fn from_bits(bits: u32) -> Self;

    fn scalar_to_f32(scalar: Self::Scalar) -> f32;

    /// Atomic `*cell += delta` on a 32-bit cell, the CPU counterpart of the
    /// device atomic add. Loops on contention.
    fn atomic_accumulate(cell: &AtomicU32, delta: Self) {
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let updated = Self::from_bits(current).add(delta).to_bits();
            match cell.compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl DispatchElement for f32 {
    type Scalar = f32;

    const ELEMENT: ElementType = ElementType::F32;

    #[inline(always)]
    fn zero() -> Self {
        0.0
    }

    #[inline(always)]
    fn scalar_zero() -> Self::Scalar {
        0.0
    }

    #[inline(always)]
    fn scale(self, gate: f32) -> Self {
        gate * self
    }

    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        self * rhs
    }

    #[inline(always)]
    fn collapse(self) -> f32 {
        self
    }

    #[inline(always)]
    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    #[inline(always)]
    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }

    #[inline(always)]
    fn scalar_to_f32(scalar: f32) -> f32 {
        scalar
    }
}

impl DispatchElement for Half2 {
    type Scalar = f16;

    const ELEMENT: ElementType = ElementType::F16x2;

    #[inline(always)]
    fn zero() -> Self {
        Half2::ZERO
    }

    #[inline(always)]
    fn scalar_zero() -> Self::Scalar {
        f16::ZERO
    }

    // Per-component arithmetic rounds after every operation, matching the
    // native half2 instructions rather than a widened f32 pipeline.
    #[inline(always)]
    fn scale(self, gate: f16) -> Self {
        let g = gate.to_f32();
        Half2::from_f32s(self.lo.to_f32() * g, self.hi.to_f32() * g)
    }

    #[inline(always)]
    fn add(self, rhs: Self) -> Self {
        Half2::from_f32s(
            self.lo.to_f32() + rhs.lo.to_f32(),
            self.hi.to_f32() + rhs.hi.to_f32(),
        )
    }

    #[inline(always)]
    fn mul(self, rhs: Self) -> Self {
        Half2::from_f32s(
            self.lo.to_f32() * rhs.lo.to_f32(),
            self.hi.to_f32() * rhs.hi.to_f32(),
        )
    }

    #[inline(always)]
    fn collapse(self) -> f16 {
        f16::from_f32(self.lo.to_f32() + self.hi.to_f32())
    }

    #[inline(always)]
    fn to_bits(self) -> u32 {
        (self.lo.to_bits() as u32) | ((self.hi.to_bits() as u32) << 16)
    }

    #[inline(always)]
    fn from_bits(bits: u32) -> Self {
        Half2 {
            lo: f16::from_bits(bits as u16),
            hi: f16::from_bits((bits >> 16) as u16),
        }
    }

    #[inline(always)]
    fn scalar_to_f32(scalar: f16) -> f32 {
        scalar.to_f32()
    }
}

/// Shape parameters of one kernel specialization.
///
/// `hidden` is counted in units of the working element type; padding the
/// model dimension to that unit is the caller's contract and not validated
/// per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelSpec {
    pub samples: usize,
    pub hidden: usize,
    pub capacity: usize,
    pub global_experts: usize,
}

impl KernelSpec {
    pub fn new(
        samples: usize,
        hidden: usize,
        capacity: usize,
        global_experts: usize,
    ) -> KernelResult<Self> {
        if samples == 0 || hidden == 0 || capacity == 0 || global_experts == 0 {
            return Err(KernelError::InvalidSpec(format!(
                "all dimensions must be > 0 (samples={samples}, hidden={hidden}, \
                 capacity={capacity}, global_experts={global_experts})"
            )));
        }
        let spec = KernelSpec {
            samples,
            hidden,
            capacity,
            global_experts,
        };
        spec.dispatched_len().ok_or_else(|| {
            KernelError::InvalidSpec("expert buffer length overflows usize".to_string())
        })?;
        spec.input_len()
            .ok_or_else(|| KernelError::InvalidSpec("input length overflows usize".to_string()))?;
        Ok(spec)
    }

    /// Length of the `[global_experts * capacity, hidden]` expert buffer.
    pub fn dispatched_len(&self) -> Option<usize> {
        self.global_experts
            .checked_mul(self.capacity)?
            .checked_mul(self.hidden)
    }

    /// Length of the `[samples, hidden]` activation buffer.
    pub fn input_len(&self) -> Option<usize> {
        self.samples.checked_mul(self.hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_type_tag_resolution() {
        assert_eq!(ElementType::from_tag("f32").unwrap(), ElementType::F32);
        assert_eq!(
            ElementType::from_tag("float16").unwrap(),
            ElementType::F16x2
        );

        let err = ElementType::from_tag("f64").unwrap_err();
        assert!(matches!(err, KernelError::UnsupportedElementType(ref t) if t == "f64"));
    }

    #[test]
    fn half2_zero_is_a_zero_pair() {
        let zero = Half2::zero();
        assert_eq!(zero.lo.to_bits(), 0);
        assert_eq!(zero.hi.to_bits(), 0);

        // Round-trip through the 32-bit cell representation.
        let roundtrip = Half2::from_bits(zero.to_bits());
        assert_eq!(roundtrip.lo.to_bits(), 0);
        assert_eq!(roundtrip.hi.to_bits(), 0);
    }

    #[test]
    fn half2_bits_roundtrip() {
        let v = Half2::from_f32s(1.5, -0.25);
        let back = Half2::from_bits(v.to_bits());
        assert_eq!(v, back);
    }

    #[test]
    fn half2_cell_layout_fits_atomic() {
        assert_eq!(std::mem::size_of::<Half2>(), 4);
        assert_eq!(std::mem::align_of::<Half2>(), 4);
        assert_eq!(std::mem::size_of::<f32>(), 4);
    }

    #[test]
    fn atomic_accumulate_sums_under_contention() {
        let cell = AtomicU32::new(0.0f32.to_bits());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        f32::atomic_accumulate(&cell, 1.0);
                    }
                });
            }
        });
        assert_eq!(f32::from_bits(cell.load(Ordering::Relaxed)), 4000.0);
    }

    #[test]
    fn kernel_spec_rejects_zero_dims() {
        assert!(KernelSpec::new(0, 8, 2, 2).is_err());
        assert!(KernelSpec::new(4, 8, 2, 0).is_err());
        let spec = KernelSpec::new(4, 8, 2, 2).unwrap();
        assert_eq!(spec.dispatched_len(), Some(32));
        assert_eq!(spec.input_len(), Some(32));
    }

    #[test]
    fn kernel_spec_rejects_overflowing_buffers() {
        assert!(KernelSpec::new(2, usize::MAX / 2, 4, 4).is_err());
    }
}
