//! moe-dispatch-kernels: the data-movement core of a sparse
//! Mixture-of-Experts layer.
//!
//! Three kernels share one index scheme over capacity-bounded per-expert
//! buffers:
//! - **Dispatch**: scatter gate-weighted activation rows into expert
//!   buffers (atomic accumulation, capacity overflow drops the sample)
//! - **Combine-Gradient**: gather per-sample gradients back out of the
//!   buffers (exact-zero rows for dropped samples)
//! - **Gate-Gradient**: per-sample dot-product reduction across one
//!   cooperating lane group (two selectable reduction strategies)
//!
//! Kernels are specialized per `(samples, hidden, capacity, element type)`
//! tuple: monomorphized on the CPU backend, NVRTC-compiled with a
//! compile-once cache on the CUDA backend (feature `cuda`).
//!
//! # Quick start
//!
//! ```
//! use moe_dispatch_kernels::{DispatchEngine, KernelSpec};
//!
//! let spec = KernelSpec::new(4, 8, 2, 2).unwrap();
//! let engine = DispatchEngine::<f32>::new(spec);
//!
//! let gates = [1.0f32, 0.5, 0.25, 0.75];
//! let indices = [0i32, 0, 1, 0];
//! let locations = [0i32, 1, 0, 2]; // sample 3 overflows expert 0: dropped
//! let input = vec![1.0f32; spec.input_len().unwrap()];
//! let mut dispatched = vec![0.0f32; spec.dispatched_len().unwrap()];
//!
//! engine
//!     .dispatch(&gates, &indices, &locations, &input, &mut dispatched)
//!     .unwrap();
//! ```
//!
//! Routing itself (softmax, top-k, load balancing) happens upstream; this
//! crate consumes its outputs and trusts them: capacity overflow is a
//! defined drop, out-of-range indices are a precondition violation.

pub mod comm;
pub mod cpu_kernels;
#[cfg(feature = "cuda")]
pub mod cuda_kernels;
pub mod jit;
pub mod kernel_dispatcher;
pub mod kernel_types;

pub use jit::{render_template, KernelFlavor, KernelKey};
pub use kernel_dispatcher::{BackendKind, DispatchEngine};
pub use kernel_types::{
    DispatchElement, ElementType, Half2, KernelError, KernelResult, KernelSpec, ReduceStrategy,
    LANE_WIDTH,
};
