//! Portable CPU backend for the dispatch kernels.
//!
//! The CPU kernels keep the parallel shape of their device counterparts:
//! sample-parallel execution, 32-bit atomic accumulation in the scatter, and
//! an explicit 32-lane group model with the 16/8/4/2/1 halving schedule in
//! the gate-gradient reduction.

mod combine_grad;
mod dispatch;
mod gate_grad;

pub use combine_grad::combine_grad;
pub use dispatch::dispatch;
pub use gate_grad::gate_grad;
