//! Capacity-bounded scatter of gate-weighted rows into expert buffers.

use std::sync::atomic::AtomicU32;

use rayon::prelude::*;

use crate::kernel_types::{DispatchElement, KernelSpec};

/// View a buffer of 32-bit elements as atomic cells.
fn as_atomic_cells<T: DispatchElement>(buffer: &mut [T]) -> &[AtomicU32] {
    assert_eq!(std::mem::size_of::<T>(), 4);
    assert_eq!(std::mem::align_of::<T>(), 4);
    // SAFETY: T is a plain 32-bit value with 4-byte alignment (asserted
    // above), so the memory is valid for AtomicU32 access; the exclusive
    // borrow guarantees no non-atomic aliasing during the view's lifetime.
    unsafe { std::slice::from_raw_parts(buffer.as_mut_ptr().cast::<AtomicU32>(), buffer.len()) }
}

/// For every admitted sample `i`, atomically accumulate
/// `gates[i] * input[i, j]` into `dispatched[indices[i] * capacity +
/// locations[i], j]`. Dropped samples (`locations[i] >= capacity`) write
/// nothing.
///
/// `dispatched` must be zero-initialized by the caller. Accumulation is
/// always atomic, never a plain store: slot uniqueness among admitted
/// samples is the router's contract and is not verified here, so colliding
/// writers must still sum correctly.
///
/// Out-of-range `indices`/`locations` are a precondition violation; the
/// kernel performs no per-element bounds validation beyond what slice
/// indexing enforces.
pub fn dispatch<T: DispatchElement>(
    gates: &[T::Scalar],
    indices: &[i32],
    locations: &[i32],
    input: &[T],
    dispatched: &mut [T],
    spec: &KernelSpec,
) {
    let hidden = spec.hidden;
    let capacity = spec.capacity as i32;
    debug_assert_eq!(gates.len(), spec.samples);
    debug_assert_eq!(input.len(), spec.samples * hidden);

    let cells = as_atomic_cells(dispatched);
    (0..spec.samples).into_par_iter().for_each(|i| {
        if locations[i] < capacity {
            let slot = indices[i] as usize * spec.capacity + locations[i] as usize;
            let row = slot * hidden;
            let gate = gates[i];
            for j in 0..hidden {
                T::atomic_accumulate(&cells[row + j], input[i * hidden + j].scale(gate));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_types::Half2;
    use half::f16;

    fn spec() -> KernelSpec {
        KernelSpec::new(4, 8, 2, 2).unwrap()
    }

    fn input_f32(spec: &KernelSpec) -> Vec<f32> {
        (0..spec.samples * spec.hidden)
            .map(|v| (v as f32 * 0.1).sin())
            .collect()
    }

    #[test]
    fn scatters_admitted_samples_to_disjoint_slots() {
        let spec = spec();
        let gates = vec![0.5f32, 0.25, 1.0, 0.75];
        let indices = vec![0, 0, 1, 0];
        let locations = vec![0, 1, 0, 2]; // sample 3 overflows expert 0
        let input = input_f32(&spec);
        let mut dispatched = vec![0.0f32; spec.dispatched_len().unwrap()];

        dispatch(&gates, &indices, &locations, &input, &mut dispatched, &spec);

        // Admitted samples land exactly once at expert * capacity + location.
        for (i, slot) in [(0usize, 0usize), (1, 1), (2, 2)] {
            let row = &dispatched[slot * spec.hidden..(slot + 1) * spec.hidden];
            for j in 0..spec.hidden {
                assert_eq!(row[j], gates[i] * input[i * spec.hidden + j]);
            }
        }
        // The untouched slot of expert 1 stays zero.
        let empty = &dispatched[3 * spec.hidden..4 * spec.hidden];
        assert!(empty.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn dropped_sample_contributes_nothing() {
        let spec = spec();
        let gates = vec![1.0f32; 4];
        let indices = vec![0, 1, 0, 1];
        let locations = vec![7, 2, 100, 5]; // every location >= capacity
        let input = input_f32(&spec);
        let mut dispatched = vec![0.0f32; spec.dispatched_len().unwrap()];

        dispatch(&gates, &indices, &locations, &input, &mut dispatched, &spec);

        assert!(dispatched.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn colliding_slots_accumulate() {
        let spec = KernelSpec::new(2, 4, 1, 1).unwrap();
        let gates = vec![1.0f32, 2.0];
        let indices = vec![0, 0];
        let locations = vec![0, 0]; // both samples map to the same slot
        let input = vec![1.0f32; 8];
        let mut dispatched = vec![0.0f32; spec.dispatched_len().unwrap()];

        dispatch(&gates, &indices, &locations, &input, &mut dispatched, &spec);

        for &v in &dispatched {
            assert_eq!(v, 3.0);
        }
    }

    #[test]
    fn half2_scatter_scales_both_components() {
        let spec = KernelSpec::new(1, 2, 1, 1).unwrap();
        let gates = vec![f16::from_f32(0.5)];
        let indices = vec![0];
        let locations = vec![0];
        let input = vec![Half2::from_f32s(2.0, 4.0), Half2::from_f32s(-1.0, 8.0)];
        let mut dispatched = vec![Half2::ZERO; spec.dispatched_len().unwrap()];

        dispatch(&gates, &indices, &locations, &input, &mut dispatched, &spec);

        assert_eq!(dispatched[0], Half2::from_f32s(1.0, 2.0));
        assert_eq!(dispatched[1], Half2::from_f32s(-0.5, 4.0));
    }
}
