//! Gradient of the dispatch scatter w.r.t. the input rows.

use rayon::prelude::*;

use crate::kernel_types::{DispatchElement, KernelSpec};

/// For every admitted sample `i`, `grad_input[i, j] = gates[i] *
/// dispatched[slot, j]`; for every dropped sample the row is the exact
/// additive identity of the working type (the zero pair for packed halves,
/// never a bit-cast).
///
/// A pure gather: each sample owns its output row, so no atomics are needed.
pub fn combine_grad<T: DispatchElement>(
    gates: &[T::Scalar],
    dispatched: &[T],
    indices: &[i32],
    locations: &[i32],
    grad_input: &mut [T],
    spec: &KernelSpec,
) {
    let hidden = spec.hidden;
    let capacity = spec.capacity as i32;
    debug_assert_eq!(gates.len(), spec.samples);
    debug_assert_eq!(grad_input.len(), spec.samples * hidden);

    grad_input
        .par_chunks_mut(hidden)
        .enumerate()
        .for_each(|(i, row)| {
            if locations[i] < capacity {
                let slot = indices[i] as usize * spec.capacity + locations[i] as usize;
                let source = &dispatched[slot * hidden..(slot + 1) * hidden];
                let gate = gates[i];
                for (dst, src) in row.iter_mut().zip(source) {
                    *dst = src.scale(gate);
                }
            } else {
                row.fill(T::zero());
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

    #[test]
    fn gathers_independent_of_buffer_provenance() {
        // The gather contract holds for arbitrary buffer contents, not just
        // buffers produced by the forward scatter.
        let spec = spec();
        let gates = vec![0.5f32, 2.0, 1.5, 0.25];
        let indices = vec![0, 0, 1, 0];
        let locations = vec![0, 1, 0, 2]; // sample 3 dropped
        let dispatched: Vec<f32> = (0..spec.dispatched_len().unwrap())
            .map(|v| v as f32 * 0.3 - 1.0)
            .collect();
        let mut grad_input = vec![f32::NAN; spec.input_len().unwrap()];

        combine_grad(&gates, &dispatched, &indices, &locations, &mut grad_input, &spec);

        for (i, slot) in [(0usize, 0usize), (1, 1), (2, 2)] {
            for j in 0..spec.hidden {
                assert_eq!(
                    grad_input[i * spec.hidden + j],
                    gates[i] * dispatched[slot * spec.hidden + j]
                );
            }
        }
    }

    #[test]
    fn dropped_sample_row_is_exact_zero() {
        let spec = spec();
        let gates = vec![1.0f32; 4];
        let indices = vec![0, 0, 1, 0];
        let locations = vec![0, 1, 0, 2];
        let dispatched = vec![3.0f32; spec.dispatched_len().unwrap()];
        // Poison the output so stale values cannot masquerade as zeros.
        let mut grad_input = vec![f32::NAN; spec.input_len().unwrap()];

        combine_grad(&gates, &dispatched, &indices, &locations, &mut grad_input, &spec);

        let dropped = &grad_input[3 * spec.hidden..4 * spec.hidden];
        for &v in dropped {
            assert_eq!(v.to_bits(), 0.0f32.to_bits());
        }
    }

    #[test]
    fn dropped_half2_row_is_a_zero_pair() {
        let spec = KernelSpec::new(2, 4, 1, 1).unwrap();
        let gates = vec![f16::ONE; 2];
        let indices = vec![0, 0];
        let locations = vec![0, 9]; // sample 1 dropped
        let dispatched = vec![Half2::from_f32s(1.0, 2.0); spec.dispatched_len().unwrap()];
        let mut grad_input = vec![Half2::from_f32s(7.0, 7.0); spec.input_len().unwrap()];

        combine_grad(&gates, &dispatched, &indices, &locations, &mut grad_input, &spec);

        for pair in &grad_input[spec.hidden..] {
            assert_eq!(pair.lo.to_bits(), 0);
            assert_eq!(pair.hi.to_bits(), 0);
        }
    }
}
