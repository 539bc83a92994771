//! Gradient of the routing weight: a per-sample dot product reduced across
//! one cooperating lane group.

use rayon::prelude::*;

use crate::kernel_types::{DispatchElement, KernelSpec, ReduceStrategy, LANE_WIDTH};

const HALVING_OFFSETS: [usize; 5] = [16, 8, 4, 2, 1];

/// For every admitted sample `b`, `grad_gates[b] = Σ_j dispatched[slot, j] *
/// input[b, j]`, reduced with the selected strategy; for every dropped
/// sample a type-correct scalar zero is written and no reduction runs.
///
/// One 32-lane group owns each sample: lane `l` accumulates the strided
/// partial over `j = l, l + 32, ...` in the working type, then the tree
/// reduction collapses the 32 partials over lane distances 16, 8, 4, 2, 1.
/// The collapsed value is downcast to the scalar output type before the
/// single write (a packed pair sums its two components).
pub fn gate_grad<T: DispatchElement>(
    dispatched: &[T],
    indices: &[i32],
    locations: &[i32],
    input: &[T],
    grad_gates: &mut [T::Scalar],
    spec: &KernelSpec,
    strategy: ReduceStrategy,
) {
    let hidden = spec.hidden;
    let capacity = spec.capacity as i32;
    debug_assert_eq!(grad_gates.len(), spec.samples);
    debug_assert_eq!(input.len(), spec.samples * hidden);

    grad_gates
        .par_iter_mut()
        .enumerate()
        .for_each(|(b, out)| {
            if locations[b] >= capacity {
                *out = T::scalar_zero();
                return;
            }
            let slot = indices[b] as usize * spec.capacity + locations[b] as usize;

            let mut lanes = [T::zero(); LANE_WIDTH];
            for j in 0..hidden {
                let lane = j % LANE_WIDTH;
                let product = dispatched[slot * hidden + j].mul(input[b * hidden + j]);
                lanes[lane] = lanes[lane].add(product);
            }

            let reduced = match strategy {
                ReduceStrategy::LaneShuffle => reduce_lane_shuffle(lanes),
                ReduceStrategy::SharedScratch => reduce_shared_scratch(lanes),
            };
            *out = reduced.collapse();
        });
}

/// Register-exchange reduction: each halving step adds the partial held
/// `offset` lanes away, shrinking the live prefix until lane 0 holds the sum.
fn reduce_lane_shuffle<T: DispatchElement>(mut lanes: [T; LANE_WIDTH]) -> T {
    for offset in HALVING_OFFSETS {
        let exchanged = lanes;
        for l in 0..offset {
            lanes[l] = exchanged[l].add(exchanged[l + offset]);
        }
    }
    lanes[0]
}

/// Shared-scratch reduction: the full half-group writes every step, with a
/// snapshot standing in for the barrier between the read and write halves.
/// Lanes past the live prefix hold stale partials that never reach lane 0.
fn reduce_shared_scratch<T: DispatchElement>(lanes: [T; LANE_WIDTH]) -> T {
    let mut scratch = lanes;
    for offset in HALVING_OFFSETS {
        let snapshot = scratch;
        for l in 0..LANE_WIDTH / 2 {
            scratch[l] = snapshot[l].add(snapshot[l + offset]);
        }
    }
    scratch[0]
}
