//! CUDA dispatch (scatter) kernel wrapper.

use std::sync::Arc;

use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};

use super::{driver_err, load_kernel, BLOCK_WIDTH, GRID_WIDTH};
use crate::jit::{KernelFlavor, KernelKey};
use crate::kernel_types::{DispatchElement, ElementType, KernelResult, KernelSpec};

const KERNEL_SOURCE: &str = include_str!("kernels/moe_dispatch.cu");

/// One compiled dispatch specialization.
pub struct CudaDispatchKernel {
    func: CudaFunction,
    spec: KernelSpec,
}

impl CudaDispatchKernel {
    pub fn new(
        ctx: &Arc<CudaContext>,
        spec: &KernelSpec,
        element: ElementType,
    ) -> KernelResult<Self> {
        let key = KernelKey::new(KernelFlavor::Dispatch, element, spec);
        let func = load_kernel(ctx, key, KERNEL_SOURCE)?;
        Ok(Self { func, spec: *spec })
    }

    /// Launch the scatter. `dispatched` must be zero-initialized device
    /// memory of length `global_experts * capacity * hidden`.
    pub fn launch<T>(
        &self,
        stream: &Arc<CudaStream>,
        gates: &CudaSlice<T::Scalar>,
        indices: &CudaSlice<i32>,
        locations: &CudaSlice<i32>,
        input: &CudaSlice<T>,
        dispatched: &mut CudaSlice<T>,
    ) -> KernelResult<()>
    where
        T: DispatchElement,
    {
        let cfg = sample_strided_launch(&self.spec);
        unsafe {
            let mut builder = stream.launch_builder(&self.func);
            builder.arg(gates);
            builder.arg(indices);
            builder.arg(locations);
            builder.arg(input);
            builder.arg(dispatched);
            builder.launch(cfg).map_err(driver_err)?;
        }
        Ok(())
    }
}

/// Launch shape shared by the dispatch and combine-gradient kernels: a fixed
/// grid striding over samples, a full block striding over hidden.
pub(crate) fn sample_strided_launch(_spec: &KernelSpec) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (GRID_WIDTH, 1, 1),
        block_dim: (BLOCK_WIDTH, 1, 1),
        shared_mem_bytes: 0,
    }
}
