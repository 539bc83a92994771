//! CUDA gate-gradient (reduction) kernel wrapper.

use std::sync::Arc;

use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};

use super::{driver_err, load_kernel};
use crate::jit::{KernelFlavor, KernelKey};
use crate::kernel_types::{
    DispatchElement, ElementType, KernelError, KernelResult, KernelSpec, ReduceStrategy,
    LANE_WIDTH,
};

const KERNEL_SOURCE: &str = include_str!("kernels/moe_gate_grad.cu");

/// One compiled gate-gradient specialization. The reduction strategy is part
/// of the specialization tuple, never a runtime branch.
pub struct CudaGateGradKernel {
    func: CudaFunction,
    spec: KernelSpec,
}

impl CudaGateGradKernel {
    pub fn new(
        ctx: &Arc<CudaContext>,
        spec: &KernelSpec,
        element: ElementType,
        strategy: ReduceStrategy,
    ) -> KernelResult<Self> {
        let key = KernelKey::new(KernelFlavor::GateGrad, element, spec).with_strategy(strategy);
        let func = load_kernel(ctx, key, KERNEL_SOURCE)?;
        Ok(Self { func, spec: *spec })
    }

    pub fn launch<T>(
        &self,
        stream: &Arc<CudaStream>,
        dispatched: &CudaSlice<T>,
        indices: &CudaSlice<i32>,
        locations: &CudaSlice<i32>,
        input: &CudaSlice<T>,
        grad_gates: &mut CudaSlice<T::Scalar>,
    ) -> KernelResult<()>
    where
        T: DispatchElement,
    {
        // One lane group per sample.
        let grid_dim = u32::try_from(self.spec.samples)
            .map_err(|_| KernelError::Cuda("sample count exceeds grid limits".to_string()))?;
        let cfg = LaunchConfig {
            grid_dim: (grid_dim, 1, 1),
            block_dim: (LANE_WIDTH as u32, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            let mut builder = stream.launch_builder(&self.func);
            builder.arg(dispatched);
            builder.arg(indices);
            builder.arg(locations);
            builder.arg(input);
            builder.arg(grad_gates);
            builder.launch(cfg).map_err(driver_err)?;
        }
        Ok(())
    }
}
