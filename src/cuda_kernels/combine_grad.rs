//! CUDA combine-gradient (gather) kernel wrapper.

use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaSlice, CudaStream, PushKernelArg};

use super::dispatch::sample_strided_launch;
use super::{driver_err, load_kernel};
use crate::jit::{KernelFlavor, KernelKey};
use crate::kernel_types::{DispatchElement, ElementType, KernelResult, KernelSpec};

const KERNEL_SOURCE: &str = include_str!("kernels/moe_combine_grad.cu");

/// One compiled combine-gradient specialization.
pub struct CudaCombineGradKernel {
    func: CudaFunction,
    spec: KernelSpec,
}

impl CudaCombineGradKernel {
    pub fn new(
        ctx: &Arc<CudaContext>,
        spec: &KernelSpec,
        element: ElementType,
    ) -> KernelResult<Self> {
        let key = KernelKey::new(KernelFlavor::CombineGrad, element, spec);
        let func = load_kernel(ctx, key, KERNEL_SOURCE)?;
        Ok(Self { func, spec: *spec })
    }

    pub fn launch<T>(
        &self,
        stream: &Arc<CudaStream>,
        gates: &CudaSlice<T::Scalar>,
        dispatched: &CudaSlice<T>,
        indices: &CudaSlice<i32>,
        locations: &CudaSlice<i32>,
        grad_input: &mut CudaSlice<T>,
    ) -> KernelResult<()>
    where
        T: DispatchElement,
    {
        let cfg = sample_strided_launch(&self.spec);
        unsafe {
            let mut builder = stream.launch_builder(&self.func);
            builder.arg(gates);
            builder.arg(dispatched);
            builder.arg(indices);
            builder.arg(locations);
            builder.arg(grad_input);
            builder.launch(cfg).map_err(driver_err)?;
        }
        Ok(())
    }
}
