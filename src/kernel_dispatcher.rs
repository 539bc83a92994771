//! Zero-cost engine over the kernel backends.
//!
//! One [`DispatchEngine`] owns one specialization tuple: the shape
//! parameters, the element type (through the generic parameter) and the
//! gate-gradient reduction strategy are all fixed at construction, where the
//! CUDA kernels are compiled if a device is present. All boundary validation
//! lives here; the kernels themselves trust their inputs.

use std::marker::PhantomData;

use crate::cpu_kernels;
use crate::kernel_types::{
    DispatchElement, KernelError, KernelResult, KernelSpec, ReduceStrategy,
};

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::CudaStream;

#[cfg(feature = "cuda")]
use crate::cuda_kernels::{
    cuda_context, driver_err, CudaCombineGradKernel, CudaDispatchKernel, CudaGateGradKernel,
};
#[cfg(feature = "cuda")]
use crate::kernel_types::ElementType;

/// Which backend an engine resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cpu,
    Cuda,
}

enum Backend {
    Cpu,
    #[cfg(feature = "cuda")]
    Cuda(CudaBackend),
}

/// Capacity-bounded dispatch engine for one `(spec, element, strategy)`
/// specialization.
pub struct DispatchEngine<T: DispatchElement> {
    spec: KernelSpec,
    strategy: ReduceStrategy,
    backend: Backend,
    _element: PhantomData<T>,
}

impl<T: DispatchElement> DispatchEngine<T> {
    /// Build an engine with the default reduction strategy, preferring the
    /// CUDA backend when a device is available.
    pub fn new(spec: KernelSpec) -> Self {
        Self::with_strategy(spec, ReduceStrategy::default())
    }

    pub fn with_strategy(spec: KernelSpec, strategy: ReduceStrategy) -> Self {
        #[cfg(feature = "cuda")]
        if let Some(ctx) = cuda_context() {
            match CudaBackend::new(ctx, &spec, T::ELEMENT, strategy) {
                Ok(backend) => {
                    log::debug!("dispatch engine using CUDA backend for {spec:?}");
                    return Self {
                        spec,
                        strategy,
                        backend: Backend::Cuda(backend),
                        _element: PhantomData,
                    };
                }
                Err(err) => {
                    log::warn!("CUDA kernel setup failed, falling back to CPU: {err}");
                }
            }
        }
        log::debug!("dispatch engine using CPU backend for {spec:?}");
        Self {
            spec,
            strategy,
            backend: Backend::Cpu,
            _element: PhantomData,
        }
    }

    /// Force the portable CPU backend.
    pub fn cpu(spec: KernelSpec) -> Self {
        Self::cpu_with_strategy(spec, ReduceStrategy::default())
    }

    pub fn cpu_with_strategy(spec: KernelSpec, strategy: ReduceStrategy) -> Self {
        Self {
            spec,
            strategy,
            backend: Backend::Cpu,
            _element: PhantomData,
        }
    }

    pub fn spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn strategy(&self) -> ReduceStrategy {
        self.strategy
    }

    pub fn backend(&self) -> BackendKind {
        match self.backend {
            Backend::Cpu => BackendKind::Cpu,
            #[cfg(feature = "cuda")]
            Backend::Cuda(_) => BackendKind::Cuda,
        }
    }

    /// Forward scatter: accumulate `gates[i] * input[i]` into the expert
    /// buffer slot of every admitted sample. `dispatched` must be
    /// zero-initialized by the caller.
    pub fn dispatch(
        &self,
        gates: &[T::Scalar],
        indices: &[i32],
        locations: &[i32],
        input: &[T],
        dispatched: &mut [T],
    ) -> KernelResult<()> {
        self.check_routing(gates.len(), indices.len(), locations.len())?;
        check_len("input", input.len(), self.input_len()?)?;
        check_len("dispatched", dispatched.len(), self.dispatched_len()?)?;

        match &self.backend {
            Backend::Cpu => {
                cpu_kernels::dispatch(gates, indices, locations, input, dispatched, &self.spec);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => cuda.dispatch(gates, indices, locations, input, dispatched),
        }
    }

    /// Backward gather w.r.t. the input rows.
    pub fn combine_grad(
        &self,
        gates: &[T::Scalar],
        dispatched: &[T],
        indices: &[i32],
        locations: &[i32],
        grad_input: &mut [T],
    ) -> KernelResult<()> {
        self.check_routing(gates.len(), indices.len(), locations.len())?;
        check_len("dispatched", dispatched.len(), self.dispatched_len()?)?;
        check_len("grad_input", grad_input.len(), self.input_len()?)?;

        match &self.backend {
            Backend::Cpu => {
                cpu_kernels::combine_grad(
                    gates,
                    dispatched,
                    indices,
                    locations,
                    grad_input,
                    &self.spec,
                );
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => {
                cuda.combine_grad(gates, dispatched, indices, locations, grad_input)
            }
        }
    }

    /// Backward reduction w.r.t. the routing weight.
    pub fn gate_grad(
        &self,
        dispatched: &[T],
        indices: &[i32],
        locations: &[i32],
        input: &[T],
        grad_gates: &mut [T::Scalar],
    ) -> KernelResult<()> {
        check_len("indices", indices.len(), self.spec.samples)?;
        check_len("locations", locations.len(), self.spec.samples)?;
        check_len("dispatched", dispatched.len(), self.dispatched_len()?)?;
        check_len("input", input.len(), self.input_len()?)?;
        check_len("grad_gates", grad_gates.len(), self.spec.samples)?;

        match &self.backend {
            Backend::Cpu => {
                cpu_kernels::gate_grad(
                    dispatched,
                    indices,
                    locations,
                    input,
                    grad_gates,
                    &self.spec,
                    self.strategy,
                );
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => {
                cuda.gate_grad::<T>(dispatched, indices, locations, input, grad_gates)
            }
        }
    }

    fn check_routing(&self, gates: usize, indices: usize, locations: usize) -> KernelResult<()> {
        check_len("gates", gates, self.spec.samples)?;
        check_len("indices", indices, self.spec.samples)?;
        check_len("locations", locations, self.spec.samples)
    }

    fn input_len(&self) -> KernelResult<usize> {
        self.spec
            .input_len()
            .ok_or_else(|| KernelError::InvalidSpec("input length overflows usize".to_string()))
    }

    fn dispatched_len(&self) -> KernelResult<usize> {
        self.spec.dispatched_len().ok_or_else(|| {
            KernelError::InvalidSpec("expert buffer length overflows usize".to_string())
        })
    }
}

fn check_len(name: &'static str, actual: usize, expected: usize) -> KernelResult<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(KernelError::ShapeMismatch {
            name,
            expected,
            actual,
        })
    }
}

/// Compiled CUDA kernels plus the stream they launch on. Host slices are
/// staged through device buffers around every launch.
#[cfg(feature = "cuda")]
struct CudaBackend {
    stream: Arc<CudaStream>,
    dispatch: CudaDispatchKernel,
    combine_grad: CudaCombineGradKernel,
    gate_grad: CudaGateGradKernel,
}

#[cfg(feature = "cuda")]
impl CudaBackend {
    fn new(
        ctx: &Arc<cudarc::driver::CudaContext>,
        spec: &KernelSpec,
        element: ElementType,
        strategy: ReduceStrategy,
    ) -> KernelResult<Self> {
        Ok(Self {
            stream: ctx.default_stream(),
            dispatch: CudaDispatchKernel::new(ctx, spec, element)?,
            combine_grad: CudaCombineGradKernel::new(ctx, spec, element)?,
            gate_grad: CudaGateGradKernel::new(ctx, spec, element, strategy)?,
        })
    }

    fn dispatch<T: DispatchElement>(
        &self,
        gates: &[T::Scalar],
        indices: &[i32],
        locations: &[i32],
        input: &[T],
        dispatched: &mut [T],
    ) -> KernelResult<()> {
        let stream = &self.stream;
        let gates_dev = stream.memcpy_stod(gates).map_err(driver_err)?;
        let indices_dev = stream.memcpy_stod(indices).map_err(driver_err)?;
        let locations_dev = stream.memcpy_stod(locations).map_err(driver_err)?;
        let input_dev = stream.memcpy_stod(input).map_err(driver_err)?;
        // Upload rather than alloc_zeros: the zero-initialization contract
        // stays with the caller, exactly as on the CPU path.
        let mut dispatched_dev = stream.memcpy_stod(dispatched).map_err(driver_err)?;

        self.dispatch.launch::<T>(
            stream,
            &gates_dev,
            &indices_dev,
            &locations_dev,
            &input_dev,
            &mut dispatched_dev,
        )?;

        let host = stream.memcpy_dtov(&dispatched_dev).map_err(driver_err)?;
        dispatched.copy_from_slice(&host);
        Ok(())
    }

    fn combine_grad<T: DispatchElement>(
        &self,
        gates: &[T::Scalar],
        dispatched: &[T],
        indices: &[i32],
        locations: &[i32],
        grad_input: &mut [T],
    ) -> KernelResult<()> {
        let stream = &self.stream;
        let gates_dev = stream.memcpy_stod(gates).map_err(driver_err)?;
        let dispatched_dev = stream.memcpy_stod(dispatched).map_err(driver_err)?;
        let indices_dev = stream.memcpy_stod(indices).map_err(driver_err)?;
        let locations_dev = stream.memcpy_stod(locations).map_err(driver_err)?;
        let mut grad_dev = stream.alloc_zeros::<T>(grad_input.len()).map_err(driver_err)?;

        self.combine_grad.launch::<T>(
            stream,
            &gates_dev,
            &dispatched_dev,
            &indices_dev,
            &locations_dev,
            &mut grad_dev,
        )?;

        let host = stream.memcpy_dtov(&grad_dev).map_err(driver_err)?;
        grad_input.copy_from_slice(&host);
        Ok(())
    }

    fn gate_grad<T: DispatchElement>(
        &self,
        dispatched: &[T],
        indices: &[i32],
        locations: &[i32],
        input: &[T],
        grad_gates: &mut [T::Scalar],
    ) -> KernelResult<()> {
        let stream = &self.stream;
        let dispatched_dev = stream.memcpy_stod(dispatched).map_err(driver_err)?;
        let indices_dev = stream.memcpy_stod(indices).map_err(driver_err)?;
        let locations_dev = stream.memcpy_stod(locations).map_err(driver_err)?;
        let input_dev = stream.memcpy_stod(input).map_err(driver_err)?;
        let mut grad_dev = stream
            .alloc_zeros::<T::Scalar>(grad_gates.len())
            .map_err(driver_err)?;

        self.gate_grad.launch::<T>(
            stream,
            &dispatched_dev,
            &indices_dev,
            &locations_dev,
            &input_dev,
            &mut grad_dev,
        )?;

        let host = stream.memcpy_dtov(&grad_dev).map_err(driver_err)?;
        grad_gates.copy_from_slice(&host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_engine_reports_backend() {
        let spec = KernelSpec::new(4, 8, 2, 2).unwrap();
        let engine = DispatchEngine::<f32>::cpu(spec);
        assert_eq!(engine.backend(), BackendKind::Cpu);
        assert_eq!(engine.strategy(), ReduceStrategy::LaneShuffle);
    }

    #[test]
    fn rejects_mismatched_host_slices() {
        let spec = KernelSpec::new(4, 8, 2, 2).unwrap();
        let engine = DispatchEngine::<f32>::cpu(spec);

        let gates = vec![1.0f32; 3]; // one short
        let indices = vec![0i32; 4];
        let locations = vec![0i32; 4];
        let input = vec![0.0f32; spec.input_len().unwrap()];
        let mut dispatched = vec![0.0f32; spec.dispatched_len().unwrap()];

        let err = engine
            .dispatch(&gates, &indices, &locations, &input, &mut dispatched)
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::ShapeMismatch {
                name: "gates",
                expected: 4,
                actual: 3,
            }
        ));
    }
}
