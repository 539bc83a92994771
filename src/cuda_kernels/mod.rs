//! CUDA backend: NVRTC-specialized kernels with a process-wide compile cache.
//!
//! Each kernel flavor is a parameterized source template rendered and
//! compiled once per [`KernelKey`] (compile-once, reuse; the key space is
//! bounded by model configuration, so the cache never evicts). The CUDA
//! driver and NVRTC are loaded dynamically at runtime; a missing driver
//! degrades to the CPU backend at engine construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use cudarc::driver::{CudaContext, CudaFunction, CudaModule};
use cudarc::nvrtc::compile_ptx;

use crate::jit::{render_template, KernelKey};
use crate::kernel_types::{Half2, KernelError, KernelResult};

mod combine_grad;
mod dispatch;
mod gate_grad;

pub use combine_grad::CudaCombineGradKernel;
pub use dispatch::CudaDispatchKernel;
pub use gate_grad::CudaGateGradKernel;

/// Grid width of the sample-strided kernels.
pub(crate) const GRID_WIDTH: u32 = 128;
/// Block width of the sample-strided kernels.
pub(crate) const BLOCK_WIDTH: u32 = 1024;

// SAFETY: Half2 is a plain 32-bit value with no padding or invariants; the
// all-zero bit pattern is the zero pair.
unsafe impl cudarc::driver::DeviceRepr for Half2 {}
unsafe impl cudarc::driver::ValidAsZeroBits for Half2 {}

/// Lazily initialized shared CUDA context (device 0).
static CUDA_CONTEXT: OnceLock<Option<Arc<CudaContext>>> = OnceLock::new();

pub fn cuda_context() -> Option<&'static Arc<CudaContext>> {
    CUDA_CONTEXT
        .get_or_init(|| match CudaContext::new(0) {
            Ok(ctx) => Some(ctx),
            Err(err) => {
                log::warn!("CUDA unavailable: {err}");
                None
            }
        })
        .as_ref()
}

type ModuleCache = Mutex<HashMap<KernelKey, Arc<CudaModule>>>;

static MODULE_CACHE: OnceLock<ModuleCache> = OnceLock::new();

/// Render, compile and load the specialized kernel for `key`, reusing the
/// cached module when the same specialization was compiled before.
pub(crate) fn load_kernel(
    ctx: &Arc<CudaContext>,
    key: KernelKey,
    source: &str,
) -> KernelResult<CudaFunction> {
    let cache = MODULE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().expect("module cache poisoned");

    let module = if let Some(module) = cache.get(&key) {
        log::debug!("kernel cache hit: {key:?}");
        Arc::clone(module)
    } else {
        let rendered = render_template(source, &key.template_params())?;
        log::debug!("compiling {} for {key:?}", key.flavor.name());
        let ptx =
            compile_ptx(rendered).map_err(|err| KernelError::Compile(format!("{err:?}")))?;
        let module = ctx
            .load_module(ptx)
            .map_err(|err| KernelError::Cuda(format!("{err:?}")))?;
        cache.insert(key, Arc::clone(&module));
        module
    };

    module
        .load_function(key.flavor.name())
        .map_err(|err| KernelError::Cuda(format!("{err:?}")))
}

pub(crate) fn driver_err(err: cudarc::driver::DriverError) -> KernelError {
    KernelError::Cuda(format!("{err:?}"))
}
