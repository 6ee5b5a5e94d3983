//! Runtime selection

use mirror_runtime::{AcceleratorRuntime, CudaRuntime, Result, SimRuntime};
use std::fmt;
use std::sync::Arc;

/// Available accelerator runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    /// Host-memory reference runtime (always available)
    Simulated,
    /// NVIDIA GPUs (requires the `cuda` feature)
    Cuda,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Simulated => f.write_str("simulated"),
            RuntimeKind::Cuda => f.write_str("cuda"),
        }
    }
}

/// Open a runtime of the given kind
///
/// # Errors
///
/// `InvalidState` if the runtime is not compiled in or no device is present.
///
/// # Example
///
/// ```rust
/// use mirror_core::{open_runtime, RuntimeKind};
///
/// let runtime = open_runtime(RuntimeKind::Simulated)?;
/// assert_eq!(runtime.name(), "simulated");
/// # Ok::<(), mirror_core::MirrorError>(())
/// ```
#[tracing::instrument]
pub fn open_runtime(kind: RuntimeKind) -> Result<Arc<dyn AcceleratorRuntime>> {
    let runtime: Arc<dyn AcceleratorRuntime> = match kind {
        RuntimeKind::Simulated => Arc::new(SimRuntime::new()),
        RuntimeKind::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Arc::new(CudaRuntime::new()?)
            }
            #[cfg(not(feature = "cuda"))]
            {
                return Err(mirror_runtime::MirrorError::invalid_state(
                    "CUDA runtime requires the 'cuda' feature to be enabled",
                ));
            }
        }
    };
    tracing::debug!(runtime = runtime.name(), devices = runtime.device_count()?, "runtime opened");
    Ok(runtime)
}

/// Open CUDA when available, otherwise the simulated runtime
#[tracing::instrument]
pub fn open_auto() -> Result<Arc<dyn AcceleratorRuntime>> {
    if CudaRuntime::is_available() {
        match open_runtime(RuntimeKind::Cuda) {
            Ok(runtime) => {
                tracing::info!("auto-selected CUDA runtime");
                return Ok(runtime);
            }
            Err(err) => tracing::warn!(error = %err, "CUDA reported available but failed to open"),
        }
    }
    tracing::info!("auto-selected simulated runtime (fallback)");
    open_runtime(RuntimeKind::Simulated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_simulated() {
        let runtime = open_runtime(RuntimeKind::Simulated).unwrap();
        assert_eq!(runtime.device_count().unwrap(), 1);
        assert!(runtime.as_any().downcast_ref::<SimRuntime>().is_some());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_requires_feature() {
        let err = open_runtime(RuntimeKind::Cuda).err().map(|e| e.kind());
        assert_eq!(err, Some(mirror_runtime::ErrorKind::InvalidState));
    }

    #[test]
    fn test_open_auto_always_succeeds() {
        let runtime = open_auto().unwrap();
        assert!(runtime.device_count().unwrap() >= 1);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(RuntimeKind::Simulated.to_string(), "simulated");
        assert_eq!(RuntimeKind::Cuda.to_string(), "cuda");
    }
}
