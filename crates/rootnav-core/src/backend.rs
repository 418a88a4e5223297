//! Backend selection for the Burn framework.
//!
//! CPU (`NdArray`) is the default; building with the `wgpu` feature trains on
//! the GPU instead.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::NdArray;

#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn::backend::Wgpu;

/// The autodiff backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Default device of the selected backend.
pub fn default_device() -> <DefaultBackend as Backend>::Device {
    <DefaultBackend as Backend>::Device::default()
}

/// Human-readable name of the selected backend.
pub fn backend_name() -> &'static str {
    #[cfg(feature = "wgpu")]
    {
        "WGPU (GPU)"
    }
    #[cfg(not(feature = "wgpu"))]
    {
        "NdArray (CPU)"
    }
}
