//! Device trait and handle types

mod traits;
mod types;

pub use traits::{Device, DeviceExt};
pub use types::{BufferHandle, CompileOptions, DeviceCapabilities, KernelHandle, ProgramHandle};
