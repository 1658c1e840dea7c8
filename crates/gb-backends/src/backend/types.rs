//! Handles and descriptors shared by all devices

use std::fmt;

/// Handle to an allocated device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    pub const fn new(id: u64) -> Self {
        BufferHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Handle to a compiled device program (one source bundle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

impl ProgramHandle {
    pub const fn new(id: u64) -> Self {
        ProgramHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProgramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prog{}", self.0)
    }
}

/// Handle to a resolved kernel entry point inside a program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

impl KernelHandle {
    pub const fn new(id: u64) -> Self {
        KernelHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kern{}", self.0)
    }
}

/// What a device can do, queried once and cached by callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Human-readable device name
    pub name: String,
    /// Largest work-group (thread block) the device accepts
    pub max_group_size: usize,
    /// Whether kernels may use double precision arithmetic
    pub supports_double: bool,
}

impl DeviceCapabilities {
    pub fn new(name: impl Into<String>, max_group_size: usize, supports_double: bool) -> Self {
        Self {
            name: name.into(),
            max_group_size,
            supports_double,
        }
    }
}

/// Build options for a device program
///
/// Backends translate these into their own compiler flags
/// (`-cl-fast-relaxed-math`, `--use_fast_math`, `-D...`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Allow relaxed IEEE semantics for speed
    pub fast_math: bool,
    /// Allow fused multiply-add contraction
    pub mad_enable: bool,
    /// Preprocessor macros defined for the build (`NAME` or `NAME=VALUE`)
    pub defines: Vec<String>,
}

impl CompileOptions {
    /// Fast math and fused multiply-add enabled, no defines
    pub fn optimized() -> Self {
        Self {
            fast_math: true,
            mad_enable: true,
            defines: Vec::new(),
        }
    }

    pub fn with_define(mut self, define: impl Into<String>) -> Self {
        self.defines.push(define.into());
        self
    }

    /// Render as OpenCL-style flag string
    pub fn to_flag_string(&self) -> String {
        let mut flags = Vec::new();
        if self.fast_math {
            flags.push("-cl-fast-relaxed-math".to_string());
        }
        if self.mad_enable {
            flags.push("-cl-mad-enable".to_string());
        }
        flags.extend(self.defines.iter().map(|d| format!("-D{d}")));
        flags.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_display_with_prefix() {
        assert_eq!(BufferHandle::new(3).to_string(), "buf3");
        assert_eq!(ProgramHandle::new(1).to_string(), "prog1");
        assert_eq!(KernelHandle::new(9).to_string(), "kern9");
    }

    #[test]
    fn optimized_flags_render_in_order() {
        let options = CompileOptions::optimized().with_define("_SINGLE_SINGLE");
        assert_eq!(
            options.to_flag_string(),
            "-cl-fast-relaxed-math -cl-mad-enable -D_SINGLE_SINGLE"
        );
    }

    #[test]
    fn default_options_are_empty() {
        assert_eq!(CompileOptions::default().to_flag_string(), "");
    }
}
