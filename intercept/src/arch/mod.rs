//! Instruction-level support for rewriting function entries.

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
pub mod x86;

#[cfg(target_arch = "aarch64")]
pub mod arm64;
