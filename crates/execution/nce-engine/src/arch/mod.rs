//! Host-specific trap glue.

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod aarch64;

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub use aarch64::NativeBackend;
