//! Native backends for the OS-facing capabilities.
//!
//! macOS gets real event taps and device seizure. Everything else gets a
//! stub whose hooks never install, so locks there are accepted as
//! unprotected.

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub use macos::native_backend;

#[cfg(not(target_os = "macos"))]
mod stub;

#[cfg(not(target_os = "macos"))]
pub use stub::native_backend;
