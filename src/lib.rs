//! Workspace facade crate.
//!
//! Re-exports the display synchronization crates so host applications can
//! depend on `display-sync` and opt into the desktop bridge implementations
//! through the `desktop-shims` feature instead of wiring each crate
//! individually.

pub use bridge_traits;
pub use core_runtime;
pub use core_sync;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;
