//! dxshim-intercept: export hooking and vtable proxying for in-process
//! interception of vtable-based interfaces.
//!
//! - [`hook`]: route a module's exports to replacements, keeping the originals.
//! - [`com`]: wrap a vtable object behind a proxy that overrides chosen slots
//!   and forwards the rest to the real object.
//! - [`module`]: the loader primitives both of the above stand on.
//! - [`arch`]: entry relocation for inline replacement.

pub mod arch;
pub mod code;
pub mod com;
pub mod hook;
pub mod module;
pub mod types;

// Re-exports for convenience (flattened imports)
pub use com::{ComProxy, ComRef, Guid, ProxyBuilder, HRESULT};
pub use hook::{HookTable, InlineHooks, OriginalSlot, SymbolHook};
pub use module::{platform_loader, Library, Loader, Redirect};
pub use types::HookError;
