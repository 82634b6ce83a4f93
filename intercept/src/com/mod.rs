//! Vtable-based object interop: owned references and interface proxies.

pub mod proxy;
pub mod thunk;
pub mod unknown;

pub use proxy::{ComProxy, ProxyBuilder};
pub use unknown::{ComRef, Guid, HRESULT};
