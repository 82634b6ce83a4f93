use thiserror::Error;

/// Errors raised while resolving, rebinding or proxying.
///
/// None of these are fatal to the host: callers log them and leave the
/// affected hook or proxy inert.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("module {0} is not loaded")]
    ModuleNotFound(String),
    #[error("export {0} not found")]
    ExportNotFound(String),
    #[error("allocation failed")]
    AllocationFailed,
    #[error("a {0}-slot table cannot hold the IUnknown methods")]
    TableTooSmall(usize),
    #[error("a {0}-slot table exceeds the forwarding limit")]
    TableTooLarge(usize),
    #[error("slot {index} is out of range for a {size}-slot table")]
    SlotOutOfRange { index: usize, size: usize },
    #[error("slot {0} is reserved by the proxy")]
    ReservedSlot(usize),
    #[error("cannot relocate the entry of {0:#x}")]
    RelocationFailed(usize),
    #[error("{0:#x} is already routed elsewhere")]
    AlreadyHooked(usize),
    #[error("failed to change memory protection")]
    ProtectFailed,
    #[error("unsupported on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}
