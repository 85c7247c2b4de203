use wayland_client::{globals::GlobalError as EnumerationError, ConnectError, DispatchError};

/// An error that may occur when dealing with a bound global.
#[derive(Debug, thiserror::Error)]
pub enum GlobalError {
    /// A compositor global was not available
    #[error("the '{0}' global was not available")]
    MissingGlobal(&'static str),

    /// A compositor global was available, but did not support the given minimum version
    #[error("the '{name}' global does not support interface version {required} (server offers version {available})")]
    InvalidVersion { name: &'static str, required: u32, available: u32 },
}

/// An error raised while bringing up or running the windowing backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connecting to the compositor socket failed.
    #[error("could not connect to the Wayland compositor: {0}")]
    Connect(#[from] ConnectError),

    /// The initial enumeration of globals failed.
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    /// A required global was missing or underversioned.
    #[error(transparent)]
    Global(#[from] GlobalError),

    /// A protocol roundtrip failed.
    #[error("Wayland roundtrip failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The compositor never advertised any usable output.
    #[error("no outputs received from compositor")]
    NoOutputs,

    /// Neither shell protocol variant could be bound.
    #[error("compositor supports neither xdg_wm_base nor wl_shell")]
    NoShell,

    /// The event pump thread could not be started.
    #[error("could not start the Wayland event pump: {0}")]
    EventPump(String),

    /// A window already exists; only one application surface is supported.
    #[error("a window was already created on this connection")]
    WindowExists,

    /// An operation required a window but none was created yet.
    #[error("no window has been created yet")]
    NoWindow,
}
