use wayland_client::Proxy;

use crate::error::GlobalError;

/// A struct used as the user data for globals bound by this crate.
///
/// This is used instead of `()` to allow multiple `Dispatch` impls on the same
/// object.
#[derive(Debug)]
pub struct GlobalData;

/// The handle to an optional global.
///
/// Optional protocols leave their proxy in the [`GlobalProxy::NotBound`] state
/// when the compositor never advertised them; callers must check before use.
#[derive(Debug)]
pub enum GlobalProxy<I> {
    /// The global was bound.
    Bound(I),
    /// The compositor did not advertise the global.
    NotBound,
}

impl<I> From<Result<I, GlobalError>> for GlobalProxy<I> {
    fn from(result: Result<I, GlobalError>) -> Self {
        match result {
            Ok(proxy) => GlobalProxy::Bound(proxy),
            Err(_) => GlobalProxy::NotBound,
        }
    }
}

impl<I: Proxy> GlobalProxy<I> {
    pub fn get(&self) -> Result<&I, GlobalError> {
        match self {
            GlobalProxy::Bound(proxy) => Ok(proxy),
            GlobalProxy::NotBound => Err(GlobalError::MissingGlobal(I::interface().name)),
        }
    }

    /// Whether the global is available at all.
    pub fn is_bound(&self) -> bool {
        matches!(self, GlobalProxy::Bound(_))
    }
}
