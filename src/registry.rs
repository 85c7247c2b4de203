//! Binding globals advertised by the compositor.
//!
//! [`RegistryState`] snapshots the globals enumerated during the initial
//! roundtrip and binds them at negotiated versions. Singleton globals are
//! resolved first ([`RegistryState::bind_one`] / [`RegistryState::bind_optional`]);
//! per-instance globals (outputs, seats) are bound in a second pass with
//! [`RegistryState::bind_all`] so their handlers can assume the singletons are
//! already available.
//!
//! Globals appearing or disappearing later are forwarded to the
//! [`RegistryHandler`] implementations listed in the [`registry_handlers!`]
//! invocation of the dispatching state; the registry itself does not interpret
//! removals.

use std::ops::RangeInclusive;

use wayland_client::{
    globals::{Global, GlobalList, GlobalListContents},
    protocol::wl_registry,
    Connection, Dispatch, Proxy, QueueHandle,
};

use crate::error::GlobalError;

/// A state which may be notified when a global is created or destroyed at runtime.
pub trait RegistryHandler<D>
where
    D: ProvidesRegistryState,
{
    /// A new global has been advertised by the compositor.
    fn new_global(data: &mut D, conn: &Connection, qh: &QueueHandle<D>, name: u32, interface: &str, version: u32);

    /// A global has been destroyed by the compositor.
    fn remove_global(data: &mut D, conn: &Connection, qh: &QueueHandle<D>, name: u32);
}

/// Asserts that a data type can provide the registry state and route runtime
/// global events.
///
/// The routing methods are usually generated with [`registry_handlers!`].
pub trait ProvidesRegistryState: Sized {
    fn registry(&mut self) -> &mut RegistryState;

    /// A global was advertised after the initial enumeration.
    fn runtime_add_global(&mut self, conn: &Connection, qh: &QueueHandle<Self>, name: u32, interface: &str, version: u32);

    /// A global was removed after the initial enumeration.
    fn runtime_remove_global(&mut self, conn: &Connection, qh: &QueueHandle<Self>, name: u32);
}

/// State object tracking the registry and the advertised globals.
#[derive(Debug)]
pub struct RegistryState {
    registry: wl_registry::WlRegistry,
    globals: Vec<Global>,
}

impl RegistryState {
    pub fn new(global_list: &GlobalList) -> Self {
        RegistryState {
            registry: global_list.registry().clone(),
            globals: global_list.contents().with_list(|list| list.to_vec()),
        }
    }

    pub fn registry(&self) -> &wl_registry::WlRegistry {
        &self.registry
    }

    /// Binds a required singleton global, failing fast when it is missing or
    /// the server offers less than the start of `version`.
    ///
    /// The global is bound at `min(server version, *version.end())`.
    pub fn bind_one<I, D, U>(
        &self,
        qh: &QueueHandle<D>,
        version: RangeInclusive<u32>,
        udata: U,
    ) -> Result<I, GlobalError>
    where
        D: Dispatch<I, U> + 'static,
        I: Proxy + 'static,
        U: Send + Sync + 'static,
    {
        let global = self
            .globals
            .iter()
            .find(|global| global.interface == I::interface().name)
            .ok_or(GlobalError::MissingGlobal(I::interface().name))?;

        if global.version < *version.start() {
            return Err(GlobalError::InvalidVersion {
                name: I::interface().name,
                required: *version.start(),
                available: global.version,
            });
        }

        let bind_version = u32::min(global.version, *version.end());
        log::debug!(target: "winsys", "binding global [{}] {} v{} (server has v{})",
            global.name, I::interface().name, bind_version, global.version);

        Ok(self.registry.bind(global.name, bind_version, qh, udata))
    }

    /// Binds an optional singleton global.
    ///
    /// An absent global, or one below the minimum version, leaves the handle
    /// explicitly empty; the latter additionally logs a warning since the
    /// compositor does advertise the interface.
    pub fn bind_optional<I, D, U>(
        &self,
        qh: &QueueHandle<D>,
        version: RangeInclusive<u32>,
        udata: U,
    ) -> Result<I, GlobalError>
    where
        D: Dispatch<I, U> + 'static,
        I: Proxy + 'static,
        U: Send + Sync + 'static,
    {
        let result = self.bind_one(qh, version, udata);
        if let Err(GlobalError::InvalidVersion { name, required, available }) = &result {
            log::warn!(target: "winsys",
                "ignoring {} v{}: need at least v{}", name, available, required);
        }
        result
    }

    /// Binds every advertised instance of a per-instance global, yielding the
    /// numeric global name alongside the bound proxy.
    pub fn bind_all<I, D, U, F>(
        &self,
        qh: &QueueHandle<D>,
        version: RangeInclusive<u32>,
        mut make_data: F,
    ) -> Result<Vec<(u32, I)>, GlobalError>
    where
        D: Dispatch<I, U> + 'static,
        I: Proxy + 'static,
        U: Send + Sync + 'static,
        F: FnMut(u32) -> U,
    {
        let mut bound = Vec::new();

        for global in self.globals.iter().filter(|global| global.interface == I::interface().name) {
            if global.version < *version.start() {
                return Err(GlobalError::InvalidVersion {
                    name: I::interface().name,
                    required: *version.start(),
                    available: global.version,
                });
            }

            let bind_version = u32::min(global.version, *version.end());
            log::debug!(target: "winsys", "binding global [{}] {} v{} (server has v{})",
                global.name, I::interface().name, bind_version, global.version);

            let proxy = self.registry.bind(global.name, bind_version, qh, make_data(global.name));
            bound.push((global.name, proxy));
        }

        Ok(bound)
    }

    /// Binds one specific instance of a per-instance global by its numeric name.
    ///
    /// Used when the compositor advertises a new instance at runtime.
    pub fn bind_specific<I, D, U>(
        &self,
        qh: &QueueHandle<D>,
        name: u32,
        version: RangeInclusive<u32>,
        udata: U,
    ) -> Result<I, GlobalError>
    where
        D: Dispatch<I, U> + 'static,
        I: Proxy + 'static,
        U: Send + Sync + 'static,
    {
        let global = self
            .globals
            .iter()
            .find(|global| global.name == name && global.interface == I::interface().name)
            .ok_or(GlobalError::MissingGlobal(I::interface().name))?;

        if global.version < *version.start() {
            return Err(GlobalError::InvalidVersion {
                name: I::interface().name,
                required: *version.start(),
                available: global.version,
            });
        }

        let bind_version = u32::min(global.version, *version.end());
        Ok(self.registry.bind(global.name, bind_version, qh, udata))
    }

    pub(crate) fn update(&mut self, event: &wl_registry::Event) {
        match event {
            wl_registry::Event::Global { name, interface, version } => {
                self.globals.push(Global { name: *name, interface: interface.clone(), version: *version });
            }
            wl_registry::Event::GlobalRemove { name } => {
                self.globals.retain(|global| global.name != *name);
            }
            _ => {}
        }
    }
}

impl<D> Dispatch<wl_registry::WlRegistry, GlobalListContents, D> for RegistryState
where
    D: Dispatch<wl_registry::WlRegistry, GlobalListContents> + ProvidesRegistryState,
{
    fn event(
        state: &mut D,
        _: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &GlobalListContents,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        state.registry().update(&event);

        match event {
            wl_registry::Event::Global { name, interface, version } => {
                state.runtime_add_global(conn, qh, name, &interface[..], version);
            }
            wl_registry::Event::GlobalRemove { name } => {
                state.runtime_remove_global(conn, qh, name);
            }
            _ => unreachable!("wl_registry is frozen"),
        }
    }
}

/// Delegates the handling of [`wl_registry`] to [`RegistryState`].
#[macro_export]
macro_rules! delegate_registry {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_registry::WlRegistry: $crate::reexports::client::globals::GlobalListContents
            ] => $crate::registry::RegistryState
        );
    };
}

/// Generates the runtime global routing methods of [`ProvidesRegistryState`],
/// forwarding to each listed [`RegistryHandler`] in order.
#[macro_export]
macro_rules! registry_handlers {
    ($($ty:ty),* $(,)?) => {
        fn runtime_add_global(
            &mut self,
            conn: &$crate::reexports::client::Connection,
            qh: &$crate::reexports::client::QueueHandle<Self>,
            name: u32,
            interface: &str,
            version: u32,
        ) {
            $(<$ty as $crate::registry::RegistryHandler<Self>>::new_global(self, conn, qh, name, interface, version);)*
        }

        fn runtime_remove_global(
            &mut self,
            conn: &$crate::reexports::client::Connection,
            qh: &$crate::reexports::client::QueueHandle<Self>,
            name: u32,
        ) {
            $(<$ty as $crate::registry::RegistryHandler<Self>>::remove_global(self, conn, qh, name);)*
        }
    };
}
