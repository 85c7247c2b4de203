//! Screensaver/idle inhibition.

use wayland_client::{protocol::wl_surface::WlSurface, Connection, Dispatch, QueueHandle};
use wayland_protocols::wp::idle_inhibit::zv1::client::{
    zwp_idle_inhibit_manager_v1::{self, ZwpIdleInhibitManagerV1},
    zwp_idle_inhibitor_v1::{self, ZwpIdleInhibitorV1},
};

use crate::{
    error::GlobalError,
    globals::{GlobalData, GlobalProxy},
    registry::RegistryState,
};

#[derive(Debug)]
pub struct IdleInhibitState {
    manager: GlobalProxy<ZwpIdleInhibitManagerV1>,
}

impl IdleInhibitState {
    /// Binds the idle-inhibit manager if the compositor offers it.
    pub fn bind<State>(registry: &RegistryState, qh: &QueueHandle<State>) -> Self
    where
        State: Dispatch<ZwpIdleInhibitManagerV1, GlobalData, State> + 'static,
    {
        let manager = registry.bind_optional(qh, 1..=1, GlobalData).into();
        IdleInhibitState { manager }
    }

    pub fn is_available(&self) -> bool {
        self.manager.is_bound()
    }

    /// Detachable handle for creating inhibitors from other threads.
    pub fn handle(&self) -> IdleInhibitHandle {
        IdleInhibitHandle {
            manager: match &self.manager {
                GlobalProxy::Bound(manager) => Some(manager.clone()),
                GlobalProxy::NotBound => None,
            },
        }
    }
}

/// A cloneable handle to the idle-inhibit manager, independent of the
/// dispatch state.
#[derive(Debug, Clone)]
pub struct IdleInhibitHandle {
    manager: Option<ZwpIdleInhibitManagerV1>,
}

impl IdleInhibitHandle {
    /// Creates an inhibitor scoped to the surface. Dropping the handle lets
    /// the display idle again.
    pub fn create_inhibitor<State>(
        &self,
        surface: &WlSurface,
        qh: &QueueHandle<State>,
    ) -> Result<IdleInhibitor, GlobalError>
    where
        State: Dispatch<ZwpIdleInhibitorV1, GlobalData, State> + 'static,
    {
        let manager = self
            .manager
            .as_ref()
            .ok_or(GlobalError::MissingGlobal("zwp_idle_inhibit_manager_v1"))?;
        Ok(IdleInhibitor(manager.create_inhibitor(surface, qh, GlobalData)))
    }
}

/// An active idle inhibition, released on drop.
#[derive(Debug)]
pub struct IdleInhibitor(ZwpIdleInhibitorV1);

impl Drop for IdleInhibitor {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

impl<D> Dispatch<ZwpIdleInhibitManagerV1, GlobalData, D> for IdleInhibitState
where
    D: Dispatch<ZwpIdleInhibitManagerV1, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &ZwpIdleInhibitManagerV1,
        _: zwp_idle_inhibit_manager_v1::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("zwp_idle_inhibit_manager_v1 has no events")
    }
}

impl<D> Dispatch<ZwpIdleInhibitorV1, GlobalData, D> for IdleInhibitState
where
    D: Dispatch<ZwpIdleInhibitorV1, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &ZwpIdleInhibitorV1,
        _: zwp_idle_inhibitor_v1::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("zwp_idle_inhibitor_v1 has no events")
    }
}

#[macro_export]
macro_rules! delegate_idle_inhibit {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::wp::idle_inhibit::zv1::client::zwp_idle_inhibit_manager_v1::ZwpIdleInhibitManagerV1: $crate::globals::GlobalData
            ] => $crate::idle_inhibit::IdleInhibitState
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::wp::idle_inhibit::zv1::client::zwp_idle_inhibitor_v1::ZwpIdleInhibitorV1: $crate::globals::GlobalData
            ] => $crate::idle_inhibit::IdleInhibitState
        );
    };
}
