//! The xdg_shell window role.

use std::sync::{Arc, Mutex};

use wayland_client::{
    protocol::{wl_output::WlOutput, wl_seat::WlSeat, wl_surface::WlSurface},
    Connection, Dispatch, QueueHandle, WEnum,
};
use wayland_protocols::xdg::decoration::zv1::client::{
    zxdg_decoration_manager_v1::{self, ZxdgDecorationManagerV1},
    zxdg_toplevel_decoration_v1::{self, ZxdgToplevelDecorationV1},
};
use wayland_protocols::xdg::shell::client::{
    xdg_surface,
    xdg_toplevel::{self, XdgToplevel},
    xdg_wm_base,
};

use crate::{
    error::GlobalError,
    globals::{GlobalData, GlobalProxy},
    registry::RegistryState,
};

use super::{Configure, ResizeEdge, ShellHandler, ShellSurface, SurfaceState, Unsupported};

#[derive(Debug)]
pub struct XdgShell {
    wm_base: xdg_wm_base::XdgWmBase,
    decoration_manager: GlobalProxy<ZxdgDecorationManagerV1>,
}

impl XdgShell {
    /// Binds `xdg_wm_base`, probing for availability.
    ///
    /// Version 4 adds configure bounds, version 5 wm capabilities; both are
    /// accepted and ignored.
    pub fn bind<State>(registry: &RegistryState, qh: &QueueHandle<State>) -> Result<XdgShell, GlobalError>
    where
        State: Dispatch<xdg_wm_base::XdgWmBase, GlobalData, State>
            + Dispatch<ZxdgDecorationManagerV1, GlobalData, State>
            + 'static,
    {
        let wm_base = registry.bind_one(qh, 1..=5, GlobalData)?;
        let decoration_manager = registry.bind_optional(qh, 1..=1, GlobalData).into();
        Ok(XdgShell { wm_base, decoration_manager })
    }

    /// Gives the surface the toplevel role.
    ///
    /// When the compositor supports the decoration negotiation protocol,
    /// server-side decorations are requested; the compositor's answer arrives
    /// through [`ShellHandler::shell_decoration_mode`].
    pub fn create_shell_surface<State>(
        &self,
        surface: WlSurface,
        title: &str,
        app_id: &str,
        qh: &QueueHandle<State>,
    ) -> XdgShellSurface
    where
        State: Dispatch<xdg_surface::XdgSurface, XdgSurfaceData, State>
            + Dispatch<XdgToplevel, XdgSurfaceData, State>
            + Dispatch<ZxdgToplevelDecorationV1, XdgSurfaceData, State>
            + 'static,
    {
        let data = XdgSurfaceData::default();
        let xdg_surface = self.wm_base.get_xdg_surface(&surface, qh, data.clone());
        let toplevel = xdg_surface.get_toplevel(qh, data.clone());

        toplevel.set_app_id(app_id.to_owned());
        toplevel.set_title(title.to_owned());

        let decoration = match &self.decoration_manager {
            GlobalProxy::Bound(manager) => {
                let decoration = manager.get_toplevel_decoration(&toplevel, qh, data.clone());
                decoration.set_mode(zxdg_toplevel_decoration_v1::Mode::ServerSide);
                Some(decoration)
            }
            GlobalProxy::NotBound => None,
        };

        XdgShellSurface { surface, xdg_surface, toplevel, decoration, fullscreen_output: None }
    }
}

/// Pending configure data accumulated between the toplevel and surface
/// configure events.
#[derive(Debug, Clone, Default)]
pub struct XdgSurfaceData {
    pending: Arc<Mutex<PendingConfigure>>,
}

#[derive(Debug, Default)]
struct PendingConfigure {
    size: (i32, i32),
    state: SurfaceState,
}

#[derive(Debug)]
pub struct XdgShellSurface {
    surface: WlSurface,
    xdg_surface: xdg_surface::XdgSurface,
    toplevel: XdgToplevel,
    decoration: Option<ZxdgToplevelDecorationV1>,
    /// Output the surface was last requested fullscreen on. Used to suppress
    /// repeated requests for the same output, which disturbs the surface on at
    /// least one compositor implementation.
    fullscreen_output: Option<WlOutput>,
}

impl ShellSurface for XdgShellSurface {
    fn wl_surface(&self) -> &WlSurface {
        &self.surface
    }

    fn commit_initial(&self) {
        // Commit without a buffer to finalize the role; the compositor
        // answers with the initial configure.
        self.surface.commit();
    }

    fn expects_initial_configure(&self) -> bool {
        true
    }

    fn ack_configure(&self, serial: u32) {
        self.xdg_surface.ack_configure(serial);
    }

    fn set_fullscreen(&mut self, output: Option<&WlOutput>, _refresh_hz: f32) {
        // xdg_shell cannot express a refresh rate preference.
        if should_request_fullscreen(&mut self.fullscreen_output, output) {
            self.toplevel.set_fullscreen(output);
        }
    }

    fn set_windowed(&mut self) {
        self.fullscreen_output = None;
        self.toplevel.unset_fullscreen();
    }

    fn set_maximized(&self) -> Result<(), Unsupported> {
        self.toplevel.set_maximized();
        Ok(())
    }

    fn unset_maximized(&self) -> Result<(), Unsupported> {
        self.toplevel.unset_maximized();
        Ok(())
    }

    fn set_minimized(&self) -> Result<(), Unsupported> {
        self.toplevel.set_minimized();
        Ok(())
    }

    fn interactive_move(&self, seat: &WlSeat, serial: u32) -> Result<(), Unsupported> {
        self.toplevel._move(seat, serial);
        Ok(())
    }

    fn interactive_resize(&self, seat: &WlSeat, serial: u32, edge: ResizeEdge) -> Result<(), Unsupported> {
        self.toplevel.resize(seat, serial, resize_edge_to_xdg(edge));
        Ok(())
    }

    fn show_window_menu(&self, seat: &WlSeat, serial: u32, position: (i32, i32)) -> Result<(), Unsupported> {
        self.toplevel.show_window_menu(seat, serial, position.0, position.1);
        Ok(())
    }
}

impl Drop for XdgShellSurface {
    fn drop(&mut self) {
        // xdg_shell is picky about destruction order: decoration first, then
        // the toplevel role, then the xdg surface.
        if let Some(decoration) = self.decoration.take() {
            decoration.destroy();
        }
        self.toplevel.destroy();
        self.xdg_surface.destroy();
    }
}

/// Whether a fullscreen request must be forwarded to the compositor.
///
/// Requesting fullscreen again on the output the surface is already
/// fullscreen on disturbs the surface on at least one compositor
/// (https://bugzilla.gnome.org/show_bug.cgi?id=783709), so requests are only
/// forwarded when the target actually changes.
fn should_request_fullscreen<T: Clone + PartialEq>(current: &mut Option<T>, target: Option<&T>) -> bool {
    if current.as_ref() == target {
        return false;
    }
    *current = target.cloned();
    true
}

fn resize_edge_to_xdg(edge: ResizeEdge) -> xdg_toplevel::ResizeEdge {
    match edge {
        ResizeEdge::None => xdg_toplevel::ResizeEdge::None,
        ResizeEdge::Top => xdg_toplevel::ResizeEdge::Top,
        ResizeEdge::Bottom => xdg_toplevel::ResizeEdge::Bottom,
        ResizeEdge::Left => xdg_toplevel::ResizeEdge::Left,
        ResizeEdge::Right => xdg_toplevel::ResizeEdge::Right,
        ResizeEdge::TopLeft => xdg_toplevel::ResizeEdge::TopLeft,
        ResizeEdge::TopRight => xdg_toplevel::ResizeEdge::TopRight,
        ResizeEdge::BottomLeft => xdg_toplevel::ResizeEdge::BottomLeft,
        ResizeEdge::BottomRight => xdg_toplevel::ResizeEdge::BottomRight,
    }
}

fn state_from_flag(state: xdg_toplevel::State) -> SurfaceState {
    match state {
        xdg_toplevel::State::Maximized => SurfaceState::MAXIMIZED,
        xdg_toplevel::State::Fullscreen => SurfaceState::FULLSCREEN,
        xdg_toplevel::State::Resizing => SurfaceState::RESIZING,
        xdg_toplevel::State::Activated => SurfaceState::ACTIVATED,
        // Tiling hints and the like have no bearing on the surface geometry.
        _ => SurfaceState::empty(),
    }
}

/// Decodes the byte array of a toplevel configure into the state bitset.
fn states_from_bytes(states: &[u8]) -> SurfaceState {
    states
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes(chunk.try_into().unwrap()))
        .filter_map(|raw| xdg_toplevel::State::try_from(raw).ok())
        .fold(SurfaceState::empty(), |acc, state| acc | state_from_flag(state))
}

impl<D> Dispatch<xdg_wm_base::XdgWmBase, GlobalData, D> for XdgShell
where
    D: Dispatch<xdg_wm_base::XdgWmBase, GlobalData> + ShellHandler,
{
    fn event(
        _: &mut D,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        match event {
            xdg_wm_base::Event::Ping { serial } => {
                wm_base.pong(serial);
            }
            _ => unreachable!(),
        }
    }
}

impl<D> Dispatch<xdg_surface::XdgSurface, XdgSurfaceData, D> for XdgShell
where
    D: Dispatch<xdg_surface::XdgSurface, XdgSurfaceData> + ShellHandler,
{
    fn event(
        state: &mut D,
        _: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        data: &XdgSurfaceData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            xdg_surface::Event::Configure { serial } => {
                let (size, surface_state) = {
                    let pending = data.pending.lock().unwrap();
                    (pending.size, pending.state)
                };
                state.shell_configure(conn, qh, Configure { serial, size, state: surface_state });
            }
            _ => unreachable!(),
        }
    }
}

impl<D> Dispatch<XdgToplevel, XdgSurfaceData, D> for XdgShell
where
    D: Dispatch<XdgToplevel, XdgSurfaceData> + ShellHandler,
{
    fn event(
        state: &mut D,
        _: &XdgToplevel,
        event: xdg_toplevel::Event,
        data: &XdgSurfaceData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, states } => {
                let mut pending = data.pending.lock().unwrap();
                pending.size = (width, height);
                pending.state = states_from_bytes(&states);
            }

            xdg_toplevel::Event::Close => {
                state.shell_close(conn, qh);
            }

            // Size bounds and wm capability advertisements do not affect the
            // configure bookkeeping.
            _ => {}
        }
    }
}

impl<D> Dispatch<ZxdgDecorationManagerV1, GlobalData, D> for XdgShell
where
    D: Dispatch<ZxdgDecorationManagerV1, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &ZxdgDecorationManagerV1,
        _: zxdg_decoration_manager_v1::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("zxdg_decoration_manager_v1 has no events")
    }
}

impl<D> Dispatch<ZxdgToplevelDecorationV1, XdgSurfaceData, D> for XdgShell
where
    D: Dispatch<ZxdgToplevelDecorationV1, XdgSurfaceData> + ShellHandler,
{
    fn event(
        state: &mut D,
        _: &ZxdgToplevelDecorationV1,
        event: zxdg_toplevel_decoration_v1::Event,
        _: &XdgSurfaceData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            zxdg_toplevel_decoration_v1::Event::Configure { mode } => {
                let server_side = matches!(mode, WEnum::Value(zxdg_toplevel_decoration_v1::Mode::ServerSide));
                state.shell_decoration_mode(conn, qh, server_side);
            }
            _ => unreachable!(),
        }
    }
}

#[macro_export]
macro_rules! delegate_xdg_shell {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::xdg::shell::client::xdg_wm_base::XdgWmBase: $crate::globals::GlobalData
            ] => $crate::shell::xdg::XdgShell
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::xdg::shell::client::xdg_surface::XdgSurface: $crate::shell::xdg::XdgSurfaceData
            ] => $crate::shell::xdg::XdgShell
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::xdg::shell::client::xdg_toplevel::XdgToplevel: $crate::shell::xdg::XdgSurfaceData
            ] => $crate::shell::xdg::XdgShell
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::xdg::decoration::zv1::client::zxdg_decoration_manager_v1::ZxdgDecorationManagerV1: $crate::globals::GlobalData
            ] => $crate::shell::xdg::XdgShell
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::xdg::decoration::zv1::client::zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1: $crate::shell::xdg::XdgSurfaceData
            ] => $crate::shell::xdg::XdgShell
        );
    };
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(states: &[xdg_toplevel::State]) -> Vec<u8> {
        states.iter().flat_map(|state| (*state as u32).to_ne_bytes()).collect()
    }

    #[test]
    fn state_bytes_decode() {
        let bytes = encode(&[xdg_toplevel::State::Activated, xdg_toplevel::State::Fullscreen]);
        let state = states_from_bytes(&bytes);
        assert!(state.contains(SurfaceState::ACTIVATED));
        assert!(state.contains(SurfaceState::FULLSCREEN));
        assert!(!state.contains(SurfaceState::MAXIMIZED));
    }

    #[test]
    fn unknown_state_values_are_ignored() {
        let mut bytes = encode(&[xdg_toplevel::State::Maximized]);
        bytes.extend(0xdead_beef_u32.to_ne_bytes());
        assert_eq!(states_from_bytes(&bytes), SurfaceState::MAXIMIZED);
    }

    #[test]
    fn empty_states_decode_to_empty_bitset() {
        assert_eq!(states_from_bytes(&[]), SurfaceState::empty());
    }

    #[test]
    fn repeated_fullscreen_request_is_suppressed() {
        let mut current: Option<u32> = None;

        assert!(should_request_fullscreen(&mut current, Some(&7)));
        // Same output again: must not reach the compositor
        assert!(!should_request_fullscreen(&mut current, Some(&7)));
        // A different output is forwarded
        assert!(should_request_fullscreen(&mut current, Some(&9)));
        // Leaving and re-entering counts as a change
        assert!(should_request_fullscreen(&mut current, None));
        assert!(should_request_fullscreen(&mut current, Some(&9)));
    }
}
