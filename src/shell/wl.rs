//! The legacy wl_shell window role.
//!
//! Kept for compositors that predate xdg_shell. There are no configure
//! serials, so every configure is an immediate resize hint and
//! [`ShellSurface::ack_configure`] is a no-op. Maximize, minimize and the
//! window menu cannot be expressed.

use wayland_client::{
    protocol::{
        wl_output::WlOutput,
        wl_seat::WlSeat,
        wl_shell,
        wl_shell_surface::{self, WlShellSurface},
        wl_surface::WlSurface,
    },
    Connection, Dispatch, QueueHandle,
};

use crate::{error::GlobalError, globals::GlobalData, registry::RegistryState};

use super::{Configure, ResizeEdge, ShellHandler, ShellSurface, SurfaceState, Unsupported};

#[derive(Debug)]
pub struct WlShell {
    wl_shell: wl_shell::WlShell,
}

impl WlShell {
    pub fn bind<State>(registry: &RegistryState, qh: &QueueHandle<State>) -> Result<WlShell, GlobalError>
    where
        State: Dispatch<wl_shell::WlShell, GlobalData, State> + 'static,
    {
        let wl_shell = registry.bind_one(qh, 1..=1, GlobalData)?;
        Ok(WlShell { wl_shell })
    }

    pub fn create_shell_surface<State>(
        &self,
        surface: WlSurface,
        title: &str,
        class: &str,
        qh: &QueueHandle<State>,
    ) -> WlShellSurfaceWrapper
    where
        State: Dispatch<WlShellSurface, GlobalData, State> + 'static,
    {
        let shell_surface = self.wl_shell.get_shell_surface(&surface, qh, GlobalData);
        shell_surface.set_class(class.to_owned());
        shell_surface.set_title(title.to_owned());
        // Windowed role by default; a fullscreen request may replace it before
        // the first commit.
        shell_surface.set_toplevel();

        WlShellSurfaceWrapper { surface, shell_surface }
    }
}

#[derive(Debug)]
pub struct WlShellSurfaceWrapper {
    surface: WlSurface,
    shell_surface: WlShellSurface,
}

impl ShellSurface for WlShellSurfaceWrapper {
    fn wl_surface(&self) -> &WlSurface {
        &self.surface
    }

    fn commit_initial(&self) {
        self.surface.commit();
    }

    fn expects_initial_configure(&self) -> bool {
        // wl_shell never reports an initial size; the caller's requested size
        // applies directly.
        false
    }

    fn ack_configure(&self, _serial: u32) {
        // wl_shell has no serials.
    }

    fn set_fullscreen(&mut self, output: Option<&WlOutput>, refresh_hz: f32) {
        self.shell_surface.set_fullscreen(
            wl_shell_surface::FullscreenMethod::Driver,
            (refresh_hz * 1000.0).round() as u32,
            output,
        );
    }

    fn set_windowed(&mut self) {
        self.shell_surface.set_toplevel();
    }

    fn interactive_move(&self, seat: &WlSeat, serial: u32) -> Result<(), Unsupported> {
        self.shell_surface._move(seat, serial);
        Ok(())
    }

    fn interactive_resize(&self, seat: &WlSeat, serial: u32, edge: ResizeEdge) -> Result<(), Unsupported> {
        self.shell_surface.resize(seat, serial, resize_edge_to_wl(edge));
        Ok(())
    }
}

fn resize_edge_to_wl(edge: ResizeEdge) -> wl_shell_surface::Resize {
    match edge {
        ResizeEdge::None => wl_shell_surface::Resize::None,
        ResizeEdge::Top => wl_shell_surface::Resize::Top,
        ResizeEdge::Bottom => wl_shell_surface::Resize::Bottom,
        ResizeEdge::Left => wl_shell_surface::Resize::Left,
        ResizeEdge::Right => wl_shell_surface::Resize::Right,
        ResizeEdge::TopLeft => wl_shell_surface::Resize::TopLeft,
        ResizeEdge::TopRight => wl_shell_surface::Resize::TopRight,
        ResizeEdge::BottomLeft => wl_shell_surface::Resize::BottomLeft,
        ResizeEdge::BottomRight => wl_shell_surface::Resize::BottomRight,
    }
}

impl<D> Dispatch<wl_shell::WlShell, GlobalData, D> for WlShell
where
    D: Dispatch<wl_shell::WlShell, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &wl_shell::WlShell,
        _: wl_shell::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("wl_shell has no events")
    }
}

impl<D> Dispatch<WlShellSurface, GlobalData, D> for WlShell
where
    D: Dispatch<WlShellSurface, GlobalData> + ShellHandler,
{
    fn event(
        state: &mut D,
        shell_surface: &WlShellSurface,
        event: wl_shell_surface::Event,
        _: &GlobalData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            wl_shell_surface::Event::Ping { serial } => {
                shell_surface.pong(serial);
            }

            wl_shell_surface::Event::Configure { width, height, .. } => {
                // No serials and no state reporting in this protocol.
                state.shell_configure(
                    conn,
                    qh,
                    Configure { serial: 0, size: (width, height), state: SurfaceState::empty() },
                );
            }

            wl_shell_surface::Event::PopupDone => {}

            _ => unreachable!(),
        }
    }
}

#[macro_export]
macro_rules! delegate_wl_shell {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_shell::WlShell: $crate::globals::GlobalData
            ] => $crate::shell::wl::WlShell
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_shell_surface::WlShellSurface: $crate::globals::GlobalData
            ] => $crate::shell::wl::WlShell
        );
    };
}
