//! Shell surface role abstractions.
//!
//! A shell protocol gives the application surface its window role. Two
//! mutually exclusive variants exist: the modern [`xdg`] protocol with the
//! full configure/ack handshake, states and window management requests, and
//! the legacy [`wl`] protocol which treats every configure as an immediate,
//! unacknowledged resize hint. The variant is selected once at surface
//! creation by probing for `xdg_wm_base`.

use bitflags::bitflags;
use wayland_client::protocol::{wl_output::WlOutput, wl_seat::WlSeat, wl_surface::WlSurface};

pub mod wl;
pub mod xdg;

/// An operation the bound shell protocol variant cannot express.
#[derive(Debug, Default)]
pub struct Unsupported;

bitflags! {
    /// Window states reported alongside a configure.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct SurfaceState: u32 {
        const MAXIMIZED = 1 << 0;
        const FULLSCREEN = 1 << 1;
        const RESIZING = 1 << 2;
        const ACTIVATED = 1 << 3;
    }
}

/// A size/state proposal from the compositor.
#[derive(Debug, Clone, Copy)]
pub struct Configure {
    /// Serial to acknowledge once the client buffers match. The legacy
    /// variant has no serials and always reports 0.
    pub serial: u32,
    /// Proposed size including any client-side decoration; (0, 0) means the
    /// compositor has no preference.
    pub size: (i32, i32),
    pub state: SurfaceState,
}

/// An edge or corner used for interactive resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeEdge {
    None,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl ResizeEdge {
    /// Cursor name for the edge per the cursor-spec.
    pub fn cursor_icon(self) -> cursor_icon::CursorIcon {
        use cursor_icon::CursorIcon;
        match self {
            ResizeEdge::Top => CursorIcon::NResize,
            ResizeEdge::Bottom => CursorIcon::SResize,
            ResizeEdge::Left => CursorIcon::WResize,
            ResizeEdge::Right => CursorIcon::EResize,
            ResizeEdge::TopLeft => CursorIcon::NwResize,
            ResizeEdge::TopRight => CursorIcon::NeResize,
            ResizeEdge::BottomLeft => CursorIcon::SwResize,
            ResizeEdge::BottomRight => CursorIcon::SeResize,
            ResizeEdge::None => CursorIcon::Default,
        }
    }
}

/// Callbacks a shell variant raises towards the surface state machine.
pub trait ShellHandler: Sized {
    /// A configure arrived. The handler decides when (and whether) to call
    /// [`ShellSurface::ack_configure`]; skipping acks stalls compositor-side
    /// resize negotiation.
    fn shell_configure(
        &mut self,
        conn: &wayland_client::Connection,
        qh: &wayland_client::QueueHandle<Self>,
        configure: Configure,
    );

    /// The compositor asked the window to close.
    fn shell_close(&mut self, conn: &wayland_client::Connection, qh: &wayland_client::QueueHandle<Self>);

    /// The compositor answered the decoration negotiation (xdg variant only).
    ///
    /// With `server_side` true the compositor draws the decorations and the
    /// client-side decorator must stay hidden.
    fn shell_decoration_mode(
        &mut self,
        _conn: &wayland_client::Connection,
        _qh: &wayland_client::QueueHandle<Self>,
        _server_side: bool,
    ) {
    }
}

/// A surface with a window role, polymorphic over the protocol variant.
///
/// Construction and the initial commit must happen while the event pump
/// thread is *not* running; the initial configure is awaited synchronously by
/// the bootstrap code.
pub trait ShellSurface: Send + std::fmt::Debug {
    fn wl_surface(&self) -> &WlSurface;

    /// Commits the surface to finalize role assignment.
    fn commit_initial(&self);

    /// Whether the variant delivers an initial configure that the bootstrap
    /// must wait for before the surface has a usable size.
    fn expects_initial_configure(&self) -> bool;

    /// Acknowledges a configure. A no-op on the legacy variant, mandatory
    /// exactly once per honored serial on the modern one.
    fn ack_configure(&self, serial: u32);

    /// Requests fullscreen on an output, or the compositor's choice for
    /// `None`. Idempotent: a repeated request for the output the surface is
    /// already fullscreen on must not reach the compositor.
    fn set_fullscreen(&mut self, output: Option<&WlOutput>, refresh_hz: f32);

    /// Leaves fullscreen. Takes effect via a subsequent configure.
    fn set_windowed(&mut self);

    fn set_maximized(&self) -> Result<(), Unsupported> {
        Err(Unsupported)
    }

    fn unset_maximized(&self) -> Result<(), Unsupported> {
        Err(Unsupported)
    }

    fn set_minimized(&self) -> Result<(), Unsupported> {
        Err(Unsupported)
    }

    /// Starts an interactive, compositor-driven move.
    fn interactive_move(&self, _seat: &WlSeat, _serial: u32) -> Result<(), Unsupported> {
        Err(Unsupported)
    }

    /// Starts an interactive resize from the given edge.
    fn interactive_resize(&self, _seat: &WlSeat, _serial: u32, _edge: ResizeEdge) -> Result<(), Unsupported> {
        Err(Unsupported)
    }

    /// Asks the compositor to show the window menu at surface-local
    /// coordinates.
    fn show_window_menu(&self, _seat: &WlSeat, _serial: u32, _position: (i32, i32)) -> Result<(), Unsupported> {
        Err(Unsupported)
    }
}
