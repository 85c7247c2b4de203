//! Wayland windowing backend for hosting a single GL application surface.
//!
//! The crate connects to a compositor, negotiates the protocol capabilities
//! it needs, gives the application surface a shell role (xdg_shell when
//! available, wl_shell as a fallback), draws client-side decorations when the
//! compositor does not, translates seat input into an application event
//! stream and integrates presentation feedback for AV sync.
//!
//! The entry point is [`window::WindowingSystem`]: construct it, call
//! [`window::WindowingSystem::create_window`], then drain
//! [`window::WindowingSystem::events`] from the application loop. All
//! protocol dispatching happens on a dedicated pump thread once the window
//! exists.
//!
//! Modules are organised per protocol concern the way a client toolkit is:
//! each has a state object, a handler trait and a `delegate_*!` macro; the
//! [`window`] module composes them into the concrete dispatch state.

/// Re-exports of the protocol crates, for consumers of the delegate macros.
pub mod reexports {
    pub use calloop;
    pub use wayland_client as client;
    pub use wayland_protocols as protocols;
}

pub mod compositor;
pub mod decorations;
pub mod error;
pub mod events;
pub mod globals;
pub mod idle_inhibit;
pub mod output;
pub mod presentation;
pub mod registry;
pub mod seat;
pub mod shell;
pub mod shm;
pub mod window;

mod event_pump;

pub use error::Error;
pub use events::{Event, EventSink};
pub use window::{ResolutionInfo, WindowingSystem};
