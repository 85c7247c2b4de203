//! Pointer input processing.
//!
//! Enter/motion coordinates arrive in compositor logical units and are
//! multiplied by the active buffer scale to produce application pixel
//! coordinates; the scale is pushed in whenever the main surface's effective
//! scale changes. Scroll axis events are translated to one synthetic
//! press+release of a wheel button per event, keeping only the sign of the
//! value; diagonal scrolling is not supported.

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Mutex,
};

use wayland_client::{
    protocol::{
        wl_pointer::{self, WlPointer},
        wl_seat::WlSeat,
        wl_surface::WlSurface,
    },
    Connection, Dispatch, QueueHandle, WEnum,
};

use crate::events::MouseButton;

use super::SeatState;

/* From linux/input-event-codes.h - the buttons usually used by mice */
pub const BTN_LEFT: u32 = 0x110;
pub const BTN_RIGHT: u32 = 0x111;
pub const BTN_MIDDLE: u32 = 0x112;

/// Maps an evdev button code to an application button.
///
/// Unmapped codes yield `None` and the event is dropped.
pub fn map_button(code: u32) -> Option<MouseButton> {
    match code {
        BTN_LEFT => Some(MouseButton::Left),
        BTN_MIDDLE => Some(MouseButton::Middle),
        BTN_RIGHT => Some(MouseButton::Right),
        _ => None,
    }
}

/// Expands one scroll axis event into a press+release pair of the
/// wheel-equivalent button. Negative values scroll up.
pub fn wheel_events(value: f64) -> [(MouseButton, bool); 2] {
    let button = if value < 0.0 { MouseButton::WheelUp } else { MouseButton::WheelDown };
    [(button, true), (button, false)]
}

/// User data attached to a `wl_pointer`.
#[derive(Debug)]
pub struct PointerData {
    seat: WlSeat,
    /// Buffer scale used to convert logical surface units to pixels.
    scale: AtomicI32,
    inner: Mutex<PointerDataInner>,
}

#[derive(Debug, Default)]
struct PointerDataInner {
    /// Surface the pointer most recently entered, if any.
    focus: Option<WlSurface>,
    /// Position in logical surface units.
    position: (f64, f64),
    /// Serial of the latest enter event, needed for set_cursor.
    enter_serial: Option<u32>,
}

impl PointerData {
    pub fn new(seat: WlSeat, scale: i32) -> Self {
        PointerData { seat, scale: AtomicI32::new(scale), inner: Mutex::new(PointerDataInner::default()) }
    }

    pub fn seat(&self) -> &WlSeat {
        &self.seat
    }

    pub fn set_coordinate_scale(&self, scale: i32) {
        self.scale.store(scale, Ordering::SeqCst);
    }

    /// The focused surface, if the pointer is currently on one of ours.
    pub fn focus(&self) -> Option<WlSurface> {
        self.inner.lock().unwrap().focus.clone()
    }

    pub fn enter_serial(&self) -> Option<u32> {
        self.inner.lock().unwrap().enter_serial
    }

    /// Position in logical surface units, unscaled.
    pub fn logical_position(&self) -> (f64, f64) {
        self.inner.lock().unwrap().position
    }

    /// Position converted to buffer pixels, rounded to the nearest integer.
    pub fn pixel_position(&self) -> (i32, i32) {
        let (x, y) = self.logical_position();
        let scale = self.scale.load(Ordering::SeqCst);
        scale_coordinate(x, y, scale)
    }
}

fn scale_coordinate(x: f64, y: f64, scale: i32) -> (i32, i32) {
    ((x * scale as f64).round() as i32, (y * scale as f64).round() as i32)
}

pub trait PointerHandler: Sized {
    /// The pointer entered a surface.
    ///
    /// The handler must (re-)assign a cursor image: the compositor may have
    /// substituted its own cursor surface while focus was elsewhere.
    fn pointer_enter(
        &mut self,
        conn: &Connection,
        qh: &QueueHandle<Self>,
        pointer: &WlPointer,
        surface: &WlSurface,
        serial: u32,
    );

    fn pointer_leave(&mut self, conn: &Connection, qh: &QueueHandle<Self>, pointer: &WlPointer, surface: &WlSurface);

    /// The pointer moved. The new position is already recorded in the
    /// [`PointerData`].
    fn pointer_motion(&mut self, conn: &Connection, qh: &QueueHandle<Self>, pointer: &WlPointer, surface: &WlSurface);

    /// A button changed state. `button` is the raw evdev code.
    #[allow(clippy::too_many_arguments)]
    fn pointer_button(
        &mut self,
        conn: &Connection,
        qh: &QueueHandle<Self>,
        pointer: &WlPointer,
        surface: &WlSurface,
        serial: u32,
        button: u32,
        pressed: bool,
    );

    /// A scroll axis event. Only the sign of `value` is meaningful.
    fn pointer_axis(
        &mut self,
        conn: &Connection,
        qh: &QueueHandle<Self>,
        pointer: &WlPointer,
        surface: &WlSurface,
        value: f64,
    );
}

impl<D> Dispatch<WlPointer, PointerData, D> for SeatState
where
    D: Dispatch<WlPointer, PointerData> + PointerHandler,
{
    fn event(
        state: &mut D,
        pointer: &WlPointer,
        event: wl_pointer::Event,
        data: &PointerData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            wl_pointer::Event::Enter { serial, surface, surface_x, surface_y } => {
                {
                    let mut inner = data.inner.lock().unwrap();
                    inner.focus = Some(surface.clone());
                    inner.position = (surface_x, surface_y);
                    inner.enter_serial = Some(serial);
                }
                state.pointer_enter(conn, qh, pointer, &surface, serial);
            }

            wl_pointer::Event::Leave { surface, .. } => {
                {
                    let mut inner = data.inner.lock().unwrap();
                    inner.focus = None;
                    inner.enter_serial = None;
                }
                state.pointer_leave(conn, qh, pointer, &surface);
            }

            wl_pointer::Event::Motion { surface_x, surface_y, .. } => {
                let surface = {
                    let mut inner = data.inner.lock().unwrap();
                    inner.position = (surface_x, surface_y);
                    inner.focus.clone()
                };
                if let Some(surface) = surface {
                    state.pointer_motion(conn, qh, pointer, &surface);
                }
            }

            wl_pointer::Event::Button { serial, button, state: button_state, .. } => {
                let pressed = matches!(button_state, WEnum::Value(wl_pointer::ButtonState::Pressed));
                let surface = data.inner.lock().unwrap().focus.clone();
                if let Some(surface) = surface {
                    state.pointer_button(conn, qh, pointer, &surface, serial, button, pressed);
                }
            }

            wl_pointer::Event::Axis { value, .. } => {
                let surface = data.inner.lock().unwrap().focus.clone();
                if let Some(surface) = surface {
                    state.pointer_axis(conn, qh, pointer, &surface, value);
                }
            }

            // Frames, axis sources and discrete deltas carry no information we
            // use; each axis event already stands on its own here.
            _ => {}
        }
    }
}

#[macro_export]
macro_rules! delegate_pointer {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_pointer::WlPointer: $crate::seat::pointer::PointerData
            ] => $crate::seat::SeatState
        );
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unmapped_buttons_are_dropped() {
        assert_eq!(map_button(BTN_LEFT), Some(MouseButton::Left));
        assert_eq!(map_button(BTN_MIDDLE), Some(MouseButton::Middle));
        assert_eq!(map_button(BTN_RIGHT), Some(MouseButton::Right));
        // BTN_SIDE
        assert_eq!(map_button(0x113), None);
    }

    #[test]
    fn axis_events_expand_to_press_release_pairs() {
        let up = wheel_events(-2.5);
        assert_eq!(up, [(MouseButton::WheelUp, true), (MouseButton::WheelUp, false)]);

        let down = wheel_events(1.0);
        assert_eq!(down, [(MouseButton::WheelDown, true), (MouseButton::WheelDown, false)]);

        // Two sequential events in the same direction stay two independent
        // pairs, four entries total, never coalesced.
        let events: Vec<_> = wheel_events(1.0).into_iter().chain(wheel_events(3.0)).collect();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|(button, _)| *button == MouseButton::WheelDown));
    }

    #[test]
    fn coordinates_scale_and_round() {
        assert_eq!(scale_coordinate(10.2, 20.7, 1), (10, 21));
        assert_eq!(scale_coordinate(10.2, 20.7, 2), (20, 41));
        assert_eq!(scale_coordinate(0.0, 0.0, 3), (0, 0));
    }
}
