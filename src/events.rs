//! The application-facing event stream.
//!
//! Protocol callbacks push discrete events into an [`EventSink`]; the
//! application drains it from its own thread with [`EventSink::pump`]. Events
//! are delivered in FIFO order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use xkbcommon::xkb::Keysym;

/// A mouse button as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    /// Synthesized from a scroll axis event with negative value.
    WheelUp,
    /// Synthesized from a scroll axis event with positive value.
    WheelDown,
}

/// Active keyboard modifiers at the time of a key event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub logo: bool,
    pub caps_lock: bool,
    pub num_lock: bool,
}

/// A fully translated key event.
///
/// Carries everything the application needs so that replaying it (key repeat)
/// never has to consult the keymap again.
#[derive(Debug, Clone)]
pub struct KeyEvent {
    /// Key symbol resolved through the active keymap and modifiers.
    pub keysym: Keysym,
    /// Scancode clamped to the representable range; out-of-range codes map to
    /// 0 ("unknown"), not a wrapped value.
    pub scancode: u8,
    /// UTF-16 code unit for text input. Code points above the 16-bit range are
    /// reported as 0, never truncated.
    pub unicode: u16,
    pub modifiers: Modifiers,
    pub pressed: bool,
}

/// A touch point event carrying the reusable slot the point was assigned to.
#[derive(Debug, Clone, Copy)]
pub enum TouchEvent {
    Down { slot: usize, x: i32, y: i32 },
    Motion { slot: usize, x: i32, y: i32 },
    Up { slot: usize, x: i32, y: i32 },
    /// The compositor aborted the whole touch sequence.
    Cancel,
}

/// A discrete event delivered to the application.
#[derive(Debug, Clone)]
pub enum Event {
    /// Pointer moved; coordinates are buffer pixels.
    Motion { x: i32, y: i32 },
    /// Pointer button or synthesized wheel button.
    Button { button: MouseButton, pressed: bool, x: i32, y: i32 },
    Key(KeyEvent),
    Touch(TouchEvent),
    /// Keyboard focus gained or lost.
    Focus { gained: bool },
    /// The pointer entered or left the surface.
    MouseActive { active: bool },
    /// The surface was resized; the render surface must be brought to
    /// `buffer_size` and the resize confirmed via the windowing system.
    Resized { surface_size: (i32, i32), buffer_size: (i32, i32), scale: i32 },
    /// The compositor asked the window to close.
    Close,
    /// The set of known outputs or their properties changed; resolution
    /// lists should be re-enumerated.
    OutputsChanged,
}

/// FIFO queue between the protocol thread and the application.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    queue: Arc<Mutex<VecDeque<Event>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.queue.lock().unwrap().push_back(event);
    }

    /// Drains queued events into the callback.
    ///
    /// The lock is not held while the callback runs, so handlers may push
    /// further events without deadlocking.
    pub fn pump(&self, mut handler: impl FnMut(Event)) {
        loop {
            let event = {
                let mut queue = self.queue.lock().unwrap();
                match queue.pop_front() {
                    Some(event) => event,
                    None => break,
                }
            };
            handler(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pump_preserves_fifo_order() {
        let sink = EventSink::new();
        sink.push(Event::Focus { gained: true });
        sink.push(Event::Close);

        let mut seen = Vec::new();
        sink.pump(|event| seen.push(event));

        assert!(matches!(seen[0], Event::Focus { gained: true }));
        assert!(matches!(seen[1], Event::Close));
        assert!(sink.is_empty());
    }

    #[test]
    fn pump_is_reentrant() {
        let sink = EventSink::new();
        sink.push(Event::Close);

        let resend = sink.clone();
        let mut count = 0;
        sink.pump(|event| {
            if count == 0 {
                // Handler pushes while the pump is draining
                resend.push(event);
            }
            count += 1;
        });

        assert_eq!(count, 2);
    }
}
