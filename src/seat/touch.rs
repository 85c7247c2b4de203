//! Touch input processing.
//!
//! Compositor touch point ids are arbitrary; they are mapped to a small
//! reusable slot from a bounded pool so downstream consumers can index
//! per-point state cheaply. The position table is updated before any handler
//! runs, so gesture recognition never sees stale coordinates. A cancel aborts
//! every active slot at once.

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Mutex,
};

use wayland_client::{
    protocol::{
        wl_surface::WlSurface,
        wl_touch::{self, WlTouch},
    },
    Connection, Dispatch, QueueHandle,
};

use super::SeatState;

/// Maximum number of simultaneously tracked touch points.
pub const MAX_TOUCH_POINTS: usize = 10;

#[derive(Debug, Clone, Copy)]
struct TouchPoint {
    id: i32,
    /// Logical surface coordinates.
    position: (f64, f64),
}

/// User data attached to a `wl_touch`.
#[derive(Debug)]
pub struct TouchData {
    /// Buffer scale used to convert logical surface units to pixels.
    scale: AtomicI32,
    slots: Mutex<[Option<TouchPoint>; MAX_TOUCH_POINTS]>,
}

impl TouchData {
    pub fn new(scale: i32) -> Self {
        TouchData { scale: AtomicI32::new(scale), slots: Mutex::new([None; MAX_TOUCH_POINTS]) }
    }

    pub fn set_coordinate_scale(&self, scale: i32) {
        self.scale.store(scale, Ordering::SeqCst);
    }

    fn scale_position(&self, x: f64, y: f64) -> (i32, i32) {
        let scale = self.scale.load(Ordering::SeqCst) as f64;
        ((x * scale).round() as i32, (y * scale).round() as i32)
    }

    /// Assigns the first free slot to a new touch point.
    fn allocate(&self, id: i32, position: (f64, f64)) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.iter().position(Option::is_none)?;
        slots[slot] = Some(TouchPoint { id, position });
        Some(slot)
    }

    /// Updates the position table entry for a point, returning its slot.
    fn update(&self, id: i32, position: (f64, f64)) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.iter().position(|point| point.map(|p| p.id) == Some(id))?;
        slots[slot] = Some(TouchPoint { id, position });
        Some(slot)
    }

    fn release(&self, id: i32) -> Option<(usize, (f64, f64))> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.iter().position(|point| point.map(|p| p.id) == Some(id))?;
        let point = slots[slot].take()?;
        Some((slot, point.position))
    }

    fn clear(&self) {
        *self.slots.lock().unwrap() = [None; MAX_TOUCH_POINTS];
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|point| point.is_some()).count()
    }
}

pub trait TouchHandler: Sized {
    /// A new touch point went down. Coordinates are buffer pixels.
    #[allow(clippy::too_many_arguments)]
    fn touch_down(
        &mut self,
        conn: &Connection,
        qh: &QueueHandle<Self>,
        touch: &WlTouch,
        surface: &WlSurface,
        serial: u32,
        slot: usize,
        position: (i32, i32),
    );

    fn touch_motion(&mut self, conn: &Connection, qh: &QueueHandle<Self>, touch: &WlTouch, slot: usize, position: (i32, i32));

    fn touch_up(&mut self, conn: &Connection, qh: &QueueHandle<Self>, touch: &WlTouch, slot: usize, position: (i32, i32));

    /// The compositor aborted the touch sequence; every slot was cleared.
    fn touch_cancel(&mut self, conn: &Connection, qh: &QueueHandle<Self>, touch: &WlTouch);
}

impl<D> Dispatch<WlTouch, TouchData, D> for SeatState
where
    D: Dispatch<WlTouch, TouchData> + TouchHandler,
{
    fn event(
        state: &mut D,
        touch: &WlTouch,
        event: wl_touch::Event,
        data: &TouchData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            wl_touch::Event::Down { serial, surface, id, x, y, .. } => {
                match data.allocate(id, (x, y)) {
                    Some(slot) => {
                        let position = data.scale_position(x, y);
                        state.touch_down(conn, qh, touch, &surface, serial, slot, position);
                    }
                    None => {
                        log::debug!(target: "winsys", "touch point pool exhausted, dropping id {}", id);
                    }
                }
            }

            wl_touch::Event::Motion { id, x, y, .. } => {
                // Table first, handler second
                if let Some(slot) = data.update(id, (x, y)) {
                    state.touch_motion(conn, qh, touch, slot, data.scale_position(x, y));
                }
            }

            wl_touch::Event::Up { id, .. } => {
                if let Some((slot, (x, y))) = data.release(id) {
                    state.touch_up(conn, qh, touch, slot, data.scale_position(x, y));
                }
            }

            wl_touch::Event::Cancel => {
                data.clear();
                state.touch_cancel(conn, qh, touch);
            }

            // Frames and shape/orientation reports are not used.
            _ => {}
        }
    }
}

#[macro_export]
macro_rules! delegate_touch {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_touch::WlTouch: $crate::seat::touch::TouchData
            ] => $crate::seat::SeatState
        );
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slots_are_reused_first_free_first() {
        let data = TouchData::new(1);

        assert_eq!(data.allocate(100, (0.0, 0.0)), Some(0));
        assert_eq!(data.allocate(101, (0.0, 0.0)), Some(1));
        assert_eq!(data.allocate(102, (0.0, 0.0)), Some(2));

        // Releasing the middle point frees its slot for the next id
        assert!(data.release(101).is_some());
        assert_eq!(data.allocate(103, (0.0, 0.0)), Some(1));
        assert_eq!(data.active_count(), 3);
    }

    #[test]
    fn pool_exhaustion_drops_new_points() {
        let data = TouchData::new(1);
        for id in 0..MAX_TOUCH_POINTS as i32 {
            assert!(data.allocate(id, (0.0, 0.0)).is_some());
        }
        assert_eq!(data.allocate(99, (0.0, 0.0)), None);
    }

    #[test]
    fn motion_updates_position_before_reporting() {
        let data = TouchData::new(2);
        let slot = data.allocate(7, (1.0, 1.0)).unwrap();

        assert_eq!(data.update(7, (3.4, 5.6)), Some(slot));
        let (_, position) = data.release(7).unwrap();
        assert_eq!(position, (3.4, 5.6));
    }

    #[test]
    fn cancel_clears_all_slots() {
        let data = TouchData::new(1);
        data.allocate(1, (0.0, 0.0));
        data.allocate(2, (0.0, 0.0));
        data.clear();
        assert_eq!(data.active_count(), 0);

        // Ids from the cancelled sequence are unknown afterwards
        assert_eq!(data.update(1, (1.0, 1.0)), None);
    }

    #[test]
    fn positions_scale_to_buffer_pixels() {
        let data = TouchData::new(2);
        assert_eq!(data.scale_position(10.2, 20.7), (20, 41));
        data.set_coordinate_scale(1);
        assert_eq!(data.scale_position(10.2, 20.7), (10, 21));
    }
}
