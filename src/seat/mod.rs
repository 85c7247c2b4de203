//! Seat handling and input processing.
//!
//! Each advertised `wl_seat` carries a capability bitset that may change over
//! the seat's lifetime. Gaining a capability constructs the corresponding
//! input processor, losing it destroys the processor; the transitions are
//! reported through [`SeatHandler`].

pub mod keyboard;
pub mod pointer;
pub mod repeat;
pub mod touch;

use std::fmt::{self, Display, Formatter};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use wayland_client::{
    protocol::{wl_keyboard::WlKeyboard, wl_pointer::WlPointer, wl_seat, wl_touch::WlTouch},
    Connection, Dispatch, Proxy, QueueHandle, WEnum,
};

use crate::registry::{ProvidesRegistryState, RegistryHandler, RegistryState};

/// Version range of `wl_seat` this crate binds.
///
/// Version 2 adds the name event, version 4 keyboard repeat info, version 5
/// discrete pointer axes; everything newer is accepted and ignored.
const WL_SEAT_VERSIONS: std::ops::RangeInclusive<u32> = 1..=7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Pointer,
    Keyboard,
    Touch,
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Pointer => write!(f, "pointer"),
            Capability::Keyboard => write!(f, "keyboard"),
            Capability::Touch => write!(f, "touch"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeatError {
    /// The capability is not currently present on the seat.
    #[error("the capability \"{0}\" is not supported")]
    UnsupportedCapability(Capability),

    /// The seat global disappeared.
    #[error("the seat is dead")]
    DeadObject,
}

/// User data attached to every bound `wl_seat`.
#[derive(Debug, Clone)]
pub struct SeatData {
    name: Arc<Mutex<Option<String>>>,
    has_pointer: Arc<AtomicBool>,
    has_keyboard: Arc<AtomicBool>,
    has_touch: Arc<AtomicBool>,
}

impl SeatData {
    fn new() -> Self {
        SeatData {
            name: Arc::new(Mutex::new(None)),
            has_pointer: Arc::new(AtomicBool::new(false)),
            has_keyboard: Arc::new(AtomicBool::new(false)),
            has_touch: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The seat name, or a placeholder while the compositor has not sent one.
    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone().unwrap_or_else(|| "<unknown>".into())
    }

    pub fn has_pointer(&self) -> bool {
        self.has_pointer.load(Ordering::SeqCst)
    }

    pub fn has_keyboard(&self) -> bool {
        self.has_keyboard.load(Ordering::SeqCst)
    }

    pub fn has_touch(&self) -> bool {
        self.has_touch.load(Ordering::SeqCst)
    }
}

/// Shared, lock-guarded list of known seats.
#[derive(Debug, Clone, Default)]
pub struct Seats(Arc<Mutex<Vec<(u32, wl_seat::WlSeat)>>>);

impl Seats {
    pub fn seats(&self) -> Vec<wl_seat::WlSeat> {
        self.0.lock().unwrap().iter().map(|(_, seat)| seat.clone()).collect()
    }

    /// Whether any seat currently exposes a pointer.
    pub fn any_pointer(&self) -> bool {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, seat)| seat.data::<SeatData>())
            .any(SeatData::has_pointer)
    }

    fn push(&self, name: u32, seat: wl_seat::WlSeat) {
        self.0.lock().unwrap().push((name, seat));
    }

    fn remove(&self, name: u32) -> Option<wl_seat::WlSeat> {
        let mut guard = self.0.lock().unwrap();
        let idx = guard.iter().position(|(global, _)| *global == name)?;
        Some(guard.remove(idx).1)
    }
}

#[derive(Debug)]
pub struct SeatState {
    seats: Seats,
}

impl SeatState {
    /// Binds every seat advertised in the initial enumeration.
    pub fn bind_all<D>(registry: &RegistryState, qh: &QueueHandle<D>) -> Result<Self, crate::error::GlobalError>
    where
        D: Dispatch<wl_seat::WlSeat, SeatData> + 'static,
    {
        let seats = Seats::default();
        for (name, seat) in registry.bind_all(qh, WL_SEAT_VERSIONS, |_| SeatData::new())? {
            seats.push(name, seat);
        }
        Ok(SeatState { seats })
    }

    /// Shared handle for querying seats from other threads.
    pub fn seats(&self) -> Seats {
        self.seats.clone()
    }

    /// Creates the pointer processor for a seat.
    pub fn get_pointer<D>(
        &self,
        qh: &QueueHandle<D>,
        seat: &wl_seat::WlSeat,
        data: pointer::PointerData,
    ) -> Result<WlPointer, SeatError>
    where
        D: Dispatch<WlPointer, pointer::PointerData> + pointer::PointerHandler + 'static,
    {
        let seat_data = seat.data::<SeatData>().ok_or(SeatError::DeadObject)?;
        if !seat_data.has_pointer() {
            return Err(SeatError::UnsupportedCapability(Capability::Pointer));
        }
        Ok(seat.get_pointer(qh, data))
    }

    /// Creates the keyboard processor for a seat.
    pub fn get_keyboard<D>(
        &self,
        qh: &QueueHandle<D>,
        seat: &wl_seat::WlSeat,
        data: keyboard::KeyboardData,
    ) -> Result<WlKeyboard, SeatError>
    where
        D: Dispatch<WlKeyboard, keyboard::KeyboardData> + keyboard::KeyboardHandler + 'static,
    {
        let seat_data = seat.data::<SeatData>().ok_or(SeatError::DeadObject)?;
        if !seat_data.has_keyboard() {
            return Err(SeatError::UnsupportedCapability(Capability::Keyboard));
        }
        Ok(seat.get_keyboard(qh, data))
    }

    /// Creates the touch processor for a seat.
    pub fn get_touch<D>(
        &self,
        qh: &QueueHandle<D>,
        seat: &wl_seat::WlSeat,
        data: touch::TouchData,
    ) -> Result<WlTouch, SeatError>
    where
        D: Dispatch<WlTouch, touch::TouchData> + touch::TouchHandler + 'static,
    {
        let seat_data = seat.data::<SeatData>().ok_or(SeatError::DeadObject)?;
        if !seat_data.has_touch() {
            return Err(SeatError::UnsupportedCapability(Capability::Touch));
        }
        Ok(seat.get_touch(qh, data))
    }
}

pub trait SeatHandler: Sized {
    fn seat_state(&mut self) -> &mut SeatState;

    /// A seat was advertised. Capabilities arrive separately.
    fn new_seat(&mut self, conn: &Connection, qh: &QueueHandle<Self>, seat: wl_seat::WlSeat);

    /// The seat gained a capability; the corresponding processor should be
    /// created now.
    fn new_capability(
        &mut self,
        conn: &Connection,
        qh: &QueueHandle<Self>,
        seat: wl_seat::WlSeat,
        capability: Capability,
    );

    /// The seat lost a capability; the corresponding processor must be
    /// released.
    fn remove_capability(
        &mut self,
        conn: &Connection,
        qh: &QueueHandle<Self>,
        seat: wl_seat::WlSeat,
        capability: Capability,
    );

    /// The seat global was removed along with all its processors.
    fn remove_seat(&mut self, conn: &Connection, qh: &QueueHandle<Self>, seat: wl_seat::WlSeat);
}

impl<D> Dispatch<wl_seat::WlSeat, SeatData, D> for SeatState
where
    D: Dispatch<wl_seat::WlSeat, SeatData> + SeatHandler,
{
    fn event(
        state: &mut D,
        seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        data: &SeatData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            wl_seat::Event::Capabilities { capabilities } => {
                let capabilities = match capabilities {
                    WEnum::Value(capabilities) => capabilities,
                    WEnum::Unknown(value) => {
                        log::warn!(target: "winsys", "{} sent unknown capabilities: {}", seat.id(), value);
                        wl_seat::Capability::from_bits_truncate(value)
                    }
                };

                let transitions = [
                    (Capability::Pointer, wl_seat::Capability::Pointer, &data.has_pointer),
                    (Capability::Keyboard, wl_seat::Capability::Keyboard, &data.has_keyboard),
                    (Capability::Touch, wl_seat::Capability::Touch, &data.has_touch),
                ];

                for (capability, bit, flag) in transitions {
                    let has = capabilities.contains(bit);
                    if has == flag.load(Ordering::SeqCst) {
                        continue;
                    }

                    flag.store(has, Ordering::SeqCst);
                    if has {
                        log::debug!(target: "winsys", "seat {} gained capability {}", data.name(), capability);
                        state.new_capability(conn, qh, seat.clone(), capability);
                    } else {
                        log::debug!(target: "winsys", "seat {} lost capability {}", data.name(), capability);
                        state.remove_capability(conn, qh, seat.clone(), capability);
                    }
                }
            }

            wl_seat::Event::Name { name } => {
                *data.name.lock().unwrap() = Some(name);
            }

            _ => unreachable!(),
        }
    }
}

impl<D> RegistryHandler<D> for SeatState
where
    D: Dispatch<wl_seat::WlSeat, SeatData> + SeatHandler + ProvidesRegistryState + 'static,
{
    fn new_global(state: &mut D, conn: &Connection, qh: &QueueHandle<D>, name: u32, interface: &str, _version: u32) {
        if interface != wl_seat::WlSeat::interface().name {
            return;
        }

        match state.registry().bind_specific::<wl_seat::WlSeat, _, _>(qh, name, WL_SEAT_VERSIONS, SeatData::new()) {
            Ok(seat) => {
                state.seat_state().seats.push(name, seat.clone());
                state.new_seat(conn, qh, seat);
            }
            Err(err) => log::warn!(target: "winsys", "could not bind new seat global {}: {}", name, err),
        }
    }

    fn remove_global(state: &mut D, conn: &Connection, qh: &QueueHandle<D>, name: u32) {
        if let Some(seat) = state.seat_state().seats.remove(name) {
            state.remove_seat(conn, qh, seat.clone());
            if seat.version() >= 5 {
                seat.release();
            }
        }
    }
}

#[macro_export]
macro_rules! delegate_seat {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_seat::WlSeat: $crate::seat::SeatData
            ] => $crate::seat::SeatState
        );
    };
}
