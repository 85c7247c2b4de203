//! The surface state machine and public windowing facade.
//!
//! [`WindowingSystem`] owns the connection and drives bootstrap: resolve
//! globals, wait for outputs, create the main surface, let a shell variant
//! assume the window role, wait for the initial configure, then hand the
//! protocol machinery to the event pump thread.
//!
//! From then on all protocol callbacks run on the pump thread and mutate
//! [`WinSystemState`]; application threads interact through the shared,
//! individually locked pieces (output list, seat list, surface
//! configuration, frame times, event sink) and through proxies, which are
//! thread safe. Requests that need to touch dispatch state (a windowed
//! resize, for example) serialize onto the pump thread over a command
//! channel.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use wayland_backend::client::ObjectId;
use wayland_client::{
    globals::registry_queue_init,
    protocol::{
        wl_compositor::WlCompositor,
        wl_keyboard::WlKeyboard,
        wl_pointer::WlPointer,
        wl_seat::WlSeat,
        wl_shm::WlShm,
        wl_surface::WlSurface,
        wl_touch::WlTouch,
    },
    Connection, EventQueue, Proxy, QueueHandle,
};
use wayland_cursor::CursorTheme;

use crate::{
    compositor::{CompositorState, SurfaceData, SurfaceHandler},
    decorations::{decoration_size, DecorationAction, SubcompositorState, WindowDecorator},
    error::Error,
    event_pump::EventPump,
    events::{Event, EventSink, KeyEvent, TouchEvent},
    idle_inhibit::{IdleInhibitState, IdleInhibitor},
    output::{OutputHandler, OutputState, Outputs},
    presentation::{FrameTimes, PresentationHandler, PresentationState},
    registry::{ProvidesRegistryState, RegistryState},
    seat::{
        keyboard::{KeyboardData, KeyboardHandler},
        pointer::{map_button, wheel_events, PointerData, PointerHandler},
        repeat::{repeat_source, RepeatMessage},
        touch::{TouchData, TouchHandler},
        Capability, SeatHandler, SeatState, Seats,
    },
    shell::{wl::WlShell, xdg::XdgShell, Configure, ShellHandler, ShellSurface, SurfaceState},
    shm::{ShmHandler, ShmState},
};

/// One selectable display mode, as exposed to the resolution subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionInfo {
    pub width: i32,
    pub height: i32,
    pub refresh_hz: f32,
    pub pixel_ratio: f32,
    /// User-friendly name of the output the mode belongs to.
    pub output: String,
    /// Whether this is the mode the output currently runs.
    pub current: bool,
}

/// A configure whose serial still awaits its acknowledgement.
#[derive(Debug, Clone, Copy)]
struct PendingAck {
    serial: u32,
    surface_size: (i32, i32),
}

/// The coarse-locked current configuration, shared with application threads.
#[derive(Debug)]
struct SurfaceConfig {
    /// Logical, undecorated, unscaled surface size.
    surface_size: (i32, i32),
    /// Integer buffer scale, the maximum over all entered outputs.
    scale: i32,
    state: SurfaceState,
    /// Whether the application asked for fullscreen.
    fullscreen: bool,
    /// Size the application asked for; authoritative only while unconstrained.
    requested_size: (i32, i32),
    /// Name of the output the surface is assumed to be on.
    current_output: String,
    /// Effective refresh rate for vsync pacing, from the entered output set.
    refresh_hz: f32,
    /// Average DPI over the entered output set, for touch calibration.
    dpi: Option<f32>,
    /// The compositor draws decorations itself.
    server_decorations: bool,
    pending_acks: Vec<PendingAck>,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        SurfaceConfig {
            surface_size: (0, 0),
            scale: 1,
            state: SurfaceState::empty(),
            fullscreen: false,
            requested_size: (0, 0),
            current_output: String::new(),
            refresh_hz: 0.0,
            dpi: None,
            server_decorations: false,
            pending_acks: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct WindowShared {
    config: Mutex<SurfaceConfig>,
    events: EventSink,
    /// Set once the first configure has been processed.
    configured: AtomicBool,
}

/// Request from an application thread, executed on the pump thread.
#[derive(Debug)]
enum WindowCommand {
    /// Apply an unconstrained windowed size.
    ApplySize { width: i32, height: i32 },
    /// Re-run the surface state pipeline, e.g. after a fullscreen switch.
    SyncState,
}

/// Resolves the surface size a configure results in.
///
/// A (0, 0) configure means the compositor has no preference: the previously
/// configured size is retained, falling back to the application's requested
/// size during bootstrap. Otherwise the proposal includes decorations when
/// they are active and these are subtracted.
fn resolve_surface_size(
    proposal: (i32, i32),
    decorations_active: bool,
    previous: (i32, i32),
    requested: (i32, i32),
) -> (i32, i32) {
    if proposal == (0, 0) {
        return if previous == (0, 0) { requested } else { previous };
    }

    if decorations_active {
        let (dw, dh) = decoration_size();
        ((proposal.0 - dw).max(1), (proposal.1 - dh).max(1))
    } else {
        proposal
    }
}

/// `bufferSize = surfaceSize * scale`, always.
fn buffer_size_for(surface: (i32, i32), scale: i32) -> (i32, i32) {
    (surface.0 * scale, surface.1 * scale)
}

/// Newest configure wins: acknowledges the most recent pending serial whose
/// size matches what the renderer settled on; everything older is discarded
/// without an ack.
fn take_newest_matching_ack(acks: &mut Vec<PendingAck>, surface_size: (i32, i32)) -> Option<u32> {
    let pos = acks.iter().rposition(|ack| ack.surface_size == surface_size)?;
    let serial = acks[pos].serial;
    acks.drain(..=pos);
    Some(serial)
}

/// Loads and (re)attaches the default cursor for the main surface.
///
/// The cursor must be re-assigned on every pointer enter: the compositor may
/// substitute its own cursor surface while focus is elsewhere.
struct CursorManager {
    conn: Connection,
    compositor: WlCompositor,
    shm: WlShm,
    theme: Option<CursorTheme>,
    surface: Option<WlSurface>,
}

impl std::fmt::Debug for CursorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorManager").field("loaded", &self.surface.is_some()).finish()
    }
}

impl CursorManager {
    /// Cursor theme base size; 16px matches what the rest of the system
    /// expects from the default theme.
    const CURSOR_SIZE: u32 = 16;

    fn set_cursor(
        &mut self,
        qh: &QueueHandle<WinSystemState>,
        pointer: &WlPointer,
        serial: u32,
        visible: bool,
    ) {
        if !visible {
            pointer.set_cursor(serial, None, 0, 0);
            return;
        }

        if self.theme.is_none() {
            match CursorTheme::load(&self.conn, self.shm.clone(), Self::CURSOR_SIZE) {
                Ok(theme) => self.theme = Some(theme),
                Err(err) => {
                    // Not fatal: the application runs without an OS cursor.
                    log::warn!(target: "winsys", "could not load default cursor theme, continuing without OS cursor: {}", err);
                    return;
                }
            }
        }

        let theme = self.theme.as_mut().unwrap();
        let name = if theme.get_cursor("default").is_some() { "default" } else { "left_ptr" };
        let cursor = match theme.get_cursor(name) {
            Some(cursor) => cursor,
            None => {
                log::warn!(target: "winsys", "cursor theme has no default cursor, continuing without OS cursor");
                return;
            }
        };

        // Just use the first image, no animation
        let image = &cursor[0];
        let (w, h) = image.dimensions();
        let (hx, hy) = image.hotspot();

        let compositor = &self.compositor;
        let surface = self
            .surface
            .get_or_insert_with(|| compositor.create_surface(qh, SurfaceData::new()));

        surface.attach(Some(image), 0, 0);
        surface.damage(0, 0, w as i32, h as i32);
        surface.commit();
        pointer.set_cursor(serial, Some(surface), hx as i32, hy as i32);
    }
}

/// Per-seat protocol objects created from the capability state machine.
#[derive(Debug, Default)]
struct SeatObjects {
    pointer: Option<WlPointer>,
    keyboard: Option<WlKeyboard>,
    touch: Option<WlTouch>,
}

/// Dispatch state for the whole windowing backend.
///
/// Owned by the bootstrap thread until the event pump starts, by the pump
/// thread afterwards.
pub struct WinSystemState {
    conn: Connection,
    qh: QueueHandle<WinSystemState>,

    registry: RegistryState,
    compositor: CompositorState,
    subcompositor: Option<SubcompositorState>,
    shm: ShmState,
    output_state: OutputState,
    seat_state: SeatState,
    presentation: PresentationState,
    idle_inhibit: IdleInhibitState,
    xdg_shell: Option<XdgShell>,
    wl_shell: Option<WlShell>,

    shared: Arc<WindowShared>,
    outputs: Outputs,
    seats: Seats,

    main_surface: Option<WlSurface>,
    shell_surface: Option<Arc<Mutex<Box<dyn ShellSurface>>>>,
    decorator: Option<WindowDecorator<WinSystemState>>,
    seat_objects: HashMap<ObjectId, SeatObjects>,
    repeat_sender: calloop::channel::Sender<RepeatMessage>,
    cursor: CursorManager,
    cursor_visible: Arc<AtomicBool>,
}

impl std::fmt::Debug for WinSystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinSystemState")
            .field("main_surface", &self.main_surface)
            .field("seats", &self.seat_objects.len())
            .finish()
    }
}

impl WinSystemState {
    fn is_main_surface(&self, surface: &WlSurface) -> bool {
        self.main_surface.as_ref() == Some(surface)
    }

    fn push_event(&self, event: Event) {
        self.shared.events.push(event);
    }

    /// Re-applies the current size/scale/state to everything that derives
    /// from it: the opaque region hint, the decorator, and the per-seat
    /// coordinate scaling.
    fn sync_surface_state(&mut self) {
        let (surface_size, scale, state, server_decorations) = {
            let config = self.shared.config.lock().unwrap();
            (config.surface_size, config.scale, config.state, config.server_decorations)
        };

        if let Some(main_surface) = &self.main_surface {
            // The opaque region is an optimization hint for the compositor,
            // not a correctness requirement; it covers exactly the visible,
            // undecorated surface rectangle.
            let region = self.compositor.create_region(&self.qh);
            region.add(0, 0, surface_size.0, surface_size.1);
            main_surface.set_opaque_region(Some(region.wl_region()));

            if main_surface.version() >= 3 {
                main_surface.set_buffer_scale(scale);
            }
        }

        for objects in self.seat_objects.values() {
            if let Some(data) = objects.pointer.as_ref().and_then(|p| p.data::<PointerData>()) {
                data.set_coordinate_scale(scale);
            }
            if let Some(data) = objects.touch.as_ref().and_then(|t| t.data::<TouchData>()) {
                data.set_coordinate_scale(scale);
            }
        }

        if let Some(decorator) = &mut self.decorator {
            decorator.set_enabled(!server_decorations);
            decorator.set_state(surface_size, scale, state);
        }
    }

    fn decorations_active(&self, state: SurfaceState, server_decorations: bool) -> bool {
        self.decorator.is_some()
            && !server_decorations
            && WindowDecorator::<WinSystemState>::state_has_decorations(state)
    }

    /// The shared configure/resize pipeline.
    ///
    /// Applies a new surface size (compositor- or application-driven),
    /// records the serial for a later ack and notifies the renderer. A
    /// configure that changes nothing is acked straight away since the
    /// buffers already match.
    fn apply_configure(&mut self, configure: Configure) {
        let (size_changed, surface_size, scale) = {
            let mut config = self.shared.config.lock().unwrap();

            // The legacy shell never reports states and app-driven sizes
            // carry none either; there the requested-fullscreen intent
            // stands in for the compositor-confirmed bit.
            let mut state = configure.state;
            if configure.serial == 0 && config.fullscreen {
                state |= SurfaceState::FULLSCREEN;
            }

            let decorations_active = self.decorations_active(state, config.server_decorations);
            let surface_size = resolve_surface_size(
                configure.size,
                decorations_active,
                config.surface_size,
                config.requested_size,
            );

            let size_changed = surface_size != config.surface_size;
            config.surface_size = surface_size;
            config.state = state;

            if configure.serial != 0 && size_changed {
                config.pending_acks.push(PendingAck { serial: configure.serial, surface_size });
            }

            (size_changed, surface_size, config.scale)
        };

        self.shared.configured.store(true, Ordering::SeqCst);
        self.sync_surface_state();

        if size_changed {
            self.push_event(Event::Resized {
                surface_size,
                buffer_size: buffer_size_for(surface_size, scale),
                scale,
            });
        } else if configure.serial != 0 {
            // Nothing to resize; the promise "my buffers match" already holds.
            if let Some(shell) = &self.shell_surface {
                shell.lock().unwrap().ack_configure(configure.serial);
            }
        }
    }

    /// Recomputes everything derived from the set of outputs currently
    /// showing the surface: effective refresh rate and average DPI. The
    /// effective scale is tracked separately through [`SurfaceData`].
    fn recompute_output_set(&mut self) {
        let entered = match &self.main_surface {
            Some(surface) => match surface.data::<SurfaceData>() {
                Some(data) => data.outputs(),
                None => return,
            },
            None => return,
        };

        let mut max_refresh: f32 = 0.0;
        let mut dpi_sum = 0.0;
        let mut dpi_count = 0;

        for output in &entered {
            if let Some(data) = output.data::<crate::output::OutputData>() {
                data.with_info(|info| {
                    if let Ok(mode) = info.current_mode() {
                        max_refresh = max_refresh.max(mode.refresh_hz());
                    }
                    if let Some(dpi) = info.dpi() {
                        dpi_sum += dpi;
                        dpi_count += 1;
                    }
                });
            }
        }

        let mut config = self.shared.config.lock().unwrap();
        let mut changed = false;

        if max_refresh > 0.0 && (max_refresh - config.refresh_hz).abs() > f32::EPSILON {
            config.refresh_hz = max_refresh;
            changed = true;
        }
        if dpi_count > 0 {
            let dpi = dpi_sum / dpi_count as f32;
            if config.dpi != Some(dpi) {
                config.dpi = Some(dpi);
                changed = true;
            }
        }
        drop(config);

        if changed {
            self.push_event(Event::OutputsChanged);
        }
    }

    fn handle_decoration_action(&mut self, seat: &WlSeat, serial: u32, action: DecorationAction) {
        let shell = match &self.shell_surface {
            Some(shell) => shell.clone(),
            None => return,
        };
        let shell = shell.lock().unwrap();

        let result = match action {
            DecorationAction::Move => shell.interactive_move(seat, serial),
            DecorationAction::Resize(edge) => shell.interactive_resize(seat, serial, edge),
            DecorationAction::Minimize => shell.set_minimized(),
            DecorationAction::ToggleMaximize => {
                let maximized =
                    self.shared.config.lock().unwrap().state.contains(SurfaceState::MAXIMIZED);
                if maximized {
                    shell.unset_maximized()
                } else {
                    shell.set_maximized()
                }
            }
            DecorationAction::Close => {
                self.push_event(Event::Close);
                Ok(())
            }
            DecorationAction::ShowMenu { position } => shell.show_window_menu(seat, serial, position),
        };

        if result.is_err() {
            log::debug!(target: "winsys", "shell variant does not support {:?}", action);
        }
    }

    fn handle_repeat(state: &mut WinSystemState, event: KeyEvent) {
        // Repeats replay the saved press event
        state.push_event(Event::Key(event));
    }

    fn handle_command(state: &mut WinSystemState, command: WindowCommand) {
        match command {
            WindowCommand::ApplySize { width, height } => {
                // The application requests an undecorated surface size while
                // the pipeline expects a decorated proposal.
                let (state_bits, server_decorations) = {
                    let config = state.shared.config.lock().unwrap();
                    (config.state, config.server_decorations)
                };
                let size = if state.decorations_active(state_bits, server_decorations) {
                    let (dw, dh) = decoration_size();
                    (width + dw, height + dh)
                } else {
                    (width, height)
                };
                state.apply_configure(Configure { serial: 0, size, state: state_bits });
            }
            WindowCommand::SyncState => state.sync_surface_state(),
        }
    }
}

impl ProvidesRegistryState for WinSystemState {
    fn registry(&mut self) -> &mut RegistryState {
        &mut self.registry
    }

    crate::registry_handlers![OutputState, SeatState];
}

impl ShmHandler for WinSystemState {
    fn shm_state(&mut self) -> &mut ShmState {
        &mut self.shm
    }
}

impl PresentationHandler for WinSystemState {
    fn presentation_state(&mut self) -> &mut PresentationState {
        &mut self.presentation
    }
}

impl OutputHandler for WinSystemState {
    fn output_state(&mut self) -> &mut OutputState {
        &mut self.output_state
    }

    fn new_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, output: wayland_client::protocol::wl_output::WlOutput) {
        if let Some(data) = output.data::<crate::output::OutputData>() {
            data.with_info(|info| {
                log::info!(target: "winsys", "new output \"{}\" with {} mode(s)", info.friendly_name(), info.modes().len());
            });
        }

        // A fullscreen target the user configured may just have appeared
        if self.shared.config.lock().unwrap().fullscreen {
            self.push_event(Event::OutputsChanged);
        }
    }

    fn update_output(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: wayland_client::protocol::wl_output::WlOutput) {
        // Scale or mode list may have changed under the surface
        if let Some(data) = self.main_surface.as_ref().and_then(|s| s.data::<SurfaceData>()) {
            if let Some(factor) = data.recompute_scale() {
                let surface = self.main_surface.clone().unwrap();
                let conn = self.conn.clone();
                let qh = self.qh.clone();
                self.scale_factor_changed(&conn, &qh, &surface, factor);
            }
        }
        self.recompute_output_set();
    }

    fn output_destroyed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _output: wayland_client::protocol::wl_output::WlOutput) {
        self.recompute_output_set();
        if self.shared.config.lock().unwrap().fullscreen {
            self.push_event(Event::OutputsChanged);
        }
    }
}

impl SurfaceHandler for WinSystemState {
    fn scale_factor_changed(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        surface: &WlSurface,
        new_factor: i32,
    ) {
        if !self.is_main_surface(surface) {
            return;
        }

        let surface_size = {
            let mut config = self.shared.config.lock().unwrap();
            if config.scale == new_factor {
                return;
            }
            config.scale = new_factor;
            config.surface_size
        };

        log::debug!(target: "winsys", "buffer scale is now {}", new_factor);
        self.sync_surface_state();
        self.push_event(Event::Resized {
            surface_size,
            buffer_size: buffer_size_for(surface_size, new_factor),
            scale: new_factor,
        });
    }

    fn surface_outputs_changed(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, surface: &WlSurface) {
        if self.is_main_surface(surface) {
            self.recompute_output_set();
        }
    }
}

impl ShellHandler for WinSystemState {
    fn shell_configure(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, configure: Configure) {
        log::debug!(target: "winsys",
            "configure serial {} size {}x{} state {:?}",
            configure.serial, configure.size.0, configure.size.1, configure.state);
        self.apply_configure(configure);
    }

    fn shell_close(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>) {
        self.push_event(Event::Close);
    }

    fn shell_decoration_mode(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, server_side: bool) {
        log::debug!(target: "winsys", "compositor decoration mode: {}", if server_side { "server" } else { "client" });
        self.shared.config.lock().unwrap().server_decorations = server_side;
        self.sync_surface_state();
    }
}

impl SeatHandler for WinSystemState {
    fn seat_state(&mut self) -> &mut SeatState {
        &mut self.seat_state
    }

    fn new_seat(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, seat: WlSeat) {
        log::debug!(target: "winsys", "seat {} added", seat.id());
    }

    fn new_capability(&mut self, _conn: &Connection, qh: &QueueHandle<Self>, seat: WlSeat, capability: Capability) {
        let scale = self.shared.config.lock().unwrap().scale;
        let objects = self.seat_objects.entry(seat.id()).or_default();

        let created = match capability {
            Capability::Pointer => self
                .seat_state
                .get_pointer(qh, &seat, PointerData::new(seat.clone(), scale))
                .map(|pointer| objects.pointer = Some(pointer)),
            Capability::Keyboard => self
                .seat_state
                .get_keyboard(qh, &seat, KeyboardData::new(seat.clone(), self.repeat_sender.clone()))
                .map(|keyboard| objects.keyboard = Some(keyboard)),
            Capability::Touch => self
                .seat_state
                .get_touch(qh, &seat, TouchData::new(scale))
                .map(|touch| objects.touch = Some(touch)),
        };

        if let Err(err) = created {
            log::warn!(target: "winsys", "could not create {} processor: {}", capability, err);
        }
    }

    fn remove_capability(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, seat: WlSeat, capability: Capability) {
        if let Some(objects) = self.seat_objects.get_mut(&seat.id()) {
            match capability {
                Capability::Pointer => {
                    if let Some(pointer) = objects.pointer.take() {
                        if pointer.version() >= 3 {
                            pointer.release();
                        }
                    }
                }
                Capability::Keyboard => {
                    if let Some(keyboard) = objects.keyboard.take() {
                        if keyboard.version() >= 3 {
                            keyboard.release();
                        }
                    }
                }
                Capability::Touch => {
                    if let Some(touch) = objects.touch.take() {
                        if touch.version() >= 3 {
                            touch.release();
                        }
                    }
                }
            }
        }
    }

    fn remove_seat(&mut self, conn: &Connection, qh: &QueueHandle<Self>, seat: WlSeat) {
        for capability in [Capability::Pointer, Capability::Keyboard, Capability::Touch] {
            self.remove_capability(conn, qh, seat.clone(), capability);
        }
        self.seat_objects.remove(&seat.id());
    }
}

impl PointerHandler for WinSystemState {
    fn pointer_enter(&mut self, _conn: &Connection, qh: &QueueHandle<Self>, pointer: &WlPointer, surface: &WlSurface, serial: u32) {
        let data = match pointer.data::<PointerData>() {
            Some(data) => data,
            None => return,
        };

        if let Some(index) = self.decorator.as_ref().and_then(|d| d.surface_index(surface)) {
            let position = data.logical_position();
            if let Some(decorator) = self.decorator.as_mut() {
                decorator.pointer_enter(pointer, serial, index, position);
            }
            return;
        }

        if !self.is_main_surface(surface) {
            return;
        }

        // Focus gain first, then cursor assignment (which is separate from
        // focus and must happen on every enter), then the initial position.
        self.push_event(Event::MouseActive { active: true });

        let visible = self.cursor_visible.load(Ordering::SeqCst);
        self.cursor.set_cursor(qh, pointer, serial, visible);

        let (x, y) = data.pixel_position();
        self.push_event(Event::Motion { x, y });
    }

    fn pointer_leave(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, pointer: &WlPointer, surface: &WlSurface) {
        if self.decorator.as_ref().and_then(|d| d.surface_index(surface)).is_some() {
            if let Some(decorator) = self.decorator.as_mut() {
                decorator.pointer_leave(pointer);
            }
            return;
        }

        if self.is_main_surface(surface) {
            self.push_event(Event::MouseActive { active: false });
        }
    }

    fn pointer_motion(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, pointer: &WlPointer, surface: &WlSurface) {
        let data = match pointer.data::<PointerData>() {
            Some(data) => data,
            None => return,
        };

        if let Some(index) = self.decorator.as_ref().and_then(|d| d.surface_index(surface)) {
            let position = data.logical_position();
            if let Some(decorator) = self.decorator.as_mut() {
                decorator.pointer_motion(pointer, index, position);
            }
            return;
        }

        if self.is_main_surface(surface) {
            let (x, y) = data.pixel_position();
            self.push_event(Event::Motion { x, y });
        }
    }

    fn pointer_button(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        pointer: &WlPointer,
        surface: &WlSurface,
        serial: u32,
        button: u32,
        pressed: bool,
    ) {
        let data = match pointer.data::<PointerData>() {
            Some(data) => data,
            None => return,
        };

        if let Some(index) = self.decorator.as_ref().and_then(|d| d.surface_index(surface)) {
            if pressed {
                let position = data.logical_position();
                let action = self
                    .decorator
                    .as_mut()
                    .and_then(|decorator| decorator.button_pressed(index, button, position));
                if let Some(action) = action {
                    let seat = data.seat().clone();
                    self.handle_decoration_action(&seat, serial, action);
                }
            }
            return;
        }

        if !self.is_main_surface(surface) {
            return;
        }

        let mapped = match map_button(button) {
            Some(mapped) => mapped,
            // Unmapped button codes are dropped
            None => return,
        };

        let (x, y) = data.pixel_position();
        self.push_event(Event::Button { button: mapped, pressed, x, y });
    }

    fn pointer_axis(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, pointer: &WlPointer, surface: &WlSurface, value: f64) {
        if !self.is_main_surface(surface) {
            return;
        }

        let (x, y) = match pointer.data::<PointerData>() {
            Some(data) => data.pixel_position(),
            None => return,
        };

        // One synthetic press+release per axis event, direction from sign
        for (button, pressed) in wheel_events(value) {
            self.push_event(Event::Button { button, pressed, x, y });
        }
    }
}

impl KeyboardHandler for WinSystemState {
    fn keyboard_focus(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _keyboard: &WlKeyboard, gained: bool) {
        self.push_event(Event::Focus { gained });
    }

    fn key_event(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _keyboard: &WlKeyboard, event: KeyEvent) {
        self.push_event(Event::Key(event));
    }
}

impl TouchHandler for WinSystemState {
    fn touch_down(
        &mut self,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
        touch: &WlTouch,
        surface: &WlSurface,
        serial: u32,
        slot: usize,
        position: (i32, i32),
    ) {
        if let Some(index) = self.decorator.as_ref().and_then(|d| d.surface_index(surface)) {
            let logical = (position.0 as f64, position.1 as f64);
            let action =
                self.decorator.as_mut().and_then(|decorator| decorator.touch_down(index, logical));
            if let Some(action) = action {
                // Resolve which seat this touch belongs to
                let seat = self
                    .seat_objects
                    .iter()
                    .find(|(_, objects)| objects.touch.as_ref() == Some(touch))
                    .and_then(|(id, _)| {
                        self.seats.seats().into_iter().find(|seat| &seat.id() == id)
                    });
                if let Some(seat) = seat {
                    self.handle_decoration_action(&seat, serial, action);
                }
            }
            return;
        }

        if self.is_main_surface(surface) {
            self.push_event(Event::Touch(TouchEvent::Down { slot, x: position.0, y: position.1 }));
        }
    }

    fn touch_motion(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _touch: &WlTouch, slot: usize, position: (i32, i32)) {
        self.push_event(Event::Touch(TouchEvent::Motion { slot, x: position.0, y: position.1 }));
    }

    fn touch_up(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _touch: &WlTouch, slot: usize, position: (i32, i32)) {
        self.push_event(Event::Touch(TouchEvent::Up { slot, x: position.0, y: position.1 }));
    }

    fn touch_cancel(&mut self, _conn: &Connection, _qh: &QueueHandle<Self>, _touch: &WlTouch) {
        self.push_event(Event::Touch(TouchEvent::Cancel));
    }
}

crate::delegate_registry!(WinSystemState);
crate::delegate_compositor!(WinSystemState);
crate::delegate_output!(WinSystemState);
crate::delegate_shm!(WinSystemState);
crate::delegate_seat!(WinSystemState);
crate::delegate_pointer!(WinSystemState);
crate::delegate_keyboard!(WinSystemState);
crate::delegate_touch!(WinSystemState);
crate::delegate_xdg_shell!(WinSystemState);
crate::delegate_wl_shell!(WinSystemState);
crate::delegate_presentation!(WinSystemState);
crate::delegate_idle_inhibit!(WinSystemState);
crate::delegate_decorations!(WinSystemState);

/// State kept on the bootstrap thread until the pump takes over.
struct Bootstrap {
    queue: EventQueue<WinSystemState>,
    state: WinSystemState,
    repeat: crate::seat::repeat::KeyRepeatSource,
    commands: calloop::channel::Channel<WindowCommand>,
}

/// The windowing backend facade handed to the application's composition
/// root. There is no process-wide instance; the owner decides the lifetime.
pub struct WindowingSystem {
    conn: Connection,
    qh: QueueHandle<WinSystemState>,

    bootstrap: Option<Bootstrap>,
    pump: Option<EventPump>,

    shared: Arc<WindowShared>,
    outputs: Outputs,
    seats: Seats,
    frame_times: FrameTimes,

    main_surface: Option<WlSurface>,
    shell_surface: Option<Arc<Mutex<Box<dyn ShellSurface>>>>,
    presentation: crate::presentation::PresentationHandle,
    idle_inhibit: crate::idle_inhibit::IdleInhibitHandle,
    commands: calloop::channel::Sender<WindowCommand>,
    cursor_visible: Arc<AtomicBool>,
}

impl std::fmt::Debug for WindowingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowingSystem")
            .field("running", &self.pump.is_some())
            .finish()
    }
}

impl WindowingSystem {
    /// Connects to the compositor and resolves all globals.
    ///
    /// Singleton globals are bound first; outputs and seats afterwards, so
    /// their handlers can rely on the singletons. Fails when a required
    /// global is missing or no output ever reports complete information.
    pub fn new() -> Result<WindowingSystem, Error> {
        log::info!(target: "winsys", "connecting to Wayland server");
        let conn = Connection::connect_to_env()?;

        let (globals, mut queue) = registry_queue_init::<WinSystemState>(&conn)?;
        let qh = queue.handle();

        let registry = RegistryState::new(&globals);

        let compositor = CompositorState::bind(&registry, &qh)?;
        let shm = ShmState::bind(&registry, &qh)?;

        let subcompositor = match SubcompositorState::bind(&registry, &qh) {
            Ok(subcompositor) => Some(subcompositor),
            Err(err) => {
                log::info!(target: "winsys", "no subcompositor, client-side decorations disabled: {}", err);
                None
            }
        };

        let xdg_shell = XdgShell::bind(&registry, &qh).ok();
        let wl_shell = WlShell::bind(&registry, &qh).ok();
        let presentation = PresentationState::bind(&registry, &qh);
        let idle_inhibit = IdleInhibitState::bind(&registry, &qh);

        if !presentation.is_available() {
            log::info!(target: "winsys", "compositor does not support presentation timing");
        }

        // Second phase: per-instance globals, now that the singletons exist.
        let output_state = OutputState::bind_all(&registry, &qh)?;
        let seat_state = SeatState::bind_all(&registry, &qh)?;

        let outputs = output_state.outputs();
        let seats = seat_state.seats();

        if seats.seats().is_empty() {
            log::warn!(target: "winsys",
                "compositor did not announce a wl_seat - no input devices for the time being");
        }

        let (repeat_sender, repeat) = repeat_source();
        let (command_sender, commands) = calloop::channel::channel();

        let shared = Arc::new(WindowShared::default());
        let frame_times = presentation.times();
        let presentation_handle = presentation.handle();
        let idle_handle = idle_inhibit.handle();
        let cursor_visible = Arc::new(AtomicBool::new(true));

        let mut state = WinSystemState {
            conn: conn.clone(),
            qh: qh.clone(),
            cursor: CursorManager {
                conn: conn.clone(),
                compositor: compositor.wl_compositor().clone(),
                shm: shm.wl_shm().clone(),
                theme: None,
                surface: None,
            },
            registry,
            compositor,
            subcompositor,
            shm,
            output_state,
            seat_state,
            presentation,
            idle_inhibit,
            xdg_shell,
            wl_shell,
            shared: shared.clone(),
            outputs: outputs.clone(),
            seats: seats.clone(),
            main_surface: None,
            shell_surface: None,
            decorator: None,
            seat_objects: HashMap::new(),
            repeat_sender,
            cursor_visible: cursor_visible.clone(),
        };

        // Roundtrip until the initial output information is complete. A
        // compositor that never sends an output is unusable.
        let mut tries = 0;
        while outputs.ready_count() == 0 {
            if tries > 5 {
                return Err(Error::NoOutputs);
            }
            queue.roundtrip(&mut state)?;
            tries += 1;
        }

        Ok(WindowingSystem {
            conn,
            qh,
            bootstrap: Some(Bootstrap { queue, state, repeat, commands }),
            pump: None,
            shared,
            outputs,
            seats,
            frame_times,
            main_surface: None,
            shell_surface: None,
            presentation: presentation_handle,
            idle_inhibit: idle_handle,
            commands: command_sender,
            cursor_visible,
        })
    }

    /// Creates the application window and starts the event pump.
    ///
    /// Blocks until the initial configure handshake completed (on the shell
    /// variant that has one), so the caller has a usable size once this
    /// returns.
    pub fn create_window(&mut self, name: &str, fullscreen: bool, res: &ResolutionInfo) -> Result<(), Error> {
        let bootstrap = self.bootstrap.as_mut().ok_or(Error::WindowExists)?;
        let state = &mut bootstrap.state;
        let qh = &self.qh;

        {
            let mut config = self.shared.config.lock().unwrap();
            config.requested_size = (res.width, res.height);
            config.fullscreen = fullscreen;
            config.current_output = res.output.clone();
            config.refresh_hz = res.refresh_hz;
        }

        let surface = state.compositor.create_surface_with_data(qh, SurfaceData::new());

        let mut shell: Box<dyn ShellSurface> = if let Some(xdg_shell) = &state.xdg_shell {
            Box::new(xdg_shell.create_shell_surface(surface.clone(), name, name, qh))
        } else if let Some(wl_shell) = &state.wl_shell {
            log::warn!(target: "winsys",
                "compositor does not support xdg_wm_base - falling back to wl_shell, not all features will work");
            Box::new(wl_shell.create_shell_surface(surface.clone(), name, name, qh))
        } else {
            return Err(Error::NoShell);
        };

        if fullscreen {
            let output = self.outputs.find_by_friendly_name(&res.output);
            if output.is_none() && !res.output.is_empty() {
                log::info!(target: "winsys",
                    "could not match output \"{}\" to a currently available output, falling back to compositor choice",
                    res.output);
            }
            shell.set_fullscreen(output.as_ref().map(|(wl_output, _)| wl_output), res.refresh_hz);
        }

        let expects_configure = shell.expects_initial_configure();
        let shell = Arc::new(Mutex::new(shell));

        state.main_surface = Some(surface.clone());
        state.shell_surface = Some(shell.clone());

        if let Some(subcompositor) = &state.subcompositor {
            state.decorator = Some(WindowDecorator::new(
                self.conn.clone(),
                state.compositor.wl_compositor().clone(),
                subcompositor.wl_subcompositor().clone(),
                state.shm.wl_shm().clone(),
                surface.clone(),
                qh.clone(),
            ));
        }

        shell.lock().unwrap().commit_initial();

        if expects_configure {
            // Synchronous bootstrap: the pump is not running yet, so the
            // initial handshake is driven right here.
            while !self.shared.configured.load(Ordering::SeqCst) {
                bootstrap.queue.blocking_dispatch(&mut bootstrap.state)?;
            }
        } else {
            // The legacy shell reports no initial size; the request stands.
            let (width, height) = (res.width, res.height);
            bootstrap.state.apply_configure(Configure {
                serial: 0,
                size: (width, height),
                state: SurfaceState::empty(),
            });
        }

        self.main_surface = Some(surface);
        self.shell_surface = Some(shell);

        // Hand the machinery to the pump; from here on everything is live.
        let Bootstrap { queue, state, repeat, commands } = self.bootstrap.take().unwrap();
        self.pump = Some(EventPump::spawn(
            self.conn.clone(),
            queue,
            state,
            repeat,
            WinSystemState::handle_repeat,
            commands,
            WinSystemState::handle_command,
        )?);

        Ok(())
    }

    /// Switches between fullscreen and windowed, or between outputs/modes.
    ///
    /// Returns `true` when the caller may adopt the resolution immediately
    /// and `false` when the authoritative size will arrive asynchronously
    /// with a later configure.
    pub fn set_fullscreen(&self, fullscreen: bool, res: &ResolutionInfo) -> bool {
        let shell = match &self.shell_surface {
            Some(shell) => shell,
            None => return false,
        };

        {
            let config = self.shared.config.lock().unwrap();
            if config.current_output == res.output
                && config.surface_size == (res.width, res.height)
                && (config.refresh_hz - res.refresh_hz).abs() < 1e-3
                && config.fullscreen == fullscreen
            {
                // Nothing to do
                return true;
            }
        }

        log::info!(target: "winsys",
            "trying to switch mode to {}x{} @{:.3} Hz on output \"{}\"",
            res.width, res.height, res.refresh_hz, res.output);

        let output = self.outputs.find_by_friendly_name(&res.output);
        match &output {
            Some((_, info)) => {
                log::debug!(target: "winsys", "resolved output \"{}\" to global {}", res.output, info.id)
            }
            None => log::info!(target: "winsys",
                "could not match output \"{}\" to a currently available output, falling back to default output",
                res.output),
        }

        let constrained = {
            let mut config = self.shared.config.lock().unwrap();
            config.requested_size = (res.width, res.height);
            config.fullscreen = fullscreen;
            // The compositor is free to ignore the refresh rate request, and
            // nothing guarantees the surface actually lands on this output;
            // track the intent so there is any information at all.
            config.refresh_hz = res.refresh_hz;
            config.current_output = res.output.clone();

            fullscreen
                || config.state.intersects(SurfaceState::MAXIMIZED | SurfaceState::FULLSCREEN)
        };

        {
            let mut shell = shell.lock().unwrap();
            if fullscreen {
                shell.set_fullscreen(output.as_ref().map(|(wl_output, _)| wl_output), res.refresh_hz);
            } else {
                shell.set_windowed();
            }
        }
        let _ = self.conn.flush();

        if constrained {
            // Compositor dictates the size; a configure will follow.
            false
        } else {
            // Plain windowed resize is a pure client preference.
            let _ = self
                .commands
                .send(WindowCommand::ApplySize { width: res.width, height: res.height });
            let _ = self.conn.flush();
            true
        }
    }

    /// Resizes the window while unconstrained.
    pub fn resize_window(&self, width: i32, height: i32) -> bool {
        let constrained = {
            let mut config = self.shared.config.lock().unwrap();
            config.requested_size = (width, height);
            config.state.intersects(SurfaceState::MAXIMIZED | SurfaceState::FULLSCREEN)
        };

        if constrained {
            // The authoritative size comes from the next configure
            return false;
        }

        let _ = self.commands.send(WindowCommand::ApplySize { width, height });
        let _ = self.conn.flush();
        true
    }

    /// The renderer finished resizing its buffers to the current size.
    ///
    /// Acknowledges the newest matching configure; superseded serials are
    /// discarded without an ack. Acking before the buffers match would let
    /// the compositor present a mismatched size.
    pub fn finish_resize(&self) {
        let serial = {
            let mut config = self.shared.config.lock().unwrap();
            let size = config.surface_size;
            take_newest_matching_ack(&mut config.pending_acks, size)
        };

        if let Some(serial) = serial {
            if let Some(shell) = &self.shell_surface {
                shell.lock().unwrap().ack_configure(serial);
                let _ = self.conn.flush();
            }
        }
    }

    /// Repopulates the resolution list from the currently known outputs.
    ///
    /// `preferred_output` is the user's configured output name, used only as
    /// a hint: an unknown name falls back to the output the surface is on,
    /// then to the first known output.
    pub fn update_resolutions(&self, preferred_output: &str) -> Vec<ResolutionInfo> {
        let infos = self.outputs.infos();
        if infos.is_empty() {
            // Should not happen after successful startup - just give up
            return Vec::new();
        }

        let current_output = self.shared.config.lock().unwrap().current_output.clone();

        let info = infos
            .iter()
            .find(|info| info.friendly_name() == preferred_output)
            .or_else(|| infos.iter().find(|info| info.friendly_name() == current_output))
            .unwrap_or(&infos[0]);

        let name = info.friendly_name();
        let current = info.current_mode().ok();

        log::info!(target: "winsys",
            "user wanted output \"{}\", using \"{}\" size {}x{} mm with {} mode(s)",
            preferred_output, name, info.physical_size.0, info.physical_size.1, info.modes().len());

        info.modes()
            .iter()
            .map(|mode| {
                let is_current = Some(*mode) == current;
                log::info!(target: "winsys",
                    "- {}x{} @{:.3} Hz pixel ratio {:.3}{}",
                    mode.size.0, mode.size.1, mode.refresh_hz(), info.pixel_ratio_for_mode(mode),
                    if is_current { " current" } else { "" });

                ResolutionInfo {
                    width: mode.size.0,
                    height: mode.size.1,
                    refresh_hz: mode.refresh_hz(),
                    pixel_ratio: info.pixel_ratio_for_mode(mode),
                    output: name.clone(),
                    current: is_current,
                }
            })
            .collect()
    }

    /// Friendly names of all usable outputs.
    pub fn connected_outputs(&self) -> Vec<String> {
        self.outputs.infos().iter().map(|info| info.friendly_name()).collect()
    }

    /// Current buffer size in pixels, for the render surface.
    pub fn buffer_size(&self) -> (i32, i32) {
        let config = self.shared.config.lock().unwrap();
        buffer_size_for(config.surface_size, config.scale)
    }

    /// Current logical surface size.
    pub fn surface_size(&self) -> (i32, i32) {
        self.shared.config.lock().unwrap().surface_size
    }

    pub fn scale(&self) -> i32 {
        self.shared.config.lock().unwrap().scale
    }

    /// Effective refresh rate for vsync pacing.
    pub fn refresh_hz(&self) -> f32 {
        self.shared.config.lock().unwrap().refresh_hz
    }

    /// Average DPI over the outputs showing the surface.
    pub fn dpi(&self) -> Option<f32> {
        self.shared.config.lock().unwrap().dpi
    }

    /// Whether any seat currently has a pointer.
    pub fn has_cursor(&self) -> bool {
        self.seats.any_pointer()
    }

    /// Shows or hides the OS cursor. Applied on the next pointer enter.
    pub fn show_os_cursor(&self, show: bool) {
        self.cursor_visible.store(show, Ordering::SeqCst);
    }

    /// The application event stream.
    pub fn events(&self) -> EventSink {
        self.shared.events.clone()
    }

    /// Notes a rendered-frame submission for presentation feedback.
    pub fn frame_submitted(&self) {
        if let Some(surface) = &self.main_surface {
            self.presentation.frame_submitted(surface, &self.qh);
            let _ = self.conn.flush();
        }
    }

    /// Moving-average presentation latency for AV sync correction.
    pub fn average_latency(&self) -> Option<Duration> {
        self.frame_times.average_latency()
    }

    /// Refresh rate of the compositor's actual presentation target.
    pub fn sync_output_refresh_hz(&self) -> Option<f32> {
        self.frame_times.sync_output_refresh_hz()
    }

    /// Keeps the display awake for the lifetime of the returned handle.
    pub fn inhibit_idle(&self) -> Result<IdleInhibitor, Error> {
        let surface = self.main_surface.as_ref().ok_or(Error::NoWindow)?;
        let inhibitor = self.idle_inhibit.create_inhibitor(surface, &self.qh)?;
        let _ = self.conn.flush();
        Ok(inhibitor)
    }
}

impl Drop for WindowingSystem {
    fn drop(&mut self) {
        // Stop dispatching before the window objects go away
        if let Some(mut pump) = self.pump.take() {
            pump.stop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buffer_size_follows_scale() {
        assert_eq!(buffer_size_for((1280, 720), 1), (1280, 720));
        assert_eq!(buffer_size_for((1280, 720), 2), (2560, 1440));
        assert_eq!(buffer_size_for((0, 0), 3), (0, 0));
    }

    #[test]
    fn zero_configure_retains_previous_size() {
        // Compositor has no preference while going fullscreen: keep what we had
        assert_eq!(resolve_surface_size((0, 0), false, (1280, 720), (640, 480)), (1280, 720));
    }

    #[test]
    fn zero_configure_falls_back_to_request_at_bootstrap() {
        assert_eq!(resolve_surface_size((0, 0), false, (0, 0), (640, 480)), (640, 480));
    }

    #[test]
    fn configured_size_includes_decorations_only_when_active() {
        let (dw, dh) = decoration_size();

        let undecorated = resolve_surface_size((1280, 720), false, (0, 0), (0, 0));
        assert_eq!(undecorated, (1280, 720));

        let decorated = resolve_surface_size((1280, 720), true, (0, 0), (0, 0));
        assert_eq!(decorated, (1280 - dw, 720 - dh));
        // configuredSize = surfaceSize + decorationSize
        assert_eq!((decorated.0 + dw, decorated.1 + dh), (1280, 720));
    }

    #[test]
    fn tiny_decorated_configure_clamps_to_positive_size() {
        let size = resolve_surface_size((4, 4), true, (0, 0), (0, 0));
        assert!(size.0 >= 1 && size.1 >= 1);
    }

    #[test]
    fn newest_configure_wins_for_acks() {
        let mut acks = vec![
            PendingAck { serial: 1, surface_size: (800, 600) },
            PendingAck { serial: 2, surface_size: (1024, 768) },
            PendingAck { serial: 3, surface_size: (1024, 768) },
        ];

        // The renderer settled on 1024x768: the newest matching serial is
        // acked, serials 1 and 2 are never acked.
        assert_eq!(take_newest_matching_ack(&mut acks, (1024, 768)), Some(3));
        assert!(acks.is_empty());
    }

    #[test]
    fn unmatched_resize_leaves_acks_pending() {
        let mut acks = vec![PendingAck { serial: 7, surface_size: (800, 600) }];
        assert_eq!(take_newest_matching_ack(&mut acks, (640, 480)), None);
        assert_eq!(acks.len(), 1);
    }
}
