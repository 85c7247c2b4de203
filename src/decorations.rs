//! Client-side window decorations.
//!
//! Four border surfaces are positioned as subsurfaces around the main
//! surface: top and bottom span the full width plus both side borders, left
//! and right only the main surface height.
//!
//! ```text
//! ---------------------------------------------
//! |                   TOP                     |
//! ---------------------------------------------
//! |   |                                   |   |
//! | L |                                   | R |
//! | E |                                   | I |
//! | F |           Main surface            | G |
//! | T |                                   | H |
//! |   |                                   | T |
//! ---------------------------------------------
//! |                 BOTTOM                    |
//! ---------------------------------------------
//! ```
//!
//! All four buffers come from one shared memory pool sized for exactly this
//! set at the current scale. Buffers the compositor may still read are kept
//! in a pending set keyed by buffer identity and only destroyed once their
//! release event arrives.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use wayland_backend::client::ObjectId;
use wayland_client::{
    protocol::{
        wl_buffer::{self, WlBuffer},
        wl_compositor::WlCompositor,
        wl_pointer::WlPointer,
        wl_region::WlRegion,
        wl_shm::{self, WlShm},
        wl_shm_pool::WlShmPool,
        wl_subcompositor::{self, WlSubcompositor},
        wl_subsurface::{self, WlSubsurface},
        wl_surface::WlSurface,
    },
    Connection, Dispatch, Proxy, QueueHandle,
};
use wayland_cursor::CursorTheme;

use crate::{
    compositor::SurfaceData,
    error::GlobalError,
    globals::GlobalData,
    registry::RegistryState,
    seat::pointer::{BTN_LEFT, BTN_RIGHT},
    shell::{ResizeEdge, SurfaceState},
    shm::RawPool,
};

/// Bytes per pixel in shm storage.
const BYTES_PER_PIXEL: usize = 4;
/// Width of the border around the whole window.
const BORDER_WIDTH: i32 = 5;
/// Height of the top bar.
const TOP_BAR_HEIGHT: i32 = 33;
/// Maximum distance from a window corner that still counts as corner resize.
const RESIZE_MAX_CORNER_DISTANCE: i32 = BORDER_WIDTH;
/// Distance of buttons from the edges of the top bar.
const BUTTONS_EDGE_DISTANCE: i32 = 6;
/// Distance from a button edge to the button content.
const BUTTON_INNER_SEPARATION: i32 = 4;
const BUTTON_SIZE: i32 = 21;

const BORDER_COLOR: u32 = 0xFF000000;
const BUTTON_COLOR_ACTIVE: u32 = 0xFFFFFFFF;
const BUTTON_COLOR_INACTIVE: u32 = 0xFF777777;

/// Cursor theme base size; multiplied by the buffer scale on load.
const CURSOR_BASE_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceIndex {
    Top = 0,
    Right = 1,
    Bottom = 2,
    Left = 3,
}

const ALL_SURFACES: [SurfaceIndex; 4] =
    [SurfaceIndex::Top, SurfaceIndex::Right, SurfaceIndex::Bottom, SurfaceIndex::Left];

/// What a click or touch on a decoration surface asks the window to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecorationAction {
    Move,
    Resize(ResizeEdge),
    Minimize,
    ToggleMaximize,
    Close,
    /// Show the window menu at the given main-surface-local position.
    ShowMenu { position: (i32, i32) },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Size {
    w: i32,
    h: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
}

impl Rect {
    fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }
}

/// Logical size of one border surface for a given main surface size.
fn surface_size(index: SurfaceIndex, main: Size) -> Size {
    match index {
        SurfaceIndex::Top => Size { w: main.w + 2 * BORDER_WIDTH, h: TOP_BAR_HEIGHT + BORDER_WIDTH },
        SurfaceIndex::Right | SurfaceIndex::Left => Size { w: BORDER_WIDTH, h: main.h },
        SurfaceIndex::Bottom => Size { w: main.w + 2 * BORDER_WIDTH, h: BORDER_WIDTH },
    }
}

/// Subsurface offset of one border surface relative to the main surface.
fn surface_position(index: SurfaceIndex, main: Size) -> (i32, i32) {
    match index {
        SurfaceIndex::Top => (-BORDER_WIDTH, -(BORDER_WIDTH + TOP_BAR_HEIGHT)),
        SurfaceIndex::Right => (main.w, 0),
        SurfaceIndex::Bottom => (-BORDER_WIDTH, main.h),
        SurfaceIndex::Left => (-BORDER_WIDTH, 0),
    }
}

/// Full decoration size added to the main surface size.
pub fn decoration_size() -> (i32, i32) {
    (2 * BORDER_WIDTH, 2 * BORDER_WIDTH + TOP_BAR_HEIGHT)
}

fn memory_bytes(main: Size, scale: i32) -> usize {
    ALL_SURFACES
        .iter()
        .map(|&index| {
            let size = surface_size(index, main);
            (size.w * scale) as usize * (size.h * scale) as usize * BYTES_PER_PIXEL
        })
        .sum()
}

/// Classifies a position on a border surface into the resize edge it grabs.
///
/// Corner regions take priority over edges within the corner distance; the
/// inside of the title bar resolves to `None` (move/button territory).
fn resize_edge_for_position(index: SurfaceIndex, surface: Size, x: i32, y: i32) -> ResizeEdge {
    match index {
        SurfaceIndex::Top => {
            if y <= RESIZE_MAX_CORNER_DISTANCE {
                if x <= RESIZE_MAX_CORNER_DISTANCE {
                    ResizeEdge::TopLeft
                } else if x >= surface.w - RESIZE_MAX_CORNER_DISTANCE {
                    ResizeEdge::TopRight
                } else {
                    ResizeEdge::Top
                }
            } else if x <= RESIZE_MAX_CORNER_DISTANCE {
                ResizeEdge::Left
            } else if x >= surface.w - RESIZE_MAX_CORNER_DISTANCE {
                ResizeEdge::Right
            } else {
                // Inside the title bar
                ResizeEdge::None
            }
        }
        SurfaceIndex::Right => {
            if y >= surface.h - RESIZE_MAX_CORNER_DISTANCE {
                ResizeEdge::BottomRight
            } else {
                ResizeEdge::Right
            }
        }
        SurfaceIndex::Bottom => {
            if x <= RESIZE_MAX_CORNER_DISTANCE {
                ResizeEdge::BottomLeft
            } else if x >= surface.w - RESIZE_MAX_CORNER_DISTANCE {
                ResizeEdge::BottomRight
            } else {
                ResizeEdge::Bottom
            }
        }
        SurfaceIndex::Left => {
            if y >= surface.h - RESIZE_MAX_CORNER_DISTANCE {
                ResizeEdge::BottomLeft
            } else {
                ResizeEdge::Left
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ButtonKind {
    Minimize,
    Maximize,
    Close,
}

#[derive(Debug)]
struct DecorationButton {
    kind: ButtonKind,
    rect: Rect,
}

/// Right-aligns the buttons in the top bar, clamped so they never overlap
/// the left edge when space runs out.
fn position_buttons(buttons: &mut [DecorationButton], top_surface: Size) {
    let mut x = top_surface.w - BORDER_WIDTH;
    for button in buttons.iter_mut().rev() {
        x -= BUTTONS_EDGE_DISTANCE + BUTTON_SIZE;
        x = x.max(0);
        button.rect = Rect { x, y: BORDER_WIDTH + BUTTONS_EDGE_DISTANCE, w: BUTTON_SIZE, h: BUTTON_SIZE };
    }
}

/// Buffers attached to a decoration surface at some point and possibly still
/// read by the compositor.
#[derive(Debug, Default)]
struct PendingBuffers {
    in_flight: HashSet<ObjectId>,
    /// Replaced buffers that were still in flight; destroyed on release.
    zombies: HashMap<ObjectId, WlBuffer>,
}

/// User data of a decoration buffer; routes the release event back to the
/// pending set.
#[derive(Debug)]
pub struct DecorationBufferData {
    pending: Arc<Mutex<PendingBuffers>>,
}

#[derive(Debug)]
struct DecorationBuffer {
    wl_buffer: WlBuffer,
    offset: usize,
    /// Device pixels.
    size_px: Size,
}

impl DecorationBuffer {
    /// Drops the buffer, deferring destruction while the compositor may
    /// still be scanning out from it.
    fn retire(self, pending: &Arc<Mutex<PendingBuffers>>) {
        let mut pending = pending.lock().unwrap();
        let id = self.wl_buffer.id();
        if pending.in_flight.contains(&id) {
            pending.zombies.insert(id, self.wl_buffer);
        } else {
            self.wl_buffer.destroy();
        }
    }
}

#[derive(Debug)]
struct BorderSurface {
    surface: WlSurface,
    subsurface: WlSubsurface,
    buffer: Option<DecorationBuffer>,
}

impl Drop for BorderSurface {
    fn drop(&mut self) {
        self.subsurface.destroy();
        self.surface.destroy();
    }
}

#[derive(Debug)]
struct SeatCursor {
    surface: WlSurface,
    name: Option<&'static str>,
}

impl Drop for SeatCursor {
    fn drop(&mut self) {
        self.surface.destroy();
    }
}

/// Synthesizes window borders, title bar and buttons when the compositor
/// does not draw decorations itself.
///
/// Constructed only when the subcompositor protocol is available; hidden
/// whenever the window state includes fullscreen.
pub struct WindowDecorator<State> {
    conn: Connection,
    qh: QueueHandle<State>,
    compositor: WlCompositor,
    subcompositor: WlSubcompositor,
    shm: WlShm,
    parent: WlSurface,

    surfaces: Option<[BorderSurface; 4]>,
    pool: Option<RawPool>,
    pool_allocated: usize,
    pending: Arc<Mutex<PendingBuffers>>,

    buttons: Vec<DecorationButton>,
    main_size: Size,
    scale: i32,
    state: SurfaceState,
    /// Cleared when the compositor draws decorations itself.
    enabled: bool,
    button_color: u32,

    cursor_theme: Option<CursorTheme>,
    /// Per-pointer cursor surfaces, keyed by wl_pointer identity.
    cursors: HashMap<ObjectId, SeatCursor>,
    /// Enter serials per pointer, needed for set_cursor.
    enter_serials: HashMap<ObjectId, u32>,
}

impl<State> std::fmt::Debug for WindowDecorator<State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowDecorator")
            .field("main_size", &self.main_size)
            .field("scale", &self.scale)
            .field("state", &self.state)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl<State> WindowDecorator<State>
where
    State: Dispatch<WlSurface, SurfaceData>
        + Dispatch<WlSubsurface, GlobalData>
        + Dispatch<WlBuffer, DecorationBufferData>
        + Dispatch<WlShmPool, GlobalData>
        + Dispatch<WlRegion, GlobalData>
        + 'static,
{
    pub fn new(
        conn: Connection,
        compositor: WlCompositor,
        subcompositor: WlSubcompositor,
        shm: WlShm,
        parent: WlSurface,
        qh: QueueHandle<State>,
    ) -> Self {
        WindowDecorator {
            conn,
            qh,
            compositor,
            subcompositor,
            shm,
            parent,
            surfaces: None,
            pool: None,
            pool_allocated: 0,
            pending: Arc::new(Mutex::new(PendingBuffers::default())),
            buttons: Vec::new(),
            main_size: Size::default(),
            scale: 1,
            state: SurfaceState::empty(),
            enabled: true,
            button_color: BUTTON_COLOR_ACTIVE,
            cursor_theme: None,
            cursors: HashMap::new(),
            enter_serials: HashMap::new(),
        }
    }

    /// Whether decorations are shown for a window state.
    pub fn state_has_decorations(state: SurfaceState) -> bool {
        !state.contains(SurfaceState::FULLSCREEN)
    }

    pub fn is_active(&self) -> bool {
        self.enabled && Self::state_has_decorations(self.state)
    }

    /// Enables or disables the decorator wholesale, e.g. when the compositor
    /// negotiated server-side decorations.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.reset();
        }
    }

    /// The single entry point: reconciles decoration state with the window.
    ///
    /// `main_size` is the undecorated main surface size in logical units. A
    /// call that changes nothing relevant is a no-op; size/scale/activation
    /// changes reallocate surfaces and buffers, a bare activation-highlight
    /// change only repaints.
    pub fn set_state(&mut self, main_size: (i32, i32), scale: i32, state: SurfaceState) {
        let main_size = Size { w: main_size.0, h: main_size.1 };
        if main_size == self.main_size && scale == self.scale && state == self.state {
            return;
        }

        let was_active = self.is_active();
        self.state = state;
        self.button_color = if state.contains(SurfaceState::ACTIVATED) {
            BUTTON_COLOR_ACTIVE
        } else {
            BUTTON_COLOR_INACTIVE
        };

        log::debug!(target: "winsys",
            "decorations: main surface {}x{} scale {} active {}",
            main_size.w, main_size.h, scale, self.is_active());

        if main_size != self.main_size || scale != self.scale || was_active != self.is_active() {
            if scale != self.scale {
                // Cursor images are scale dependent
                self.cursor_theme = None;
                self.reload_seat_cursors();
            }
            self.main_size = main_size;
            self.scale = scale;
            self.reset();
        } else if self.is_active() {
            self.repaint();
        }
    }

    /// Which decoration surface, if any, a protocol surface belongs to.
    pub fn surface_index(&self, surface: &WlSurface) -> Option<SurfaceIndex> {
        let surfaces = self.surfaces.as_ref()?;
        ALL_SURFACES.into_iter().find(|&index| surfaces[index as usize].surface == *surface)
    }

    pub fn pointer_enter(&mut self, pointer: &WlPointer, serial: u32, index: SurfaceIndex, position: (f64, f64)) {
        self.enter_serials.insert(pointer.id(), serial);
        self.update_cursor(pointer, index, position);
    }

    pub fn pointer_motion(&mut self, pointer: &WlPointer, index: SurfaceIndex, position: (f64, f64)) {
        self.update_cursor(pointer, index, position);
    }

    pub fn pointer_leave(&mut self, pointer: &WlPointer) {
        self.enter_serials.remove(&pointer.id());
        // Recreate the cursor surface on re-enter
        self.cursors.remove(&pointer.id());
    }

    /// Handles a pointer button press on a decoration surface.
    pub fn button_pressed(&mut self, index: SurfaceIndex, button: u32, position: (f64, f64)) -> Option<DecorationAction> {
        let (x, y) = (position.0 as i32, position.1 as i32);
        match button {
            BTN_LEFT => Some(self.classify_grab(index, x, y)),
            BTN_RIGHT if index == SurfaceIndex::Top => Some(DecorationAction::ShowMenu {
                position: (x - BORDER_WIDTH, y - (BORDER_WIDTH + TOP_BAR_HEIGHT)),
            }),
            _ => None,
        }
    }

    /// A touch down on a decoration surface acts like a left click.
    pub fn touch_down(&mut self, index: SurfaceIndex, position: (f64, f64)) -> Option<DecorationAction> {
        Some(self.classify_grab(index, position.0 as i32, position.1 as i32))
    }

    fn classify_grab(&self, index: SurfaceIndex, x: i32, y: i32) -> DecorationAction {
        let edge = resize_edge_for_position(index, surface_size(index, self.main_size), x, y);
        if edge != ResizeEdge::None {
            return DecorationAction::Resize(edge);
        }

        for button in &self.buttons {
            if button.rect.contains(x, y) {
                return match button.kind {
                    ButtonKind::Minimize => DecorationAction::Minimize,
                    ButtonKind::Maximize => DecorationAction::ToggleMaximize,
                    ButtonKind::Close => DecorationAction::Close,
                };
            }
        }

        DecorationAction::Move
    }

    fn reset(&mut self) {
        self.reset_buttons();
        self.reset_surfaces();
        self.reset_pool();
        if self.is_active() {
            self.reattach_subsurfaces();
            self.allocate_buffers();
            position_buttons(&mut self.buttons, surface_size(SurfaceIndex::Top, self.main_size));
            self.repaint();
        }
    }

    fn reset_buttons(&mut self) {
        if self.is_active() {
            if self.buttons.is_empty() {
                let rect = Rect { x: 0, y: 0, w: BUTTON_SIZE, h: BUTTON_SIZE };
                self.buttons = vec![
                    DecorationButton { kind: ButtonKind::Minimize, rect },
                    DecorationButton { kind: ButtonKind::Maximize, rect },
                    DecorationButton { kind: ButtonKind::Close, rect },
                ];
            }
        } else {
            self.buttons.clear();
        }
    }

    fn reset_surfaces(&mut self) {
        if self.is_active() {
            if self.surfaces.is_none() {
                self.surfaces = Some([
                    self.make_border_surface(),
                    self.make_border_surface(),
                    self.make_border_surface(),
                    self.make_border_surface(),
                ]);
            }
        } else if let Some(surfaces) = &self.surfaces {
            // Destroying the surfaces would take effect before the next main
            // surface commit and flicker; attach a null buffer instead.
            for border in surfaces {
                border.surface.attach(None, 0, 0);
                border.surface.commit();
            }
        }
    }

    fn make_border_surface(&self) -> BorderSurface {
        let surface = self.compositor.create_surface(&self.qh, SurfaceData::new());
        let subsurface = self.subcompositor.get_subsurface(&surface, &self.parent, &self.qh, GlobalData);
        subsurface.set_sync();
        BorderSurface { surface, subsurface, buffer: None }
    }

    fn reset_pool(&mut self) {
        if let Some(surfaces) = &mut self.surfaces {
            for border in surfaces.iter_mut() {
                if let Some(buffer) = border.buffer.take() {
                    buffer.retire(&self.pending);
                }
            }
        }

        self.pool = None;
        self.pool_allocated = 0;

        if self.is_active() {
            let bytes = memory_bytes(self.main_size, self.scale);
            match RawPool::new(bytes, &self.shm, &self.qh) {
                Ok(pool) => self.pool = Some(pool),
                Err(err) => {
                    log::error!(target: "winsys", "could not allocate decoration memory: {}", err);
                }
            }
        }
    }

    fn reattach_subsurfaces(&mut self) {
        if let Some(surfaces) = &self.surfaces {
            for index in ALL_SURFACES {
                let (x, y) = surface_position(index, self.main_size);
                surfaces[index as usize].subsurface.set_position(x, y);
            }
        }
    }

    fn allocate_buffers(&mut self) {
        let (surfaces, pool) = match (&mut self.surfaces, &mut self.pool) {
            (Some(surfaces), Some(pool)) => (surfaces, pool),
            _ => return,
        };

        for index in ALL_SURFACES {
            let border = &mut surfaces[index as usize];
            if border.buffer.is_some() {
                continue;
            }

            let logical = surface_size(index, self.main_size);
            let size_px = Size { w: logical.w * self.scale, h: logical.h * self.scale };
            let bytes = size_px.w as usize * size_px.h as usize * BYTES_PER_PIXEL;

            let offset = self.pool_allocated;
            debug_assert!(offset + bytes <= pool.len(), "shm pool sized too small for borders");

            let wl_buffer = pool.create_buffer(
                offset as i32,
                size_px.w,
                size_px.h,
                size_px.w * BYTES_PER_PIXEL as i32,
                wl_shm::Format::Argb8888,
                DecorationBufferData { pending: self.pending.clone() },
                &self.qh,
            );
            self.pool_allocated += bytes;

            border.buffer = Some(DecorationBuffer { wl_buffer, offset, size_px });

            // Borders are fully opaque; let the compositor skip blending
            let region = self.compositor.create_region(&self.qh, GlobalData);
            region.add(0, 0, logical.w, logical.h);
            border.surface.set_opaque_region(Some(&region));
            region.destroy();

            if border.surface.version() >= 3 {
                border.surface.set_buffer_scale(self.scale);
            }
        }
    }

    fn repaint(&mut self) {
        let (surfaces, pool) = match (&mut self.surfaces, &mut self.pool) {
            (Some(surfaces), Some(pool)) => (surfaces, pool),
            _ => return,
        };

        let scale = self.scale;
        let mmap = pool.mmap();

        for index in ALL_SURFACES {
            let border = &surfaces[index as usize];
            if let Some(buffer) = &border.buffer {
                let canvas = canvas_of(mmap, buffer);
                fill(canvas, BORDER_COLOR);
            }
        }

        let top_logical = surface_size(SurfaceIndex::Top, self.main_size);
        let accent = self.button_color;

        if let Some(buffer) = &surfaces[SurfaceIndex::Top as usize].buffer {
            let mut canvas = Canvas { data: canvas_of(mmap, buffer), width: buffer.size_px.w, scale };
            // Window outline along the top bar
            canvas.horizontal_line(accent, BORDER_WIDTH - 1, BORDER_WIDTH - 1, top_logical.w - 2 * BORDER_WIDTH + 2);
            canvas.vertical_line(accent, BORDER_WIDTH - 1, BORDER_WIDTH - 1, top_logical.h - BORDER_WIDTH + 1);
            canvas.vertical_line(accent, top_logical.w - BORDER_WIDTH, BORDER_WIDTH - 1, top_logical.h - BORDER_WIDTH + 1);
            // Separator between top bar and main surface
            canvas.horizontal_line(accent, BORDER_WIDTH - 1, top_logical.h - 1, top_logical.w - 2 * BORDER_WIDTH + 2);

            for button in &self.buttons {
                draw_button(&mut canvas, accent, button);
            }
        }

        if let Some(buffer) = &surfaces[SurfaceIndex::Left as usize].buffer {
            let logical = surface_size(SurfaceIndex::Left, self.main_size);
            let mut canvas = Canvas { data: canvas_of(mmap, buffer), width: buffer.size_px.w, scale };
            canvas.vertical_line(accent, BORDER_WIDTH - 1, 0, logical.h);
        }

        if let Some(buffer) = &surfaces[SurfaceIndex::Right as usize].buffer {
            let logical = surface_size(SurfaceIndex::Right, self.main_size);
            let mut canvas = Canvas { data: canvas_of(mmap, buffer), width: buffer.size_px.w, scale };
            canvas.vertical_line(accent, 0, 0, logical.h);
        }

        if let Some(buffer) = &surfaces[SurfaceIndex::Bottom as usize].buffer {
            let logical = surface_size(SurfaceIndex::Bottom, self.main_size);
            let mut canvas = Canvas { data: canvas_of(mmap, buffer), width: buffer.size_px.w, scale };
            canvas.horizontal_line(accent, BORDER_WIDTH - 1, 0, logical.w - 2 * BORDER_WIDTH + 2);
        }

        self.commit_all();
    }

    fn commit_all(&mut self) {
        let surfaces = match &self.surfaces {
            Some(surfaces) => surfaces,
            None => return,
        };

        let mut pending = self.pending.lock().unwrap();
        for index in ALL_SURFACES {
            let border = &surfaces[index as usize];
            if let Some(buffer) = &border.buffer {
                pending.in_flight.insert(buffer.wl_buffer.id());

                let logical = surface_size(index, self.main_size);
                border.surface.attach(Some(&buffer.wl_buffer), 0, 0);
                border.surface.damage(0, 0, logical.w, logical.h);
                border.surface.commit();
            }
        }
    }

    fn update_cursor(&mut self, pointer: &WlPointer, index: SurfaceIndex, position: (f64, f64)) {
        let edge = resize_edge_for_position(
            index,
            surface_size(index, self.main_size),
            position.0 as i32,
            position.1 as i32,
        );
        let name = edge.cursor_icon().name();

        let id = pointer.id();
        if self.cursors.get(&id).map(|cursor| cursor.name) == Some(Some(name)) {
            // Avoid reloading the cursor when nothing changes
            return;
        }

        if self.cursor_theme.is_none() {
            match CursorTheme::load(&self.conn, self.shm.clone(), CURSOR_BASE_SIZE * self.scale as u32) {
                Ok(theme) => self.cursor_theme = Some(theme),
                Err(err) => {
                    log::error!(target: "winsys", "could not load cursor theme: {}", err);
                    return;
                }
            }
        }

        let theme = self.cursor_theme.as_mut().unwrap();
        let cursor = match theme.get_cursor(name) {
            Some(cursor) => cursor,
            None => {
                log::error!(target: "winsys", "cursor theme has no cursor \"{}\"", name);
                return;
            }
        };
        // Just use the first image, no animation
        let image = &cursor[0];
        let (hx, hy) = image.hotspot();
        let (w, h) = image.dimensions();

        let entry = self.cursors.entry(id.clone()).or_insert_with(|| SeatCursor {
            surface: self.compositor.create_surface(&self.qh, SurfaceData::new()),
            name: None,
        });
        entry.name = Some(name);

        let serial = self.enter_serials.get(&id).copied().unwrap_or(0);
        let scale = self.scale;
        pointer.set_cursor(serial, Some(&entry.surface), hx as i32 / scale, hy as i32 / scale);
        entry.surface.attach(Some(image), 0, 0);
        entry.surface.damage(0, 0, w as i32 / scale, h as i32 / scale);
        if entry.surface.version() >= 3 {
            entry.surface.set_buffer_scale(scale);
        }
        entry.surface.commit();
    }

    fn reload_seat_cursors(&mut self) {
        // Names are cleared so the next motion reloads from the new theme.
        for cursor in self.cursors.values_mut() {
            cursor.name = None;
        }
    }
}

fn canvas_of<'a>(mmap: &'a mut [u8], buffer: &DecorationBuffer) -> &'a mut [u8] {
    let bytes = buffer.size_px.w as usize * buffer.size_px.h as usize * BYTES_PER_PIXEL;
    &mut mmap[buffer.offset..buffer.offset + bytes]
}

fn fill(canvas: &mut [u8], color: u32) {
    let bytes = color.to_le_bytes();
    for pixel in canvas.chunks_exact_mut(4) {
        pixel.copy_from_slice(&bytes);
    }
}

/// Drawing surface taking logical coordinates; primitives are `scale` device
/// pixels thick.
struct Canvas<'a> {
    data: &'a mut [u8],
    /// Device pixels per row.
    width: i32,
    scale: i32,
}

impl Canvas<'_> {
    fn put_px(&mut self, x: i32, y: i32, bytes: [u8; 4]) {
        if x < 0 || y < 0 || x >= self.width {
            return;
        }
        let idx = (y * self.width + x) as usize * BYTES_PER_PIXEL;
        if idx + BYTES_PER_PIXEL <= self.data.len() {
            self.data[idx..idx + BYTES_PER_PIXEL].copy_from_slice(&bytes);
        }
    }

    fn horizontal_line(&mut self, color: u32, x: i32, y: i32, length: i32) {
        let bytes = color.to_le_bytes();
        for py in y * self.scale..(y + 1) * self.scale {
            for px in x * self.scale..(x + length) * self.scale {
                self.put_px(px, py, bytes);
            }
        }
    }

    fn vertical_line(&mut self, color: u32, x: i32, y: i32, length: i32) {
        let bytes = color.to_le_bytes();
        for py in y * self.scale..(y + length) * self.scale {
            for px in x * self.scale..(x + 1) * self.scale {
                self.put_px(px, py, bytes);
            }
        }
    }

    fn rect_outline(&mut self, color: u32, rect: Rect) {
        self.horizontal_line(color, rect.x, rect.y, rect.w);
        self.horizontal_line(color, rect.x, rect.y + rect.h - 1, rect.w);
        self.vertical_line(color, rect.x, rect.y, rect.h);
        self.vertical_line(color, rect.x + rect.w - 1, rect.y, rect.h);
    }

    /// Diagonal from (x, y), going down-right when `down_right`, else
    /// down-left.
    fn diagonal(&mut self, color: u32, x: i32, y: i32, length: i32, down_right: bool) {
        let bytes = color.to_le_bytes();
        for step in 0..length * self.scale {
            let px = if down_right { x * self.scale + step } else { x * self.scale - step };
            let py = y * self.scale + step;
            for t in 0..self.scale {
                self.put_px(px + t, py, bytes);
            }
        }
    }
}

fn draw_button(canvas: &mut Canvas<'_>, color: u32, button: &DecorationButton) {
    let rect = button.rect;
    canvas.rect_outline(color, rect);

    let sep = BUTTON_INNER_SEPARATION;
    match button.kind {
        ButtonKind::Minimize => {
            canvas.horizontal_line(color, rect.x + sep, rect.y + rect.h - sep - 1, rect.w - 2 * sep);
        }
        ButtonKind::Maximize => {
            canvas.rect_outline(
                color,
                Rect { x: rect.x + sep, y: rect.y + sep, w: rect.w - 2 * sep, h: rect.h - 2 * sep },
            );
            canvas.horizontal_line(color, rect.x + sep, rect.y + sep + 1, rect.w - 2 * sep);
        }
        ButtonKind::Close => {
            let diagonal = rect.w - 2 * sep;
            canvas.diagonal(color, rect.x + sep, rect.y + sep, diagonal, true);
            canvas.diagonal(color, rect.x + rect.w - sep - 1, rect.y + sep, diagonal, false);
        }
    }
}

/// Delegate target for the subcompositor objects and decoration buffers.
#[derive(Debug)]
pub struct SubcompositorState {
    subcompositor: WlSubcompositor,
}

impl SubcompositorState {
    pub fn bind<State>(registry: &RegistryState, qh: &QueueHandle<State>) -> Result<Self, GlobalError>
    where
        State: Dispatch<WlSubcompositor, GlobalData, State> + 'static,
    {
        let subcompositor = registry.bind_optional(qh, 1..=1, GlobalData)?;
        Ok(SubcompositorState { subcompositor })
    }

    pub fn wl_subcompositor(&self) -> &WlSubcompositor {
        &self.subcompositor
    }
}

impl<D> Dispatch<WlSubcompositor, GlobalData, D> for SubcompositorState
where
    D: Dispatch<WlSubcompositor, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &WlSubcompositor,
        _: wl_subcompositor::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("wl_subcompositor has no events")
    }
}

impl<D> Dispatch<WlSubsurface, GlobalData, D> for SubcompositorState
where
    D: Dispatch<WlSubsurface, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &WlSubsurface,
        _: wl_subsurface::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("wl_subsurface has no events")
    }
}

impl<D> Dispatch<WlBuffer, DecorationBufferData, D> for SubcompositorState
where
    D: Dispatch<WlBuffer, DecorationBufferData>,
{
    fn event(
        _: &mut D,
        buffer: &WlBuffer,
        event: wl_buffer::Event,
        data: &DecorationBufferData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        match event {
            wl_buffer::Event::Release => {
                let mut pending = data.pending.lock().unwrap();
                pending.in_flight.remove(&buffer.id());
                if let Some(zombie) = pending.zombies.remove(&buffer.id()) {
                    zombie.destroy();
                }
            }
            _ => unreachable!(),
        }
    }
}

#[macro_export]
macro_rules! delegate_decorations {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_subcompositor::WlSubcompositor: $crate::globals::GlobalData
            ] => $crate::decorations::SubcompositorState
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_subsurface::WlSubsurface: $crate::globals::GlobalData
            ] => $crate::decorations::SubcompositorState
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_buffer::WlBuffer: $crate::decorations::DecorationBufferData
            ] => $crate::decorations::SubcompositorState
        );
    };
}

#[cfg(test)]
mod test {
    use super::*;

    const MAIN: Size = Size { w: 640, h: 480 };

    #[test]
    fn border_surface_sizes() {
        assert_eq!(surface_size(SurfaceIndex::Top, MAIN), Size { w: 650, h: 38 });
        assert_eq!(surface_size(SurfaceIndex::Bottom, MAIN), Size { w: 650, h: 5 });
        assert_eq!(surface_size(SurfaceIndex::Left, MAIN), Size { w: 5, h: 480 });
        assert_eq!(surface_size(SurfaceIndex::Right, MAIN), Size { w: 5, h: 480 });
    }

    #[test]
    fn decoration_size_covers_borders_and_top_bar() {
        assert_eq!(decoration_size(), (10, 43));
    }

    #[test]
    fn pool_is_sized_for_exactly_four_buffers() {
        for scale in [1, 2, 3] {
            let total: usize = ALL_SURFACES
                .iter()
                .map(|&index| {
                    let size = surface_size(index, MAIN);
                    (size.w * scale * size.h * scale) as usize * BYTES_PER_PIXEL
                })
                .sum();
            assert_eq!(memory_bytes(MAIN, scale), total);
        }
    }

    #[test]
    fn corners_win_over_edges() {
        let top = surface_size(SurfaceIndex::Top, MAIN);

        assert_eq!(resize_edge_for_position(SurfaceIndex::Top, top, 0, 0), ResizeEdge::TopLeft);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Top, top, top.w, 2), ResizeEdge::TopRight);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Top, top, 100, 2), ResizeEdge::Top);

        // Below the corner distance the sides resize horizontally
        assert_eq!(resize_edge_for_position(SurfaceIndex::Top, top, 2, 20), ResizeEdge::Left);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Top, top, top.w - 2, 20), ResizeEdge::Right);

        // Middle of the title bar is for moving, not resizing
        assert_eq!(resize_edge_for_position(SurfaceIndex::Top, top, 300, 20), ResizeEdge::None);
    }

    #[test]
    fn side_and_bottom_edges_classify() {
        let left = surface_size(SurfaceIndex::Left, MAIN);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Left, left, 2, 10), ResizeEdge::Left);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Left, left, 2, left.h), ResizeEdge::BottomLeft);

        let right = surface_size(SurfaceIndex::Right, MAIN);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Right, right, 2, 10), ResizeEdge::Right);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Right, right, 2, right.h), ResizeEdge::BottomRight);

        let bottom = surface_size(SurfaceIndex::Bottom, MAIN);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Bottom, bottom, 0, 2), ResizeEdge::BottomLeft);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Bottom, bottom, bottom.w, 2), ResizeEdge::BottomRight);
        assert_eq!(resize_edge_for_position(SurfaceIndex::Bottom, bottom, 300, 2), ResizeEdge::Bottom);
    }

    #[test]
    fn buttons_right_align_and_clamp() {
        let mut buttons = vec![
            DecorationButton { kind: ButtonKind::Minimize, rect: Rect { x: 0, y: 0, w: 0, h: 0 } },
            DecorationButton { kind: ButtonKind::Maximize, rect: Rect { x: 0, y: 0, w: 0, h: 0 } },
            DecorationButton { kind: ButtonKind::Close, rect: Rect { x: 0, y: 0, w: 0, h: 0 } },
        ];

        let top = surface_size(SurfaceIndex::Top, MAIN);
        position_buttons(&mut buttons, top);

        // Close is rightmost
        let close = &buttons[2].rect;
        assert_eq!(close.x, top.w - BORDER_WIDTH - BUTTONS_EDGE_DISTANCE - BUTTON_SIZE);
        assert_eq!(close.y, BORDER_WIDTH + BUTTONS_EDGE_DISTANCE);

        // Buttons do not overlap and descend leftwards
        assert!(buttons[1].rect.x + BUTTON_SIZE <= buttons[2].rect.x);
        assert!(buttons[0].rect.x + BUTTON_SIZE <= buttons[1].rect.x);

        // A tiny window clamps instead of going negative
        let tiny = surface_size(SurfaceIndex::Top, Size { w: 30, h: 30 });
        position_buttons(&mut buttons, tiny);
        assert!(buttons.iter().all(|button| button.rect.x >= 0));
    }

    #[test]
    fn buttons_fit_in_top_bar() {
        assert!(BUTTON_SIZE <= TOP_BAR_HEIGHT - BUTTONS_EDGE_DISTANCE * 2);
    }

    #[test]
    fn canvas_draws_scaled_lines_in_bounds() {
        let logical = Size { w: 8, h: 4 };
        let scale = 2;
        let mut data = vec![0u8; (logical.w * scale * logical.h * scale) as usize * BYTES_PER_PIXEL];
        let width = logical.w * scale;

        {
            let mut canvas = Canvas { data: &mut data, width, scale };
            canvas.horizontal_line(0xFFFFFFFF, 1, 1, 3);
        }

        let px = |x: i32, y: i32| {
            let idx = (y * width + x) as usize * BYTES_PER_PIXEL;
            u32::from_le_bytes(data[idx..idx + 4].try_into().unwrap())
        };

        // A logical pixel covers a scale x scale block
        assert_eq!(px(2, 2), 0xFFFFFFFF);
        assert_eq!(px(3, 3), 0xFFFFFFFF);
        assert_eq!(px(7, 2), 0xFFFFFFFF);
        assert_eq!(px(8, 2), 0);
        assert_eq!(px(2, 4), 0);
    }
}
