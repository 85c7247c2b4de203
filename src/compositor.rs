use std::sync::{
    atomic::{AtomicI32, Ordering},
    Mutex,
};

use wayland_client::{
    protocol::{
        wl_compositor, wl_output, wl_region,
        wl_surface::{self, WlSurface},
    },
    Connection, Dispatch, Proxy, QueueHandle,
};

use crate::{
    error::GlobalError,
    globals::GlobalData,
    output::OutputData,
    registry::RegistryState,
};

pub trait SurfaceHandler: Sized {
    /// The set of outputs showing the surface changed and with it the highest
    /// scale factor among them.
    fn scale_factor_changed(
        &mut self,
        conn: &Connection,
        qh: &QueueHandle<Self>,
        surface: &WlSurface,
        new_factor: i32,
    );

    /// The surface entered or left an output.
    ///
    /// Fired after the per-surface output set has been updated, so handlers
    /// can recompute anything derived from it (refresh rate, DPI).
    fn surface_outputs_changed(&mut self, conn: &Connection, qh: &QueueHandle<Self>, surface: &WlSurface);
}

#[derive(Debug)]
pub struct CompositorState {
    wl_compositor: wl_compositor::WlCompositor,
}

impl CompositorState {
    /// Maximum version of `wl_compositor` this state is prepared for.
    pub const API_VERSION_MAX: u32 = 6;

    pub fn bind<State>(
        registry: &RegistryState,
        qh: &QueueHandle<State>,
    ) -> Result<CompositorState, GlobalError>
    where
        State: Dispatch<wl_compositor::WlCompositor, GlobalData, State> + 'static,
    {
        let wl_compositor = registry.bind_one(qh, 1..=Self::API_VERSION_MAX, GlobalData)?;
        Ok(CompositorState { wl_compositor })
    }

    pub fn wl_compositor(&self) -> &wl_compositor::WlCompositor {
        &self.wl_compositor
    }

    pub fn create_surface_with_data<D, U>(&self, qh: &QueueHandle<D>, data: U) -> WlSurface
    where
        D: Dispatch<WlSurface, U> + 'static,
        U: Send + Sync + 'static,
    {
        self.wl_compositor.create_surface(qh, data)
    }

    pub fn create_region<D>(&self, qh: &QueueHandle<D>) -> Region
    where
        D: Dispatch<wl_region::WlRegion, GlobalData> + 'static,
    {
        Region(self.wl_compositor.create_region(qh, GlobalData))
    }
}

/// Data associated with a [`WlSurface`].
#[derive(Debug)]
pub struct SurfaceData {
    /// The scale factor of the entered output with the highest scale factor.
    scale_factor: AtomicI32,

    /// The outputs the surface is currently inside.
    outputs: Mutex<Vec<wl_output::WlOutput>>,
}

impl SurfaceData {
    pub fn new() -> Self {
        Self { scale_factor: AtomicI32::new(1), outputs: Mutex::new(Vec::new()) }
    }

    pub fn scale_factor(&self) -> i32 {
        self.scale_factor.load(Ordering::Relaxed)
    }

    /// The outputs the surface is currently inside.
    pub fn outputs(&self) -> Vec<wl_output::WlOutput> {
        self.outputs.lock().unwrap().clone()
    }

    /// Recomputes the effective scale from the entered outputs.
    ///
    /// Returns the new maximum when it differs from the stored one. An empty
    /// output set keeps the previous scale rather than resetting it.
    pub(crate) fn recompute_scale(&self) -> Option<i32> {
        let current = self.scale_factor.load(Ordering::Relaxed);
        let factor = self
            .outputs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|output| output.data::<OutputData>().map(OutputData::scale_factor))
            .reduce(i32::max)?;

        if factor == current {
            return None;
        }

        self.scale_factor.store(factor, Ordering::Relaxed);
        Some(factor)
    }
}

impl Default for SurfaceData {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Dispatch<WlSurface, SurfaceData, D> for CompositorState
where
    D: Dispatch<WlSurface, SurfaceData> + SurfaceHandler + 'static,
{
    fn event(
        state: &mut D,
        surface: &WlSurface,
        event: wl_surface::Event,
        data: &SurfaceData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            wl_surface::Event::Enter { output } => {
                data.outputs.lock().unwrap().push(output);
            }

            wl_surface::Event::Leave { output } => {
                data.outputs.lock().unwrap().retain(|o| o != &output);
            }

            // Sent by newer compositors than we bind; scale is derived from
            // the entered outputs instead.
            _ => return,
        }

        if let Some(factor) = data.recompute_scale() {
            state.scale_factor_changed(conn, qh, surface, factor);
        }

        state.surface_outputs_changed(conn, qh, surface);
    }
}

impl<D> Dispatch<wl_compositor::WlCompositor, GlobalData, D> for CompositorState
where
    D: Dispatch<wl_compositor::WlCompositor, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &wl_compositor::WlCompositor,
        _: wl_compositor::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("wl_compositor has no events")
    }
}

impl<D> Dispatch<wl_region::WlRegion, GlobalData, D> for CompositorState
where
    D: Dispatch<wl_region::WlRegion, GlobalData>,
{
    fn event(
        _: &mut D,
        _: &wl_region::WlRegion,
        _: wl_region::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        unreachable!("wl_region has no events")
    }
}

/// A wrapper around a [`wl_region::WlRegion`] destroying it on drop.
#[derive(Debug)]
pub struct Region(wl_region::WlRegion);

impl Region {
    pub fn add(&self, x: i32, y: i32, width: i32, height: i32) {
        self.0.add(x, y, width, height)
    }

    pub fn wl_region(&self) -> &wl_region::WlRegion {
        &self.0
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.0.destroy()
    }
}

#[macro_export]
macro_rules! delegate_compositor {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_compositor::WlCompositor: $crate::globals::GlobalData
            ] => $crate::compositor::CompositorState
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_surface::WlSurface: $crate::compositor::SurfaceData
            ] => $crate::compositor::CompositorState
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_region::WlRegion: $crate::globals::GlobalData
            ] => $crate::compositor::CompositorState
        );
    };
}
