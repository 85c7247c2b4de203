//! Tracking of `wl_output` globals.
//!
//! Output properties arrive in any order and may be resent on later `done`
//! cycles when a monitor is reconfigured. An output only becomes usable after
//! its first `done`; the mode set is strictly additive so the current and
//! preferred marks can never dangle.

use std::sync::{Arc, Mutex};

use wayland_client::{
    protocol::wl_output::{self, WlOutput},
    Connection, Dispatch, Proxy, QueueHandle, WEnum,
};

use crate::registry::{ProvidesRegistryState, RegistryHandler};

/// Version range of `wl_output` this crate binds.
///
/// Version 2 adds the `done` event which the accumulation model depends on;
/// version 4 adds the `name`/`description` events.
const WL_OUTPUT_VERSIONS: std::ops::RangeInclusive<u32> = 2..=4;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// A mode query was made before the output sent its first `done`.
    #[error("output information is not complete yet")]
    NotReady,
}

pub trait OutputHandler: Sized {
    fn output_state(&mut self) -> &mut OutputState;

    /// A new output finished its first `done` cycle and is now usable.
    fn new_output(&mut self, conn: &Connection, qh: &QueueHandle<Self>, output: WlOutput);

    /// An already known output finished another `done` cycle.
    fn update_output(&mut self, conn: &Connection, qh: &QueueHandle<Self>, output: WlOutput);

    /// An output global was removed; all references to it must be dropped.
    fn output_destroyed(&mut self, conn: &Connection, qh: &QueueHandle<Self>, output: WlOutput);
}

/// A display mode advertised by an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    /// Size in physical pixels.
    pub size: (i32, i32),
    /// Refresh rate in millihertz.
    pub refresh_mhz: i32,
}

impl Mode {
    pub fn refresh_hz(&self) -> f32 {
        self.refresh_mhz as f32 / 1000.0
    }
}

/// Accumulated information about one output.
#[derive(Debug, Clone)]
pub struct OutputInfo {
    /// Numeric name of the `wl_output` global.
    pub id: u32,
    /// Position in compositor space.
    pub location: (i32, i32),
    /// Physical size in millimeters. May be (0, 0) for virtual outputs.
    pub physical_size: (i32, i32),
    pub make: String,
    pub model: String,
    /// Connector name, if the compositor supports version 4.
    pub name: Option<String>,
    pub description: Option<String>,
    pub scale_factor: i32,
    modes: Vec<Mode>,
    current: Option<usize>,
    preferred: Option<usize>,
    done: bool,
}

impl OutputInfo {
    pub(crate) fn new(id: u32) -> Self {
        OutputInfo {
            id,
            location: (0, 0),
            physical_size: (0, 0),
            make: String::new(),
            model: String::new(),
            name: None,
            description: None,
            // Default of 1 if the compositor never sends wl_output::scale
            scale_factor: 1,
            modes: Vec::new(),
            current: None,
            preferred: None,
            done: false,
        }
    }

    /// Whether the first `done` cycle completed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn current_mode(&self) -> Result<Mode, OutputError> {
        if !self.done {
            return Err(OutputError::NotReady);
        }
        self.current.map(|idx| self.modes[idx]).ok_or(OutputError::NotReady)
    }

    pub fn preferred_mode(&self) -> Result<Mode, OutputError> {
        if !self.done {
            return Err(OutputError::NotReady);
        }
        self.preferred.map(|idx| self.modes[idx]).ok_or(OutputError::NotReady)
    }

    /// Pixel aspect ratio a mode would have on this output.
    ///
    /// Returns 1.0 when either physical dimension or either mode dimension is
    /// zero, which guards against divide-by-zero from missing geometry.
    pub fn pixel_ratio_for_mode(&self, mode: &Mode) -> f32 {
        let (phys_w, phys_h) = self.physical_size;
        let (mode_w, mode_h) = mode.size;
        if phys_w == 0 || phys_h == 0 || mode_w == 0 || mode_h == 0 {
            1.0
        } else {
            (phys_w as f32 / mode_w as f32) / (phys_h as f32 / mode_h as f32)
        }
    }

    /// Average DPI over both axes, if the physical size is known.
    pub fn dpi(&self) -> Option<f32> {
        let mode = self.current_mode().ok()?;
        let (phys_w, phys_h) = self.physical_size;
        if phys_w <= 0 || phys_h <= 0 {
            return None;
        }
        let dpi_x = mode.size.0 as f32 / (phys_w as f32 / 25.4);
        let dpi_y = mode.size.1 as f32 / (phys_h as f32 / 25.4);
        Some((dpi_x + dpi_y) / 2.0)
    }

    /// Human readable identifier for settings and logs.
    ///
    /// Prefers the connector name of newer compositors and otherwise falls
    /// back to `make model [@x,y]`, with a position suffix only when the
    /// output is not at the origin.
    pub fn friendly_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        let mut parts: Vec<String> = Vec::new();
        if !self.make.is_empty() {
            parts.push(self.make.clone());
        }
        if !self.model.is_empty() {
            parts.push(self.model.clone());
        }
        if parts.is_empty() {
            parts.push("unknown".into());
        }

        let (x, y) = self.location;
        if x != 0 || y != 0 {
            parts.push(format!("@{}x{}", x, y));
        }

        parts.join(" ")
    }

    /// Records a mode event. The mode set only ever grows; `current` and
    /// `preferred` are indices into it and follow the last event that carried
    /// the corresponding flag.
    pub(crate) fn record_mode(&mut self, mode: Mode, current: bool, preferred: bool) {
        let idx = match self.modes.iter().position(|known| *known == mode) {
            Some(idx) => idx,
            None => {
                self.modes.push(mode);
                self.modes.len() - 1
            }
        };

        if current {
            self.current = Some(idx);
        }
        if preferred {
            self.preferred = Some(idx);
        }
    }

    pub(crate) fn mark_done(&mut self) -> bool {
        let first = !self.done;
        self.done = true;
        first
    }
}

/// User data attached to every bound `wl_output`.
#[derive(Debug, Clone)]
pub struct OutputData(Arc<Mutex<OutputInfo>>);

impl OutputData {
    pub fn new(id: u32) -> Self {
        OutputData(Arc::new(Mutex::new(OutputInfo::new(id))))
    }

    pub fn scale_factor(&self) -> i32 {
        self.0.lock().unwrap().scale_factor
    }

    pub fn with_info<T>(&self, f: impl FnOnce(&OutputInfo) -> T) -> T {
        f(&self.0.lock().unwrap())
    }

    fn with_info_mut<T>(&self, f: impl FnOnce(&mut OutputInfo) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }
}

/// Shared, lock-guarded list of known outputs.
///
/// Cloned into the windowing facade so application threads can enumerate
/// outputs while the pump thread mutates the list on global add/remove.
#[derive(Debug, Clone, Default)]
pub struct Outputs(Arc<Mutex<Vec<(u32, WlOutput)>>>);

impl Outputs {
    /// Iterates over the outputs that completed their first `done`.
    pub fn for_each_ready<T>(&self, mut f: impl FnMut(&WlOutput, &OutputInfo) -> Option<T>) -> Option<T> {
        let guard = self.0.lock().unwrap();
        for (_, wl_output) in guard.iter() {
            if let Some(data) = wl_output.data::<OutputData>() {
                let result = data.with_info(|info| if info.is_done() { f(wl_output, info) } else { None });
                if result.is_some() {
                    return result;
                }
            }
        }
        None
    }

    /// Snapshot of the information of every usable output.
    pub fn infos(&self) -> Vec<OutputInfo> {
        let guard = self.0.lock().unwrap();
        guard
            .iter()
            .filter_map(|(_, wl_output)| wl_output.data::<OutputData>())
            .filter_map(|data| data.with_info(|info| info.is_done().then(|| info.clone())))
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.infos().len()
    }

    /// Resolves a user-facing output name to the bound global.
    pub fn find_by_friendly_name(&self, name: &str) -> Option<(WlOutput, OutputInfo)> {
        let guard = self.0.lock().unwrap();
        guard.iter().find_map(|(_, wl_output)| {
            let data = wl_output.data::<OutputData>()?;
            data.with_info(|info| {
                (info.is_done() && info.friendly_name() == name)
                    .then(|| (wl_output.clone(), info.clone()))
            })
        })
    }

    pub fn first(&self) -> Option<(WlOutput, OutputInfo)> {
        self.for_each_ready(|wl_output, info| Some((wl_output.clone(), info.clone())))
    }

    fn push(&self, name: u32, output: WlOutput) {
        self.0.lock().unwrap().push((name, output));
    }

    fn remove(&self, name: u32) -> Option<WlOutput> {
        let mut guard = self.0.lock().unwrap();
        let idx = guard.iter().position(|(global, _)| *global == name)?;
        Some(guard.remove(idx).1)
    }
}

#[derive(Debug)]
pub struct OutputState {
    outputs: Outputs,
}

impl OutputState {
    /// Binds every output advertised in the initial enumeration.
    ///
    /// Run after the singleton globals are resolved so that output handlers
    /// can rely on them being available.
    pub fn bind_all<D>(registry: &crate::registry::RegistryState, qh: &QueueHandle<D>) -> Result<Self, crate::error::GlobalError>
    where
        D: Dispatch<WlOutput, OutputData> + 'static,
    {
        let outputs = Outputs::default();
        for (name, wl_output) in registry.bind_all(qh, WL_OUTPUT_VERSIONS, OutputData::new)? {
            outputs.push(name, wl_output);
        }
        Ok(OutputState { outputs })
    }

    /// Shared handle for enumerating outputs from other threads.
    pub fn outputs(&self) -> Outputs {
        self.outputs.clone()
    }
}

impl<D> Dispatch<WlOutput, OutputData, D> for OutputState
where
    D: Dispatch<WlOutput, OutputData> + OutputHandler,
{
    fn event(
        state: &mut D,
        output: &WlOutput,
        event: wl_output::Event,
        data: &OutputData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            wl_output::Event::Geometry { x, y, physical_width, physical_height, make, model, .. } => {
                data.with_info_mut(|info| {
                    info.location = (x, y);
                    info.physical_size = (physical_width, physical_height);
                    info.make = make;
                    info.model = model;
                });
            }

            wl_output::Event::Mode { flags, width, height, refresh } => {
                let flags = match flags {
                    WEnum::Value(flags) => flags,
                    WEnum::Unknown(bits) => {
                        log::warn!(target: "winsys", "{} sent unknown mode flags {:x}", output.id(), bits);
                        wl_output::Mode::from_bits_truncate(bits)
                    }
                };

                data.with_info_mut(|info| {
                    info.record_mode(
                        Mode { size: (width, height), refresh_mhz: refresh },
                        flags.contains(wl_output::Mode::Current),
                        flags.contains(wl_output::Mode::Preferred),
                    )
                });
            }

            wl_output::Event::Scale { factor } => {
                data.with_info_mut(|info| info.scale_factor = factor);
            }

            wl_output::Event::Name { name } => {
                data.with_info_mut(|info| info.name = Some(name));
            }

            wl_output::Event::Description { description } => {
                data.with_info_mut(|info| info.description = Some(description));
            }

            wl_output::Event::Done => {
                let first = data.with_info_mut(|info| info.mark_done());
                if first {
                    state.new_output(conn, qh, output.clone());
                } else {
                    state.update_output(conn, qh, output.clone());
                }
            }

            _ => unreachable!(),
        }
    }
}

impl<D> RegistryHandler<D> for OutputState
where
    D: Dispatch<WlOutput, OutputData> + OutputHandler + ProvidesRegistryState + 'static,
{
    fn new_global(state: &mut D, _conn: &Connection, qh: &QueueHandle<D>, name: u32, interface: &str, _version: u32) {
        if interface != WlOutput::interface().name {
            return;
        }

        match state.registry().bind_specific(qh, name, WL_OUTPUT_VERSIONS, OutputData::new(name)) {
            Ok(output) => state.output_state().outputs.push(name, output),
            Err(err) => log::warn!(target: "winsys", "could not bind new output global {}: {}", name, err),
        }
    }

    fn remove_global(state: &mut D, conn: &Connection, qh: &QueueHandle<D>, name: u32) {
        if let Some(output) = state.output_state().outputs.remove(name) {
            state.output_destroyed(conn, qh, output.clone());
            if output.version() >= 3 {
                output.release();
            }
        }
    }
}

#[macro_export]
macro_rules! delegate_output {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_output::WlOutput: $crate::output::OutputData
            ] => $crate::output::OutputState
        );
    };
}

#[cfg(test)]
mod test {
    use super::*;

    fn mode(w: i32, h: i32, mhz: i32) -> Mode {
        Mode { size: (w, h), refresh_mhz: mhz }
    }

    #[test]
    fn pixel_ratio_guards_zero_dimensions() {
        let mut info = OutputInfo::new(1);
        assert_eq!(info.pixel_ratio_for_mode(&mode(1920, 1080, 60000)), 1.0);

        info.physical_size = (160, 90);
        assert_eq!(info.pixel_ratio_for_mode(&mode(0, 1080, 60000)), 1.0);
        assert_eq!(info.pixel_ratio_for_mode(&mode(1920, 0, 60000)), 1.0);

        info.physical_size = (0, 90);
        assert_eq!(info.pixel_ratio_for_mode(&mode(1920, 1080, 60000)), 1.0);
    }

    #[test]
    fn pixel_ratio_square_and_anamorphic() {
        let mut info = OutputInfo::new(1);
        info.physical_size = (160, 90);
        // Same aspect as the mode, square pixels
        assert!((info.pixel_ratio_for_mode(&mode(1920, 1080, 60000)) - 1.0).abs() < 1e-6);
        // Half the horizontal resolution doubles the pixel width
        assert!((info.pixel_ratio_for_mode(&mode(960, 1080, 60000)) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn mode_set_is_additive_across_done_cycles() {
        let mut info = OutputInfo::new(1);
        info.record_mode(mode(1920, 1080, 60000), true, true);
        info.record_mode(mode(1280, 720, 60000), false, false);
        info.mark_done();

        // A later done cycle resends a known mode with new flags
        info.record_mode(mode(1280, 720, 60000), true, false);
        info.mark_done();

        assert_eq!(info.modes().len(), 2);
        assert_eq!(info.current_mode().unwrap(), mode(1280, 720, 60000));
        assert_eq!(info.preferred_mode().unwrap(), mode(1920, 1080, 60000));
    }

    #[test]
    fn mode_queries_fail_before_done() {
        let mut info = OutputInfo::new(1);
        info.record_mode(mode(1920, 1080, 60000), true, true);
        assert!(info.current_mode().is_err());
        assert!(info.preferred_mode().is_err());

        info.mark_done();
        assert!(info.current_mode().is_ok());
        assert!(info.preferred_mode().is_ok());
    }

    #[test]
    fn friendly_name_formats() {
        let mut info = OutputInfo::new(1);
        assert_eq!(info.friendly_name(), "unknown");

        info.make = "Foocorp".into();
        info.model = "Display 1".into();
        assert_eq!(info.friendly_name(), "Foocorp Display 1");

        info.location = (1920, 0);
        assert_eq!(info.friendly_name(), "Foocorp Display 1 @1920x0");

        info.name = Some("HDMI-A-1".into());
        assert_eq!(info.friendly_name(), "HDMI-A-1");
    }

    #[test]
    fn first_done_cycle_is_detected_once() {
        let mut info = OutputInfo::new(1);
        assert!(info.mark_done());
        assert!(!info.mark_done());
    }
}
