//! Presentation feedback timing.
//!
//! When the compositor supports `wp_presentation`, every rendered-frame
//! submission requests feedback for that commit. The delta between the
//! submission time, sampled from the protocol-designated clock, and the
//! reported presentation time is folded into a moving average used for
//! audio/video sync correction. Discarded frames contribute nothing. The
//! feedback's sync output is the compositor's actual presentation target and
//! is cached separately from the geometry-derived output set.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustix::time::{clock_gettime, ClockId, Timespec};
use wayland_backend::client::ObjectId;
use wayland_client::{
    protocol::wl_surface::WlSurface,
    Connection, Dispatch, Proxy, QueueHandle,
};
use wayland_protocols::wp::presentation_time::client::{wp_presentation, wp_presentation_feedback};

use crate::{
    globals::{GlobalData, GlobalProxy},
    output::OutputData,
    registry::RegistryState,
};

/// Samples folded into the latency average before old entries fall out.
const LATENCY_WINDOW: usize = 30;

pub trait PresentationHandler: Sized {
    fn presentation_state(&mut self) -> &mut PresentationState;
}

#[derive(Debug)]
pub struct PresentationState {
    presentation: GlobalProxy<wp_presentation::WpPresentation>,
    times: FrameTimes,
}

impl PresentationState {
    /// Binds `wp_presentation` if the compositor offers it. Absence simply
    /// disables latency reporting.
    pub fn bind<State>(registry: &RegistryState, qh: &QueueHandle<State>) -> Self
    where
        State: Dispatch<wp_presentation::WpPresentation, GlobalData, State> + 'static,
    {
        let presentation = registry.bind_optional(qh, 1..=1, GlobalData).into();
        PresentationState { presentation, times: FrameTimes::default() }
    }

    pub fn is_available(&self) -> bool {
        self.presentation.is_bound()
    }

    /// Shared handle for submitting frames and reading timings from other
    /// threads.
    pub fn times(&self) -> FrameTimes {
        self.times.clone()
    }

    /// Detachable handle for submitting frames from other threads.
    pub fn handle(&self) -> PresentationHandle {
        PresentationHandle {
            presentation: match &self.presentation {
                GlobalProxy::Bound(presentation) => Some(presentation.clone()),
                GlobalProxy::NotBound => None,
            },
            times: self.times.clone(),
        }
    }
}

/// A cloneable handle to the presentation machinery, independent of the
/// dispatch state.
#[derive(Debug, Clone)]
pub struct PresentationHandle {
    presentation: Option<wp_presentation::WpPresentation>,
    times: FrameTimes,
}

impl PresentationHandle {
    /// Requests feedback for the commit the renderer is about to make.
    ///
    /// A no-op when the compositor lacks presentation timing.
    pub fn frame_submitted<State>(&self, surface: &WlSurface, qh: &QueueHandle<State>)
    where
        State: Dispatch<wp_presentation_feedback::WpPresentationFeedback, FeedbackData, State> + 'static,
    {
        let presentation = match &self.presentation {
            Some(presentation) => presentation,
            None => return,
        };

        let data = FeedbackData { times: self.times.clone() };
        let feedback = presentation.feedback(surface, qh, data);
        self.times.record_submission(feedback.id());
    }
}

/// User data of an in-flight feedback object.
#[derive(Debug)]
pub struct FeedbackData {
    times: FrameTimes,
}

/// Shared frame timing state.
#[derive(Debug, Clone, Default)]
pub struct FrameTimes(Arc<Mutex<FrameTimesInner<ObjectId>>>);

impl FrameTimes {
    fn record_submission(&self, id: ObjectId) {
        let mut inner = self.0.lock().unwrap();
        let now = sample_clock(inner.clk_id);
        inner.submitted(id, now);
    }

    /// Moving average of presentation latency over the recent window.
    pub fn average_latency(&self) -> Option<Duration> {
        self.0.lock().unwrap().average_latency()
    }

    /// Refresh rate of the output the compositor actually presents on,
    /// as reported by feedback.
    pub fn sync_output_refresh_hz(&self) -> Option<f32> {
        self.0.lock().unwrap().sync_refresh_hz
    }

    /// Global id of the feedback-reported sync output, when known.
    pub fn sync_output_id(&self) -> Option<u32> {
        self.0.lock().unwrap().sync_output_id
    }

    fn set_clock(&self, clk_id: u32) {
        self.0.lock().unwrap().clk_id = Some(clk_id);
    }
}

#[derive(Debug)]
struct FrameTimesInner<K> {
    clk_id: Option<u32>,
    pending: VecDeque<(K, Timespec)>,
    latency: VecDeque<i64>,
    sync_refresh_hz: Option<f32>,
    sync_output_id: Option<u32>,
}

impl<K> Default for FrameTimesInner<K> {
    fn default() -> Self {
        FrameTimesInner {
            clk_id: None,
            pending: VecDeque::new(),
            latency: VecDeque::new(),
            sync_refresh_hz: None,
            sync_output_id: None,
        }
    }
}

impl<K: PartialEq> FrameTimesInner<K> {
    fn submitted(&mut self, key: K, at: Timespec) {
        self.pending.push_back((key, at));
    }

    fn take_pending(&mut self, key: &K) -> Option<Timespec> {
        let idx = self.pending.iter().position(|(pending, _)| pending == key)?;
        self.pending.remove(idx).map(|(_, at)| at)
    }

    fn presented(&mut self, key: &K, tv_sec: u64, tv_nsec: u32) {
        let submitted = match self.take_pending(key) {
            Some(submitted) => submitted,
            None => return,
        };

        let latency_ns = (tv_sec as i64 - submitted.tv_sec as i64) * 1_000_000_000
            + (tv_nsec as i64 - submitted.tv_nsec as i64);

        self.latency.push_back(latency_ns);
        while self.latency.len() > LATENCY_WINDOW {
            self.latency.pop_front();
        }
    }

    fn discarded(&mut self, key: &K) {
        self.take_pending(key);
    }

    fn average_latency(&self) -> Option<Duration> {
        if self.latency.is_empty() {
            return None;
        }
        let sum: i64 = self.latency.iter().sum();
        let avg = sum / self.latency.len() as i64;
        // A frame cannot be presented before it was submitted; clamp clock
        // noise instead of panicking in Duration construction.
        Some(Duration::from_nanos(avg.max(0) as u64))
    }
}

/// Samples the protocol-designated clock.
///
/// Feedback timestamps must be compared against the same clock the
/// compositor reports with, not wall-clock time.
fn sample_clock(clk_id: Option<u32>) -> Timespec {
    // CLOCK_REALTIME = 0, CLOCK_MONOTONIC = 1
    let clock = match clk_id {
        Some(0) => ClockId::Realtime,
        Some(1) | None => ClockId::Monotonic,
        Some(other) => {
            log::debug!(target: "winsys", "unhandled presentation clock {}, using monotonic", other);
            ClockId::Monotonic
        }
    };
    clock_gettime(clock)
}

impl<D> Dispatch<wp_presentation::WpPresentation, GlobalData, D> for PresentationState
where
    D: Dispatch<wp_presentation::WpPresentation, GlobalData> + PresentationHandler,
{
    fn event(
        state: &mut D,
        _: &wp_presentation::WpPresentation,
        event: wp_presentation::Event,
        _: &GlobalData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        match event {
            wp_presentation::Event::ClockId { clk_id } => {
                state.presentation_state().times.set_clock(clk_id);
            }
            _ => unreachable!(),
        }
    }
}

impl<D> Dispatch<wp_presentation_feedback::WpPresentationFeedback, FeedbackData, D> for PresentationState
where
    D: Dispatch<wp_presentation_feedback::WpPresentationFeedback, FeedbackData> + PresentationHandler,
{
    fn event(
        _: &mut D,
        feedback: &wp_presentation_feedback::WpPresentationFeedback,
        event: wp_presentation_feedback::Event,
        data: &FeedbackData,
        _: &Connection,
        _: &QueueHandle<D>,
    ) {
        match event {
            wp_presentation_feedback::Event::SyncOutput { output } => {
                if let Some(info) = output.data::<OutputData>() {
                    data.times.0.lock().unwrap().sync_output_id = Some(info.with_info(|info| info.id));
                }
            }

            wp_presentation_feedback::Event::Presented { tv_sec_hi, tv_sec_lo, tv_nsec, refresh, .. } => {
                let tv_sec = ((tv_sec_hi as u64) << 32) | (tv_sec_lo as u64);

                let mut inner = data.times.0.lock().unwrap();
                inner.presented(&feedback.id(), tv_sec, tv_nsec);
                if refresh > 0 {
                    // refresh is the nanosecond duration of one cycle
                    inner.sync_refresh_hz = Some(1_000_000_000.0 / refresh as f32);
                }
            }

            wp_presentation_feedback::Event::Discarded => {
                data.times.0.lock().unwrap().discarded(&feedback.id());
            }

            _ => {}
        }
    }
}

#[macro_export]
macro_rules! delegate_presentation {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::wp::presentation_time::client::wp_presentation::WpPresentation: $crate::globals::GlobalData
            ] => $crate::presentation::PresentationState
        );
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::protocols::wp::presentation_time::client::wp_presentation_feedback::WpPresentationFeedback: $crate::presentation::FeedbackData
            ] => $crate::presentation::PresentationState
        );
    };
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(sec: i64, nsec: i64) -> Timespec {
        Timespec { tv_sec: sec, tv_nsec: nsec as _ }
    }

    #[test]
    fn latency_is_presented_minus_submitted() {
        let mut inner = FrameTimesInner::<u32>::default();
        inner.submitted(1, ts(10, 0));
        inner.presented(&1, 10, 16_000_000);

        assert_eq!(inner.average_latency(), Some(Duration::from_millis(16)));
        assert!(inner.pending.is_empty());
    }

    #[test]
    fn discarded_frames_contribute_no_latency() {
        let mut inner = FrameTimesInner::<u32>::default();
        inner.submitted(1, ts(10, 0));
        inner.discarded(&1);

        assert_eq!(inner.average_latency(), None);
        assert!(inner.pending.is_empty());
    }

    #[test]
    fn unknown_feedback_is_ignored() {
        let mut inner = FrameTimesInner::<u32>::default();
        inner.presented(&42, 10, 0);
        assert_eq!(inner.average_latency(), None);
    }

    #[test]
    fn average_window_prunes_old_samples() {
        let mut inner = FrameTimesInner::<u32>::default();

        // One slow frame, then a full window of fast frames
        inner.submitted(0, ts(0, 0));
        inner.presented(&0, 1, 0);

        for key in 1..=LATENCY_WINDOW as u32 {
            inner.submitted(key, ts(0, 0));
            inner.presented(&key, 0, 1_000_000);
        }

        // The slow frame has been pruned from the running average
        assert_eq!(inner.latency.len(), LATENCY_WINDOW);
        assert_eq!(inner.average_latency(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn out_of_order_feedback_resolves_by_identity() {
        let mut inner = FrameTimesInner::<u32>::default();
        inner.submitted(1, ts(0, 0));
        inner.submitted(2, ts(0, 1000));

        // Second frame answered first
        inner.presented(&2, 0, 2000);
        assert_eq!(inner.pending.len(), 1);
        assert_eq!(inner.pending[0].0, 1);
    }
}
