//! The protocol event pump.
//!
//! One dedicated thread per connection drives all protocol I/O: it flushes
//! pending requests, parks in a readiness wait on the transport and a wakeup
//! channel, and dispatches every queued callback synchronously. Callbacks
//! therefore never race each other. Cancellation goes through the loop's
//! wakeup signal rather than by closing the transport, which would be unsafe
//! while a read may be in flight, and joins the thread before returning.
//!
//! A transport or dispatch error leaves the protocol stream in an unknown
//! state; recovery is not attempted. The error is logged and the process is
//! terminated.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use calloop::{EventLoop, LoopSignal};
use calloop_wayland_source::WaylandSource;
use wayland_client::{Connection, EventQueue};

use crate::error::Error;
use crate::events::KeyEvent;
use crate::seat::repeat::KeyRepeatSource;

pub struct EventPump {
    signal: LoopSignal,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EventPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPump").field("running", &self.thread.is_some()).finish()
    }
}

impl EventPump {
    /// Starts the pump thread.
    ///
    /// Must only be called once bootstrap is complete: from this point on,
    /// protocol callbacks run concurrently with the caller and all further
    /// state access goes through the shared handles.
    pub fn spawn<D, C>(
        conn: Connection,
        queue: EventQueue<D>,
        mut state: D,
        repeat: KeyRepeatSource,
        on_repeat: fn(&mut D, KeyEvent),
        commands: calloop::channel::Channel<C>,
        on_command: fn(&mut D, C),
    ) -> Result<EventPump, Error>
    where
        D: Send + 'static,
        C: Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("wayland-events".into())
            .spawn(move || {
                let mut event_loop = match EventLoop::<D>::try_new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };

                let loop_handle = event_loop.handle();

                if let Err(err) = WaylandSource::new(conn, queue).insert(loop_handle.clone()) {
                    let _ = ready_tx.send(Err(calloop::Error::from(err).to_string()));
                    return;
                }

                if let Err(err) =
                    loop_handle.insert_source(repeat, move |event, _, state| on_repeat(state, event))
                {
                    let _ = ready_tx.send(Err(calloop::Error::from(err).to_string()));
                    return;
                }

                // Requests from application threads serialize onto this
                // thread instead of mutating dispatch state concurrently.
                if let Err(err) = loop_handle.insert_source(commands, move |event, _, state| {
                    if let calloop::channel::Event::Msg(command) = event {
                        on_command(state, command);
                    }
                }) {
                    let _ = ready_tx.send(Err(calloop::Error::from(err).to_string()));
                    return;
                }

                let _ = ready_tx.send(Ok(event_loop.get_signal()));

                log::debug!(target: "winsys", "starting Wayland message pump");
                match event_loop.run(None::<Duration>, &mut state, |_| {}) {
                    Ok(()) => {
                        log::debug!(target: "winsys", "Wayland message pump stopped");
                    }
                    Err(err) => {
                        // The protocol stream is desynchronized; continuing
                        // would dispatch garbage.
                        log::error!(target: "winsys", "fatal error in Wayland message pump: {}", err);
                        std::process::abort();
                    }
                }
            })
            .map_err(|err| Error::EventPump(err.to_string()))?;

        let signal = match ready_rx.recv() {
            Ok(Ok(signal)) => signal,
            Ok(Err(message)) => {
                let _ = thread.join();
                return Err(Error::EventPump(message));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::EventPump("pump thread died during startup".into()));
            }
        };

        Ok(EventPump { signal, thread: Some(thread) })
    }

    /// Stops the pump and joins the thread.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            log::debug!(target: "winsys", "stopping Wayland message pump");
            self.signal.stop();
            self.signal.wakeup();
            let _ = thread.join();
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}
