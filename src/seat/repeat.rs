//! Key repeat timing.
//!
//! A single-shot timer that is rearmed after every firing, driven from the
//! event pump's loop. Arming carries a fully resolved [`KeyEvent`] snapshot,
//! so firing never touches keymap state owned by the protocol thread. Any
//! stop message cancels the in-flight repeat before the state it was resolved
//! against is mutated.

use std::time::Duration;

use calloop::{
    channel::{self, Channel},
    timer::{TimeoutAction, Timer},
    EventSource, Poll, PostAction, Readiness, Token, TokenFactory,
};

use crate::events::KeyEvent;

use super::keyboard::RepeatInfo;

/// Message from a keyboard processor to the repeat source.
#[derive(Debug)]
pub enum RepeatMessage {
    /// Arm repeat for the given resolved key event.
    Start { event: KeyEvent, info: RepeatInfo },

    /// Cancel the in-flight repeat, if any.
    Stop,
}

/// Creates the repeat source and the sender handed to keyboard processors.
pub fn repeat_source() -> (channel::Sender<RepeatMessage>, KeyRepeatSource) {
    let (sender, channel) = channel::channel();
    let source = KeyRepeatSource {
        channel,
        timer: Timer::immediate(),
        gap: Duration::ZERO,
        key: None,
    };
    (sender, source)
}

/// [`EventSource`] emitting key repeat events.
pub struct KeyRepeatSource {
    channel: Channel<RepeatMessage>,
    timer: Timer,
    gap: Duration,
    key: Option<KeyEvent>,
}

// SAFETY: the source is constructed during synchronous bootstrap and then
// moved once into the event-pump thread, which is the only thread that ever
// registers or processes the contained timer. Nothing else references it.
unsafe impl Send for KeyRepeatSource {}

impl EventSource for KeyRepeatSource {
    type Event = KeyEvent;
    type Metadata = ();
    type Ret = ();
    type Error = calloop::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> calloop::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let mut removed = false;
        let mut reregister = false;

        let timer = &mut self.timer;
        let gap = &mut self.gap;
        let key = &mut self.key;

        let channel_pa = self
            .channel
            .process_events(readiness, token, |event, _| match event {
                channel::Event::Msg(RepeatMessage::Start { event, info }) => {
                    // A new arm replaces the previous one
                    key.replace(event);
                    *gap = Duration::from_millis(info.interval_ms as u64);
                    timer.set_duration(Duration::from_millis(info.delay_ms as u64));
                    reregister = true;
                }
                channel::Event::Msg(RepeatMessage::Stop) => {
                    key.take();
                }
                channel::Event::Closed => {
                    removed = true;
                }
            })
            .map_err(|err| calloop::Error::OtherError(Box::new(err)))?;

        // All keyboards are gone
        if removed {
            return Ok(PostAction::Remove);
        }

        // Re-register to start the new delay
        if reregister {
            return Ok(PostAction::Reregister);
        }

        let timer_pa = timer.process_events(readiness, token, |_, _| {
            let event = match key {
                Some(event) => event.clone(),
                None => return TimeoutAction::Drop,
            };

            callback(event, &mut ());

            // Rearm as a fresh single shot for the next firing
            TimeoutAction::ToDuration(*gap)
        })?;

        Ok(match (timer_pa, channel_pa) {
            (PostAction::Disable, PostAction::Disable) => PostAction::Disable,
            (PostAction::Remove, PostAction::Remove) => PostAction::Remove,
            (PostAction::Reregister, _) | (_, PostAction::Reregister) => PostAction::Reregister,
            _ => PostAction::Continue,
        })
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.channel.register(poll, token_factory)?;
        self.timer.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.channel.reregister(poll, token_factory)?;
        self.timer.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.channel.unregister(poll)?;
        self.timer.unregister(poll)
    }
}
