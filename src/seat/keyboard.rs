//! Keyboard input processing.
//!
//! The compositor delivers the keymap as a one-shot shared memory blob which
//! is compiled through libxkbcommon. Modifier events update the xkb state
//! before any later key event is translated; the keymap abstraction does not
//! tolerate reordering. Key repeat is armed with a fully resolved copy of the
//! key event so the repeat timer never touches the keymap from its own thread.

use std::fs::File;
use std::sync::Mutex;

use wayland_client::{
    protocol::{
        wl_keyboard::{self, KeymapFormat, WlKeyboard},
        wl_seat::WlSeat,
    },
    Connection, Dispatch, QueueHandle, WEnum,
};
use xkbcommon::xkb;

use crate::events::{KeyEvent, Modifiers};

use super::repeat::RepeatMessage;
use super::SeatState;

/// Repeat timing, in the units the protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatInfo {
    /// Delay before the first repeat in milliseconds.
    pub delay_ms: u32,
    /// Gap between repeats in milliseconds.
    pub interval_ms: u32,
}

impl Default for RepeatInfo {
    /// Defaults used when the compositor never sends `repeat_info`, which is
    /// optional before seat version 4.
    fn default() -> Self {
        RepeatInfo { delay_ms: 1000, interval_ms: 50 }
    }
}

pub trait KeyboardHandler: Sized {
    /// Keyboard focus entered or left the surface.
    fn keyboard_focus(&mut self, conn: &Connection, qh: &QueueHandle<Self>, keyboard: &WlKeyboard, gained: bool);

    /// A fully translated key event.
    fn key_event(&mut self, conn: &Connection, qh: &QueueHandle<Self>, keyboard: &WlKeyboard, event: KeyEvent);
}

/// User data attached to a `wl_keyboard`.
pub struct KeyboardData {
    seat: WlSeat,
    repeat_sender: Mutex<calloop::channel::Sender<RepeatMessage>>,
    inner: Mutex<KeyboardInner>,
}

impl std::fmt::Debug for KeyboardData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyboardData").field("seat", &self.seat).finish()
    }
}

struct KeyboardInner {
    context: xkb::Context,
    keymap: Option<xkb::Keymap>,
    state: Option<xkb::State>,
    modifiers: Modifiers,
    /// None while repeat is disabled by the compositor.
    repeat_info: Option<RepeatInfo>,
    /// Raw code of the key currently held and repeating, if any.
    repeating_key: Option<u32>,
}

impl std::fmt::Debug for KeyboardInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyboardInner")
            .field("has_keymap", &self.keymap.is_some())
            .field("modifiers", &self.modifiers)
            .field("repeat_info", &self.repeat_info)
            .field("repeating_key", &self.repeating_key)
            .finish()
    }
}

impl KeyboardData {
    pub fn new(seat: WlSeat, repeat_sender: calloop::channel::Sender<RepeatMessage>) -> Self {
        KeyboardData {
            seat,
            repeat_sender: Mutex::new(repeat_sender),
            inner: Mutex::new(KeyboardInner {
                context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
                keymap: None,
                state: None,
                modifiers: Modifiers::default(),
                repeat_info: Some(RepeatInfo::default()),
                repeating_key: None,
            }),
        }
    }

    pub fn seat(&self) -> &WlSeat {
        &self.seat
    }

    fn send_repeat(&self, message: RepeatMessage) {
        if self.repeat_sender.lock().unwrap().send(message).is_err() {
            log::debug!(target: "winsys", "key repeat channel is gone");
        }
    }
}

// SAFETY: the xkb context/keymap/state live behind `KeyboardData`'s `Mutex`
// and are only ever touched on the single protocol-pump thread that dispatches
// keyboard events (see spec.md: all protocol callbacks run strictly
// sequentially on one thread). No concurrent access occurs.
unsafe impl Send for KeyboardInner {}

impl KeyboardInner {
    fn install_keymap(&mut self, file: File, size: u32) {
        // The fd is closed when `file` drops, whether or not the compile
        // succeeds.
        let mmap = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(err) => {
                log::warn!(target: "winsys", "could not map keymap fd: {}", err);
                self.keymap = None;
                self.state = None;
                return;
            }
        };

        // The blob is NUL terminated.
        let len = (size as usize).min(mmap.len()).saturating_sub(1);
        let text = match std::str::from_utf8(&mmap[..len]) {
            Ok(text) => text,
            Err(err) => {
                log::warn!(target: "winsys", "keymap is not valid UTF-8: {}", err);
                self.keymap = None;
                self.state = None;
                return;
            }
        };

        match xkb::Keymap::new_from_string(
            &self.context,
            text.to_owned(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        ) {
            Some(keymap) => {
                self.state = Some(xkb::State::new(&keymap));
                self.keymap = Some(keymap);
                log::debug!(target: "winsys", "compiled new keymap");
            }
            None => {
                // Keyboard translation stays disabled until a valid keymap
                // arrives.
                log::warn!(target: "winsys", "provided keymap did not compile, keyboard input disabled");
                self.keymap = None;
                self.state = None;
            }
        }
    }

    fn update_modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        let state = match &mut self.state {
            Some(state) => state,
            None => return,
        };

        state.update_mask(depressed, latched, locked, 0, 0, group);

        self.modifiers = Modifiers {
            ctrl: state.mod_name_is_active(xkb::MOD_NAME_CTRL, xkb::STATE_MODS_EFFECTIVE),
            alt: state.mod_name_is_active(xkb::MOD_NAME_ALT, xkb::STATE_MODS_EFFECTIVE),
            shift: state.mod_name_is_active(xkb::MOD_NAME_SHIFT, xkb::STATE_MODS_EFFECTIVE),
            logo: state.mod_name_is_active(xkb::MOD_NAME_LOGO, xkb::STATE_MODS_EFFECTIVE),
            caps_lock: state.mod_name_is_active(xkb::MOD_NAME_CAPS, xkb::STATE_MODS_EFFECTIVE),
            num_lock: state.mod_name_is_active(xkb::MOD_NAME_NUM, xkb::STATE_MODS_EFFECTIVE),
        };
    }

    /// Translates a raw evdev code into an application key event.
    ///
    /// Returns `None` while no valid keymap is installed.
    fn translate(&self, raw: u32, pressed: bool) -> Option<KeyEvent> {
        let state = self.state.as_ref()?;
        let keycode: xkb::Keycode = (raw + EVDEV_OFFSET).into();

        Some(KeyEvent {
            keysym: state.key_get_one_sym(keycode),
            scancode: clamp_scancode(raw),
            unicode: unicode_unit(state.key_get_utf32(keycode)),
            modifiers: self.modifiers,
            pressed,
        })
    }

    fn key_repeats(&self, raw: u32) -> bool {
        self.keymap
            .as_ref()
            .map(|keymap| keymap.key_repeats((raw + EVDEV_OFFSET).into()))
            .unwrap_or(false)
    }
}

/// Offset between evdev codes delivered by the compositor and xkb keycodes.
const EVDEV_OFFSET: u32 = 8;

/// Clamps a raw code to the representable scancode range; overflow maps to
/// "unknown" (0), not a wrapped value.
fn clamp_scancode(raw: u32) -> u8 {
    u8::try_from(raw).unwrap_or(0)
}

/// Narrows a code point to one UTF-16 unit. Code points beyond the 16-bit
/// range are dropped to 0, never truncated.
fn unicode_unit(code_point: u32) -> u16 {
    u16::try_from(code_point).unwrap_or(0)
}

impl<D> Dispatch<WlKeyboard, KeyboardData, D> for SeatState
where
    D: Dispatch<WlKeyboard, KeyboardData> + KeyboardHandler,
{
    fn event(
        state: &mut D,
        keyboard: &WlKeyboard,
        event: wl_keyboard::Event,
        data: &KeyboardData,
        conn: &Connection,
        qh: &QueueHandle<D>,
    ) {
        match event {
            wl_keyboard::Event::Keymap { format, fd, size } => {
                // A new keymap invalidates any repeat armed under the old one.
                data.send_repeat(RepeatMessage::Stop);

                let mut inner = data.inner.lock().unwrap();
                inner.repeating_key = None;

                match format {
                    WEnum::Value(KeymapFormat::XkbV1) => {
                        inner.install_keymap(File::from(fd), size);
                    }
                    other => {
                        // The fd still has to be closed, which dropping it does.
                        log::warn!(target: "winsys", "unsupported keymap format {:?}, keyboard input disabled", other);
                        inner.keymap = None;
                        inner.state = None;
                    }
                }
            }

            wl_keyboard::Event::Enter { .. } => {
                state.keyboard_focus(conn, qh, keyboard, true);
            }

            wl_keyboard::Event::Leave { .. } => {
                data.send_repeat(RepeatMessage::Stop);
                data.inner.lock().unwrap().repeating_key = None;
                state.keyboard_focus(conn, qh, keyboard, false);
            }

            wl_keyboard::Event::Key { key, state: key_state, .. } => {
                let pressed = matches!(key_state, WEnum::Value(wl_keyboard::KeyState::Pressed));

                let (event, repeat) = {
                    let mut inner = data.inner.lock().unwrap();
                    let event = inner.translate(key, pressed);

                    if pressed {
                        let arm = event.is_some() && inner.key_repeats(key);
                        if arm {
                            inner.repeating_key = Some(key);
                        }
                        (event, arm.then(|| inner.repeat_info).flatten())
                    } else {
                        if inner.repeating_key == Some(key) {
                            inner.repeating_key = None;
                            data.send_repeat(RepeatMessage::Stop);
                        }
                        (event, None)
                    }
                };

                if let Some(event) = event {
                    if let Some(info) = repeat {
                        // The repeat source re-emits this saved copy without
                        // ever consulting the keymap again.
                        data.send_repeat(RepeatMessage::Start { event: event.clone(), info });
                    }
                    state.key_event(conn, qh, keyboard, event);
                }
            }

            wl_keyboard::Event::Modifiers { mods_depressed, mods_latched, mods_locked, group, .. } => {
                // Applied before any subsequent key event is translated; a
                // modifier change also cancels an in-flight repeat.
                data.send_repeat(RepeatMessage::Stop);

                let mut inner = data.inner.lock().unwrap();
                inner.repeating_key = None;
                inner.update_modifiers(mods_depressed, mods_latched, mods_locked, group);
            }

            wl_keyboard::Event::RepeatInfo { rate, delay } => {
                let mut inner = data.inner.lock().unwrap();
                if rate <= 0 {
                    // Rate 0 disables repeat entirely.
                    inner.repeat_info = None;
                    data.send_repeat(RepeatMessage::Stop);
                } else {
                    inner.repeat_info = Some(RepeatInfo {
                        delay_ms: delay.max(0) as u32,
                        interval_ms: (1000 / rate).max(1) as u32,
                    });
                }
            }

            _ => {}
        }
    }
}

#[macro_export]
macro_rules! delegate_keyboard {
    ($ty: ty) => {
        $crate::reexports::client::delegate_dispatch!($ty:
            [
                $crate::reexports::client::protocol::wl_keyboard::WlKeyboard: $crate::seat::keyboard::KeyboardData
            ] => $crate::seat::SeatState
        );
    };
}

#[cfg(test)]
mod test {
    use super::*;

    /// A keymap with one ASCII key, one key outside the basic plane, and one
    /// key above the representable scancode range.
    const TEST_KEYMAP: &str = r#"
xkb_keymap {
    xkb_keycodes "test" {
        minimum = 8;
        maximum = 708;
        <KQ>   = 24;
        <KHI>  = 32;
        <KBIG> = 708;
    };
    xkb_types "test" {
        type "ONE_LEVEL" {
            modifiers = none;
            level_name[Level1] = "Any";
        };
    };
    xkb_compatibility "test" { };
    xkb_symbols "test" {
        key <KQ>   { [ q ] };
        key <KHI>  { [ U10000 ] };
        key <KBIG> { [ z ] };
    };
};
"#;

    fn inner_with_test_keymap() -> KeyboardInner {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_string(
            &context,
            TEST_KEYMAP.to_string(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .expect("test keymap must compile");
        let state = xkb::State::new(&keymap);

        KeyboardInner {
            context,
            keymap: Some(keymap),
            state: Some(state),
            modifiers: Modifiers::default(),
            repeat_info: Some(RepeatInfo::default()),
            repeating_key: None,
        }
    }

    #[test]
    fn press_release_translates_symbol_and_code_point() {
        let inner = inner_with_test_keymap();

        // evdev 16 maps to xkb keycode 24 (<KQ>)
        let down = inner.translate(16, true).unwrap();
        assert!(down.pressed);
        assert_eq!(u32::from(down.keysym), u32::from(xkeysym::Keysym::q));
        assert_eq!(down.unicode, u32::from('q') as u16);
        assert_eq!(down.scancode, 16);

        let up = inner.translate(16, false).unwrap();
        assert!(!up.pressed);
        assert_eq!(up.keysym, down.keysym);
    }

    #[test]
    fn code_points_above_the_basic_plane_are_dropped() {
        let inner = inner_with_test_keymap();

        // evdev 24 maps to <KHI> carrying U+10000
        let event = inner.translate(24, true).unwrap();
        assert_eq!(event.unicode, 0);
    }

    #[test]
    fn scancodes_clamp_instead_of_wrapping() {
        let inner = inner_with_test_keymap();

        // evdev 700 maps to <KBIG>; 700 does not fit a scancode
        let event = inner.translate(700, true).unwrap();
        assert_eq!(event.scancode, 0);

        assert_eq!(clamp_scancode(255), 255);
        assert_eq!(clamp_scancode(256), 0);
    }

    #[test]
    fn translation_is_disabled_without_a_keymap() {
        let inner = KeyboardInner {
            context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            keymap: None,
            state: None,
            modifiers: Modifiers::default(),
            repeat_info: Some(RepeatInfo::default()),
            repeating_key: None,
        };
        assert!(inner.translate(16, true).is_none());
        assert!(!inner.key_repeats(16));
    }

    #[test]
    fn unicode_units_never_truncate() {
        assert_eq!(unicode_unit(0), 0);
        assert_eq!(unicode_unit(0x41), 0x41);
        assert_eq!(unicode_unit(0xFFFF), 0xFFFF);
        assert_eq!(unicode_unit(0x1_0000), 0);
        assert_eq!(unicode_unit(0x1F600), 0);
    }
}
