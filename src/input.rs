//! Input routing
//!
//! Translates client key/pointer/text verbs into X11 side effects. Keys go
//! through the key-injection tool (xdotool); printable non-alphabetic
//! keysyms with no modifiers held are typed atomically instead of pressed,
//! which keeps the modifier set from drifting out of sync on some X input
//! stacks. Pointer motion and buttons go through XTest directly.

use crate::x11::X11Input;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

const KEY_TOOL_TIMEOUT: Duration = Duration::from_millis(500);

const KEYSYM_ALT_L: u32 = 0xFFE9;
const KEYSYM_LEFT_ARROW: u32 = 0xFF51;
const KEYSYM_RIGHT_ARROW: u32 = 0xFF53;

/// Shift, Control, Alt, AltGr, Meta/Super keysyms.
const MODIFIER_KEYSYMS: [u32; 9] = [
    65505, 65506, // Shift_L, Shift_R
    65507, 65508, // Control_L, Control_R
    65513, 65514, // Alt_L, Alt_R
    65027, // ISO_Level3_Shift (AltGr)
    65511, 65512, // Meta_L/Super_L, Meta_R/Super_R
];

/// Keys released by `kr`: all modifier pairs plus keys that commonly stick.
const RESET_KEYSYMS: [u32; 13] = [
    65507, 65505, 65513, 65508, 65506, 65027, 65511, 65512, 102, 70, 109, 77, 65307,
];

const SHORTCUT_MODIFIER_NAMES: [&str; 8] = [
    "Control_L", "Control_R", "Alt_L", "Alt_R", "Super_L", "Super_R", "Meta_L", "Meta_R",
];

// X core button numbers
const BTN_LEFT: u8 = 1;
const BTN_MIDDLE: u8 = 2;
const BTN_RIGHT: u8 = 3;
const BTN_SCROLL_UP: u8 = 4;
const BTN_SCROLL_DOWN: u8 = 5;
const BTN_SCROLL_LEFT: u8 = 6;
const BTN_SCROLL_RIGHT: u8 = 7;

/// Printable per the X keysym convention: Latin-1 range or a Unicode
/// keysym (0x01xxxxxx, codepoint in the low 24 bits).
pub fn is_printable_keysym(keysym: u32) -> bool {
    (0x20..=0xFF).contains(&keysym) || (keysym & 0xFF00_0000) == 0x0100_0000
}

pub fn keysym_codepoint(keysym: u32) -> u32 {
    if (keysym & 0xFF00_0000) == 0x0100_0000 {
        keysym & 0x00FF_FFFF
    } else {
        keysym
    }
}

/// X key name for the common non-printable keysyms, as the key tool
/// expects them.
fn keysym_to_xkey_name(keysym: u32) -> Option<&'static str> {
    let name = match keysym {
        0xFF08 => "BackSpace",
        0xFF09 => "Tab",
        0xFF0D => "Return",
        0xFF13 => "Pause",
        0xFF14 => "Scroll_Lock",
        0xFF1B => "Escape",
        0xFF50 => "Home",
        0xFF51 => "Left",
        0xFF52 => "Up",
        0xFF53 => "Right",
        0xFF54 => "Down",
        0xFF55 => "Prior",
        0xFF56 => "Next",
        0xFF57 => "End",
        0xFF61 => "Print",
        0xFF63 => "Insert",
        0xFF67 => "Menu",
        0xFF7F => "Num_Lock",
        0xFF8D => "KP_Enter",
        0xFF95 => "KP_Home",
        0xFF96 => "KP_Left",
        0xFF97 => "KP_Up",
        0xFF98 => "KP_Right",
        0xFF99 => "KP_Down",
        0xFF9A => "KP_Prior",
        0xFF9B => "KP_Next",
        0xFF9C => "KP_End",
        0xFF9E => "KP_Insert",
        0xFF9F => "KP_Delete",
        0xFFAA => "KP_Multiply",
        0xFFAB => "KP_Add",
        0xFFAD => "KP_Subtract",
        0xFFAE => "KP_Decimal",
        0xFFAF => "KP_Divide",
        0xFFB0 => "KP_0",
        0xFFB1 => "KP_1",
        0xFFB2 => "KP_2",
        0xFFB3 => "KP_3",
        0xFFB4 => "KP_4",
        0xFFB5 => "KP_5",
        0xFFB6 => "KP_6",
        0xFFB7 => "KP_7",
        0xFFB8 => "KP_8",
        0xFFB9 => "KP_9",
        0xFFBE => "F1",
        0xFFBF => "F2",
        0xFFC0 => "F3",
        0xFFC1 => "F4",
        0xFFC2 => "F5",
        0xFFC3 => "F6",
        0xFFC4 => "F7",
        0xFFC5 => "F8",
        0xFFC6 => "F9",
        0xFFC7 => "F10",
        0xFFC8 => "F11",
        0xFFC9 => "F12",
        0xFFE1 => "Shift_L",
        0xFFE2 => "Shift_R",
        0xFFE3 => "Control_L",
        0xFFE4 => "Control_R",
        0xFFE5 => "Caps_Lock",
        0xFFE9 => "Alt_L",
        0xFFEA => "Alt_R",
        0xFE03 => "ISO_Level3_Shift",
        0xFFE7 => "Meta_L",
        0xFFE8 => "Meta_R",
        0xFFEB => "Super_L",
        0xFFEC => "Super_R",
        0xFFFF => "Delete",
        _ => return None,
    };
    Some(name)
}

async fn run_key_tool(args: &[&str]) -> bool {
    let child = Command::new("xdotool")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match tokio::time::timeout(KEY_TOOL_TIMEOUT, child).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(err)) => {
            warn!("Failed to run key tool: {}", err);
            false
        }
        Err(_) => {
            warn!("Key tool timed out for {:?}", args);
            false
        }
    }
}

/// Per-session input state machine.
pub struct InputRouter {
    x11: Option<Arc<X11Input>>,
    active_modifiers: HashSet<u32>,
    active_shortcut_modifiers: HashSet<&'static str>,
    atomically_typed_keys: HashSet<u32>,
    button_mask: u8,
}

impl InputRouter {
    pub fn new(x11: Option<Arc<X11Input>>) -> Self {
        Self {
            x11,
            active_modifiers: HashSet::new(),
            active_shortcut_modifiers: HashSet::new(),
            atomically_typed_keys: HashSet::new(),
            button_mask: 0,
        }
    }

    pub async fn key_down(&mut self, keysym: u32) {
        if MODIFIER_KEYSYMS.contains(&keysym) {
            self.active_modifiers.insert(keysym);
        }
        if is_printable_keysym(keysym) && self.active_modifiers.is_empty() {
            if let Some(ch) = char::from_u32(keysym_codepoint(keysym)) {
                if !ch.is_alphabetic() {
                    debug!(
                        "Handling non-alpha '{}' with atomic type to prevent stuck modifiers",
                        ch
                    );
                    self.type_text(&ch.to_string()).await;
                    self.atomically_typed_keys.insert(keysym);
                    return;
                }
            }
        }
        self.send_keypress(keysym, true).await;
    }

    pub async fn key_up(&mut self, keysym: u32) {
        if MODIFIER_KEYSYMS.contains(&keysym) {
            self.active_modifiers.remove(&keysym);
        }
        if self.atomically_typed_keys.remove(&keysym) {
            // The matching key-down was typed atomically.
            return;
        }
        self.send_keypress(keysym, false).await;
    }

    /// Release modifiers and commonly stuck keys.
    pub async fn reset_keyboard(&mut self) {
        info!("Resetting keyboard modifiers");
        for keysym in RESET_KEYSYMS {
            self.send_keypress(keysym, false).await;
        }
        self.active_modifiers.clear();
        self.active_shortcut_modifiers.clear();
        self.atomically_typed_keys.clear();
    }

    async fn send_keypress(&mut self, keysym: u32, down: bool) {
        let action = if down { "keydown" } else { "keyup" };

        let (arg, is_printable): (Option<String>, bool) = if is_printable_keysym(keysym) {
            (
                Some(format!("U{:04X}", keysym_codepoint(keysym))),
                true,
            )
        } else {
            match keysym_to_xkey_name(keysym) {
                Some(name) => {
                    if SHORTCUT_MODIFIER_NAMES.contains(&name) {
                        if down {
                            self.active_shortcut_modifiers.insert(name);
                        } else {
                            self.active_shortcut_modifiers.remove(name);
                        }
                    }
                    (Some(name.to_string()), false)
                }
                None => (None, false),
            }
        };

        let Some(arg) = arg else {
            debug!("No key name for keysym 0x{:x}; dropping key event", keysym);
            return;
        };

        let ok = if is_printable && self.active_shortcut_modifiers.is_empty() {
            run_key_tool(&[action, "--clearmodifiers", arg.as_str()]).await
        } else {
            run_key_tool(&[action, arg.as_str()]).await
        };

        if !ok && down && is_printable {
            // Second tool invocation: atomic type of the literal character.
            if let Some(ch) = char::from_u32(keysym_codepoint(keysym)) {
                if ch.is_ascii_graphic() || ch as u32 >= 0xA0 {
                    let literal = ch.to_string();
                    run_key_tool(&["type", "--clearmodifiers", literal.as_str()]).await;
                }
            }
        }
    }

    /// Atomic text injection via the type tool.
    pub async fn type_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !run_key_tool(&["type", text]).await {
            warn!("Type tool failed for {:?}", text);
        }
    }

    /// Absolute or relative pointer update plus button-mask diffing.
    pub async fn mouse(
        &mut self,
        x: i32,
        y: i32,
        button_mask: u8,
        scroll_magnitude: u32,
        relative: bool,
    ) {
        if let Some(x11) = &self.x11 {
            let clamp = |v: i32| v.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            if relative {
                x11.move_pointer_relative(clamp(x), clamp(y));
            } else {
                x11.move_pointer_absolute(clamp(x), clamp(y));
            }
        }

        if button_mask == self.button_mask {
            return;
        }
        let changed = button_mask ^ self.button_mask;
        for bit in 0..8u8 {
            if changed & (1 << bit) == 0 {
                continue;
            }
            let pressed = button_mask & (1 << bit) != 0;
            match bit {
                0 => self.emit_button(BTN_LEFT, pressed),
                1 => self.emit_button(BTN_MIDDLE, pressed),
                2 => self.emit_button(BTN_RIGHT, pressed),
                // Bit 3 doubles as scroll-up and browser-back.
                3 => {
                    if scroll_magnitude > 0 {
                        if pressed {
                            self.emit_scroll(BTN_SCROLL_UP, scroll_magnitude);
                        }
                    } else if pressed {
                        self.send_key_combo(KEYSYM_ALT_L, KEYSYM_LEFT_ARROW).await;
                    }
                }
                // Bit 4 doubles as scroll-down and browser-forward.
                4 => {
                    if scroll_magnitude > 0 {
                        if pressed {
                            self.emit_scroll(BTN_SCROLL_DOWN, scroll_magnitude);
                        }
                    } else if pressed {
                        self.send_key_combo(KEYSYM_ALT_L, KEYSYM_RIGHT_ARROW).await;
                    }
                }
                6 => {
                    if scroll_magnitude > 0 && pressed {
                        self.emit_scroll(BTN_SCROLL_LEFT, scroll_magnitude);
                    }
                }
                7 => {
                    if scroll_magnitude > 0 && pressed {
                        self.emit_scroll(BTN_SCROLL_RIGHT, scroll_magnitude);
                    }
                }
                _ => {}
            }
        }
        self.button_mask = button_mask;
    }

    fn emit_button(&self, button: u8, pressed: bool) {
        if let Some(x11) = &self.x11 {
            x11.button(button, pressed);
        }
    }

    fn emit_scroll(&self, button: u8, magnitude: u32) {
        if let Some(x11) = &self.x11 {
            x11.scroll(button, magnitude.max(1));
        }
    }

    async fn send_key_combo(&mut self, modifier: u32, key: u32) {
        self.send_keypress(modifier, true).await;
        self.send_keypress(key, true).await;
        self.send_keypress(key, false).await;
        self.send_keypress(modifier, false).await;
    }

    /// Free text the grammar did not recognize; dropped, as documented.
    pub fn unknown(&self, text: &str) {
        info!("Unknown data channel message: {:.100}", text);
    }

    #[cfg(test)]
    fn has_atomic_key(&self, keysym: u32) -> bool {
        self.atomically_typed_keys.contains(&keysym)
    }

    #[cfg(test)]
    fn modifier_count(&self) -> usize {
        self.active_modifiers.len()
    }
}

/// Run a client-supplied shell command, fire-and-forget.
pub fn run_client_command(command: &str, enabled: bool) {
    if !enabled {
        warn!("Command execution disabled; ignoring cmd request");
        return;
    }
    let command = command.trim();
    if command.is_empty() {
        warn!("Received empty cmd request");
        return;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    match std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(home)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(_) => info!("Launched command: {}", command),
        Err(err) => warn!("Failed to launch command '{}': {}", command, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_classification() {
        assert!(is_printable_keysym(0x20)); // space
        assert!(is_printable_keysym(0x41)); // A
        assert!(is_printable_keysym(0xFF)); // ydiaeresis
        assert!(is_printable_keysym(0x0100_20AC)); // Unicode euro sign
        assert!(!is_printable_keysym(0xFF0D)); // Return
        assert!(!is_printable_keysym(0xFFE1)); // Shift_L
    }

    #[test]
    fn unicode_codepoint_extraction() {
        assert_eq!(keysym_codepoint(0x0100_20AC), 0x20AC);
        assert_eq!(keysym_codepoint(0x61), 0x61);
    }

    #[tokio::test]
    async fn non_alpha_printable_is_typed_atomically() {
        let mut router = InputRouter::new(None);
        // '5' with no modifiers: exactly one atomic type, ku is a no-op.
        router.key_down(0x35).await;
        assert!(router.has_atomic_key(0x35));
        router.key_up(0x35).await;
        assert!(!router.has_atomic_key(0x35));
    }

    #[tokio::test]
    async fn printable_with_modifier_held_is_pressed() {
        let mut router = InputRouter::new(None);
        router.key_down(65507).await; // Control_L
        assert_eq!(router.modifier_count(), 1);
        // '5' while Ctrl is held must NOT be atomically typed.
        router.key_down(0x35).await;
        assert!(!router.has_atomic_key(0x35));
        router.key_up(65507).await;
        assert_eq!(router.modifier_count(), 0);
    }

    #[tokio::test]
    async fn alpha_keys_are_never_atomic() {
        let mut router = InputRouter::new(None);
        router.key_down(0x61).await; // 'a'
        assert!(!router.has_atomic_key(0x61));
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let mut router = InputRouter::new(None);
        router.key_down(65507).await;
        router.key_down(0x2C).await; // ',' typed atomically? no: Ctrl held
        router.reset_keyboard().await;
        assert_eq!(router.modifier_count(), 0);
        assert!(!router.has_atomic_key(0x2C));
    }

    #[test]
    fn common_keysym_names() {
        assert_eq!(keysym_to_xkey_name(0xFF0D), Some("Return"));
        assert_eq!(keysym_to_xkey_name(0xFFBE), Some("F1"));
        assert_eq!(keysym_to_xkey_name(0xFFE3), Some("Control_L"));
        assert_eq!(keysym_to_xkey_name(0xDEAD00), None);
    }
}
