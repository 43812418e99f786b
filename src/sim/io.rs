//! The front-end adapter surface and I/O devices.
//!
//! The engine is headless: everything a user interface needs (register
//! mirrors, terminal output, button state) flows out through the
//! [`FrontEnd`] trait, and keyboard input flows in through
//! [`Simulator::feed_input`] plus an I/O interrupt. This module provides:
//! - [`FrontEnd`]: the adapter trait a front end implements.
//! - [`NoOpFrontEnd`]: the silent implementation for headless use.
//! - [`BufferedFrontEnd`]: an implementation that records terminal output
//!   into shared buffers, for tests and embedding.
//!
//! [`Simulator::feed_input`]: super::Simulator::feed_input

use std::sync::{Arc, Mutex, PoisonError};

use super::word::Register;

/// Device id of the keyboard input device.
pub const DEV_KEYBOARD: u32 = 0;
/// Device id of the console output device.
pub const DEV_CONSOLE: u32 = 1;

/// The surface a front end implements to observe the machine.
///
/// The engine calls these hooks as it runs; implementations should be
/// cheap and must not call back into the simulator.
pub trait FrontEnd: Send {
    /// A register changed; `reg` carries the new bits and width.
    fn update_register(&mut self, name: &str, reg: &Register);

    /// Append text to the terminal display.
    fn append_terminal(&mut self, text: &str);

    /// Enable or disable a named front-end button.
    fn toggle_button(&mut self, id: &str, enabled: bool);

    /// Disable every execution button (the machine halted).
    fn disable_buttons(&mut self);
}

/// A front end that ignores every update. Used for headless execution and
/// tests that don't care about display state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpFrontEnd;

impl FrontEnd for NoOpFrontEnd {
    fn update_register(&mut self, _name: &str, _reg: &Register) {}
    fn append_terminal(&mut self, _text: &str) {}
    fn toggle_button(&mut self, _id: &str, _enabled: bool) {}
    fn disable_buttons(&mut self) {}
}

/// A front end that accumulates terminal output in a shared buffer.
///
/// Clone it before handing it to the simulator to keep a reading handle:
///
/// ```
/// use vn18::sim::io::BufferedFrontEnd;
///
/// let fe = BufferedFrontEnd::new();
/// let handle = fe.clone();
/// // ... move `fe` into a Simulator, run ...
/// assert_eq!(handle.terminal(), "");
/// ```
#[derive(Debug, Default, Clone)]
pub struct BufferedFrontEnd {
    terminal: Arc<Mutex<String>>,
}

impl BufferedFrontEnd {
    /// Creates an empty buffered front end.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything written to the terminal so far.
    pub fn terminal(&self) -> String {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FrontEnd for BufferedFrontEnd {
    fn update_register(&mut self, _name: &str, _reg: &Register) {}

    fn append_terminal(&mut self, text: &str) {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    fn toggle_button(&mut self, _id: &str, _enabled: bool) {}
    fn disable_buttons(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_front_end_accumulates() {
        let fe = BufferedFrontEnd::new();
        let mut sink = fe.clone();
        sink.append_terminal("Found at ");
        sink.append_terminal("sent. 1");
        assert_eq!(fe.terminal(), "Found at sent. 1");
    }
}
