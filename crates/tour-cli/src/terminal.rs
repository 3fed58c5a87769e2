//! Local terminal: raw mode, size, key translation, and the stdout surface.

use std::io::Write;

use anyhow::{Context, Result};
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tour_client::surface::{render_error, render_notice};
use tour_client::TerminalSurface;
use tour_core::{DEFAULT_COLS, DEFAULT_ROWS};
use tracing::warn;

/// Raw mode for as long as the guard lives.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enter() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// `(cols, rows)`, or 80x24 when stdout is not a terminal.
pub fn terminal_size() -> (u16, u16) {
    terminal::size().unwrap_or((DEFAULT_COLS, DEFAULT_ROWS))
}

/// Writes shell output straight to stdout.
pub struct StdoutSurface {
    out: std::io::Stdout,
}

impl StdoutSurface {
    pub fn new() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }

    fn emit(&mut self, text: &str) {
        let mut out = self.out.lock();
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            warn!(error = %e, "stdout write failed");
        }
    }
}

impl Default for StdoutSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSurface for StdoutSurface {
    fn write_output(&mut self, data: &str) {
        self.emit(data);
    }

    fn notice(&mut self, message: &str) {
        self.emit(&render_notice(message));
    }

    fn error(&mut self, message: &str) {
        self.emit(&render_error(message));
    }

    fn size(&self) -> (u16, u16) {
        terminal_size()
    }
}

/// Ctrl+] leaves the session running and exits.
pub fn is_detach_key(event: &KeyEvent) -> bool {
    event.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(event.code, KeyCode::Char(']') | KeyCode::Char('5'))
}

/// What a key press sends to the shell, as terminal input.
pub fn key_to_input(event: &KeyEvent) -> Option<String> {
    if event.kind == KeyEventKind::Release {
        return None;
    }
    let seq = match event.code {
        KeyCode::Char(c) if event.modifiers.contains(KeyModifiers::CONTROL) => {
            if c.is_ascii_alphabetic() {
                // Ctrl+A = 0x01 ... Ctrl+Z = 0x1a
                let byte = c.to_ascii_lowercase() as u8 - b'a' + 1;
                return Some((byte as char).to_string());
            }
            match c {
                ' ' | '@' => "\x00",
                '[' => "\x1b",
                '\\' => "\x1c",
                '^' => "\x1e",
                '_' => "\x1f",
                _ => return None,
            }
        }
        KeyCode::Char(c) if event.modifiers.contains(KeyModifiers::ALT) => {
            return Some(format!("\x1b{c}"));
        }
        KeyCode::Char(c) => return Some(c.to_string()),
        KeyCode::Enter => "\r",
        KeyCode::Backspace => "\x7f",
        KeyCode::Tab => "\t",
        KeyCode::BackTab => "\x1b[Z",
        KeyCode::Esc => "\x1b",
        KeyCode::Up => "\x1b[A",
        KeyCode::Down => "\x1b[B",
        KeyCode::Right => "\x1b[C",
        KeyCode::Left => "\x1b[D",
        KeyCode::Home => "\x1b[H",
        KeyCode::End => "\x1b[F",
        KeyCode::PageUp => "\x1b[5~",
        KeyCode::PageDown => "\x1b[6~",
        KeyCode::Insert => "\x1b[2~",
        KeyCode::Delete => "\x1b[3~",
        KeyCode::F(n) => match n {
            1 => "\x1bOP",
            2 => "\x1bOQ",
            3 => "\x1bOR",
            4 => "\x1bOS",
            5 => "\x1b[15~",
            6 => "\x1b[17~",
            7 => "\x1b[18~",
            8 => "\x1b[19~",
            9 => "\x1b[20~",
            10 => "\x1b[21~",
            11 => "\x1b[23~",
            12 => "\x1b[24~",
            _ => return None,
        },
        _ => return None,
    };
    Some(seq.to_string())
}
