//! Where the terminal renders.

/// Display side of a terminal: the controller writes shell output and
/// inline notices here and asks it for the current size.
pub trait TerminalSurface: Send {
    /// Shell output, passed through verbatim (escape sequences included).
    fn write_output(&mut self, data: &str);

    /// Status line shown inline, e.g. when the shell has exited.
    fn notice(&mut self, message: &str);

    /// Error shown inline.
    fn error(&mut self, message: &str);

    /// Current `(cols, rows)`.
    fn size(&self) -> (u16, u16);
}

/// Collects everything in memory. Notices and errors are rendered into
/// `output` the same way a real terminal would show them.
#[derive(Debug, Clone, Default)]
pub struct BufferSurface {
    pub output: String,
    pub notices: Vec<String>,
    pub errors: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

impl BufferSurface {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            ..Self::default()
        }
    }
}

impl TerminalSurface for BufferSurface {
    fn write_output(&mut self, data: &str) {
        self.output.push_str(data);
    }

    fn notice(&mut self, message: &str) {
        self.output.push_str(&render_notice(message));
        self.notices.push(message.to_string());
    }

    fn error(&mut self, message: &str) {
        self.output.push_str(&render_error(message));
        self.errors.push(message.to_string());
    }

    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

/// Red line on its own row.
pub fn render_notice(message: &str) -> String {
    format!("\r\n\x1b[31m{message}\x1b[0m\r\n")
}

pub fn render_error(message: &str) -> String {
    format!("\r\n\x1b[31mError: {message}\x1b[0m\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_render_in_red() {
        let mut surface = BufferSurface::new(80, 24);
        surface.write_output("$ ");
        surface.notice("Terminal session ended. Creating new session...");
        surface.error("boom");
        assert_eq!(
            surface.output,
            "$ \r\n\x1b[31mTerminal session ended. Creating new session...\x1b[0m\r\n\
             \r\n\x1b[31mError: boom\x1b[0m\r\n"
        );
        assert_eq!(surface.errors, vec!["boom".to_string()]);
        assert_eq!(surface.size(), (80, 24));
    }
}
