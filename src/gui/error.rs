use std::io;

/// Failures of the terminal UI.
#[derive(Debug, thiserror::Error)]
pub enum GuiError {
    /// Terminal setup, drawing or input failed.
    #[error("terminal I/O failed: {0}")]
    Io(#[from] io::Error),
    /// Two socks cannot be chosen from fewer than two ports.
    #[error("need at least two ports to choose from, found {0}")]
    NotEnoughPorts(usize),
}
