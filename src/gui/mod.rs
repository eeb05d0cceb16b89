//! Terminal user interface pieces.

mod error;
mod port_selector;

pub use error::GuiError;
pub use port_selector::{port_selector, TuiPortSelector};
