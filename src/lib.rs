//! Enforcement between a language model's raw output and what a user may export.
//!
//! Generation-time enforcement lives in [`enforcement`], post-hoc audit passes in [`audit`], and the
//! fail-closed export decision in [`gate`]. [`store`] persists every result.

pub mod audit;
pub mod collaborators;
pub mod config;
pub mod enforcement;
pub mod gate;
pub mod model;
pub mod store;
pub mod text;
pub mod util;
