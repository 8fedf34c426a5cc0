//! The `utils` module provides the pieces shared by the broker and the client
//! runtime: the error taxonomy and logging setup.

pub mod error;
pub mod logging;
