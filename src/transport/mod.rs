pub mod message;
pub mod server;

#[cfg(test)]
mod tests;

pub use message::{ClientMessage, ServerMessage};
pub use server::{bind, serve};
