pub mod codec;
pub mod respond;
pub mod server;

pub use server::{handle_http, serve_connection};
