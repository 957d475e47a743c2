#![allow(dead_code)]

pub mod dirs;
pub mod harness;
pub mod http_utils;
pub mod net;
pub mod origin;

pub use dirs::TestDirs;
pub use harness::{GatewayHarness, GatewayHarnessBuilder};
pub use http_utils::{HttpResponse, send_get, send_raw};
pub use net::wait_for_listener;
pub use origin::{MockOrigin, MockRoute};
