//
// src/proxy/mod.rs
//
mod backend;
mod pool;
mod proxy;

pub use backend::Backend;
pub use pool::{is_backend_alive, BackendPool};
pub use proxy::{Proxy, ProxyError};
