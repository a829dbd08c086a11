pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod handler;
pub mod logger;
pub mod pool;
pub mod route;
pub mod server;
pub mod util;

// Re-export commonly used types
pub use cache::{cache_key_bytes, cache_key_str, CacheKey, ExpireCache};
pub use config::Config;
pub use context::RequestCtx;
pub use error::{FasthttpdError, FasthttpdResult};
pub use filter::{new_filter, register_filter_type, unregister_filter_type, Filter};
pub use handler::{
    new_handler, register_handler_type, unregister_handler_type, EngineError, Handler,
    HostHandler, VirtualHandler,
};
pub use logger::{accesslog::AccessLog, Logger};
pub use route::{RouteResult, Routes};
pub use server::Server;
