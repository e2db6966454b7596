pub mod config;
pub mod error;
pub mod hub;
pub mod identity;
pub mod pager;
pub mod registry;
pub mod rest;
pub mod rpc;
pub mod server;

pub use config::{load_settings, AuthMode, IgnoredOverride, ServerConfig, Settings};
pub use hub::EventHub;
pub use pager::{HistoryPager, Page, PAGE_SIZE};
pub use registry::{Connection, ConnectionRegistry, ConnectionState};
pub use server::{build_router, start, AppState, ServerHandle};
