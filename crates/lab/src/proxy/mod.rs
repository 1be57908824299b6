//! Subdomain proxy: `<session>--<port>.<base-domain>` to container traffic.

mod host;
mod server;
mod table;
mod websocket;

pub use host::{parse_host, HostParseError};
pub use server::{proxy_router, ProxyState};
pub use table::{RegisteredContainer, RouteInfo, RouteTable, Upstream};
