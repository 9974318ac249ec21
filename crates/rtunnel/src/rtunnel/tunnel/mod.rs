pub mod classify;
pub mod error;
pub mod identifier;
pub mod identity;
pub mod keepalive;
pub mod listener;
pub mod reverse;
pub mod server_info;
pub mod session;
pub mod transport;

use tokio::sync::watch;

pub use error::TunnelError;
pub use reverse::{ReverseTunnel, TunnelConfig};

/// Liveness ping; the relay only has to acknowledge it.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

/// Asks the relay to describe itself as a JSON object.
pub const SERVER_INFO_REQUEST: &str = "server-info@rtunnel";

pub const CLIENT_VERSION: &str = concat!("rtunnel-host/", env!("CARGO_PKG_VERSION"));

/// Resolves once `ctx` reports cancellation. A dropped sender can never cancel,
/// so the future then stays pending.
pub async fn cancelled(mut ctx: watch::Receiver<bool>) {
    let res = ctx.wait_for(|c| *c).await.map(|_| ());
    if res.is_err() {
        std::future::pending::<()>().await;
    }
}
