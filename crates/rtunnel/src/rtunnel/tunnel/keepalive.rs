use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::Instrument;

use crate::rtunnel::tunnel::{KEEPALIVE_REQUEST, cancelled, session::SecureSession};

/// Handle to a running keepalive loop.
#[derive(Debug)]
pub struct Keepalive {
    task: JoinHandle<()>,
}

/// Pings `session` every `period` until `ctx` is cancelled or the returned
/// handle is shut down. The first ping goes out one period from now.
pub fn spawn(
    session: Arc<dyn SecureSession>,
    period: Duration,
    ctx: watch::Receiver<bool>,
    span: tracing::Span,
) -> Keepalive {
    let task = tokio::spawn(run(session, period, ctx).instrument(span));
    Keepalive { task }
}

impl Keepalive {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop and waits until it has actually exited.
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(session: Arc<dyn SecureSession>, period: Duration, ctx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let stop = cancelled(ctx);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                tracing::debug!("tunnel: keepalive stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = session.send_request(KEEPALIVE_REQUEST, true, &[]).await {
                    tracing::warn!(err = %err, "tunnel: error pinging server");
                }
            }
        }
    }
}
