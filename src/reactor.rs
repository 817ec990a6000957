//! Reactor loop
//!
//! A single task owns the router's inbound queue. Each cycle it waits for
//! requests (briefly while requests are in flight, longer while idle),
//! hands every request to the blocking pool, applies queued session
//! teardowns and, every `check_state_interval`, looks at the lifecycle
//! state and the time-driven persistence policy.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::server::{Server, ServerState};
use crate::transport::{Inbound, Replier, Router};

/// Decrements `RequestsRunning` even if the handler panics.
struct RunningGuard<'a>(&'a Metrics);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.request_finished();
    }
}

pub(crate) async fn run(server: Arc<Server>, mut router: Router) {
    let config = server.config().clone();
    let cycle_length = config.cycle_length();
    let replier = router.replier();
    let mut last_check = Instant::now();

    info!("reactor started");
    loop {
        let cycle_start = Instant::now();
        let wait = if server.metrics().requests_running() > 0 {
            cycle_length
        } else {
            config.idle_poll_timeout()
        };

        match timeout(wait, router.recv()).await {
            Ok(Some(inbound)) => {
                dispatch(&server, &replier, inbound);
                while let Some(inbound) = router.try_recv() {
                    dispatch(&server, &replier, inbound);
                }
            }
            Ok(None) => {
                warn!("inbound queue closed");
                server.stop();
            }
            Err(_) => {}
        }

        let removed = server.sessions().drain_removals();
        if removed > 0 {
            debug!(removed, "sessions removed");
        }

        if last_check.elapsed() >= config.check_state_interval() {
            last_check = Instant::now();
            if server.state() != ServerState::Running {
                break;
            }
            persist_due(&server).await;
        }

        let elapsed = cycle_start.elapsed();
        if elapsed < cycle_length {
            sleep(cycle_length - elapsed).await;
        }
    }

    shutdown(server, router).await;
}

fn dispatch(server: &Arc<Server>, replier: &Replier, inbound: Inbound) {
    server.metrics().request_started();
    let server = Arc::clone(server);
    let replier = replier.clone();

    tokio::task::spawn_blocking(move || {
        let _running = RunningGuard(server.metrics());
        let reply = server.handle_request(&inbound.identity, &inbound.body);
        replier.send(&inbound.identity, &reply);
    });
}

/// Time-driven persistence sweep.
async fn persist_due(server: &Arc<Server>) {
    let swept = Arc::clone(server);
    let now = Instant::now();
    match tokio::task::spawn_blocking(move || swept.databases().persist_due(now)).await {
        Ok(report) => {
            for name in &report.written {
                debug!(db = %name, "persist interval elapsed, persisted");
            }
            for (name, e) in &report.failed {
                error!(db = %name, error = %e, "interval persist failed");
            }
        }
        Err(e) => error!(error = %e, "persistence sweep panicked"),
    }
}

async fn shutdown(server: Arc<Server>, mut router: Router) {
    info!("stopping, no longer accepting requests");
    router.stop_accepting();

    // requests already queued still get an answer
    let replier = router.replier();
    let mut buffered = 0;
    while let Some(inbound) = router.try_recv() {
        dispatch(&server, &replier, inbound);
        buffered += 1;
    }
    if buffered > 0 {
        debug!(buffered, "dispatched buffered requests");
    }

    let poll = server.config().stop_poll_interval();
    while server.metrics().requests_running() > 0 {
        sleep(poll).await;
    }
    server.sessions().drain_removals();

    let persisting = Arc::clone(&server);
    match tokio::task::spawn_blocking(move || persisting.databases().persist_all()).await {
        Ok(report) => {
            for (name, e) in &report.failed {
                error!(db = %name, error = %e, "persist on shutdown failed");
            }
            info!(written = report.written.len(), failed = report.failed.len(), "databases persisted");
        }
        Err(e) => error!(error = %e, "persist on shutdown panicked"),
    }

    router.close();
    server.mark_stopped();
    info!("server stopped");
}
