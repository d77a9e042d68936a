//! Expiration janitor.
//!
//! Background task that scans the store for reservations whose lifetime has
//! run out and injects the matching deletion intents into the engine.
//! Expiry is a pure time check and needs no authorization.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use weft_common::time::now_unix;
use weft_common::ResultState;

use crate::engine::EngineHandle;
use crate::events::DeleteCause;

/// Periodic expiry scanner.
pub struct Janitor {
    handle: EngineHandle,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl Janitor {
    pub fn new(handle: EngineHandle, interval: Duration, shutdown: Arc<Notify>) -> Self {
        Janitor {
            handle,
            interval,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(interval = ?self.interval, "janitor started");
            loop {
                tokio::select! {
                    _ = self.shutdown.notified() => {
                        debug!("janitor shutting down");
                        break;
                    }
                    _ = sleep(self.interval) => self.run_once(),
                }
            }
        })
    }

    fn run_once(&self) {
        let now = now_unix();
        for id in self.handle.store().list_all() {
            let reservation = match self.handle.store().get(&id) {
                Ok(r) => r,
                Err(err) => {
                    warn!(%id, %err, "janitor failed to read reservation");
                    continue;
                }
            };
            if reservation.to_delete
                || reservation.result_state() == Some(ResultState::Deleted)
                || !reservation.is_expired(now)
            {
                continue;
            }
            info!(%id, expires_at = ?reservation.expires_at(), "reservation expired");
            if let Err(err) = self.handle.delete_with_cause(&id, DeleteCause::Expired) {
                warn!(%id, %err, "failed to inject expiry deletion");
            }
        }
    }
}
