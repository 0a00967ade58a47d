//! DJ Automation Scheduler
//!
//! While active, asks the music service for the next track every
//! `transition_duration`. Ticks are ordinary `music` commands submitted through
//! the gateway, exactly like a dashboard click.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventBus, Payload, topics};
use crate::gateway::{self, SchemaGateway, ValidationError};

/// Source recorded for commands and status published by the scheduler
pub const DJ_SOURCE: &str = "dj";

pub const DEFAULT_TRANSITION_DURATION: Duration = Duration::from_secs(30);

/// Snapshot of the scheduler state, as published on `dj_status`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DjStatus {
    pub active: bool,
    /// Seconds between automatic transitions
    pub transition_duration: f64,
}

struct RunningLoop {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct DjScheduler {
    bus: Arc<EventBus>,
    gateway: SchemaGateway,
    running: Mutex<Option<RunningLoop>>,
    duration_tx: watch::Sender<Duration>,
    /// Held for the whole of a tick so ticks of successive activations never overlap
    tick_lock: Arc<tokio::sync::Mutex<()>>,
}

impl DjScheduler {
    pub fn new(bus: Arc<EventBus>, gateway: SchemaGateway, transition_duration: Duration) -> Self {
        debug!(?transition_duration, "DjScheduler::new: called");
        let (duration_tx, _) = watch::channel(transition_duration);
        Self {
            bus,
            gateway,
            running: Mutex::new(None),
            duration_tx,
            tick_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn is_active(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn transition_duration(&self) -> Duration {
        *self.duration_tx.borrow()
    }

    pub fn status(&self) -> DjStatus {
        DjStatus {
            active: self.is_active(),
            transition_duration: self.transition_duration().as_secs_f64(),
        }
    }

    /// Begin automatic transitions; false if already active
    pub async fn start(&self) -> bool {
        debug!("DjScheduler::start: called");
        {
            let mut running = self.running.lock();
            if running.is_some() {
                debug!("DjScheduler::start: already active");
                return false;
            }
            let (stop_tx, stop_rx) = oneshot::channel();
            let task = tokio::spawn(run_loop(
                self.bus.clone(),
                self.gateway.clone(),
                self.duration_tx.subscribe(),
                self.tick_lock.clone(),
                stop_rx,
            ));
            *running = Some(RunningLoop { stop_tx, task });
        }
        info!(transition_duration = ?self.transition_duration(), "DJ automation started");
        self.publish_status().await;
        true
    }

    /// Cancel the pending timer; a tick already running completes. False if inactive
    pub async fn stop(&self) -> bool {
        debug!("DjScheduler::stop: called");
        let Some(running) = self.running.lock().take() else {
            debug!("DjScheduler::stop: not active");
            return false;
        };
        // The loop may already be gone if its runtime shut down
        let _ = running.stop_tx.send(());
        drop(running.task);
        info!("DJ automation stopped");
        self.publish_status().await;
        true
    }

    /// Change the period; the timer already running keeps its original period
    pub async fn set_transition_duration(&self, duration: Duration) {
        debug!(?duration, "DjScheduler::set_transition_duration: called");
        self.duration_tx.send_replace(duration);
        self.publish_status().await;
    }

    /// Request the next track now without touching the timer
    pub async fn skip(&self) -> Result<u64, ValidationError> {
        debug!("DjScheduler::skip: called");
        submit_next(&self.gateway, &self.bus).await
    }

    async fn publish_status(&self) {
        let status = self.status();
        let mut payload = Payload::new();
        payload.insert("active".to_string(), json!(status.active));
        payload.insert("transition_duration".to_string(), json!(status.transition_duration));
        self.bus.publish_from(topics::DJ_STATUS, DJ_SOURCE, payload).await;
    }
}

impl Drop for DjScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.task.abort();
        }
    }
}

async fn submit_next(gateway: &SchemaGateway, bus: &EventBus) -> Result<u64, ValidationError> {
    let mut raw = Payload::new();
    raw.insert("action".to_string(), json!("next"));
    raw.insert("source".to_string(), json!(DJ_SOURCE));
    gateway::submit(gateway, bus, "music", &raw).await
}

async fn run_loop(
    bus: Arc<EventBus>,
    gateway: SchemaGateway,
    mut duration_rx: watch::Receiver<Duration>,
    tick_lock: Arc<tokio::sync::Mutex<()>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        let period = *duration_rx.borrow_and_update();
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = tokio::time::sleep(period) => {}
        }

        let _tick = tick_lock.lock().await;
        match submit_next(&gateway, &bus).await {
            Ok(sequence_id) => debug!(sequence_id, "run_loop: requested next track"),
            Err(e) => warn!(error = %e, "DJ tick rejected"),
        }
    }
    debug!("run_loop: exiting");
}
