//! Mode state machine
//!
//! Owns the current [`Mode`] and the single in-flight [`Transition`]. Requests
//! that arrive while a transition runs are rejected, never queued.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, Payload, topics};

use super::setup::{MODE_SOURCE, ModeSetup, SetupError};
use super::types::{Mode, Transition, TransitionRejected};

/// Default bound on mode setup
pub const DEFAULT_TRANSITION_TIMEOUT: Duration = Duration::from_millis(5000);

struct MachineState {
    current: Mode,
    in_flight: Option<Transition>,
}

/// Clears the in-flight marker when a transition ends, including on cancellation
struct InFlightGuard {
    state: Arc<Mutex<MachineState>>,
    id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.in_flight.as_ref().is_some_and(|t| t.id == self.id) {
            state.in_flight = None;
        }
    }
}

pub struct ModeStateMachine {
    bus: Arc<EventBus>,
    setup: Arc<dyn ModeSetup>,
    timeout: Duration,
    state: Arc<Mutex<MachineState>>,
    mode_tx: watch::Sender<Mode>,
}

impl ModeStateMachine {
    pub fn new(bus: Arc<EventBus>, setup: Arc<dyn ModeSetup>, timeout: Duration) -> Self {
        debug!(?timeout, "ModeStateMachine::new: called");
        let (mode_tx, _) = watch::channel(Mode::Idle);
        Self {
            bus,
            setup,
            timeout,
            state: Arc::new(Mutex::new(MachineState {
                current: Mode::Idle,
                in_flight: None,
            })),
            mode_tx,
        }
    }

    pub fn current_mode(&self) -> Mode {
        self.state.lock().current
    }

    /// The transition currently running, if any
    pub fn in_flight(&self) -> Option<Transition> {
        self.state.lock().in_flight.clone()
    }

    /// Receiver notified after every completed transition
    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }

    /// Move to `to_mode`
    ///
    /// Returns the finished transition (completed or failed) when the request was
    /// accepted. A rejected request publishes nothing and changes nothing.
    pub async fn request_transition(&self, to_mode: Mode) -> Result<Transition, TransitionRejected> {
        debug!(%to_mode, "ModeStateMachine::request_transition: called");
        let (transition, guard) = self.begin(to_mode)?;
        Ok(self.run(transition, guard).await)
    }

    /// Accept or reject `to_mode` immediately and run an accepted transition on its own task
    ///
    /// Bus handlers use this so the topic they are serving is not held for the
    /// whole setup step.
    pub fn spawn_transition(self: &Arc<Self>, to_mode: Mode) -> Result<JoinHandle<Transition>, TransitionRejected> {
        debug!(%to_mode, "ModeStateMachine::spawn_transition: called");
        let (transition, guard) = self.begin(to_mode)?;
        let machine = self.clone();
        Ok(tokio::spawn(async move { machine.run(transition, guard).await }))
    }

    /// Check the request and mark it in flight
    fn begin(&self, to_mode: Mode) -> Result<(Transition, InFlightGuard), TransitionRejected> {
        let mut state = self.state.lock();
        if let Some(running) = &state.in_flight {
            debug!(from = %running.from_mode, to = %running.to_mode, "ModeStateMachine::begin: busy");
            return Err(TransitionRejected::InProgress {
                from: running.from_mode,
                to: running.to_mode,
            });
        }
        if state.current == to_mode {
            debug!(%to_mode, "ModeStateMachine::begin: already in mode");
            return Err(TransitionRejected::AlreadyInMode { mode: to_mode });
        }
        let transition = Transition::start(state.current, to_mode);
        state.in_flight = Some(transition.clone());
        let guard = InFlightGuard {
            state: self.state.clone(),
            id: transition.id,
        };
        Ok((transition, guard))
    }

    /// The marker is cleared only after the last event of the transition is published
    async fn run(&self, transition: Transition, guard: InFlightGuard) -> Transition {
        let to_mode = transition.to_mode;
        info!(id = %transition.id, from = %transition.from_mode, to = %to_mode, "Mode transition started");
        self.publish_transition(&transition).await;

        let outcome = match tokio::time::timeout(
            self.timeout,
            self.setup.prepare(transition.from_mode, transition.to_mode),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SetupError::Timeout),
        };

        let finished = match outcome {
            Ok(()) => {
                self.state.lock().current = to_mode;
                self.mode_tx.send_replace(to_mode);

                let completed = transition.completed();
                info!(id = %completed.id, mode = %to_mode, "Mode transition completed");
                self.publish_transition(&completed).await;

                let mut change = Payload::new();
                change.insert("previous_mode".to_string(), json!(completed.from_mode));
                change.insert("current_mode".to_string(), json!(to_mode));
                self.bus
                    .publish_from(topics::SYSTEM_MODE_CHANGE, MODE_SOURCE, change)
                    .await;
                completed
            }
            Err(e) => {
                let failed = transition.failed(e.to_string());
                warn!(id = %failed.id, to = %to_mode, error = %e, "Mode transition failed");
                self.publish_transition(&failed).await;
                failed
            }
        };
        drop(guard);
        finished
    }

    async fn publish_transition(&self, transition: &Transition) {
        let mut payload = Payload::new();
        payload.insert("transition_id".to_string(), json!(transition.id.to_string()));
        payload.insert("from_mode".to_string(), json!(transition.from_mode));
        payload.insert("to_mode".to_string(), json!(transition.to_mode));
        payload.insert("status".to_string(), json!(transition.status));
        if let Some(error) = &transition.error {
            payload.insert("error".to_string(), json!(error));
        }
        self.bus
            .publish_from(topics::MODE_TRANSITION, MODE_SOURCE, payload)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, handler_fn};
    use crate::mode::TransitionStatus;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Setup that succeeds immediately
    struct Instant;

    #[async_trait]
    impl ModeSetup for Instant {
        async fn prepare(&self, _from: Mode, _to: Mode) -> Result<(), SetupError> {
            Ok(())
        }
    }

    /// Setup that never answers
    struct Hang;

    #[async_trait]
    impl ModeSetup for Hang {
        async fn prepare(&self, _from: Mode, _to: Mode) -> Result<(), SetupError> {
            std::future::pending().await
        }
    }

    /// Setup that waits until released
    struct Gate(Arc<Notify>);

    #[async_trait]
    impl ModeSetup for Gate {
        async fn prepare(&self, _from: Mode, _to: Mode) -> Result<(), SetupError> {
            self.0.notified().await;
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl ModeSetup for Broken {
        async fn prepare(&self, _from: Mode, _to: Mode) -> Result<(), SetupError> {
            Err(SetupError::collaborator("led", "strip disconnected"))
        }
    }

    fn machine(setup: Arc<dyn ModeSetup>) -> (Arc<EventBus>, Arc<ModeStateMachine>) {
        let bus = Arc::new(EventBus::default());
        let machine = Arc::new(ModeStateMachine::new(bus.clone(), setup, DEFAULT_TRANSITION_TIMEOUT));
        (bus, machine)
    }

    fn statuses(events: &[Event]) -> Vec<(String, Option<String>)> {
        events
            .iter()
            .filter(|e| e.topic == topics::MODE_TRANSITION)
            .map(|e| {
                (
                    e.str_field("status").unwrap_or_default().to_string(),
                    e.str_field("error").map(str::to_string),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_successful_transition_event_order() {
        let (bus, machine) = machine(Arc::new(Instant));

        let report = machine.request_transition(Mode::Ambient).await.unwrap();

        assert_eq!(report.status, TransitionStatus::Completed);
        assert_eq!(machine.current_mode(), Mode::Ambient);
        assert!(machine.in_flight().is_none());

        let events = bus.snapshot(None).unwrap();
        let order: Vec<&str> = events.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(
            order,
            vec![topics::MODE_TRANSITION, topics::MODE_TRANSITION, topics::SYSTEM_MODE_CHANGE]
        );
        assert_eq!(events[0].str_field("status"), Some("started"));
        assert_eq!(events[1].str_field("status"), Some("completed"));
        assert_eq!(events[0].str_field("transition_id"), events[1].str_field("transition_id"));
        assert_eq!(events[2].str_field("previous_mode"), Some("idle"));
        assert_eq!(events[2].str_field("current_mode"), Some("ambient"));
    }

    #[tokio::test]
    async fn test_in_flight_is_held_until_terminal_events_are_published() {
        let (bus, machine) = machine(Arc::new(Instant));
        let held = Arc::new(Mutex::new(Vec::new()));
        for topic in [topics::MODE_TRANSITION, topics::SYSTEM_MODE_CHANGE] {
            let machine = machine.clone();
            let held = held.clone();
            bus.subscribe(
                topic,
                handler_fn(move |_event: Event| {
                    let busy = machine.in_flight().is_some();
                    let held = held.clone();
                    async move {
                        held.lock().push(busy);
                        Ok(())
                    }
                }),
            );
        }

        machine.request_transition(Mode::Ambient).await.unwrap();

        assert_eq!(*held.lock(), vec![true, true, true]);
        assert!(machine.in_flight().is_none());
    }

    #[tokio::test]
    async fn test_spawned_transition_decides_before_returning() {
        let gate = Arc::new(Notify::new());
        let (_bus, machine) = machine(Arc::new(Gate(gate.clone())));

        let running = machine.spawn_transition(Mode::Ambient).unwrap();
        assert_eq!(machine.in_flight().map(|t| t.to_mode), Some(Mode::Ambient));

        let rejected = machine.spawn_transition(Mode::Interactive).unwrap_err();
        assert_eq!(rejected.code(), "transition_in_progress");
        let rejected = machine.spawn_transition(Mode::Idle).unwrap_err();
        assert_eq!(rejected.code(), "transition_in_progress");

        gate.notify_one();
        let report = running.await.unwrap();
        assert_eq!(report.status, TransitionStatus::Completed);
        assert_eq!(machine.current_mode(), Mode::Ambient);
        assert!(machine.in_flight().is_none());
    }

    #[tokio::test]
    async fn test_aborted_spawned_transition_clears_in_flight() {
        let gate = Arc::new(Notify::new());
        let (_bus, machine) = machine(Arc::new(Gate(gate)));

        let running = machine.spawn_transition(Mode::Ambient).unwrap();
        running.abort();
        let _ = running.await;

        assert!(machine.in_flight().is_none());
        assert_eq!(machine.current_mode(), Mode::Idle);
    }

    #[tokio::test]
    async fn test_same_mode_is_rejected_without_events() {
        let (bus, machine) = machine(Arc::new(Instant));

        let rejected = machine.request_transition(Mode::Idle).await.unwrap_err();

        assert_eq!(rejected, TransitionRejected::AlreadyInMode { mode: Mode::Idle });
        assert_eq!(rejected.reason(), "already in target mode");
        assert_eq!(bus.last_sequence_id(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_accept_exactly_one() {
        let gate = Arc::new(Notify::new());
        let (bus, machine) = machine(Arc::new(Gate(gate.clone())));

        let first = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.request_transition(Mode::Ambient).await })
        };
        while machine.in_flight().is_none() {
            tokio::task::yield_now().await;
        }

        let second = machine.request_transition(Mode::Interactive).await;
        assert_eq!(
            second.unwrap_err(),
            TransitionRejected::InProgress {
                from: Mode::Idle,
                to: Mode::Ambient
            }
        );

        gate.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.status, TransitionStatus::Completed);
        assert_eq!(machine.current_mode(), Mode::Ambient);

        let started = statuses(&bus.snapshot(None).unwrap())
            .into_iter()
            .filter(|(s, _)| s == "started")
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_in_flight_check_precedes_same_mode_check() {
        let gate = Arc::new(Notify::new());
        let (_bus, machine) = machine(Arc::new(Gate(gate.clone())));

        let running = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.request_transition(Mode::Ambient).await })
        };
        while machine.in_flight().is_none() {
            tokio::task::yield_now().await;
        }

        let rejected = machine.request_transition(Mode::Idle).await.unwrap_err();
        assert_eq!(rejected.code(), "transition_in_progress");

        gate.notify_one();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout_fails_transition() {
        let (bus, machine) = machine(Arc::new(Hang));

        let report = machine.request_transition(Mode::Interactive).await.unwrap();

        assert_eq!(report.status, TransitionStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("timeout"));
        assert_eq!(machine.current_mode(), Mode::Idle);
        assert!(machine.in_flight().is_none());

        let events = bus.snapshot(None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            statuses(&events),
            vec![
                ("started".to_string(), None),
                ("failed".to_string(), Some("timeout".to_string()))
            ]
        );
    }

    #[tokio::test]
    async fn test_collaborator_error_fails_transition() {
        let (bus, machine) = machine(Arc::new(Broken));

        let report = machine.request_transition(Mode::Ambient).await.unwrap();

        assert_eq!(report.error.as_deref(), Some("led: strip disconnected"));
        assert_eq!(machine.current_mode(), Mode::Idle);
        assert!(
            bus.snapshot(None)
                .unwrap()
                .iter()
                .all(|e| e.topic != topics::SYSTEM_MODE_CHANGE)
        );

        // A failed transition does not block the next request
        assert!(machine.request_transition(Mode::Ambient).await.is_ok());
        assert_eq!(bus.last_sequence_id(), 4);
    }

    #[tokio::test]
    async fn test_mode_watch_sees_completed_transition() {
        let (_bus, machine) = machine(Arc::new(Instant));
        let mut rx = machine.subscribe_mode();

        machine.request_transition(Mode::Interactive).await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Mode::Interactive);
    }

    #[tokio::test]
    async fn test_cancelled_transition_clears_in_flight() {
        let gate = Arc::new(Notify::new());
        let (_bus, machine) = machine(Arc::new(Gate(gate)));

        let running = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.request_transition(Mode::Ambient).await })
        };
        while machine.in_flight().is_none() {
            tokio::task::yield_now().await;
        }
        running.abort();
        let _ = running.await;

        assert!(machine.in_flight().is_none());
        assert_eq!(machine.current_mode(), Mode::Idle);
    }
}
