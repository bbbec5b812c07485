//! Volume Event Notification
//!
//! Components signal each other through triggers: the config watcher after a
//! reload, the orphan reconciler after a cleanup, and so on. Triggers go into
//! a bounded queue; a dispatcher task drains it, coalesces bursts of the same
//! trigger, and broadcasts the result to every subscriber.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Triggers
// =============================================================================

/// What caused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    Dummy,
    ConfigModify,
    LvmCheck,
    CleanupOrphan,
    LogicVolumeController,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Dummy => write!(f, "dummy"),
            Trigger::ConfigModify => write!(f, "configModify"),
            Trigger::LvmCheck => write!(f, "lvmCheck"),
            Trigger::CleanupOrphan => write!(f, "cleanupOrphan"),
            Trigger::LogicVolumeController => write!(f, "logicVolumeController"),
        }
    }
}

/// A trigger and when it fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEvent {
    pub trigger: Trigger,
    pub trigger_at: DateTime<Utc>,
}

impl VolumeEvent {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            trigger_at: Utc::now(),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Notification settings
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Pending triggers the queue holds before dropping new ones
    pub queue_capacity: usize,
    /// Buffered events per subscriber
    pub subscriber_capacity: usize,
    /// Minimum time between two dispatches of the same trigger
    pub min_interval: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            subscriber_capacity: 64,
            min_interval: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Event Queue
// =============================================================================

/// Handle for sending triggers and subscribing to dispatched events
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: mpsc::Sender<VolumeEvent>,
    broadcaster: broadcast::Sender<VolumeEvent>,
}

impl EventQueue {
    /// Enqueue a trigger. A full queue drops the trigger: one of the same
    /// kind is already waiting and will be coalesced with it anyway.
    pub fn send(&self, trigger: Trigger) -> Result<()> {
        match self.sender.try_send(VolumeEvent::new(trigger)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event queue full, dropping {}", trigger);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::EventQueueClosed),
        }
    }

    /// Receive every event dispatched from now on
    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.broadcaster.subscribe()
    }
}

// =============================================================================
// Coalescing
// =============================================================================

/// Per-trigger rate limit. The first event of a trigger passes; further
/// events inside the window collapse into one that fires when it closes.
#[derive(Debug, Default)]
struct Coalescer {
    min_interval: Duration,
    last_dispatch: HashMap<Trigger, Instant>,
    pending: HashMap<Trigger, VolumeEvent>,
}

impl Coalescer {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            ..Default::default()
        }
    }

    /// Event to dispatch right away, if any
    fn accept(&mut self, event: VolumeEvent, now: Instant) -> Option<VolumeEvent> {
        match self.last_dispatch.get(&event.trigger) {
            Some(last) if now.duration_since(*last) < self.min_interval => {
                debug!("Coalescing {} event", event.trigger);
                self.pending.insert(event.trigger, event);
                None
            }
            _ => {
                self.last_dispatch.insert(event.trigger, now);
                Some(event)
            }
        }
    }

    /// Pending events whose window has closed
    fn due(&mut self, now: Instant) -> Vec<VolumeEvent> {
        let ready: Vec<Trigger> = self
            .pending
            .keys()
            .filter(|t| {
                self.last_dispatch
                    .get(*t)
                    .map(|last| now.duration_since(*last) >= self.min_interval)
                    .unwrap_or(true)
            })
            .copied()
            .collect();

        let mut events = Vec::with_capacity(ready.len());
        for trigger in ready {
            if let Some(event) = self.pending.remove(&trigger) {
                self.last_dispatch.insert(trigger, now);
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.trigger_at);
        events
    }

    /// When the earliest pending event becomes due
    fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .keys()
            .filter_map(|t| self.last_dispatch.get(t).map(|last| *last + self.min_interval))
            .min()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Drains the event queue and fans events out to subscribers
pub struct EventDispatcher {
    receiver: mpsc::Receiver<VolumeEvent>,
    broadcaster: broadcast::Sender<VolumeEvent>,
    coalescer: Coalescer,
}

impl EventDispatcher {
    /// Create a dispatcher and the queue feeding it
    pub fn new(config: NotifyConfig) -> (Self, EventQueue) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (broadcaster, _) = broadcast::channel(config.subscriber_capacity.max(1));
        let queue = EventQueue {
            sender,
            broadcaster: broadcaster.clone(),
        };
        let dispatcher = Self {
            receiver,
            broadcaster,
            coalescer: Coalescer::new(config.min_interval),
        };
        (dispatcher, queue)
    }

    fn dispatch(&self, event: VolumeEvent) {
        debug!("Dispatching {} event", event.trigger);
        // No subscribers is not an error
        let _ = self.broadcaster.send(event);
    }

    /// Run until shutdown or until every queue handle is dropped
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Event dispatcher started");
        loop {
            let deadline = self.coalescer.next_deadline();
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Some(event) => {
                        if let Some(event) = self.coalescer.accept(event, Instant::now()) {
                            self.dispatch(event);
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    for event in self.coalescer.due(Instant::now()) {
                        self.dispatch(event);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Event dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_names() {
        assert_eq!(Trigger::ConfigModify.to_string(), "configModify");
        assert_eq!(Trigger::LogicVolumeController.to_string(), "logicVolumeController");
        assert_eq!(
            serde_json::to_string(&Trigger::CleanupOrphan).unwrap(),
            "\"cleanupOrphan\""
        );
    }

    #[test]
    fn test_coalescer_collapses_bursts() {
        let mut coalescer = Coalescer::new(Duration::from_secs(1));
        let start = Instant::now();

        assert!(coalescer.accept(VolumeEvent::new(Trigger::LvmCheck), start).is_some());
        assert!(coalescer.accept(VolumeEvent::new(Trigger::LvmCheck), start).is_none());
        assert!(coalescer.accept(VolumeEvent::new(Trigger::LvmCheck), start).is_none());
        // Other triggers are limited independently
        assert!(coalescer.accept(VolumeEvent::new(Trigger::CleanupOrphan), start).is_some());

        assert!(coalescer.due(start + Duration::from_millis(500)).is_empty());
        assert_eq!(coalescer.next_deadline(), Some(start + Duration::from_secs(1)));

        let due = coalescer.due(start + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].trigger, Trigger::LvmCheck);
        assert!(coalescer.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_delivers_and_stops() {
        let (dispatcher, queue) = EventDispatcher::new(NotifyConfig::default());
        let mut events = queue.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(dispatcher.run(shutdown_rx));

        queue.send(Trigger::ConfigModify).unwrap();
        queue.send(Trigger::ConfigModify).unwrap();

        assert_eq!(events.recv().await.unwrap().trigger, Trigger::ConfigModify);
        // The second one arrives after the window
        assert_eq!(events.recv().await.unwrap().trigger, Trigger::ConfigModify);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(matches!(queue.send(Trigger::Dummy), Err(Error::EventQueueClosed)));
    }
}
