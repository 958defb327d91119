//! Async session driver.
//!
//! Runs a [`PlaybackEngine`] on a tokio task against the tokio clock. Each
//! loop iteration fires due deadlines, publishes status and events, then
//! waits on whichever comes first: a command or the engine's next deadline.
//! The sleep is rebuilt from the engine every iteration, so no timer outlives
//! the transition that made it obsolete.

use crate::collector::ParticipantInput;
use crate::engine::{PlaybackEngine, PlaybackEvent, PlaybackState, PlaybackStatus};
use crate::monitor::SessionReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use trialflow_core::{CoreError, CoreResult, Millis, SessionId, SessionTime};
use trialflow_plan::Timeline;

/// Operator or participant action sent to a running session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Freeze the session
    Pause,
    /// Continue a paused session
    Resume,
    /// End the live step
    Skip,
    /// End the session
    Stop,
    /// Participant input
    Input(ParticipantInput),
}

/// Handle to a session running on a tokio task
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<PlaybackStatus>,
    events: mpsc::UnboundedReceiver<PlaybackEvent>,
    task: JoinHandle<Option<SessionReport>>,
}

impl SessionHandle {
    /// Session ID
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Send a command
    ///
    /// # Errors
    ///
    /// Returns error if the session has already ended
    pub fn send(&self, command: SessionCommand) -> CoreResult<()> {
        self.commands.send(command).map_err(|_| CoreError::Cancelled)
    }

    /// Pause the session
    ///
    /// # Errors
    ///
    /// Returns error if the session has already ended
    pub fn pause(&self) -> CoreResult<()> {
        self.send(SessionCommand::Pause)
    }

    /// Resume the session
    ///
    /// # Errors
    ///
    /// Returns error if the session has already ended
    pub fn resume(&self) -> CoreResult<()> {
        self.send(SessionCommand::Resume)
    }

    /// Skip the live step
    ///
    /// # Errors
    ///
    /// Returns error if the session has already ended
    pub fn skip(&self) -> CoreResult<()> {
        self.send(SessionCommand::Skip)
    }

    /// Stop the session
    ///
    /// # Errors
    ///
    /// Returns error if the session has already ended
    pub fn stop(&self) -> CoreResult<()> {
        self.send(SessionCommand::Stop)
    }

    /// Forward participant input
    ///
    /// # Errors
    ///
    /// Returns error if the session has already ended
    pub fn input(&self, input: ParticipantInput) -> CoreResult<()> {
        self.send(SessionCommand::Input(input))
    }

    /// Latest published status
    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified on every status change
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    /// Next playback event; `None` once the session has ended and all
    /// events are drained
    pub async fn next_event(&mut self) -> Option<PlaybackEvent> {
        self.events.recv().await
    }

    /// Wait for the session to end
    ///
    /// # Errors
    ///
    /// Returns error if the session task panicked or was aborted
    pub async fn join(self) -> CoreResult<Option<SessionReport>> {
        self.task.await.map_err(|e| CoreError::Internal {
            message: format!("session task failed: {}", e),
        })
    }
}

/// Start `timeline` on `engine` and drive it on a new tokio task
///
/// The session clock's origin is the moment of this call.
///
/// # Errors
///
/// Returns error if the engine already has a live session
pub fn spawn_session(
    mut engine: PlaybackEngine,
    timeline: impl Into<Arc<Timeline>>,
) -> CoreResult<SessionHandle> {
    let origin = Instant::now();
    let session_id = engine.start(timeline, SessionTime::zero())?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(engine.status(SessionTime::zero()));
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(drive(engine, origin, command_rx, status_tx, event_tx));

    Ok(SessionHandle {
        session_id,
        commands: command_tx,
        status: status_rx,
        events: event_rx,
        task,
    })
}

async fn drive(
    mut engine: PlaybackEngine,
    origin: Instant,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    status: watch::Sender<PlaybackStatus>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) -> Option<SessionReport> {
    loop {
        let now = session_time(origin);
        engine.poll(now);
        publish(&mut engine, now, &status, &events);

        if engine.state() == PlaybackState::Completed {
            let report = engine.stop(now);
            publish(&mut engine, now, &status, &events);
            return report;
        }

        let deadline = engine.next_deadline();
        tokio::select! {
            command = commands.recv() => {
                let now = session_time(origin);
                let Some(command) = command else {
                    tracing::debug!("session handle dropped");
                    let report = engine.stop(now);
                    publish(&mut engine, now, &status, &events);
                    return report;
                };
                if command == SessionCommand::Stop {
                    let report = engine.stop(now);
                    publish(&mut engine, now, &status, &events);
                    return report;
                }
                apply(&mut engine, command, now);
            }
            () = wait_until(origin, deadline) => {}
        }
    }
}

fn apply(engine: &mut PlaybackEngine, command: SessionCommand, now: SessionTime) {
    let applied = match command {
        SessionCommand::Pause => engine.pause(now),
        SessionCommand::Resume => engine.resume(now),
        SessionCommand::Skip => engine.skip(now),
        SessionCommand::Input(input) => engine.input(input, now),
        SessionCommand::Stop => engine.stop(now).is_some(),
    };
    tracing::trace!(applied, %now, "command handled");
}

fn publish(
    engine: &mut PlaybackEngine,
    now: SessionTime,
    status: &watch::Sender<PlaybackStatus>,
    events: &mpsc::UnboundedSender<PlaybackEvent>,
) {
    for event in engine.drain_events() {
        // receiver may be gone; the session keeps running regardless
        let _ = events.send(event);
    }
    status.send_if_modified(|current| {
        let next = engine.status(now);
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn wait_until(origin: Instant, deadline: Option<SessionTime>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(origin + Duration::from_millis(deadline.as_millis())).await,
        None => std::future::pending().await,
    }
}

fn session_time(origin: Instant) -> SessionTime {
    SessionTime::from_millis(Millis::from(origin.elapsed()).as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EndReason, EngineConfig};
    use crate::monitor::SessionOutcome;
    use serde_json::json;
    use trialflow_plan::{Node, Step, StepOrigin};

    fn stimulus(id: &str, duration: u64) -> Node {
        serde_json::from_value(json!({ "id": id, "type": "stimulus", "data": { "duration": duration } })).unwrap()
    }

    fn timeline(nodes: Vec<Node>) -> Timeline {
        Timeline::new(nodes.into_iter().map(|n| Step::new(vec![n], StepOrigin::Trivial)).collect())
    }

    async fn drain(handle: &mut SessionHandle) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    fn end_reasons(events: &[PlaybackEvent]) -> Vec<EndReason> {
        events
            .iter()
            .filter_map(|e| match e {
                PlaybackEvent::StepEnded { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_plays_to_completion() {
        let engine = PlaybackEngine::new(EngineConfig::default());
        let mut handle = spawn_session(engine, timeline(vec![stimulus("a", 1000), stimulus("b", 1500)])).unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(end_reasons(&events), vec![EndReason::TimerElapsed, EndReason::TimerElapsed]);
        assert!(matches!(events.last(), Some(PlaybackEvent::Completed { .. })));

        let report = handle.join().await.unwrap().unwrap();
        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.ended_at, SessionTime::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_keep_remaining_time() {
        let handle = spawn_session(PlaybackEngine::default(), timeline(vec![stimulus("a", 1000)])).unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;

        let status = handle.status();
        assert!(status.is_paused);
        assert_eq!(status.remaining_time, Some(Millis::new(400)));

        handle.resume().unwrap();
        let report = handle.join().await.unwrap().unwrap();
        assert_eq!(report.ended_at, SessionTime::from_millis(6000));
        assert_eq!(report.metrics.paused_time, Millis::new(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_does_not_double_advance() {
        let mut handle = spawn_session(
            PlaybackEngine::default(),
            timeline(vec![stimulus("a", 1000), stimulus("b", 1000)]),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.skip().unwrap();

        let events = drain(&mut handle).await;
        assert_eq!(end_reasons(&events), vec![EndReason::Skipped, EndReason::TimerElapsed]);
        let report = handle.join().await.unwrap().unwrap();
        assert_eq!(report.ended_at, SessionTime::from_millis(1300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_records_response() {
        let responder: Node = serde_json::from_value(json!({
            "id": "response-0",
            "type": "response",
            "data": { "responseType": "keyboard", "timeout": 5000 }
        }))
        .unwrap();
        let handle = spawn_session(PlaybackEngine::default(), timeline(vec![responder])).unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.input(ParticipantInput::Key("f".into())).unwrap();

        let report = handle.join().await.unwrap().unwrap();
        assert_eq!(report.responses.len(), 1);
        assert_eq!(report.responses[0].elapsed_time, Millis::new(250));
        assert_eq!(report.ended_at, SessionTime::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_session_early() {
        let handle = spawn_session(PlaybackEngine::default(), timeline(vec![stimulus("a", 60_000)])).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop().unwrap();

        let report = handle.join().await.unwrap().unwrap();
        assert_eq!(report.outcome, SessionOutcome::Stopped);
        assert_eq!(report.ended_at, SessionTime::from_millis(10));
    }
}
