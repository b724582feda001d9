use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::{InputContext, Microphone, OutputDevice, PlaybackId};
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::net::{Connector, ServiceEvent};

use super::{Acquired, Session, SessionSettings, SessionState};

/// Snapshot published after every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub attempt: u64,
    pub active_playbacks: usize,
    pub error: Option<String>,
}

enum Event {
    Start,
    Close,
    Shutdown,
    Acquired { attempt: u64, acquired: Acquired },
    AcquireFailed { attempt: u64, error: VoiceError },
    ConnectTimeout { attempt: u64 },
    Service { attempt: u64, event: ServiceEvent },
}

/// Everything the driver needs to run one session slot.
pub struct SessionParts {
    pub microphone: Arc<dyn Microphone>,
    pub connector: Arc<dyn Connector>,
    pub output: Box<dyn OutputDevice>,
    /// Completion notices from the output device.
    pub completions: mpsc::UnboundedReceiver<PlaybackId>,
    pub audio: AudioConfig,
    pub connect_timeout: Duration,
}

/// Control surface of a running session. Dropping it shuts the driver down.
pub struct SessionHandle {
    mailbox: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Request a new session. Ignored while one is connecting or active.
    pub fn start(&self) -> Result<()> {
        self.send(Event::Start)
    }

    pub fn close(&self) -> Result<()> {
        self.send(Event::Close)
    }

    /// Close the session and stop the driver task.
    pub fn shutdown(&self) {
        let _ = self.mailbox.send(Event::Shutdown);
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Wait for the next published status. `None` once the driver has stopped.
    pub async fn changed(&mut self) -> Option<SessionStatus> {
        self.status.changed().await.ok()?;
        Some(self.status.borrow_and_update().clone())
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus> {
        let status = self
            .status
            .wait_for(|status| predicate(status))
            .await
            .map_err(|_| driver_stopped())?;
        Ok(status.clone())
    }

    fn send(&self, event: Event) -> Result<()> {
        self.mailbox.send(event).map_err(|_| driver_stopped())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn driver_stopped() -> VoiceError {
    VoiceError::Other("session driver stopped".to_string())
}

/// Spawn the driver on the current tokio runtime.
pub fn spawn_session(parts: SessionParts) -> (SessionHandle, JoinHandle<()>) {
    let SessionParts {
        microphone,
        connector,
        output,
        completions,
        audio,
        connect_timeout,
    } = parts;

    let session = Session::new(output, SessionSettings::from_config(&audio));
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(snapshot(&session));

    let driver = SessionDriver {
        session,
        microphone,
        connector,
        capture_rate: audio.capture_sample_rate,
        block_size: audio.block_size,
        connect_timeout,
        mailbox_tx: mailbox_tx.clone(),
        mailbox_rx,
        completions,
        status_tx,
    };
    let task = tokio::spawn(driver.run());

    (
        SessionHandle {
            mailbox: mailbox_tx,
            status: status_rx,
        },
        task,
    )
}

fn snapshot(session: &Session) -> SessionStatus {
    SessionStatus {
        state: session.state(),
        attempt: session.attempt(),
        active_playbacks: session.active_playbacks(),
        error: session.last_error().map(str::to_string),
    }
}

// Owns the session. Helper tasks report back through the mailbox tagged with
// their attempt number, so a superseded attempt never touches a newer one.
struct SessionDriver {
    session: Session,
    microphone: Arc<dyn Microphone>,
    connector: Arc<dyn Connector>,
    capture_rate: u32,
    block_size: usize,
    connect_timeout: Duration,
    mailbox_tx: mpsc::UnboundedSender<Event>,
    mailbox_rx: mpsc::UnboundedReceiver<Event>,
    completions: mpsc::UnboundedReceiver<PlaybackId>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.mailbox_rx.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle(event) {
                        break;
                    }
                }
                Some(id) = self.completions.recv() => self.session.on_playback_finished(id),
            }
            self.publish();
        }

        self.session.close();
        self.publish();
        tracing::debug!("session driver stopped");
    }

    /// Apply one event. Returns false on shutdown.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Start => {
                if let Some(attempt) = self.session.request_start() {
                    self.begin_attempt(attempt);
                }
            }
            Event::Close => self.session.close(),
            Event::Shutdown => return false,
            Event::Acquired { attempt, acquired } => {
                self.session.on_acquired(attempt, acquired);
            }
            Event::AcquireFailed { attempt, error } => {
                self.session.on_acquire_failed(attempt, error);
            }
            Event::ConnectTimeout { attempt } => {
                self.session.on_connect_timeout(attempt, self.connect_timeout);
            }
            Event::Service { attempt, event } => self.session.on_service_event(attempt, event),
        }
        true
    }

    fn begin_attempt(&self, attempt: u64) {
        tokio::spawn(acquire(
            attempt,
            Arc::clone(&self.microphone),
            Arc::clone(&self.connector),
            self.capture_rate,
            self.block_size,
            self.mailbox_tx.clone(),
        ));

        let mailbox = self.mailbox_tx.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = mailbox.send(Event::ConnectTimeout { attempt });
        });
    }

    fn publish(&self) {
        let next = snapshot(&self.session);
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.state != next.state {
                tracing::debug!("session {} -> {}", current.state, next.state);
            }
            *current = next;
            true
        });
    }
}

/// Acquire devices and connect for `attempt`, then relay its service events.
///
/// `Acquired` is posted before any service event so the session always holds
/// the link by the time it sees `Opened`.
async fn acquire(
    attempt: u64,
    microphone: Arc<dyn Microphone>,
    connector: Arc<dyn Connector>,
    capture_rate: u32,
    block_size: usize,
    mailbox: mpsc::UnboundedSender<Event>,
) {
    let (acquired, mut events) =
        match open_resources(microphone, connector, capture_rate, block_size).await {
            Ok(opened) => opened,
            Err(error) => {
                let _ = mailbox.send(Event::AcquireFailed { attempt, error });
                return;
            }
        };

    if mailbox.send(Event::Acquired { attempt, acquired }).is_err() {
        return;
    }

    while let Some(event) = events.recv().await {
        if mailbox.send(Event::Service { attempt, event }).is_err() {
            return;
        }
    }
}

async fn open_resources(
    microphone: Arc<dyn Microphone>,
    connector: Arc<dyn Connector>,
    capture_rate: u32,
    block_size: usize,
) -> Result<(Acquired, mpsc::UnboundedReceiver<ServiceEvent>)> {
    // Opening a device can block on the host audio API or a permission prompt
    let microphone = tokio::task::spawn_blocking(move || microphone.acquire())
        .await
        .map_err(|e| VoiceError::Other(format!("microphone task failed: {e}")))??;

    let input = InputContext::open(microphone.as_ref(), capture_rate, block_size)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let link = connector.connect(events_tx).await?;

    Ok((
        Acquired {
            microphone,
            input,
            link,
        },
        events_rx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{InlineAudio, ServerMessage};
    use crate::test_support::{FakeConnector, FakeMicrophone, FakeOutput, pcm_payload};

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        handle: SessionHandle,
        microphone: FakeMicrophone,
        connector: FakeConnector,
        output: FakeOutput,
        completions: mpsc::UnboundedSender<PlaybackId>,
    }

    fn harness(connect_timeout: Duration) -> Harness {
        let microphone = FakeMicrophone::new();
        let connector = FakeConnector::new();
        let output = FakeOutput::new();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let audio = AudioConfig {
            block_size: 4,
            ..AudioConfig::default()
        };
        let (handle, _task) = spawn_session(SessionParts {
            microphone: Arc::new(microphone.clone()),
            connector: Arc::new(connector.clone()),
            output: Box::new(output.clone()),
            completions: completions_rx,
            audio,
            connect_timeout,
        });

        Harness {
            handle,
            microphone,
            connector,
            output,
            completions: completions_tx,
        }
    }

    /// Wait for `state` once an attempt has been made; the driver starts out Idle.
    async fn wait_state(handle: &mut SessionHandle, state: SessionState) -> SessionStatus {
        tokio::time::timeout(WAIT, handle.wait_for(|s| s.state == state && s.attempt > 0))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
            .unwrap_or_else(|e| panic!("{e}"))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition never held");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn audio_event(frames: usize) -> ServiceEvent {
        ServiceEvent::Message(ServerMessage {
            audio: Some(InlineAudio {
                data: pcm_payload(frames),
                mime_type: Some("audio/pcm;rate=24000".to_string()),
            }),
            ..ServerMessage::default()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_close() {
        let mut h = harness(WAIT);

        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        wait_state(&mut h.handle, SessionState::Active).await;
        assert_eq!(h.microphone.live_streams(), 1);

        h.handle.close().unwrap_or_else(|e| panic!("{e}"));
        let status = wait_state(&mut h.handle, SessionState::Closed).await;

        assert_eq!(status.active_playbacks, 0);
        assert_eq!(h.microphone.live_streams(), 0);
        assert!(h.connector.monitors().iter().all(|p| p.is_closed()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_start_opens_one_connection() {
        let mut h = harness(WAIT);
        h.connector.stall();

        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        wait_state(&mut h.handle, SessionState::Connecting).await;
        let connector = h.connector.clone();
        eventually(|| connector.connects() == 1).await;

        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        h.connector.unstall();
        let status = wait_state(&mut h.handle, SessionState::Active).await;

        assert_eq!(status.attempt, 1);
        assert_eq!(h.connector.connects(), 1);
        assert_eq!(h.microphone.acquisitions(), 1);
        assert_eq!(h.microphone.live_streams(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn denied_microphone_returns_to_idle() {
        let mut h = harness(WAIT);
        h.microphone.deny();

        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        let status = wait_state(&mut h.handle, SessionState::Idle).await;

        assert!(
            status
                .error
                .is_some_and(|e| e.starts_with("microphone access denied"))
        );
        assert_eq!(h.connector.connects(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn channel_failure_releases_microphone() {
        let mut h = harness(WAIT);
        h.connector.fail();

        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        let status = wait_state(&mut h.handle, SessionState::Idle).await;

        assert!(status.error.is_some());
        assert_eq!(h.microphone.acquisitions(), 1);
        assert_eq!(h.microphone.live_streams(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_connection_times_out() {
        let mut h = harness(Duration::from_millis(100));
        h.connector.stall();

        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        let status = wait_state(&mut h.handle, SessionState::Idle).await;
        assert!(status.error.is_some_and(|e| e.contains("did not connect")));

        // The late link and microphone are released, not installed
        h.connector.unstall();
        let microphone = h.microphone.clone();
        let connector = h.connector.clone();
        eventually(|| microphone.live_streams() == 0 && connector.monitors().len() == 1).await;
        eventually(|| connector.monitors().iter().all(|p| p.is_closed())).await;
        assert_eq!(h.handle.status().state, SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_while_connecting_goes_idle() {
        let mut h = harness(WAIT);
        h.connector.stall();

        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        wait_state(&mut h.handle, SessionState::Connecting).await;
        h.handle.close().unwrap_or_else(|e| panic!("{e}"));
        let status = wait_state(&mut h.handle, SessionState::Idle).await;
        assert!(status.error.is_none());

        h.connector.unstall();
        let microphone = h.microphone.clone();
        let connector = h.connector.clone();
        eventually(|| connector.monitors().iter().any(|p| p.is_closed())).await;
        eventually(|| microphone.live_streams() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn playback_lifecycle() {
        let mut h = harness(WAIT);
        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        wait_state(&mut h.handle, SessionState::Active).await;

        h.connector.emit(audio_event(2400));
        h.connector.emit(audio_event(2400));
        tokio::time::timeout(WAIT, h.handle.wait_for(|s| s.active_playbacks == 2))
            .await
            .unwrap_or_else(|_| panic!("audio never scheduled"))
            .unwrap_or_else(|e| panic!("{e}"));

        let played = h.output.played();
        let _ = h.completions.send(played[0].0);
        tokio::time::timeout(WAIT, h.handle.wait_for(|s| s.active_playbacks == 1))
            .await
            .unwrap_or_else(|_| panic!("completion never applied"))
            .unwrap_or_else(|e| panic!("{e}"));

        h.connector.emit(ServiceEvent::Message(ServerMessage {
            interrupted: true,
            ..ServerMessage::default()
        }));
        tokio::time::timeout(WAIT, h.handle.wait_for(|s| s.active_playbacks == 0))
            .await
            .unwrap_or_else(|_| panic!("interruption never applied"))
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(h.output.was_stopped(played[1].0));
        assert_eq!(h.handle.status().state, SessionState::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transport_error_closes_session() {
        let mut h = harness(WAIT);
        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        wait_state(&mut h.handle, SessionState::Active).await;

        h.connector.emit(ServiceEvent::Error("connection reset".to_string()));
        let status = wait_state(&mut h.handle, SessionState::Closed).await;

        assert!(status.error.is_some_and(|e| e.contains("connection reset")));
        assert_eq!(h.microphone.live_streams(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_session_restarts_in_same_slot() {
        let mut h = harness(WAIT);
        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        wait_state(&mut h.handle, SessionState::Active).await;
        h.handle.close().unwrap_or_else(|e| panic!("{e}"));
        wait_state(&mut h.handle, SessionState::Closed).await;

        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        let status = tokio::time::timeout(
            WAIT,
            h.handle
                .wait_for(|s| s.state == SessionState::Active && s.attempt == 2),
        )
        .await
        .unwrap_or_else(|_| panic!("second session never activated"))
        .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(status.attempt, 2);
        assert_eq!(h.microphone.live_streams(), 1);
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_releases_everything() {
        let mut h = harness(WAIT);
        h.handle.start().unwrap_or_else(|e| panic!("{e}"));
        wait_state(&mut h.handle, SessionState::Active).await;

        h.handle.shutdown();
        tokio::time::timeout(WAIT, async {
            while h.handle.changed().await.is_some() {}
        })
        .await
        .unwrap_or_else(|_| panic!("driver never stopped"));

        assert_eq!(h.microphone.live_streams(), 0);
        assert!(h.handle.start().is_err());
    }
}
