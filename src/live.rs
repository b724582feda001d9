use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::capture::CpalMicrophone;
use crate::audio::playback::CpalOutput;
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::net::client::LiveConnector;
use crate::session::{SessionHandle, SessionParts, SessionState, spawn_session};

/// Talk to the advisor until Ctrl+C or until the service ends the session.
pub async fn run_live_session(config: Config) -> Result<()> {
    let connector = LiveConnector::new(&config.service)?;

    let (completed_tx, completed_rx) = mpsc::unbounded_channel();
    let output = CpalOutput::open(&config.audio, completed_tx)?;
    let microphone = CpalMicrophone::new(&config.audio);

    let (mut handle, driver) = spawn_session(SessionParts {
        microphone: Arc::new(microphone),
        connector: Arc::new(connector),
        output: Box::new(output),
        completions: completed_rx,
        audio: config.audio.clone(),
        connect_timeout: config.session.connect_timeout(),
    });

    let (interrupt_tx, mut interrupts) = mpsc::unbounded_channel();
    let listener = listen_for_interrupts(interrupt_tx);

    handle.start()?;
    let outcome = supervise(&mut handle, &mut interrupts, &config.service.model).await;

    listener.abort();
    handle.shutdown();
    if let Err(e) = driver.await {
        tracing::warn!("session driver task failed: {e}");
    }

    tracing::info!("conversation ended");
    outcome
}

/// Forward every Ctrl+C for as long as the returned task runs.
fn listen_for_interrupts(interrupts: mpsc::UnboundedSender<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for Ctrl+C: {e}");
                return;
            }
            if interrupts.send(()).is_err() {
                return;
            }
        }
    })
}

/// Follow the session until it ends. The first interrupt hangs up, a second
/// one stops waiting.
async fn supervise(
    handle: &mut SessionHandle,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
    model: &str,
) -> Result<()> {
    let mut last_state = SessionState::Idle;
    let mut closing = false;

    loop {
        tokio::select! {
            status = handle.changed() => {
                let Some(status) = status else {
                    return Err(VoiceError::Other("session driver stopped unexpectedly".to_string()));
                };

                if status.state != last_state {
                    match status.state {
                        SessionState::Connecting => {
                            tracing::info!(model, "connecting to the voice service");
                        }
                        SessionState::Active => {
                            tracing::info!("connected, start talking (Ctrl+C to hang up)");
                        }
                        SessionState::Idle | SessionState::Closed => {}
                    }
                    last_state = status.state;
                }

                match (status.state, status.error) {
                    (SessionState::Idle | SessionState::Closed, Some(error)) => {
                        return Err(VoiceError::Other(error));
                    }
                    (SessionState::Closed, None) => return Ok(()),
                    (SessionState::Idle, None) if closing => return Ok(()),
                    _ => {}
                }
            }
            Some(()) = interrupts.recv() => {
                if closing {
                    tracing::warn!("second interrupt, exiting");
                    return Ok(());
                }
                tracing::info!("hanging up");
                closing = true;
                handle.close()?;
            }
        }
    }
}
