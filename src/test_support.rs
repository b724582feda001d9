use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::sync::{Notify, mpsc};

use crate::audio::{Microphone, MicrophoneStream, OutputDevice, PlaybackHandle, PlaybackId};
use crate::codec::{self, DecodedBuffer, EncodedPacket, PcmFormat, SampleConversion};
use crate::error::{Result, VoiceError};
use crate::net::{Connector, Link, ServiceEvent};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct FakeMicrophoneStream {
    tx: Sender<Vec<f32>>,
    rx: Receiver<Vec<f32>>,
    sample_rate: u32,
    channels: u16,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl FakeMicrophoneStream {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self::counted(sample_rate, channels, Arc::new(AtomicUsize::new(0)))
    }

    fn counted(sample_rate: u32, channels: u16, live: Arc<AtomicUsize>) -> Self {
        let (tx, rx) = unbounded();
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            tx,
            rx,
            sample_rate,
            channels,
            live,
            released: false,
        }
    }

    /// Push raw device buffers as if the audio callback produced them.
    pub fn feeder(&self) -> Sender<Vec<f32>> {
        self.tx.clone()
    }
}

impl MicrophoneStream for FakeMicrophoneStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn receiver(&self) -> Receiver<Vec<f32>> {
        self.rx.clone()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeMicrophoneStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Counts acquisitions and live streams; can be told to refuse access.
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    live: Arc<AtomicUsize>,
    acquired: Arc<AtomicUsize>,
    deny: Arc<AtomicBool>,
    feeders: Arc<Mutex<Vec<Sender<Vec<f32>>>>>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_fake(&self) -> FakeMicrophoneStream {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let stream = FakeMicrophoneStream::counted(16000, 1, Arc::clone(&self.live));
        lock(&self.feeders).push(stream.feeder());
        stream
    }

    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Feed samples into the most recently acquired stream.
    pub fn speak(&self, samples: Vec<f32>) {
        if let Some(feeder) = lock(&self.feeders).last() {
            let _ = feeder.send(samples);
        }
    }
}

impl Microphone for FakeMicrophone {
    fn acquire(&self) -> Result<Box<dyn MicrophoneStream>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(VoiceError::PermissionDenied("user refused".to_string()));
        }
        Ok(Box::new(self.acquire_fake()))
    }
}

#[derive(Default)]
struct FakeOutputState {
    time: f64,
    played: Vec<(PlaybackId, f64, f64)>,
    stopped: HashSet<PlaybackId>,
    finished: HashSet<PlaybackId>,
    fail_next: bool,
}

/// Output device with a hand-driven clock.
#[derive(Clone, Default)]
pub struct FakeOutput {
    state: Arc<Mutex<FakeOutputState>>,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, time: f64) {
        lock(&self.state).time = time;
    }

    pub fn mark_finished(&self, id: PlaybackId) {
        lock(&self.state).finished.insert(id);
    }

    pub fn fail_next_play(&self) {
        lock(&self.state).fail_next = true;
    }

    pub fn was_stopped(&self, id: PlaybackId) -> bool {
        lock(&self.state).stopped.contains(&id)
    }

    /// `(id, start_at, duration)` of every buffer played, in order.
    pub fn played(&self) -> Vec<(PlaybackId, f64, f64)> {
        lock(&self.state).played.clone()
    }
}

struct FakeHandle {
    id: PlaybackId,
    state: Arc<Mutex<FakeOutputState>>,
}

impl PlaybackHandle for FakeHandle {
    fn stop(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.finished.contains(&self.id) {
            return Err(VoiceError::Audio(format!("{} already finished", self.id)));
        }
        state.stopped.insert(self.id);
        Ok(())
    }
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        lock(&self.state).time
    }

    fn play_at(
        &mut self,
        id: PlaybackId,
        buffer: DecodedBuffer,
        start_at: f64,
    ) -> Result<Box<dyn PlaybackHandle>> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next) {
            return Err(VoiceError::Audio("device gone".to_string()));
        }
        state.played.push((id, start_at, buffer.duration_secs()));
        Ok(Box::new(FakeHandle {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// A mono buffer of silence lasting `secs` at 1 kHz.
pub fn buffer_secs(secs: f64) -> DecodedBuffer {
    DecodedBuffer {
        sample_rate: 1000,
        channels: vec![vec![0.0; (secs * 1000.0).round() as usize]],
    }
}

/// Base64 PCM16 of `frames` samples of a quiet tone.
pub fn pcm_payload(frames: usize) -> String {
    let samples: Vec<f32> = (0..frames).map(|i| (i as f32 * 0.01).sin() * 0.1).collect();
    codec::encode(&samples, PcmFormat::mono(24000), SampleConversion::Clamp).data
}

/// Observes a link from the outside.
#[derive(Clone)]
pub struct LinkMonitor {
    closed: Arc<AtomicBool>,
    outbound: Arc<Mutex<mpsc::UnboundedReceiver<EncodedPacket>>>,
}

impl LinkMonitor {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Packets transmitted so far.
    pub fn drain(&self) -> Vec<EncodedPacket> {
        let mut rx = lock(&self.outbound);
        let mut packets = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            packets.push(packet);
        }
        packets
    }
}

pub struct FakeLink {
    outbound: mpsc::UnboundedSender<EncodedPacket>,
    closed: Arc<AtomicBool>,
}

impl FakeLink {
    pub fn new() -> (Self, LinkMonitor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                outbound: tx,
                closed: Arc::clone(&closed),
            },
            LinkMonitor {
                closed,
                outbound: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

impl Link for FakeLink {
    fn outbound(&self) -> mpsc::UnboundedSender<EncodedPacket> {
        self.outbound.clone()
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Voice service stand-in: records connections and lets tests inject events.
#[derive(Clone, Default)]
pub struct FakeConnector {
    connects: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    stall: Arc<AtomicBool>,
    release: Arc<Notify>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<ServiceEvent>>>>,
    monitors: Arc<Mutex<Vec<LinkMonitor>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Hold every connect until `unstall` is called.
    pub fn stall(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    pub fn unstall(&self) {
        self.stall.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn monitors(&self) -> Vec<LinkMonitor> {
        lock(&self.monitors).clone()
    }

    /// Deliver an event on the most recent channel.
    pub fn emit(&self, event: ServiceEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, events: mpsc::UnboundedSender<ServiceEvent>) -> Result<Box<dyn Link>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        while self.stall.load(Ordering::SeqCst) {
            let notified = self.release.notified();
            if !self.stall.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::ChannelOpen("service unreachable".to_string()));
        }

        let _ = events.send(ServiceEvent::Opened);
        *lock(&self.events) = Some(events);

        let (link, monitor) = FakeLink::new();
        lock(&self.monitors).push(monitor);
        Ok(Box::new(link))
    }
}
