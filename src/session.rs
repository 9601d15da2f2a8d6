use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender, TrySendError};
use ndarray::Array3;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::CalibrationSource;
use crate::config::EngineConfig;
use crate::detector::DetectionModel;
use crate::error::Error;
use crate::events::{Degradation, Event};
use crate::frame::{CameraId, Frame};
use crate::pipeline::Pipeline;
use crate::sync::FrameSynchronizer;

const PAUSE_POLL: Duration = Duration::from_millis(10);
const MIN_SPEED: f64 = 0.1;
const MAX_SPEED: f64 = 16.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Live,
}

pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;

    /// Next decoded image (HxWxC) with its capture time in seconds, `None`
    /// once the source is exhausted.
    fn next_frame(&mut self) -> Option<(Array3<u8>, f64)>;
}

struct Playback {
    paused: AtomicBool,
    cancelled: AtomicBool,
    speed_bits: AtomicU64,
}

impl Playback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
        })
    }

    #[inline]
    fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::SeqCst))
    }

    #[inline]
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

enum Control {
    Pause,
    Resume,
    Reset,
    Predict,
    Cancel,
}

struct Overflow {
    camera: CameraId,
    timestamp: f64,
}

/// One producer thread per camera feeds a drop-oldest queue, a single pipeline
/// thread synchronizes frames and publishes events.
pub struct Session {
    control: Sender<Control>,
    events: Receiver<Event>,
    playback: Arc<Playback>,
    threads: Vec<JoinHandle<()>>,
    speed_control: bool,
    closed: bool,
}

impl Session {
    /// Validates everything and starts the threads. Configuration and
    /// calibration errors are returned before any frame is read.
    pub fn start(
        config: EngineConfig,
        calibration: &dyn CalibrationSource,
        sources: [Box<dyn FrameSource>; 2],
        model: Arc<dyn DetectionModel>,
    ) -> Result<Self, Error> {
        let pipeline = Pipeline::new(&config, calibration, model)?;

        let speed_control = sources.iter().all(|s| s.kind() == SourceKind::File);
        let playback = Playback::new();

        let (control, control_rx) = unbounded();
        let (events_tx, events) = unbounded();
        let (overflow_tx, overflow_rx) = unbounded();

        let mut threads = Vec::with_capacity(3);
        let mut queues = Vec::with_capacity(2);

        for (source, camera) in sources.into_iter().zip([CameraId::A, CameraId::B]) {
            let (tx, rx) = bounded(config.sync.queue_capacity);
            let producer = Producer {
                camera,
                source,
                tx,
                head: rx.clone(),
                overflow: overflow_tx.clone(),
                playback: playback.clone(),
            };

            threads.push(
                thread::Builder::new()
                    .name(format!("source-{:?}", camera))
                    .spawn(move || producer.run())?,
            );
            queues.push(rx);
        }
        drop(overflow_tx);

        let worker = Worker {
            pipeline,
            sync: FrameSynchronizer::new(&config.sync),
            queues: [queues.remove(0), queues.remove(0)],
            overflow: overflow_rx,
            control: control_rx,
            events: events_tx,
            playback: playback.clone(),
        };

        threads.push(
            thread::Builder::new()
                .name("pipeline".into())
                .spawn(move || worker.run())?,
        );

        info!(speed_control, "session started");

        Ok(Self {
            control,
            events,
            playback,
            threads,
            speed_control,
            closed: false,
        })
    }

    #[inline]
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.playback.is_paused()
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.playback.paused.store(true, Ordering::SeqCst);
        self.send(Control::Pause)
    }

    pub fn resume(&self) -> Result<(), Error> {
        self.playback.paused.store(false, Ordering::SeqCst);
        self.send(Control::Resume)
    }

    /// Drops tracks, the current flight and queued frames; the session keeps
    /// running.
    pub fn reset(&self) -> Result<(), Error> {
        self.send(Control::Reset)
    }

    /// Fits the buffered flight now. Refusals and insufficient fits arrive as
    /// events.
    pub fn trigger_prediction(&self) -> Result<(), Error> {
        self.send(Control::Predict)
    }

    pub fn set_playback_speed(&self, speed: f64) -> Result<(), Error> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        if !self.speed_control {
            return Err(Error::SpeedControlUnavailable);
        }

        if !(speed.is_finite() && (MIN_SPEED..=MAX_SPEED).contains(&speed)) {
            return Err(Error::InvalidParameter {
                name: "playback_speed",
                value: speed,
                min: MIN_SPEED,
                max: MAX_SPEED,
            });
        }

        self.playback.speed_bits.store(speed.to_bits(), Ordering::SeqCst);
        debug!(speed, "playback speed changed");

        Ok(())
    }

    /// Stops all threads and discards live state. Events not yet received are
    /// discarded too, so nothing from the cancelled flight surfaces later.
    pub fn cancel(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        self.closed = true;
        self.playback.cancelled.store(true, Ordering::SeqCst);
        let _ = self.control.send(Control::Cancel);

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("session thread panicked");
            }
        }

        let discarded = self.events.try_iter().count();
        info!(discarded, "session cancelled");

        Ok(())
    }

    fn send(&self, control: Control) -> Result<(), Error> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        self.control.send(control).map_err(|_| Error::SessionClosed)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cancel();
        }
    }
}

struct Producer {
    camera: CameraId,
    source: Box<dyn FrameSource>,
    tx: Sender<Frame>,
    head: Receiver<Frame>,
    overflow: Sender<Overflow>,
    playback: Arc<Playback>,
}

impl Producer {
    fn run(mut self) {
        let paced = self.source.kind() == SourceKind::File;
        let mut previous: Option<f64> = None;

        loop {
            if self.playback.is_cancelled() {
                break;
            }

            if paced && self.playback.is_paused() {
                thread::sleep(PAUSE_POLL);
                continue;
            }

            let (image, timestamp) = match self.source.next_frame() {
                Some(next) => next,
                None => break,
            };

            if paced {
                if let Some(prev) = previous {
                    self.pace((timestamp - prev).max(0.0) / self.playback.speed());
                }
            }
            previous = Some(timestamp);

            if !self.enqueue(Frame::new(self.camera, image, timestamp)) {
                break;
            }
        }

        debug!(camera = ?self.camera, "source finished");
    }

    /// Sleeps in short slices so cancellation is not held up by long gaps.
    fn pace(&self, secs: f64) {
        let mut remaining = Duration::from_secs_f64(secs);

        while !remaining.is_zero() && !self.playback.is_cancelled() {
            let slice = remaining.min(PAUSE_POLL);
            thread::sleep(slice);
            remaining -= slice;
        }
    }

    fn enqueue(&self, frame: Frame) -> bool {
        let mut frame = frame;

        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(back)) => {
                    frame = back;

                    if let Ok(old) = self.head.try_recv() {
                        let _ = self.overflow.send(Overflow {
                            camera: old.camera,
                            timestamp: old.timestamp,
                        });
                    }
                }
            }
        }
    }
}

struct Worker {
    pipeline: Pipeline,
    sync: FrameSynchronizer,
    queues: [Receiver<Frame>; 2],
    overflow: Receiver<Overflow>,
    control: Receiver<Control>,
    events: Sender<Event>,
    playback: Arc<Playback>,
}

impl Worker {
    fn run(mut self) {
        let mut open = [true, true];
        let mut overflow_open = true;
        let closed = never();
        let no_overflow = never();

        while open[0] || open[1] {
            let qa = if open[0] { &self.queues[0] } else { &closed };
            let qb = if open[1] { &self.queues[1] } else { &closed };
            let ov = if overflow_open { &self.overflow } else { &no_overflow };

            let synced = select! {
                recv(self.control) -> msg => match msg {
                    Ok(Control::Pause) => {
                        self.sync.pause();
                        Vec::new()
                    }
                    Ok(Control::Resume) => self.sync.resume(),
                    Ok(Control::Reset) => {
                        self.sync.reset();
                        self.pipeline.reset();
                        for q in &self.queues {
                            q.try_iter().for_each(drop);
                        }
                        Vec::new()
                    }
                    Ok(Control::Predict) => {
                        let events = self.pipeline.trigger_prediction();
                        if !self.publish(events) {
                            self.discard();
                            return;
                        }
                        Vec::new()
                    }
                    Ok(Control::Cancel) | Err(_) => {
                        self.discard();
                        return;
                    }
                },
                recv(ov) -> msg => {
                    match msg {
                        Ok(o) => {
                            let event = Event::Degraded(Degradation::DroppedFrame {
                                camera: o.camera,
                                timestamp: o.timestamp,
                            });
                            if !self.publish(vec![event]) {
                                self.discard();
                                return;
                            }
                        }
                        Err(_) => overflow_open = false,
                    }
                    Vec::new()
                },
                recv(qa) -> msg => match msg {
                    Ok(frame) => self.sync.push(frame),
                    Err(_) => {
                        open[0] = false;
                        Vec::new()
                    }
                },
                recv(qb) -> msg => match msg {
                    Ok(frame) => self.sync.push(frame),
                    Err(_) => {
                        open[1] = false;
                        Vec::new()
                    }
                },
            };

            for s in synced {
                if self.playback.is_cancelled() {
                    self.discard();
                    return;
                }

                let events = self.pipeline.process(s);
                if !self.publish(events) {
                    self.discard();
                    return;
                }
            }
        }

        let mut tail: Vec<Event> = self
            .overflow
            .try_iter()
            .map(|o| {
                Event::Degraded(Degradation::DroppedFrame {
                    camera: o.camera,
                    timestamp: o.timestamp,
                })
            })
            .collect();

        for s in self.sync.flush() {
            tail.extend(self.pipeline.process(s));
        }
        tail.push(Event::Ended);

        if !self.playback.is_cancelled() && self.publish(tail) {
            info!("sources exhausted, session ended");
        }
    }

    fn publish(&self, events: Vec<Event>) -> bool {
        events.into_iter().all(|e| self.events.send(e).is_ok())
    }

    fn discard(&mut self) {
        self.sync.reset();
        self.pipeline.reset();
        debug!("pipeline state discarded");
    }
}
