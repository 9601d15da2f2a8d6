use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::frame::{CameraId, Frame, FramePair};

#[derive(Debug, Clone)]
pub enum Synced {
    Pair(FramePair),
    /// Single camera pass-through, tracked in 2D only
    Unpaired(Frame),
    /// Frame discarded in favour of a closer partner or an out of order arrival
    Dropped { camera: CameraId, timestamp: f64 },
    Stalled { camera: CameraId, last_seen: Option<f64> },
    Resumed { camera: CameraId },
}

const CAMERAS: [CameraId; 2] = [CameraId::A, CameraId::B];

/// Causal pairing by capture time: only frames already queued are considered.
pub struct FrameSynchronizer {
    config: SyncConfig,
    queues: [VecDeque<Frame>; 2],
    newest: [Option<f64>; 2],
    stalled: [bool; 2],
    first_seen: Option<f64>,
    paused: bool,
}

impl FrameSynchronizer {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            config: config.clone(),
            queues: [VecDeque::new(), VecDeque::new()],
            newest: [None, None],
            stalled: [false, false],
            first_seen: None,
            paused: false,
        }
    }

    pub fn reset(&mut self) {
        self.queues.iter_mut().for_each(VecDeque::clear);
        self.newest = [None, None];
        self.stalled = [false, false];
        self.first_seen = None;
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) -> Vec<Synced> {
        self.paused = false;

        let mut out = Vec::new();
        self.drain(&mut out);
        out
    }

    #[inline]
    pub fn is_stalled(&self, camera: CameraId) -> bool {
        self.stalled[camera.index()]
    }

    pub fn push(&mut self, frame: Frame) -> Vec<Synced> {
        let mut out = Vec::new();
        let c = frame.camera.index();

        if let Some(newest) = self.newest[c] {
            if frame.timestamp <= newest {
                debug!(camera = ?frame.camera, timestamp = frame.timestamp, "out of order frame dropped");
                out.push(Synced::Dropped {
                    camera: frame.camera,
                    timestamp: frame.timestamp,
                });
                return out;
            }
        }

        self.newest[c] = Some(frame.timestamp);
        self.first_seen.get_or_insert(frame.timestamp);

        if self.stalled[c] {
            self.stalled[c] = false;
            out.push(Synced::Resumed {
                camera: frame.camera,
            });
        }

        self.queues[c].push_back(frame);

        if self.paused {
            // keep the queue bounded while nothing advances
            while self.queues[c].len() > self.config.lookahead_frames + 1 {
                if let Some(old) = self.queues[c].pop_front() {
                    out.push(Synced::Dropped {
                        camera: old.camera,
                        timestamp: old.timestamp,
                    });
                }
            }
        } else {
            self.drain(&mut out);
        }

        out
    }

    /// Emits everything still queued, pairing what can be paired.
    pub fn flush(&mut self) -> Vec<Synced> {
        let mut out = Vec::new();
        self.drain(&mut out);

        loop {
            let next = match (self.queues[0].front(), self.queues[1].front()) {
                (Some(a), Some(b)) if b.timestamp < a.timestamp => 1,
                (Some(_), _) => 0,
                (None, Some(_)) => 1,
                (None, None) => break,
            };

            if let Some(frame) = self.queues[next].pop_front() {
                out.push(Synced::Unpaired(frame));
            }
        }

        out
    }

    fn drain(&mut self, out: &mut Vec<Synced>) {
        loop {
            match (!self.queues[0].is_empty(), !self.queues[1].is_empty()) {
                (true, true) => {
                    let (older, newer) = if self.queues[0][0].timestamp <= self.queues[1][0].timestamp {
                        (0, 1)
                    } else {
                        (1, 0)
                    };

                    let older_ts = self.queues[older][0].timestamp;
                    let newer_ts = self.queues[newer][0].timestamp;
                    let gap = newer_ts - older_ts;

                    if gap > self.config.tolerance_secs {
                        if let Some(frame) = self.queues[older].pop_front() {
                            out.push(Synced::Unpaired(frame));
                        }
                        continue;
                    }

                    let superseded = self.queues[older]
                        .get(1)
                        .map(|next| (next.timestamp - newer_ts).abs() < gap)
                        .unwrap_or(false);

                    if superseded {
                        if let Some(frame) = self.queues[older].pop_front() {
                            out.push(Synced::Dropped {
                                camera: frame.camera,
                                timestamp: frame.timestamp,
                            });
                        }
                        continue;
                    }

                    if let (Some(a), Some(b)) =
                        (self.queues[0].pop_front(), self.queues[1].pop_front())
                    {
                        out.push(Synced::Pair(FramePair { a, b }));
                    }
                }
                (true, false) => {
                    if !self.drain_single(0, out) {
                        break;
                    }
                }
                (false, true) => {
                    if !self.drain_single(1, out) {
                        break;
                    }
                }
                (false, false) => break,
            }
        }
    }

    /// Handles a queue whose partner queue is empty. Returns true while frames
    /// keep leaving the queue.
    fn drain_single(&mut self, c: usize, out: &mut Vec<Synced>) -> bool {
        let other = 1 - c;

        if !self.stalled[other] {
            let newest = self.newest[c].unwrap_or_default();
            let reference = self.newest[other].or(self.first_seen).unwrap_or(newest);

            if newest - reference > self.config.stall_timeout_secs {
                warn!(camera = ?CAMERAS[other], last_seen = ?self.newest[other], "stream stalled, continuing with one camera");
                self.stalled[other] = true;
                out.push(Synced::Stalled {
                    camera: CAMERAS[other],
                    last_seen: self.newest[other],
                });
            }
        }

        if self.stalled[other] || self.queues[c].len() > self.config.lookahead_frames {
            if let Some(frame) = self.queues[c].pop_front() {
                out.push(Synced::Unpaired(frame));
                return true;
            }
        }

        false
    }
}
