use std::collections::VecDeque;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TrajectoryConfig;
use crate::predictor::{Insufficient, PredictionResult};
use crate::stereo::StereoPoint;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum TrajectoryState {
    Empty,
    Accumulating,
    /// A fit was requested and its outcome is pending. A terminal attempt
    /// discards the flight when insufficient.
    Predicting { terminal: bool },
    /// Flight concluded; points captured before `until` belong to it.
    Landed { until: f64 },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum TrajectoryEvent {
    Started { timestamp: f64 },
    OutOfOrder { timestamp: f64, last: f64 },
    /// Gap too large, buffered points dropped and a new flight started
    Invalidated { gap_secs: f64, discarded: usize },
    LandingDetected { timestamp: f64, height: f64 },
    /// Fit insufficient, buffer locked to keep collecting
    Retrying { reason: Insufficient },
    Discarded { reason: Insufficient, points: usize },
    Concluded { landing_time: f64, points: usize },
    Absorbed { timestamp: f64 },
    Flushed { points: usize },
    Triggered { points: usize },
    TriggerRefused(TriggerRefusal),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum TriggerRefusal {
    NoFlight,
    Busy,
    TooFewPoints { have: usize, need: usize },
    CoolingDown { remaining_secs: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    pub points: Vec<StereoPoint>,
    pub terminal: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Push {
    pub events: Vec<TrajectoryEvent>,
    pub request: Option<PredictionRequest>,
}

/// Rolling buffer of one flight and the landing state machine. `push` hands
/// out a [`PredictionRequest`] when a fit is due, the caller runs the predictor
/// and reports back with `finish`.
pub struct TrajectoryBuffer {
    config: TrajectoryConfig,
    points: VecDeque<StereoPoint>,
    state: TrajectoryState,
    /// Set after the first insufficient fit, disables eviction
    locked: bool,
    below: usize,
    landing_seen: bool,
    on_demand: bool,
    last_trigger: Option<f64>,
    last_timestamp: Option<f64>,
}

impl TrajectoryBuffer {
    pub fn new(config: &TrajectoryConfig) -> Self {
        Self {
            config: config.clone(),
            points: VecDeque::with_capacity(config.buffer_size * 2),
            state: TrajectoryState::Empty,
            locked: false,
            below: 0,
            landing_seen: false,
            on_demand: false,
            last_trigger: None,
            last_timestamp: None,
        }
    }

    #[inline]
    pub fn state(&self) -> TrajectoryState {
        self.state
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[inline]
    pub fn points(&self) -> impl Iterator<Item = &StereoPoint> {
        self.points.iter()
    }

    pub fn reset(&mut self) {
        self.clear();
        self.last_trigger = None;
        self.last_timestamp = None;
    }

    fn clear(&mut self) {
        self.points.clear();
        self.state = TrajectoryState::Empty;
        self.locked = false;
        self.below = 0;
        self.landing_seen = false;
        self.on_demand = false;
    }

    #[inline]
    fn capacity_limit(&self) -> usize {
        if self.locked {
            self.config.buffer_size * 2
        } else {
            self.config.buffer_size
        }
    }

    pub fn push(&mut self, point: StereoPoint) -> Push {
        let mut out = Push::default();

        if let Some(last) = self.last_timestamp {
            if !(point.timestamp > last) {
                debug!(timestamp = point.timestamp, last, "out of order point rejected");
                out.events.push(TrajectoryEvent::OutOfOrder {
                    timestamp: point.timestamp,
                    last,
                });
                return out;
            }
        }

        match self.state {
            TrajectoryState::Predicting { .. } => {
                warn!(timestamp = point.timestamp, "point arrived while a fit is pending");
                return out;
            }
            TrajectoryState::Landed { until } if point.timestamp < until => {
                self.last_timestamp = Some(point.timestamp);
                out.events.push(TrajectoryEvent::Absorbed {
                    timestamp: point.timestamp,
                });
                return out;
            }
            TrajectoryState::Landed { .. } => {
                out.events.push(TrajectoryEvent::Flushed {
                    points: self.points.len(),
                });
                self.clear();
            }
            TrajectoryState::Accumulating => {
                if let Some(prev) = self.points.back() {
                    let gap = point.timestamp - prev.timestamp;

                    if gap > self.config.max_gap_secs {
                        info!(gap_secs = gap, discarded = self.points.len(), "flight invalidated by gap");
                        out.events.push(TrajectoryEvent::Invalidated {
                            gap_secs: gap,
                            discarded: self.points.len(),
                        });
                        self.clear();
                    }
                }
            }
            TrajectoryState::Empty => {}
        }

        self.last_timestamp = Some(point.timestamp);

        if self.state == TrajectoryState::Empty {
            self.state = TrajectoryState::Accumulating;
            out.events.push(TrajectoryEvent::Started {
                timestamp: point.timestamp,
            });
        }

        if point.height() < self.config.landing_height_cm {
            self.below += 1;
        } else {
            self.below = 0;
        }

        self.points.push_back(point);

        while self.points.len() > self.capacity_limit() {
            self.points.pop_front();
        }

        let landed = self.below >= self.config.landing_confirm_frames
            && self.points.len() >= self.config.landing_detection_threshold;

        let terminal = if landed {
            self.landing_seen = true;
            info!(timestamp = point.timestamp, height = point.height(), "landing detected");
            out.events.push(TrajectoryEvent::LandingDetected {
                timestamp: point.timestamp,
                height: point.height(),
            });
            Some(true)
        } else if self.locked && self.points.len() >= self.capacity_limit() {
            Some(true)
        } else if !self.locked && self.points.len() >= self.config.buffer_size {
            Some(false)
        } else {
            None
        };

        if let Some(terminal) = terminal {
            self.state = TrajectoryState::Predicting { terminal };
            out.request = Some(PredictionRequest {
                points: self.points.iter().copied().collect(),
                terminal,
            });
        }

        out
    }

    /// Requests a fit over the current flight outside the automatic triggers.
    pub fn trigger(&mut self) -> Push {
        let mut out = Push::default();

        let refusal = match self.state {
            TrajectoryState::Empty | TrajectoryState::Landed { .. } => Some(TriggerRefusal::NoFlight),
            TrajectoryState::Predicting { .. } => Some(TriggerRefusal::Busy),
            TrajectoryState::Accumulating => self.trigger_refusal(),
        };

        if let Some(refusal) = refusal {
            debug!(?refusal, "prediction trigger refused");
            out.events.push(TrajectoryEvent::TriggerRefused(refusal));
            return out;
        }

        self.last_trigger = self.points.back().map(|p| p.timestamp);
        self.on_demand = true;
        self.state = TrajectoryState::Predicting { terminal: false };

        info!(points = self.points.len(), "on-demand prediction");
        out.events.push(TrajectoryEvent::Triggered {
            points: self.points.len(),
        });
        out.request = Some(PredictionRequest {
            points: self.points.iter().copied().collect(),
            terminal: false,
        });

        out
    }

    fn trigger_refusal(&self) -> Option<TriggerRefusal> {
        let need = self.config.trigger_min_points;
        if self.points.len() < need {
            return Some(TriggerRefusal::TooFewPoints {
                have: self.points.len(),
                need,
            });
        }

        let last = self.points.back()?.timestamp;
        let elapsed = last - self.last_trigger?;

        (elapsed < self.config.trigger_cooldown_secs).then(|| TriggerRefusal::CoolingDown {
            remaining_secs: self.config.trigger_cooldown_secs - elapsed,
        })
    }

    /// Reports the outcome of the last requested fit.
    pub fn finish(&mut self, outcome: &Result<PredictionResult, Insufficient>) -> Vec<TrajectoryEvent> {
        let terminal = match self.state {
            TrajectoryState::Predicting { terminal } => terminal,
            _ => return Vec::new(),
        };
        let on_demand = std::mem::replace(&mut self.on_demand, false);

        match outcome {
            Ok(result) => {
                info!(
                    landing_time = result.landing_time,
                    x = result.landing[0],
                    y = result.landing[1],
                    "flight concluded"
                );

                self.state = TrajectoryState::Landed {
                    until: result.landing_time + self.config.cooldown_secs,
                };

                vec![TrajectoryEvent::Concluded {
                    landing_time: result.landing_time,
                    points: self.points.len(),
                }]
            }
            Err(reason) if on_demand => {
                debug!(%reason, "on-demand fit insufficient");

                self.state = TrajectoryState::Accumulating;
                Vec::new()
            }
            Err(reason) if !terminal => {
                debug!(%reason, points = self.points.len(), "fit insufficient, collecting more");

                self.locked = true;
                self.state = TrajectoryState::Accumulating;

                vec![TrajectoryEvent::Retrying {
                    reason: reason.clone(),
                }]
            }
            Err(reason) => {
                info!(%reason, points = self.points.len(), "flight discarded");

                let points = self.points.len();
                let landed = self.landing_seen;
                self.clear();

                // a shuttle lying on the floor would restart a flight every few frames
                if let (true, Some(last)) = (landed, self.last_timestamp) {
                    self.state = TrajectoryState::Landed {
                        until: last + self.config.cooldown_secs,
                    };
                }

                vec![TrajectoryEvent::Discarded {
                    reason: reason.clone(),
                    points,
                }]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::TrajectoryQuality;
    use proptest::prelude::*;

    const FRAME: f64 = 1.0 / 30.0;

    fn point(ts: f64, z: f64) -> StereoPoint {
        StereoPoint {
            position: [300.0, 600.0, z],
            track_a: 1,
            track_b: 1,
            quality: 0.5,
            pole_distance: 0.2,
            timestamp: ts,
        }
    }

    fn landed_at(landing_time: f64) -> Result<PredictionResult, Insufficient> {
        Ok(PredictionResult {
            landing: [300.0, 600.0],
            landing_time,
            max_speed: 1000.0,
            confidence: 0.8,
            in_court: Some(true),
            fit_residual_cm: 1.0,
            points_used: 5,
            quality: TrajectoryQuality::default(),
            path: Vec::new(),
        })
    }

    fn insufficient() -> Result<PredictionResult, Insufficient> {
        Err(Insufficient::ResidualTooLarge {
            residual_cm: 40.0,
            max_cm: 25.0,
        })
    }

    #[test]
    fn landing_fires_on_third_consecutive_low_point() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
        let heights = [20.0, 18.0, 14.0, 12.0, 10.0];

        for (i, &z) in heights.iter().enumerate() {
            let push = buf.push(point(i as f64 * FRAME, z));

            if i < 4 {
                assert!(push.request.is_none(), "fired early at {}", i);
                assert_eq!(buf.state(), TrajectoryState::Accumulating);
            } else {
                let request = push.request.unwrap();
                assert!(request.terminal);
                assert_eq!(request.points.len(), 5);
                assert!(push
                    .events
                    .contains(&TrajectoryEvent::LandingDetected { timestamp: 4.0 * FRAME, height: 10.0 }));
            }
        }

        assert_eq!(buf.state(), TrajectoryState::Predicting { terminal: true });
    }

    #[test]
    fn landing_needs_enough_buffered_points() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());

        for i in 0..4 {
            assert!(buf.push(point(i as f64 * FRAME, 5.0)).request.is_none());
        }

        assert!(buf.push(point(4.0 * FRAME, 5.0)).request.is_some());
    }

    #[test]
    fn out_of_order_points_are_rejected() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
        buf.push(point(1.0, 200.0));

        let push = buf.push(point(0.9, 210.0));

        assert_eq!(
            push.events,
            vec![TrajectoryEvent::OutOfOrder {
                timestamp: 0.9,
                last: 1.0
            }]
        );
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn gap_starts_a_new_flight() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
        for i in 0..3 {
            buf.push(point(i as f64 * FRAME, 200.0));
        }

        let push = buf.push(point(1.0, 220.0));

        assert!(matches!(
            push.events[0],
            TrajectoryEvent::Invalidated { discarded: 3, .. }
        ));
        assert_eq!(push.events[1], TrajectoryEvent::Started { timestamp: 1.0 });
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn rising_flight_predicts_at_cap() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
        let mut fired = None;

        for i in 0..30 {
            let push = buf.push(point(i as f64 * FRAME, 100.0 + i as f64 * 10.0));

            if let Some(request) = push.request {
                assert!(!request.terminal);
                assert_eq!(request.points.len(), 20);
                fired = Some(i);
                break;
            }
        }

        assert_eq!(fired, Some(19));
        assert_eq!(buf.state(), TrajectoryState::Predicting { terminal: false });
    }

    #[test]
    fn insufficient_fit_locks_then_discards_at_double_capacity() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
        let mut ts = 0.0;
        let mut z = 700.0;

        let mut request = None;
        while request.is_none() {
            ts += FRAME;
            z -= 5.0;
            request = buf.push(point(ts, z)).request;
        }

        assert!(!request.unwrap().terminal);
        assert_eq!(buf.len(), 20);

        let events = buf.finish(&insufficient());
        assert!(matches!(events[0], TrajectoryEvent::Retrying { .. }));
        assert!(buf.is_locked());

        let mut request = None;
        while request.is_none() {
            ts += FRAME;
            z -= 5.0;
            request = buf.push(point(ts, z)).request;
        }

        let request = request.unwrap();
        assert!(request.terminal);
        assert_eq!(request.points.len(), 40);
        assert_eq!(request.points[0].timestamp, FRAME);

        let events = buf.finish(&insufficient());
        assert!(matches!(events[0], TrajectoryEvent::Discarded { points: 40, .. }));
        assert_eq!(buf.state(), TrajectoryState::Empty);
        assert!(buf.is_empty());
    }

    #[test]
    fn cooldown_absorbs_tail_then_flushes() {
        let config = TrajectoryConfig {
            cooldown_secs: 0.2,
            ..Default::default()
        };
        let mut buf = TrajectoryBuffer::new(&config);

        let heights = [60.0, 40.0, 14.0, 12.0, 10.0];
        for (i, &z) in heights.iter().enumerate() {
            buf.push(point(i as f64 * FRAME, z));
        }

        let events = buf.finish(&landed_at(0.1));
        assert!(matches!(events[0], TrajectoryEvent::Concluded { points: 5, .. }));
        assert_eq!(buf.state(), TrajectoryState::Landed { until: 0.1 + 0.2 });

        let push = buf.push(point(0.25, 5.0));
        assert_eq!(push.events, vec![TrajectoryEvent::Absorbed { timestamp: 0.25 }]);

        let push = buf.push(point(0.35, 150.0));
        assert_eq!(
            push.events,
            vec![
                TrajectoryEvent::Flushed { points: 5 },
                TrajectoryEvent::Started { timestamp: 0.35 }
            ]
        );
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.state(), TrajectoryState::Accumulating);
    }

    #[test]
    fn failed_landing_fit_absorbs_resting_shuttle() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());

        let mut request = None;
        let mut i = 0;
        while request.is_none() {
            request = buf.push(point(i as f64 * FRAME, 5.0)).request;
            i += 1;
        }

        let events = buf.finish(&Err(Insufficient::NoLanding));
        assert!(matches!(events[0], TrajectoryEvent::Discarded { points: 5, .. }));
        assert!(buf.is_empty());

        let until = 4.0 * FRAME + 2.0;
        assert_eq!(buf.state(), TrajectoryState::Landed { until });

        for j in 0..30 {
            let push = buf.push(point((i + j) as f64 * FRAME, 5.0));
            assert!(push.request.is_none());
            assert!(matches!(push.events[0], TrajectoryEvent::Absorbed { .. }));
        }
    }

    #[test]
    fn trigger_needs_a_flight_with_enough_points() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());

        let push = buf.trigger();
        assert_eq!(
            push.events,
            vec![TrajectoryEvent::TriggerRefused(TriggerRefusal::NoFlight)]
        );

        for i in 0..4 {
            buf.push(point(i as f64 * FRAME, 300.0));
        }

        let push = buf.trigger();
        assert!(push.request.is_none());
        assert_eq!(
            push.events,
            vec![TrajectoryEvent::TriggerRefused(TriggerRefusal::TooFewPoints {
                have: 4,
                need: 10
            })]
        );
        assert_eq!(buf.state(), TrajectoryState::Accumulating);
    }

    #[test]
    fn failed_trigger_keeps_collecting_then_cools_down() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
        for i in 0..12 {
            buf.push(point(i as f64 * FRAME, 300.0 - i as f64));
        }

        let push = buf.trigger();
        let request = push.request.unwrap();
        assert!(!request.terminal);
        assert_eq!(request.points.len(), 12);
        assert_eq!(push.events, vec![TrajectoryEvent::Triggered { points: 12 }]);

        assert!(buf.finish(&insufficient()).is_empty());
        assert_eq!(buf.state(), TrajectoryState::Accumulating);
        assert!(!buf.is_locked());
        assert_eq!(buf.len(), 12);

        buf.push(point(12.0 * FRAME, 280.0));
        let push = buf.trigger();
        match push.events[0] {
            TrajectoryEvent::TriggerRefused(TriggerRefusal::CoolingDown { remaining_secs }) => {
                assert!((remaining_secs - (2.0 - FRAME)).abs() < 1e-9)
            }
            ref other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn successful_trigger_concludes_the_flight() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
        for i in 0..10 {
            buf.push(point(i as f64 * FRAME, 300.0 - 10.0 * i as f64));
        }

        assert!(buf.trigger().request.is_some());
        let events = buf.finish(&landed_at(0.8));

        assert!(matches!(events[0], TrajectoryEvent::Concluded { points: 10, .. }));
        assert_eq!(buf.state(), TrajectoryState::Landed { until: 0.8 + 2.0 });
    }

    #[test]
    fn reset_forgets_everything() {
        let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
        buf.push(point(5.0, 100.0));
        buf.reset();

        assert_eq!(buf.state(), TrajectoryState::Empty);
        let push = buf.push(point(1.0, 100.0));
        assert_eq!(push.events, vec![TrajectoryEvent::Started { timestamp: 1.0 }]);
    }

    proptest! {
        #[test]
        fn buffer_stays_time_ordered(
            steps in prop::collection::vec((0.001..0.4f64, 0.0..400.0f64, any::<bool>()), 1..120)
        ) {
            let mut buf = TrajectoryBuffer::new(&TrajectoryConfig::default());
            let mut ts = 0.0;

            for (dt, z, succeed) in steps {
                ts += dt;

                if buf.push(point(ts, z)).request.is_some() {
                    let outcome = if succeed { landed_at(ts) } else { insufficient() };
                    buf.finish(&outcome);
                }

                let times: Vec<f64> = buf.points().map(|p| p.timestamp).collect();
                prop_assert!(times.windows(2).all(|w| w[0] < w[1]));
                prop_assert!(buf.len() <= 40);
            }
        }
    }
}
