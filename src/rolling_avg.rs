use crate::circular_queue::CircularQueue;

/// Mean of the last `window` samples
#[derive(Debug, Clone)]
pub struct RollingAvg {
    history: CircularQueue<f64>,
}

impl RollingAvg {
    pub fn new(window: usize) -> Self {
        Self {
            history: CircularQueue::with_capacity(window),
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn push(&mut self, value: f64) {
        self.history.push(value);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }

        // summed oldest first so equal windows give bit-identical means
        Some(self.history.asc_iter().sum::<f64>() / self.history.len() as f64)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
