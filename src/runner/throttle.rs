//! Streaming emit throttle (§4.2 content_block_delta, §5 Timers, §9).
//!
//! Keeps `messageUpdate` emission to roughly once per [`THROTTLE_INTERVAL`]
//! per streaming block, while always emitting on cap-hit and on block
//! seal so the final content is never lost behind the throttle window.

use std::time::{Duration, Instant};

/// Target emit interval for streaming `messageUpdate` events.
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(90);

/// Per-block throttle state.
#[derive(Debug)]
pub struct EmitThrottle {
    last_emit: Option<Instant>,
}

impl Default for EmitThrottle {
    fn default() -> Self {
        Self { last_emit: None }
    }
}

impl EmitThrottle {
    /// Decide whether to emit now.
    ///
    /// `force` bypasses the window (cap-hit, seal, or final update) and
    /// always returns `true`. Otherwise returns `true` only once per
    /// [`THROTTLE_INTERVAL`].
    pub fn should_emit(&mut self, now: Instant, force: bool) -> bool {
        if force {
            self.last_emit = Some(now);
            return true;
        }
        let due = match self.last_emit {
            None => true,
            Some(last) => now.duration_since(last) >= THROTTLE_INTERVAL,
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_always_emits() {
        let mut throttle = EmitThrottle::default();
        assert!(throttle.should_emit(Instant::now(), false));
    }

    #[test]
    fn rapid_successive_calls_are_suppressed_until_window_elapses() {
        let mut throttle = EmitThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.should_emit(t0, false));
        assert!(!throttle.should_emit(t0 + Duration::from_millis(10), false));
        assert!(throttle.should_emit(t0 + Duration::from_millis(91), false));
    }

    #[test]
    fn forced_emit_always_fires_regardless_of_window() {
        let mut throttle = EmitThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.should_emit(t0, false));
        assert!(throttle.should_emit(t0 + Duration::from_millis(1), true));
    }
}
