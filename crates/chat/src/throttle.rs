use std::time::Duration;

use tokio::time::Instant;

/// Gate allowing an expensive operation at most once per `interval`.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_fired: Option<Instant>,
    pending: bool,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
            pending: false,
        }
    }

    /// Fires when never fired or the interval has elapsed, otherwise marks a pending request.
    pub fn poll(&mut self, now: Instant) -> bool {
        let due = self
            .last_fired
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.fire(now);
        } else {
            self.pending = true;
        }
        due
    }

    pub fn fire(&mut self, now: Instant) {
        self.last_fired = Some(now);
        self.pending = false;
    }

    /// A request was suppressed since the last fire.
    pub fn has_pending(&self) -> bool {
        self.pending
    }

}

/// What a delta asks the display to do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderDecision {
    pub render: bool,
    pub scroll: bool,
}

/// Accumulates one streamed reply and decides when to re-render it.
#[derive(Debug, Clone)]
pub struct StreamRenderer {
    buffer: String,
    render: Throttle,
    scroll: Throttle,
}

impl StreamRenderer {
    pub fn new(render_interval: Duration, scroll_interval: Duration) -> Self {
        Self {
            buffer: String::new(),
            render: Throttle::new(render_interval),
            scroll: Throttle::new(scroll_interval),
        }
    }

    pub fn push_delta(&mut self, delta: &str, now: Instant) -> RenderDecision {
        self.buffer.push_str(delta);
        RenderDecision {
            render: self.render.poll(now),
            scroll: self.scroll.poll(now),
        }
    }

    /// Full accumulated text; renders always use all of it.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The screen lags the buffer: a render was deferred since the last one.
    pub fn has_deferred_render(&self) -> bool {
        self.render.has_pending()
    }

    /// Ends the stream. The final render is unconditional.
    pub fn finish(&mut self, now: Instant) -> String {
        self.render.fire(now);
        self.scroll.fire(now);
        std::mem::take(&mut self.buffer)
    }

}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn throttle_fires_first_then_once_per_interval() {
        let mut throttle = Throttle::new(Duration::from_millis(50));
        let start = Instant::now();

        assert!(throttle.poll(start));
        assert!(!throttle.poll(start + Duration::from_millis(10)));
        assert!(throttle.has_pending());
        assert!(!throttle.poll(start + Duration::from_millis(49)));
        assert!(throttle.poll(start + Duration::from_millis(50)));
        assert!(!throttle.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn renderer_uses_independent_intervals() {
        let mut renderer =
            StreamRenderer::new(Duration::from_millis(50), Duration::from_millis(100));
        let start = Instant::now();

        assert_eq!(
            renderer.push_delta("Once", start),
            RenderDecision {
                render: true,
                scroll: true
            }
        );
        assert_eq!(
            renderer.push_delta(" upon", start + Duration::from_millis(60)),
            RenderDecision {
                render: true,
                scroll: false
            }
        );
        assert_eq!(
            renderer.push_delta(" a", start + Duration::from_millis(70)),
            RenderDecision::default()
        );
        assert_eq!(renderer.buffer(), "Once upon a");
    }

    #[tokio::test(start_paused = true)]
    async fn finish_returns_whole_buffer_even_when_throttled() {
        let mut renderer =
            StreamRenderer::new(Duration::from_millis(50), Duration::from_millis(100));
        let start = Instant::now();
        renderer.push_delta("Hi", start);
        assert!(!renderer.has_deferred_render());
        assert!(!renderer.push_delta(" there", start).render);
        assert!(renderer.has_deferred_render());

        assert_eq!(renderer.finish(start), "Hi there");
        assert!(!renderer.has_deferred_render());
        assert!(renderer.is_empty());
    }
}
