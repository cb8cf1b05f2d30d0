//! Label animation bookkeeping. Glyph shaping and rasterization live in the renderer.

use web_time::{Duration, Instant};

const FADE_DURATION: Duration = Duration::from_millis(300);

/// Tracks whether label fades are running so the map can keep requesting frames while they are.
#[derive(Debug, Default)]
pub struct LabelManager {
    fade_deadline: Option<Instant>,
}

impl LabelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when the displayed tile set changed; newly placed labels fade in.
    pub fn on_tiles_changed(&mut self) {
        self.fade_deadline = Some(Instant::now() + FADE_DURATION);
    }

    /// Returns whether label animations are still running.
    pub fn update(&mut self, _dt: f32) -> bool {
        match self.fade_deadline {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                self.fade_deadline = None;
                false
            }
            None => false,
        }
    }
}
