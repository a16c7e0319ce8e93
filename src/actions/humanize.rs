use crate::core::config::{DelayRange, PacingConfig};
use crate::types::ElementRect;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

/// Randomised timing and geometry for human-plausible interaction.
///
/// Every pause, click offset and mouse path is drawn fresh so that no two
/// cycles share a timing fingerprint.
pub struct Pacer {
    pacing: PacingConfig,
    rng: Mutex<StdRng>,
}

impl Pacer {
    pub fn new(pacing: PacingConfig) -> Self {
        Self {
            pacing,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Reproducible draws, for tests.
    pub fn seeded(pacing: PacingConfig, seed: u64) -> Self {
        Self {
            pacing,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn pacing(&self) -> &PacingConfig {
        &self.pacing
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    /// A duration drawn uniformly from `range`.
    pub fn draw(&self, range: DelayRange) -> Duration {
        if range.min_ms >= range.max_ms {
            return Duration::from_millis(range.min_ms);
        }
        let ms = self.with_rng(|rng| rng.random_range(range.min_ms..=range.max_ms));
        Duration::from_millis(ms)
    }

    pub async fn micro(&self) {
        tokio::time::sleep(self.draw(self.pacing.micro)).await;
    }

    pub async fn step(&self) {
        tokio::time::sleep(self.draw(self.pacing.step)).await;
    }

    pub async fn read(&self) {
        tokio::time::sleep(self.draw(self.pacing.read)).await;
    }

    /// Per-key delay plus the inter-key gap for the normal or slow cadence.
    pub fn keystroke_delay(&self, slow: bool) -> Duration {
        let (range, gap) = if slow {
            (self.pacing.slow_keystroke, self.pacing.slow_keystroke_gap_ms)
        } else {
            (self.pacing.keystroke, self.pacing.keystroke_gap_ms)
        };
        self.draw(range) + Duration::from_millis(gap)
    }

    /// Random point inside the middle 35-65 % of the box.
    pub fn click_point(&self, rect: &ElementRect) -> (f64, f64) {
        self.with_rng(|rng| {
            let fx: f64 = rng.random_range(0.35..=0.65);
            let fy: f64 = rng.random_range(0.35..=0.65);
            (rect.x + rect.width * fx, rect.y + rect.height * fy)
        })
    }

    /// Interpolated path from `from` to a jittered `to`. The last point is
    /// where the press lands.
    pub fn mouse_path(&self, from: (f64, f64), to: (f64, f64)) -> Vec<(f64, f64)> {
        let (min_steps, max_steps) = self.pacing.mouse_steps;
        let jitter = self.pacing.mouse_jitter_px.abs();
        self.with_rng(|rng| {
            let steps = rng.random_range(min_steps.max(1)..=max_steps.max(min_steps.max(1)));
            let (jx, jy) = if jitter > 0.0 {
                (rng.random_range(-jitter..=jitter), rng.random_range(-jitter..=jitter))
            } else {
                (0.0, 0.0)
            };
            let target = (to.0 + jx, to.1 + jy);
            (1..=steps)
                .map(|i| {
                    let t = f64::from(i) / f64::from(steps);
                    (
                        from.0 + (target.0 - from.0) * t,
                        from.1 + (target.1 - from.1) * t,
                    )
                })
                .collect()
        })
    }

    /// Wheel deltas for a short reading scroll: 2-4 passes of
    /// 250..max(550, height/3) pixels.
    pub fn scroll_passes(&self, page_height: f64) -> Vec<f64> {
        let upper = 550f64.max(page_height / 3.0);
        self.with_rng(|rng| {
            let passes = rng.random_range(2..=4);
            (0..passes).map(|_| rng.random_range(250.0..=upper)).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer() -> Pacer {
        Pacer::seeded(PacingConfig::default(), 7)
    }

    #[test]
    fn test_draw_stays_in_band() {
        let pacer = pacer();
        for _ in 0..200 {
            let d = pacer.draw(DelayRange::new(300, 800));
            assert!(d >= Duration::from_millis(300) && d <= Duration::from_millis(800));
        }
        assert_eq!(pacer.draw(DelayRange::zero()), Duration::ZERO);
    }

    #[test]
    fn test_click_point_inside_middle_of_box() {
        let pacer = pacer();
        let rect = ElementRect {
            x: 100.0,
            y: 50.0,
            width: 200.0,
            height: 30.0,
        };
        for _ in 0..200 {
            let (x, y) = pacer.click_point(&rect);
            assert!((170.0..=230.0).contains(&x));
            assert!((60.5..=69.5).contains(&y));
        }
    }

    #[test]
    fn test_mouse_path_bounds() {
        let pacer = pacer();
        for _ in 0..50 {
            let path = pacer.mouse_path((0.0, 0.0), (400.0, 300.0));
            assert!((8..=16).contains(&path.len()));
            let (lx, ly) = path[path.len() - 1];
            assert!((lx - 400.0).abs() <= 3.0 && (ly - 300.0).abs() <= 3.0);
        }
    }

    #[test]
    fn test_scroll_passes() {
        let pacer = pacer();
        for _ in 0..50 {
            let passes = pacer.scroll_passes(3000.0);
            assert!((2..=4).contains(&passes.len()));
            assert!(passes.iter().all(|d| (250.0..=1000.0).contains(d)));
        }
    }

    #[test]
    fn test_keystroke_delay_cadences() {
        let pacer = pacer();
        let fast = pacer.keystroke_delay(false);
        let slow = pacer.keystroke_delay(true);
        assert!(fast >= Duration::from_millis(150) && fast <= Duration::from_millis(230));
        assert!(slow >= Duration::from_millis(280) && slow <= Duration::from_millis(400));
    }
}
