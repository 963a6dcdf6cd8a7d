//! Level LED: link quality with a slow breathing dip.

use std::time::Duration;

/// Full-scale PWM duty for the level LED (10-bit channel, capped at 1000).
pub const MAX_DUTY: u16 = 1000;

const BREATH_PERIOD_MS: u128 = 4000;

/// Duty for the level LED given mesh stability and node uptime.
///
/// `stability × 0.7` minus a 0.25 Hz triangle wave peaking at 333, clamped to
/// `0..=MAX_DUTY`. A healthy mesh glows steadily; a shaky one only flickers
/// at the bottom of each breath.
pub fn level_duty(stability: u32, uptime: Duration) -> u16 {
    let phase = (uptime.as_millis() % BREATH_PERIOD_MS) as i64;
    let breathing = (phase - 2000).abs() / 6;
    let value = (f64::from(stability) * 0.7) as i64 - breathing;
    value.clamp(0, i64::from(MAX_DUTY)) as u16
}
