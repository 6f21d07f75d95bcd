use std::time::Duration;

use crate::domain::models::TimeWindow;

pub const WINDOW_MINUTES: u32 = 2;

/// Window start minutes, roughly ordered by how often the title card shows
/// up in that part of an episode.
pub const PLAN_ORDER: [u32; 5] = [4, 2, 6, 0, 8];

/// Sampling plan for a title of the given runtime. Windows starting at or
/// past the end of the title are dropped; titles shorter than one window get
/// no plan at all.
pub fn plan_chunks(duration: Duration) -> Vec<TimeWindow> {
    let window = Duration::from_secs(u64::from(WINDOW_MINUTES) * 60);
    if duration < window {
        return Vec::new();
    }

    PLAN_ORDER
        .iter()
        .map(|&start| TimeWindow::new(start, start + WINDOW_MINUTES))
        .filter(|w| w.start() < duration)
        .collect()
}
