use std::time::{Duration, Instant};

/// Wall-clock age of a worker, rendered for log lines.
#[derive(Clone, Copy, Debug)]
pub struct Stopwatch {
    started_at: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn elapsed_human_friendly(&self) -> String {
        format_duration_human_friendly(self.elapsed())
    }
}

pub fn format_duration_human_friendly(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_ms:.2} ms ({total_seconds:.2} s)");
    }

    let minutes = (total_seconds / 60.0).floor();
    let seconds_remainder = total_seconds - (minutes * 60.0);
    format!(
        "{total_ms:.2} ms ({:.0}m {:.2}s)",
        minutes, seconds_remainder
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Stopwatch, format_duration_human_friendly};

    #[test]
    fn formats_sub_second_duration_in_milliseconds() {
        let rendered = format_duration_human_friendly(Duration::from_millis(250));
        assert_eq!(rendered, "250.00 ms");
    }

    #[test]
    fn formats_seconds_with_ms_and_seconds() {
        let rendered = format_duration_human_friendly(Duration::from_millis(1_500));
        assert_eq!(rendered, "1500.00 ms (1.50 s)");
    }

    #[test]
    fn formats_minutes_with_remainder() {
        let rendered = format_duration_human_friendly(Duration::from_secs(90));
        assert_eq!(rendered, "90000.00 ms (1m 30.00s)");
    }

    #[test]
    fn stopwatch_only_moves_forward() {
        let stopwatch = Stopwatch::start();
        let first = stopwatch.elapsed();
        std::thread::sleep(Duration::from_millis(2));

        assert!(stopwatch.elapsed() > first);
        assert!(stopwatch.elapsed_human_friendly().ends_with("ms"));
    }
}
