use std::thread;
use std::time::{Duration, Instant};

/// Calls `probe` every `interval` until it returns true or `deadline` elapses.
/// The probe always runs at least once, even with a zero deadline.
pub fn poll_until<F>(mut probe: F, interval: Duration, deadline: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if probe() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return false;
        }
        thread::sleep(interval.min(deadline - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_as_soon_as_probe_passes() {
        let mut calls = 0;
        let ready = poll_until(
            || {
                calls += 1;
                calls == 3
            },
            Duration::from_millis(5),
            Duration::from_secs(2),
        );
        assert!(ready);
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_deadline() {
        let start = Instant::now();
        let ready = poll_until(|| false, Duration::from_millis(10), Duration::from_millis(60));
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn zero_deadline_probes_once() {
        let mut calls = 0;
        let ready = poll_until(
            || {
                calls += 1;
                false
            },
            Duration::from_millis(10),
            Duration::ZERO,
        );
        assert!(!ready);
        assert_eq!(calls, 1);
    }
}
