use std::time::Duration;

/// Начальная пауза после первого пустого опроса.
pub const INITIAL_BACKOFF: Duration = Duration::from_micros(50);

/// Ограниченная экспоненциальная пауза для опроса устройства.
///
/// Каждый [`Backoff::snooze`] спит текущую паузу и удваивает её до `max`.
/// [`Backoff::reset`] вызывается, как только пришли данные.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        let max = max.max(INITIAL_BACKOFF);

        Self {
            current: INITIAL_BACKOFF,
            max,
        }
    }

    /// Пауза, которую сделает следующий `snooze`.
    pub fn next_delay(&self) -> Duration {
        self.current
    }

    pub fn snooze(&mut self) {
        std::thread::sleep(self.current);
        self.current = (self.current * 2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_up_to_cap() {
        let mut b = Backoff::new(Duration::from_micros(300));

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(b.next_delay().as_micros());
            b.snooze();
        }

        assert_eq!(seen, vec![50, 100, 200, 300, 300]);
    }

    #[test]
    fn test_reset_and_tiny_cap() {
        let mut b = Backoff::new(Duration::from_nanos(1));
        assert_eq!(b.next_delay(), INITIAL_BACKOFF);
        b.snooze();
        assert_eq!(b.next_delay(), INITIAL_BACKOFF);

        let mut b = Backoff::new(Duration::from_millis(1));
        b.snooze();
        b.snooze();
        b.reset();
        assert_eq!(b.next_delay(), INITIAL_BACKOFF);
    }
}
