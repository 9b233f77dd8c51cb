use std::time::Duration;

use chrono::{DateTime, Utc};

/// Cooldown imposed after the platform rejected a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockWindow {
    active: bool,
    until: Option<DateTime<Utc>>,
}

impl BlockWindow {
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn starting_at(now: DateTime<Utc>, cooldown: Duration) -> Self {
        let until = chrono::Duration::from_std(cooldown)
            .ok()
            .and_then(|cooldown| now.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            active: true,
            until: Some(until),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.until
    }

    pub fn may_start(&self, now: DateTime<Utc>) -> bool {
        self.blocking_until(now).is_none()
    }

    /// End of the window if it still blocks at `now`.
    pub fn blocking_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.active {
            return None;
        }
        self.until.filter(|until| now < *until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().expect("timestamp")
    }

    #[test]
    fn inactive_window_never_blocks() {
        let window = BlockWindow::inactive();
        assert!(!window.is_active());
        assert!(window.may_start(at("2024-01-01T00:00:00Z")));
        assert_eq!(window.until(), None);
    }

    #[test]
    fn blocks_until_cooldown_elapses() {
        let now = at("2024-01-01T00:00:00Z");
        let window = BlockWindow::starting_at(now, Duration::from_secs(600));

        assert!(window.is_active());
        assert_eq!(window.until(), Some(at("2024-01-01T00:10:00Z")));
        assert!(!window.may_start(now));
        assert!(!window.may_start(at("2024-01-01T00:09:59Z")));
        assert!(window.may_start(at("2024-01-01T00:10:00Z")));
        assert!(window.may_start(at("2024-01-01T01:00:00Z")));
    }

    #[test]
    fn oversized_cooldown_saturates() {
        let now = at("2024-01-01T00:00:00Z");
        let window = BlockWindow::starting_at(now, Duration::MAX);
        assert_eq!(window.until(), Some(DateTime::<Utc>::MAX_UTC));
        assert!(!window.may_start(at("2999-01-01T00:00:00Z")));
    }
}
