//! Resync cooldown

use chrono::{DateTime, Utc};

/// Whether enough time has passed since the last resync to run another
///
/// A connector that never resynced is always due.
pub fn cooldown_elapsed(last_resync_at: Option<DateTime<Utc>>, cooldown_secs: u64) -> bool {
    let Some(last) = last_resync_at else {
        return true;
    };
    let cooldown = i64::try_from(cooldown_secs).unwrap_or(i64::MAX);
    (Utc::now() - last).num_seconds() >= cooldown
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_never_resynced_is_due() {
        assert!(cooldown_elapsed(None, 0));
        assert!(cooldown_elapsed(None, 3600));
    }

    #[test]
    fn test_recent_resync_waits() {
        let last = Utc::now() - Duration::seconds(5);
        assert!(!cooldown_elapsed(Some(last), 60));
    }

    #[test]
    fn test_old_resync_is_due() {
        let last = Utc::now() - Duration::seconds(120);
        assert!(cooldown_elapsed(Some(last), 60));
        assert!(cooldown_elapsed(Some(Utc::now()), 0));
    }

    #[test]
    fn test_huge_cooldown_does_not_overflow() {
        let last = Utc::now() - Duration::days(365);
        assert!(!cooldown_elapsed(Some(last), u64::MAX));
    }
}
