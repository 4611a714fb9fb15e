//! Deliverability score and engagement rates.

use crate::model::AccountTotals;

/// Inbox and spam placements located over a window of cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementCounts {
    pub inbox: u64,
    pub spam: u64,
}

impl PlacementCounts {
    pub fn located(&self) -> u64 {
        self.inbox + self.spam
    }

    /// Spam share of located placements as a percentage, 0 when nothing was located.
    pub fn spam_rate(&self) -> f64 {
        match self.located() {
            0 => 0.0,
            located => self.spam as f64 / located as f64 * 100.0,
        }
    }
}

/// `max(0, 100 - spam rate)`; 100 when nothing was located.
pub fn deliverability_score(placements: PlacementCounts) -> f64 {
    (100.0 - placements.spam_rate()).max(0.0)
}

/// Percentage of `part` over `sent`, 0 when nothing was sent.
pub fn rate(part: u64, sent: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        part as f64 / sent as f64 * 100.0
    }
}

pub fn open_rate(totals: &AccountTotals) -> f64 {
    rate(totals.opened, totals.sent)
}

pub fn reply_rate(totals: &AccountTotals) -> f64 {
    rate(totals.replied, totals.sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_located_scores_full_marks() {
        assert_eq!(deliverability_score(PlacementCounts::default()), 100.0);
    }

    #[test]
    fn spam_rate_is_share_of_located_placements() {
        let placements = PlacementCounts { inbox: 3, spam: 1 };
        assert_eq!(placements.spam_rate(), 25.0);
        assert_eq!(deliverability_score(placements), 75.0);
    }

    #[test]
    fn all_spam_scores_zero() {
        assert_eq!(deliverability_score(PlacementCounts { inbox: 0, spam: 4 }), 0.0);
    }

    #[test]
    fn rates_are_zero_without_sends() {
        let totals = AccountTotals::default();
        assert_eq!(open_rate(&totals), 0.0);
        assert_eq!(reply_rate(&totals), 0.0);
    }

    #[test]
    fn rates_use_running_totals() {
        let totals = AccountTotals {
            sent: 4,
            opened: 3,
            replied: 1,
            ..AccountTotals::default()
        };
        assert_eq!(open_rate(&totals), 75.0);
        assert_eq!(reply_rate(&totals), 25.0);
    }
}
