//! Free-tier quota arithmetic, kept as a pure function so both gates share
//! one definition of the boundary.

/// Monthly input+output token ceiling for the free plan.
pub const FREE_TIER_MONTHLY_TOKENS: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    /// `remaining` is `None` for the pro plan (no ceiling).
    Allowed { remaining: Option<i64> },
    Denied,
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { .. })
    }
}

/// Free-plan check against month-to-date consumption. A user sitting exactly
/// on the ceiling still gets their next request; the first token past it is
/// denied.
pub fn evaluate_quota(used_tokens: i64) -> QuotaDecision {
    if used_tokens <= FREE_TIER_MONTHLY_TOKENS {
        QuotaDecision::Allowed {
            remaining: Some(FREE_TIER_MONTHLY_TOKENS - used_tokens),
        }
    } else {
        QuotaDecision::Denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_user_is_allowed() {
        assert_eq!(
            evaluate_quota(0),
            QuotaDecision::Allowed {
                remaining: Some(FREE_TIER_MONTHLY_TOKENS)
            }
        );
    }

    #[test]
    fn exactly_at_ceiling_allows_the_next_request() {
        assert_eq!(
            evaluate_quota(FREE_TIER_MONTHLY_TOKENS),
            QuotaDecision::Allowed { remaining: Some(0) }
        );
    }

    #[test]
    fn one_past_ceiling_denies() {
        assert_eq!(
            evaluate_quota(FREE_TIER_MONTHLY_TOKENS + 1),
            QuotaDecision::Denied
        );
    }
}
