/// Per-connection tolerance for malformed frames.
#[derive(Debug, Clone)]
pub struct ViolationBudget {
    limit: u32,
    count: u32,
}

impl ViolationBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, count: 0 }
    }

    /// Record one violation. Returns `true` once the budget is exceeded.
    pub fn record(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.count > self.limit
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

impl Default for ViolationBudget {
    fn default() -> Self {
        Self::new(super::DEFAULT_VIOLATION_BUDGET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_violation_does_not_exhaust() {
        let mut budget = ViolationBudget::new(10);
        assert!(!budget.record());
        assert_eq!(budget.count(), 1);
    }

    #[test]
    fn test_budget_exhausted_after_limit() {
        let mut budget = ViolationBudget::new(3);
        assert!(!budget.record());
        assert!(!budget.record());
        assert!(!budget.record());
        assert!(budget.record());
        assert!(budget.is_exhausted());
    }
}
