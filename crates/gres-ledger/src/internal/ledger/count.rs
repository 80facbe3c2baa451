use serde::{Deserialize, Serialize};

/// A running GRES total that is either counted against availability or
/// merely tracked. Replaces the "no-consume" numeric sentinel so that
/// arithmetic on an untracked total is impossible to write by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consumption {
    Tracked(u64),
    Untracked,
}

impl Default for Consumption {
    fn default() -> Self {
        Consumption::Tracked(0)
    }
}

impl Consumption {
    #[inline]
    pub fn is_tracked(&self) -> bool {
        matches!(self, Consumption::Tracked(_))
    }

    #[inline]
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Consumption::Tracked(c) => Some(*c),
            Consumption::Untracked => None,
        }
    }

    pub fn add(&mut self, amount: u64) {
        if let Consumption::Tracked(c) = self {
            *c += amount;
        }
    }

    pub fn saturating_sub(&mut self, amount: u64) {
        if let Consumption::Tracked(c) = self {
            *c = c.saturating_sub(amount);
        }
    }
}

impl std::fmt::Display for Consumption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consumption::Tracked(c) => write!(f, "{c}"),
            Consumption::Untracked => write!(f, "untracked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumption_arithmetic() {
        let mut c = Consumption::default();
        c.add(5);
        assert_eq!(c.as_count(), Some(5));
        c.saturating_sub(7);
        assert_eq!(c.as_count(), Some(0));

        let mut u = Consumption::Untracked;
        u.add(5);
        assert_eq!(u.as_count(), None);
        assert!(!u.is_tracked());
    }
}
