use tsl_model::ResourceProfile;
use tracing::trace;

/// Worker-wide resource accounting.
///
/// Tracks the total capacity handed to the worker and the part currently reserved by slots.
/// Pure bookkeeping: no I/O and no interior mutability, the owner serializes access.
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    total: ResourceProfile,
    reserved: ResourceProfile,
}

impl ResourceBudget {
    pub fn new(total: ResourceProfile) -> Self {
        Self {
            total,
            reserved: ResourceProfile::ZERO,
        }
    }

    /// Reserves `profile` if it fits into what is left; all-or-nothing.
    pub fn reserve(&mut self, profile: &ResourceProfile) -> bool {
        let Some(reserved) = self.reserved.checked_add(profile) else {
            return false;
        };
        if !reserved.fits_within(&self.total) {
            trace!(requested = %profile, available = %self.available_budget(), "budget exhausted");
            return false;
        }
        self.reserved = reserved;
        true
    }

    /// Returns a previously reserved `profile` to the budget.
    ///
    /// # Panics
    /// If `profile` was never reserved: the accounting is corrupt at that point.
    pub fn release(&mut self, profile: &ResourceProfile) {
        match self.reserved.checked_sub(profile) {
            Some(reserved) => self.reserved = reserved,
            None => panic!(
                "cannot release {profile}: only {} is reserved; this indicates a programming bug",
                self.reserved
            ),
        }
    }

    pub fn available_budget(&self) -> ResourceProfile {
        self.total.saturating_sub(&self.reserved)
    }

    pub fn total_budget(&self) -> &ResourceProfile {
        &self.total
    }

    pub fn reserved_budget(&self) -> &ResourceProfile {
        &self.reserved
    }
}
