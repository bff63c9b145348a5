use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

/// A request-filter group
///
/// A small tag gating which registered handlers are reachable for the
/// transport's current authentication state. Group semantics are enforced by
/// the engine; this layer only stores and forwards the value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FilterGroup {
    /// Unfiltered, reachable once the transport is authenticated
    #[default]
    Group0,
    /// Reachable without authentication
    Group1,
    /// Reserved group 2
    Group2,
    /// Reserved group 3
    Group3,
    /// Reserved group 4
    Group4,
}

impl FilterGroup {
    /// The wire value of this group
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Look up a group by its wire value
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Group0),
            1 => Some(Self::Group1),
            2 => Some(Self::Group2),
            3 => Some(Self::Group3),
            4 => Some(Self::Group4),
            _ => None,
        }
    }
}

/// The active request-filter group of an endpoint
///
/// Written by whatever component tracks the transport's authentication state
/// and read by the handler-registration path. Starts out as
/// [`FilterGroup::Group1`] (non-authenticated).
#[derive(Debug)]
pub struct GroupRequestFilter {
    active: AtomicU8,
}

impl GroupRequestFilter {
    const DEFAULT: FilterGroup = FilterGroup::Group1;

    pub(crate) fn new() -> Self {
        Self {
            active: AtomicU8::new(Self::DEFAULT.value()),
        }
    }

    /// The currently active group
    pub fn group(&self) -> FilterGroup {
        FilterGroup::from_value(self.active.load(Ordering::Acquire))
            .unwrap_or(Self::DEFAULT)
    }

    /// Atomically switch the active group
    pub fn set_group(&self, group: FilterGroup) {
        debug!(?group, "setting active request filter group");
        self.active.store(group.value(), Ordering::Release);
    }

    /// Restore the default (non-authenticated) group
    pub(crate) fn reset(&self) {
        self.active.store(Self::DEFAULT.value(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_non_authenticated_group() {
        assert_eq!(GroupRequestFilter::new().group(), FilterGroup::Group1);
    }

    #[test]
    fn stores_and_resets_the_active_group() {
        let filter = GroupRequestFilter::new();
        filter.set_group(FilterGroup::Group0);
        assert_eq!(filter.group(), FilterGroup::Group0);
        filter.reset();
        assert_eq!(filter.group(), FilterGroup::Group1);
    }

    #[test]
    fn group_values_round_trip() {
        for value in 0..=4 {
            assert_eq!(FilterGroup::from_value(value).unwrap().value(), value);
        }
        assert_eq!(FilterGroup::from_value(5), None);
    }
}
