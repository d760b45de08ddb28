use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named controllable feature a device may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Power,
    Brightness,
    Color,
    ColorTemp,
    Volume,
    Media,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Power => "power",
            Self::Brightness => "brightness",
            Self::Color => "color",
            Self::ColorTemp => "colorTemp",
            Self::Volume => "volume",
            Self::Media => "media",
        };
        f.write_str(name)
    }
}

/// Set of capabilities declared by a device.
///
/// Ordered so that serialized descriptors are stable across snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn of(caps: &[Capability]) -> Self {
        Self(caps.iter().copied().collect())
    }

    #[must_use]
    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Returns a copy with `cap` removed.
    ///
    /// Used when a probe reveals reduced feature support (e.g. a bulb
    /// without an RGB channel).
    #[must_use]
    pub fn without(&self, cap: Capability) -> Self {
        let mut set = self.0.clone();
        set.remove(&cap);
        Self(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_narrows_only_the_named_capability() {
        let full = CapabilitySet::of(&[
            Capability::Power,
            Capability::Brightness,
            Capability::Color,
        ]);
        let narrowed = full.without(Capability::Color);

        assert!(full.contains(Capability::Color));
        assert!(!narrowed.contains(Capability::Color));
        assert!(narrowed.contains(Capability::Brightness));
        assert_eq!(narrowed.len(), 2);
    }

    #[test]
    fn serializes_as_sorted_array() {
        let set = CapabilitySet::of(&[Capability::Volume, Capability::Power]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["power","volume"]"#);
    }
}
