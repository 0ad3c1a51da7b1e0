//! Dataset kinds that can be requested from the metering API.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A set of fetchable datasets, one bit per kind.
///
/// Individual kinds are the associated constants; any subset is expressed by
/// OR-ing them together. [`DatasetKind::ALL`] is an alias for the union of
/// every kind and is never yielded by [`DatasetKind::iter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DatasetKind(u8);

impl DatasetKind {
    pub const NONE: Self = Self(0);
    pub const MEASURE: Self = Self(1 << 0);
    pub const HISTORICAL_CONSUMPTION: Self = Self(1 << 1);
    pub const HISTORICAL_GENERATION: Self = Self(1 << 2);
    pub const HISTORICAL_POWER_DEMAND: Self = Self(1 << 3);

    pub const ALL: Self = Self(0b1111);

    /// Every individual kind, in evaluation order.
    pub const KINDS: [Self; 4] = [
        Self::MEASURE,
        Self::HISTORICAL_CONSUMPTION,
        Self::HISTORICAL_GENERATION,
        Self::HISTORICAL_POWER_DEMAND,
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` and `other` share at least one bit.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True if this value names exactly one kind.
    pub const fn is_single(self) -> bool {
        self.0 != 0 && self.0 & (self.0 - 1) == 0
    }

    /// Iterate over the individual kinds contained in this set.
    pub fn iter(self) -> impl Iterator<Item = DatasetKind> {
        Self::KINDS.into_iter().filter(move |kind| self.intersects(*kind))
    }

    /// Configuration/log name of a single kind.
    pub fn name(self) -> &'static str {
        match self {
            Self::MEASURE => "measure",
            Self::HISTORICAL_CONSUMPTION => "historical_consumption",
            Self::HISTORICAL_GENERATION => "historical_generation",
            Self::HISTORICAL_POWER_DEMAND => "historical_power_demand",
            Self::NONE => "none",
            Self::ALL => "all",
            _ => "mixed",
        }
    }

    /// Parse a kind name. Dashes and underscores are interchangeable.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "measure" => Some(Self::MEASURE),
            "historical_consumption" => Some(Self::HISTORICAL_CONSUMPTION),
            "historical_generation" => Some(Self::HISTORICAL_GENERATION),
            "historical_power_demand" => Some(Self::HISTORICAL_POWER_DEMAND),
            "all" => Some(Self::ALL),
            _ => None,
        }
    }

    /// Parse a comma separated list of kind names into a set.
    pub fn parse_list(list: &str) -> Option<Self> {
        list.split(',')
            .filter(|part| !part.trim().is_empty())
            .try_fold(Self::NONE, |acc, part| Self::from_name(part).map(|k| acc | k))
    }
}

impl BitOr for DatasetKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DatasetKind {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DatasetKind {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl FromIterator<DatasetKind> for DatasetKind {
    fn from_iter<I: IntoIterator<Item = DatasetKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, |acc, kind| acc | kind)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }

        let names: Vec<String> = self.iter().map(|k| k.name().to_uppercase()).collect();
        f.write_str(&names.join("|"))
    }
}
