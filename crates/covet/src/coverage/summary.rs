//! Coverage aggregation
//!
//! Line, branch and method ratios at every level of the result tree. A unit
//! is covered when its hit count is above zero; a method is covered when any
//! of its lines is.

use super::model::{Classes, Documents, MethodCoverage, Methods, Modules};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Covered units out of total units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageDetails {
    /// Units with hits
    pub covered: u64,
    /// All trackable units
    pub total: u64,
}

impl CoverageDetails {
    /// Create details
    #[must_use]
    pub const fn new(covered: u64, total: u64) -> Self {
        Self { covered, total }
    }
}

impl Add for CoverageDetails {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            covered: self.covered + rhs.covered,
            total: self.total + rhs.total,
        }
    }
}

impl AddAssign for CoverageDetails {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for CoverageDetails {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// A level of the result tree that can be measured
pub trait Measurable {
    /// Line coverage
    fn lines(&self) -> CoverageDetails;
    /// Branch coverage
    fn branches(&self) -> CoverageDetails;
    /// Method coverage
    fn methods(&self) -> CoverageDetails;
}

impl Measurable for MethodCoverage {
    fn lines(&self) -> CoverageDetails {
        CoverageDetails::new(
            self.lines.values().filter(|&&h| h > 0).count() as u64,
            self.lines.len() as u64,
        )
    }

    fn branches(&self) -> CoverageDetails {
        CoverageDetails::new(
            self.branches.iter().filter(|b| b.hits > 0).count() as u64,
            self.branches.len() as u64,
        )
    }

    fn methods(&self) -> CoverageDetails {
        CoverageDetails::new(u64::from(self.lines.values().any(|&h| h > 0)), 1)
    }
}

macro_rules! measurable_map {
    ($($level:ty),*) => {
        $(
            impl Measurable for $level {
                fn lines(&self) -> CoverageDetails {
                    self.values().map(Measurable::lines).sum()
                }

                fn branches(&self) -> CoverageDetails {
                    self.values().map(Measurable::branches).sum()
                }

                fn methods(&self) -> CoverageDetails {
                    self.values().map(Measurable::methods).sum()
                }
            }
        )*
    };
}

// Methods, Classes, Documents and Modules are all BTreeMaps one level apart
measurable_map!(Methods, Classes, Documents, Modules);

/// Coverage ratios over a result tree
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageSummary;

impl CoverageSummary {
    /// Line coverage of any level
    #[must_use]
    pub fn calculate_line_coverage<T: Measurable + ?Sized>(level: &T) -> CoverageDetails {
        level.lines()
    }

    /// Branch coverage of any level
    #[must_use]
    pub fn calculate_branch_coverage<T: Measurable + ?Sized>(level: &T) -> CoverageDetails {
        level.branches()
    }

    /// Method coverage of any level
    #[must_use]
    pub fn calculate_method_coverage<T: Measurable + ?Sized>(level: &T) -> CoverageDetails {
        level.methods()
    }
}
