// SPDX-License-Identifier: AGPL-3.0-only

//! Minimisation front-end: strategy selection and per-chip batching.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::entry::RoutingTableEntry;
use crate::error::{Result, RoutingError};
use crate::table::validate;
use crate::{ordered_covering, remove_default_routes};

/// Available minimisation algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Drop entries that default routing reproduces. Cheap, but only helps
    /// tables with straight-through traffic.
    RemoveDefaultRoutes,
    /// Greedy ordered-covering merge search.
    OrderedCovering,
}

impl Strategy {
    /// Run this strategy on one table.
    ///
    /// # Errors
    ///
    /// [`RoutingError::MinimisationFailed`] if the result exceeds
    /// `target_length`.
    pub fn run(
        self,
        table: &[RoutingTableEntry],
        target_length: Option<usize>,
        config: &MinimiseConfig,
    ) -> Result<Vec<RoutingTableEntry>> {
        match self {
            Self::RemoveDefaultRoutes => remove_default_routes::minimise(table, target_length),
            Self::OrderedCovering => {
                ordered_covering::minimise(table, target_length, config.default_routing)
            }
        }
    }
}

/// Minimiser configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimiseConfig {
    /// Strategies tried in order after the identity check.
    pub strategies: Vec<Strategy>,
    /// Allow entries to be elided in favour of hardware default routing.
    pub default_routing: bool,
}

impl Default for MinimiseConfig {
    fn default() -> Self {
        Self {
            strategies: vec![Strategy::OrderedCovering],
            default_routing: false,
        }
    }
}

impl MinimiseConfig {
    /// Enable default-route elision: try it first on its own and also run
    /// it after ordered covering.
    #[must_use]
    pub fn with_default_routing(mut self) -> Self {
        self.default_routing = true;
        if !self.strategies.contains(&Strategy::RemoveDefaultRoutes) {
            self.strategies.insert(0, Strategy::RemoveDefaultRoutes);
        }
        self
    }

    /// Replace the strategy list.
    #[must_use]
    pub fn with_strategies(mut self, strategies: Vec<Strategy>) -> Self {
        self.strategies = strategies;
        self
    }
}

/// Per-chip table size limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TargetLengths {
    /// Minimise every table as far as possible.
    #[default]
    Unbounded,
    /// The same limit for every chip.
    Uniform(usize),
    /// Individual limits; chips not listed are unbounded.
    PerChip(BTreeMap<(u8, u8), usize>),
}

impl TargetLengths {
    /// Limit for one chip.
    pub fn for_chip(&self, chip: (u8, u8)) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Uniform(n) => Some(*n),
            Self::PerChip(map) => map.get(&chip).copied(),
        }
    }
}

impl From<Option<usize>> for TargetLengths {
    fn from(target: Option<usize>) -> Self {
        target.map_or(Self::Unbounded, Self::Uniform)
    }
}

/// Minimise one table with the default configuration (ordered covering,
/// no default routing).
///
/// # Errors
///
/// See [`minimise_table`].
pub fn minimise(
    table: &[RoutingTableEntry],
    target_length: Option<usize>,
) -> Result<Vec<RoutingTableEntry>> {
    minimise_table(table, target_length, &MinimiseConfig::default())
}

/// Minimise one table.
///
/// A table already within `target_length` is returned unchanged. Otherwise
/// each strategy is tried in turn and the first result that fits wins. With
/// no target, every strategy runs and the smallest result is returned; ties
/// go to the later strategy.
///
/// # Errors
///
/// - [`RoutingError::MalformedEntry`] / [`RoutingError::NonOrthogonal`] for
///   bad input.
/// - [`RoutingError::MinimisationFailed`] carrying the best length any
///   strategy reached.
pub fn minimise_table(
    table: &[RoutingTableEntry],
    target_length: Option<usize>,
    config: &MinimiseConfig,
) -> Result<Vec<RoutingTableEntry>> {
    validate(table)?;

    let Some(target) = target_length else {
        let mut smallest = table.to_vec();
        for strategy in &config.strategies {
            let candidate = strategy.run(table, None, config)?;
            if candidate.len() <= smallest.len() {
                smallest = candidate;
            }
        }
        return Ok(smallest);
    };

    if table.len() <= target {
        return Ok(table.to_vec());
    }

    let mut best_achieved = table.len();
    for strategy in &config.strategies {
        match strategy.run(table, Some(target), config) {
            Ok(new_table) => return Ok(new_table),
            Err(RoutingError::MinimisationFailed { final_length, .. }) => {
                debug!(?strategy, final_length, target, "Strategy missed target");
                best_achieved = best_achieved.min(final_length);
            }
            Err(e) => return Err(e),
        }
    }
    Err(RoutingError::minimisation_failed(target, best_achieved))
}

/// Minimise the tables of many chips.
///
/// Empty results are omitted from the output.
///
/// # Errors
///
/// The first failure, with the offending chip attached to
/// [`RoutingError::MinimisationFailed`].
pub fn minimise_all(
    tables: &BTreeMap<(u8, u8), Vec<RoutingTableEntry>>,
    target_lengths: &TargetLengths,
    config: &MinimiseConfig,
) -> Result<BTreeMap<(u8, u8), Vec<RoutingTableEntry>>> {
    let mut out = BTreeMap::new();
    for (&(x, y), table) in tables {
        let new_table = minimise_table(table, target_lengths.for_chip((x, y)), config)
            .map_err(|e| e.with_chip(x, y))?;
        info!(x, y, before = table.len(), after = new_table.len(), "Minimised routing table");
        if !new_table.is_empty() {
            out.insert((x, y), new_table);
        }
    }
    Ok(out)
}
