//! Machine-structure and machine-state types (§3 of the workflow spec):
//! [`MachineStructure`], [`RowState`], [`ExtractedState`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use vvw_error::{ErrorCode, WorkflowError};

/// The shape of a vending machine's slot grid.
///
/// *Invariants*: `row_order.len() == row_count`;
/// `column_order.len() == columns_per_row`;
/// `total_positions == row_count * columns_per_row`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStructure {
    /// Number of rows.
    pub row_count: u32,
    /// Number of columns per row.
    pub columns_per_row: u32,
    /// Row identifiers in physical order (e.g. `["A", "B", ...]`).
    pub row_order: Vec<String>,
    /// Column identifiers in physical order (e.g. `["1", "2", ...]`).
    pub column_order: Vec<String>,
    /// `row_count * columns_per_row`.
    pub total_positions: u32,
}

impl MachineStructure {
    /// Build a structure, computing `total_positions` and validating the
    /// invariants in the type's doc comment.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationError`] if any invariant is violated.
    pub fn new(
        row_order: Vec<String>,
        column_order: Vec<String>,
    ) -> Result<Self, WorkflowError> {
        let row_count = row_order.len() as u32;
        let columns_per_row = column_order.len() as u32;
        let s = Self {
            row_count,
            columns_per_row,
            row_order,
            column_order,
            total_positions: row_count * columns_per_row,
        };
        s.validate()?;
        Ok(s)
    }

    /// The canonical 6×7 vending-machine layout used as a parser fallback
    /// (§4.7.2 / §9 "Canonical 6×7 fallback").
    #[must_use]
    pub fn canonical_6x7() -> Self {
        Self {
            row_count: 6,
            columns_per_row: 7,
            row_order: vec!["A", "B", "C", "D", "E", "F"]
                .into_iter()
                .map(String::from)
                .collect(),
            column_order: (1..=7).map(|n| n.to_string()).collect(),
            total_positions: 42,
        }
    }

    /// Re-check the structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::ValidationError`] describing the first violated
    /// invariant.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.row_order.len() as u32 != self.row_count {
            return Err(WorkflowError::new(
                ErrorCode::ValidationError,
                format!(
                    "rowOrder length {} does not match rowCount {}",
                    self.row_order.len(),
                    self.row_count
                ),
            ));
        }
        if self.column_order.len() as u32 != self.columns_per_row {
            return Err(WorkflowError::new(
                ErrorCode::ValidationError,
                format!(
                    "columnOrder length {} does not match columnsPerRow {}",
                    self.column_order.len(),
                    self.columns_per_row
                ),
            ));
        }
        if self.total_positions != self.row_count * self.columns_per_row {
            return Err(WorkflowError::new(
                ErrorCode::ValidationError,
                format!(
                    "totalPositions {} does not equal rowCount*columnsPerRow ({}*{})",
                    self.total_positions, self.row_count, self.columns_per_row
                ),
            ));
        }
        Ok(())
    }

    /// `true` if either axis exceeds 10 — the "implausible" trigger for the
    /// canonical-6×7 parser fallback (§9).
    #[must_use]
    pub fn is_implausible(&self) -> bool {
        self.row_count > 10 || self.columns_per_row > 10
    }
}

/// State of a single row: which positions are filled vs. empty.
///
/// *Invariant*: `filled_positions` and `empty_positions` are disjoint;
/// when the enclosing [`MachineStructure`] is known,
/// `filled_positions.len() + empty_positions.len() == columns_per_row`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowState {
    /// Free-text row status (e.g. `"full"`, `"partial"`, `"empty"`).
    #[serde(default)]
    pub status: String,
    /// Positions observed as filled (e.g. `["A1", "A2"]`).
    #[serde(default)]
    pub filled_positions: Vec<String>,
    /// Positions observed as empty.
    #[serde(default)]
    pub empty_positions: Vec<String>,
    /// Reported quantity (may disagree with `filled_positions.len()`; see
    /// §4.7.3 item 5 — quantity consistency is a warning, not an error).
    #[serde(default)]
    pub quantity: u32,
    /// Free-text notes.
    #[serde(default)]
    pub notes: String,
}

impl RowState {
    /// `true` if `filled_positions` and `empty_positions` share no element.
    #[must_use]
    pub fn positions_disjoint(&self) -> bool {
        self.filled_positions
            .iter()
            .all(|p| !self.empty_positions.contains(p))
    }

    /// `true` if `filled_positions.len() + empty_positions.len() ==
    /// columns_per_row`.
    #[must_use]
    pub fn accounts_for_all_columns(&self, columns_per_row: u32) -> bool {
        (self.filled_positions.len() + self.empty_positions.len()) as u32 == columns_per_row
    }

    /// `true` if the reported `quantity` disagrees with the observed
    /// `filled_positions` count (a warning-level inconsistency, §4.7.3.5).
    #[must_use]
    pub fn quantity_disagrees_with_filled_count(&self) -> bool {
        self.quantity as usize != self.filled_positions.len()
    }
}

/// A fully extracted machine state: per-row states plus machine-wide
/// aggregates.
///
/// *Invariant*: `total_empty_count == Σ |rowState.empty_positions|` and
/// `total_filled_count == Σ |rowState.filled_positions|`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedState {
    /// The machine's structure, if known at extraction time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_structure: Option<MachineStructure>,
    /// Per-row states, keyed by row id.
    #[serde(default)]
    pub row_states: BTreeMap<String, RowState>,
    /// All empty positions across all rows (cached aggregate).
    #[serde(default)]
    pub empty_positions: Vec<String>,
    /// All filled positions across all rows (cached aggregate).
    #[serde(default)]
    pub filled_positions: Vec<String>,
    /// Cached count of `empty_positions`.
    #[serde(default)]
    pub total_empty_count: u32,
    /// Cached count of `filled_positions`.
    #[serde(default)]
    pub total_filled_count: u32,
    /// Free-text overall status summary.
    #[serde(default)]
    pub overall_status: String,
    /// Free-text observations collected during parsing.
    #[serde(default)]
    pub observations: Vec<String>,
}

impl ExtractedState {
    /// Recompute the cached aggregate fields from `row_states`, ensuring the
    /// invariant in the type's doc comment.
    pub fn recompute_aggregates(&mut self) {
        let mut filled = Vec::new();
        let mut empty = Vec::new();
        for row in self.row_states.values() {
            filled.extend(row.filled_positions.iter().cloned());
            empty.extend(row.empty_positions.iter().cloned());
        }
        self.total_filled_count = filled.len() as u32;
        self.total_empty_count = empty.len() as u32;
        self.filled_positions = filled;
        self.empty_positions = empty;
    }

    /// `true` if the cached aggregates are consistent with the per-row
    /// states (§8 invariant 6).
    #[must_use]
    pub fn aggregates_are_consistent(&self) -> bool {
        let filled: usize = self.row_states.values().map(|r| r.filled_positions.len()).sum();
        let empty: usize = self.row_states.values().map(|r| r.empty_positions.len()).sum();
        filled as u32 == self.total_filled_count && empty as u32 == self.total_empty_count
    }

    /// Every row named in `structure.row_order` has a corresponding entry in
    /// `row_states` (§4.8 `ExtractedState` validation).
    #[must_use]
    pub fn every_row_has_state(&self, structure: &MachineStructure) -> bool {
        structure.row_order.iter().all(|r| self.row_states.contains_key(r))
    }
}
