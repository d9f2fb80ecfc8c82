// ===============================
// src/columns.rs (column configuration per grid)
// ===============================
//
// Stored descriptors (order / visibility / pin / width) and the resolution
// step that merges them with the view layer's base column definitions.
//
// Resolution order:
//   LEFT partition (by leftOrder) + NONE (by order) + RIGHT (by rightOrder)
//   - missing order values sort after present ones
//   - ties and missing values fall back to base-definition order
//   - invisible columns are dropped
//   - base columns never stored are appended to NONE, visible
//
use ahash::{AHashMap, AHashSet};
use serde::Serialize;
use thiserror::Error;

use crate::domain::{ColumnDescriptor, ColumnWidth, GridType, PinType};

/// Synthetic leading column used by grouped grids for the expand toggle.
pub const EXPAND_COLUMN: &str = "row-expand";

#[derive(Debug, Error, PartialEq)]
pub enum ColumnError {
    #[error("duplicate column field `{0}`")]
    DuplicateField(String),
    #[error("unknown column field `{0}`")]
    UnknownField(String),
    #[error("invalid width {width} for column `{field}`")]
    InvalidWidth { field: String, width: f64 },
}

/// Column definition owned by the view layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseColumn {
    pub field: String,
    pub header_name: String,
    pub default_width: Option<f64>,
}

impl BaseColumn {
    pub fn new(field: &str, header_name: &str, default_width: Option<f64>) -> Self {
        Self { field: field.to_string(), header_name: header_name.to_string(), default_width }
    }
}

/// What the renderer receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedColumn {
    pub field: String,
    pub header_name: String,
    pub width: Option<f64>,
    pub pin: PinType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ColumnConfig {
    columns: Vec<ColumnDescriptor>,
}

impl ColumnConfig {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Result<Self, ColumnError> {
        let mut cfg = Self::default();
        cfg.update_order_columns(columns)?;
        Ok(cfg)
    }

    pub fn descriptors(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn widths(&self) -> Vec<ColumnWidth> {
        self.columns
            .iter()
            .filter_map(|c| {
                c.column_width.map(|w| ColumnWidth { field: c.field.clone(), column_width: w })
            })
            .collect()
    }

    /// Replace the whole sequence (bulk edit from the column dialog).
    pub fn update_order_columns(&mut self, columns: Vec<ColumnDescriptor>) -> Result<(), ColumnError> {
        let mut seen = AHashSet::with_capacity(columns.len());
        for c in &columns {
            if !seen.insert(c.field.as_str()) {
                return Err(ColumnError::DuplicateField(c.field.clone()));
            }
        }
        self.columns = columns;
        Ok(())
    }

    fn find_mut(&mut self, field: &str) -> Result<&mut ColumnDescriptor, ColumnError> {
        self.columns
            .iter_mut()
            .find(|c| c.field == field)
            .ok_or_else(|| ColumnError::UnknownField(field.to_string()))
    }

    /// Writes the canonical flag; the legacy `hidden` flag is cleared.
    pub fn set_visible(&mut self, field: &str, visible: bool) -> Result<(), ColumnError> {
        let c = self.find_mut(field)?;
        c.visibility = visible;
        c.hidden = None;
        Ok(())
    }

    pub fn set_width(&mut self, field: &str, width: f64) -> Result<(), ColumnError> {
        if !width.is_finite() || width <= 0.0 {
            return Err(ColumnError::InvalidWidth { field: field.to_string(), width });
        }
        self.find_mut(field)?.column_width = Some(width);
        Ok(())
    }

    /// Move a column to `pin`, at the end of that partition.
    pub fn pin(&mut self, field: &str, pin: PinType) -> Result<(), ColumnError> {
        let next = self
            .columns
            .iter()
            .filter(|c| c.field != field && c.pin() == pin)
            .filter_map(|c| c.partition_order())
            .max()
            .map_or(0, |m| m + 1);
        let c = self.find_mut(field)?;
        c.pin_type = Some(pin);
        c.set_partition_order(next);
        Ok(())
    }

    /// Reorder inside the column's own partition; the partition is renumbered 0..n.
    pub fn move_column(&mut self, field: &str, to_index: usize) -> Result<(), ColumnError> {
        let pin = self
            .columns
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.pin())
            .ok_or_else(|| ColumnError::UnknownField(field.to_string()))?;

        let mut members: Vec<usize> =
            (0..self.columns.len()).filter(|&i| self.columns[i].pin() == pin).collect();
        members.sort_by_key(|&i| {
            let o = self.columns[i].partition_order();
            (o.is_none(), o.unwrap_or(0), i)
        });

        let mut fields: Vec<String> = members.iter().map(|&i| self.columns[i].field.clone()).collect();
        if let Some(pos) = fields.iter().position(|f| f == field) {
            let moved = fields.remove(pos);
            fields.insert(to_index.min(fields.len()), moved);
        }
        for (n, f) in fields.iter().enumerate() {
            if let Some(c) = self.columns.iter_mut().find(|c| &c.field == f) {
                c.set_partition_order(n as i32);
            }
        }
        Ok(())
    }

    /// Merge stored configuration with the base definitions.
    pub fn resolve(&self, base: &[BaseColumn]) -> Vec<ResolvedColumn> {
        let base_index: AHashMap<&str, usize> =
            base.iter().enumerate().map(|(i, b)| (b.field.as_str(), i)).collect();

        let mut left = Vec::new();
        let mut middle = Vec::new();
        let mut right = Vec::new();
        for d in &self.columns {
            // descriptors for columns the view no longer defines are ignored
            let Some(&idx) = base_index.get(d.field.as_str()) else { continue };
            match d.pin() {
                PinType::Left => left.push((d, idx)),
                PinType::Unpinned => middle.push((d, idx)),
                PinType::Right => right.push((d, idx)),
            }
        }
        for part in [&mut left, &mut middle, &mut right] {
            part.sort_by_key(|(d, idx)| {
                let o = d.partition_order();
                (o.is_none(), o.unwrap_or(0), *idx)
            });
        }

        let resolved = |(d, idx): (&ColumnDescriptor, usize)| ResolvedColumn {
            field: d.field.clone(),
            header_name: if d.header_name.is_empty() {
                base[idx].header_name.clone()
            } else {
                d.header_name.clone()
            },
            width: d.column_width.or(base[idx].default_width),
            pin: d.pin(),
        };

        let stored: AHashSet<&str> = self.columns.iter().map(|c| c.field.as_str()).collect();
        let fresh = base.iter().filter(|b| !stored.contains(b.field.as_str())).map(|b| ResolvedColumn {
            field: b.field.clone(),
            header_name: b.header_name.clone(),
            width: b.default_width,
            pin: PinType::Unpinned,
        });

        let mut out = Vec::with_capacity(base.len());
        out.extend(left.into_iter().filter(|(d, _)| d.is_visible()).map(resolved));
        out.extend(middle.into_iter().filter(|(d, _)| d.is_visible()).map(resolved));
        out.extend(fresh);
        out.extend(right.into_iter().filter(|(d, _)| d.is_visible()).map(resolved));
        out
    }
}

/// Column ids in display order, as the table library wants them.
pub fn column_order_keys(resolved: &[ResolvedColumn], grouped: bool) -> Vec<String> {
    let mut keys = Vec::with_capacity(resolved.len() + 1);
    if grouped {
        keys.push(EXPAND_COLUMN.to_string());
    }
    keys.extend(resolved.iter().map(|c| c.field.clone()));
    keys
}

/// Base definitions shipped with each grid.
pub fn default_columns(grid: GridType) -> Vec<BaseColumn> {
    let b = BaseColumn::new;
    let mut cols = vec![
        b("repaymentStatus", "Status", Some(140.0)),
        b("submitDate", "Submit date", Some(120.0)),
        b("propertyAddress", "Property address", Some(260.0)),
        b("estSaleDate", "Est. sale date", Some(120.0)),
        b("investor", "Investor", Some(160.0)),
        b("prospectiveBuyer", "Prospective buyer", Some(160.0)),
        b("tradeStatus", "Trade status", Some(130.0)),
        b("interestRate", "Note rate", Some(100.0)),
        b("totalLoanAmount", "Loan amount", Some(130.0)),
        b("buyRate", "Buy rate", Some(100.0)),
        b("originatorSpread", "Originator spread", Some(130.0)),
    ];
    match grid {
        GridType::Delinquent => cols.push(b("delinquentDays", "Days delinquent", Some(120.0))),
        GridType::Maturity => cols.push(b("maturityDate", "Maturity date", Some(120.0))),
        GridType::Youland => cols.push(b("tradeConfirm", "", Some(80.0))),
        _ => {}
    }
    cols
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(fields: &[&str]) -> Vec<BaseColumn> {
        fields.iter().map(|f| BaseColumn::new(f, &f.to_uppercase(), None)).collect()
    }

    fn fields(r: &[ResolvedColumn]) -> Vec<&str> {
        r.iter().map(|c| c.field.as_str()).collect()
    }

    fn desc(field: &str, pin: PinType, order: Option<i32>) -> ColumnDescriptor {
        let mut d = ColumnDescriptor::new(field, "");
        d.pin_type = Some(pin);
        match pin {
            PinType::Left => d.left_order = order,
            PinType::Right => d.right_order = order,
            PinType::Unpinned => d.order = order,
        }
        d
    }

    #[test]
    fn empty_config_keeps_base_order() {
        let cfg = ColumnConfig::default();
        assert_eq!(fields(&cfg.resolve(&base(&["A", "B", "C"]))), vec!["A", "B", "C"]);
    }

    #[test]
    fn explicitly_ordered_column_precedes_unstored_ones() {
        let cfg = ColumnConfig::new(vec![desc("B", PinType::Unpinned, Some(0))]).unwrap();
        assert_eq!(fields(&cfg.resolve(&base(&["A", "B", "C"]))), vec!["B", "A", "C"]);
    }

    #[test]
    fn partitions_concatenate_left_none_right() {
        let cfg = ColumnConfig::new(vec![
            desc("A", PinType::Right, Some(0)),
            desc("B", PinType::Unpinned, Some(1)),
            desc("C", PinType::Left, Some(1)),
            desc("D", PinType::Left, Some(0)),
            desc("E", PinType::Unpinned, Some(0)),
        ])
        .unwrap();
        let r = cfg.resolve(&base(&["A", "B", "C", "D", "E", "F"]));
        assert_eq!(fields(&r), vec!["D", "C", "E", "B", "F", "A"]);
        assert_eq!(r[0].pin, PinType::Left);
        assert_eq!(r[5].pin, PinType::Right);
    }

    #[test]
    fn ties_and_missing_orders_follow_base_order() {
        let cfg = ColumnConfig::new(vec![
            desc("C", PinType::Unpinned, None),
            desc("B", PinType::Unpinned, Some(3)),
            desc("A", PinType::Unpinned, None),
            desc("D", PinType::Unpinned, Some(3)),
        ])
        .unwrap();
        // B and D tie on 3 -> base order; A and C have no order -> after, base order
        assert_eq!(fields(&cfg.resolve(&base(&["A", "B", "C", "D"]))), vec!["B", "D", "A", "C"]);
    }

    #[test]
    fn hiding_drops_from_resolution_but_not_storage() {
        let mut cfg = ColumnConfig::new(vec![
            desc("A", PinType::Unpinned, Some(0)),
            desc("B", PinType::Unpinned, Some(1)),
            desc("C", PinType::Unpinned, Some(2)),
        ])
        .unwrap();
        let b = base(&["A", "B", "C"]);

        cfg.set_visible("B", false).unwrap();
        assert_eq!(fields(&cfg.resolve(&b)), vec!["A", "C"]);
        assert_eq!(cfg.descriptors().len(), 3);

        cfg.set_visible("B", true).unwrap();
        assert_eq!(fields(&cfg.resolve(&b)), vec!["A", "B", "C"]);
    }

    #[test]
    fn legacy_hidden_flag_hides_and_is_cleared_on_show() {
        let mut d = desc("A", PinType::Unpinned, Some(0));
        d.hidden = Some(true);
        let mut cfg = ColumnConfig::new(vec![d]).unwrap();
        assert!(fields(&cfg.resolve(&base(&["A"]))).is_empty());
        cfg.set_visible("A", true).unwrap();
        assert_eq!(cfg.descriptors()[0].hidden, None);
        assert_eq!(fields(&cfg.resolve(&base(&["A"]))), vec!["A"]);
    }

    #[test]
    fn duplicate_fields_are_rejected_and_state_kept() {
        let mut cfg = ColumnConfig::new(vec![desc("A", PinType::Unpinned, Some(0))]).unwrap();
        let err = cfg
            .update_order_columns(vec![desc("B", PinType::Unpinned, None), desc("B", PinType::Left, None)])
            .unwrap_err();
        assert_eq!(err, ColumnError::DuplicateField("B".into()));
        assert_eq!(cfg.descriptors()[0].field, "A");
    }

    #[test]
    fn stored_columns_missing_from_base_are_ignored() {
        let cfg = ColumnConfig::new(vec![desc("gone", PinType::Left, Some(0))]).unwrap();
        assert_eq!(fields(&cfg.resolve(&base(&["A"]))), vec!["A"]);
    }

    #[test]
    fn pin_appends_to_target_partition() {
        let mut cfg = ColumnConfig::new(vec![
            desc("A", PinType::Left, Some(0)),
            desc("B", PinType::Unpinned, Some(0)),
            desc("C", PinType::Unpinned, Some(1)),
        ])
        .unwrap();
        cfg.pin("C", PinType::Left).unwrap();
        assert_eq!(fields(&cfg.resolve(&base(&["A", "B", "C"]))), vec!["A", "C", "B"]);
        cfg.pin("A", PinType::Right).unwrap();
        assert_eq!(fields(&cfg.resolve(&base(&["A", "B", "C"]))), vec!["C", "B", "A"]);
        assert_eq!(cfg.pin("nope", PinType::Left), Err(ColumnError::UnknownField("nope".into())));
    }

    #[test]
    fn move_renumbers_the_partition() {
        let mut cfg = ColumnConfig::new(vec![
            desc("A", PinType::Unpinned, Some(0)),
            desc("B", PinType::Unpinned, Some(1)),
            desc("C", PinType::Unpinned, Some(2)),
            desc("L", PinType::Left, Some(0)),
        ])
        .unwrap();
        cfg.move_column("C", 0).unwrap();
        let b = base(&["A", "B", "C", "L"]);
        assert_eq!(fields(&cfg.resolve(&b)), vec!["L", "C", "A", "B"]);
        let orders: Vec<_> = cfg.descriptors().iter().map(|d| d.partition_order()).collect();
        assert_eq!(orders, vec![Some(1), Some(2), Some(0), Some(0)]);

        // out-of-range target clamps to the end
        cfg.move_column("C", 99).unwrap();
        assert_eq!(fields(&cfg.resolve(&b)), vec!["L", "A", "B", "C"]);
    }

    #[test]
    fn width_prefers_stored_then_base_default() {
        let mut cfg = ColumnConfig::new(vec![desc("A", PinType::Unpinned, Some(0))]).unwrap();
        let b = vec![BaseColumn::new("A", "A", Some(100.0)), BaseColumn::new("B", "B", Some(80.0))];
        assert_eq!(cfg.resolve(&b)[0].width, Some(100.0));
        cfg.set_width("A", 240.0).unwrap();
        let r = cfg.resolve(&b);
        assert_eq!(r[0].width, Some(240.0));
        assert_eq!(r[1].width, Some(80.0));
        assert_eq!(cfg.widths(), vec![ColumnWidth { field: "A".into(), column_width: 240.0 }]);
        assert!(matches!(cfg.set_width("A", f64::NAN), Err(ColumnError::InvalidWidth { .. })));
        assert!(matches!(cfg.set_width("A", 0.0), Err(ColumnError::InvalidWidth { .. })));
    }

    #[test]
    fn grouped_grids_lead_with_expand_column() {
        let r = ColumnConfig::default().resolve(&base(&["A", "B"]));
        assert_eq!(column_order_keys(&r, true), vec![EXPAND_COLUMN, "A", "B"]);
        assert_eq!(column_order_keys(&r, false), vec!["A", "B"]);
    }

    #[test]
    fn header_falls_back_to_base_definition() {
        let cfg = ColumnConfig::new(vec![desc("a", PinType::Unpinned, Some(0))]).unwrap();
        assert_eq!(cfg.resolve(&base(&["a"]))[0].header_name, "A");
    }
}
