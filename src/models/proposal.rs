//! Order-change proposals.
//!
//! A [`Proposal`] can only be obtained through [`Proposal::validate`] (or
//! [`Proposal::from_snapshot`], which runs the same checks), so code that
//! receives one can rely on its structure: a non-empty note, at least one item
//! change, bounded non-zero quantity deltas and serial lists whose sizes match
//! those deltas.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::errors::ServiceError;

/// Largest unit count a single item change may add or remove.
pub const MAX_QUANTITY_CHANGE: i32 = 100_000;

/// Size limits applied while validating a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalLimits {
    pub max_note_chars: usize,
    pub max_items: usize,
}

impl Default for ProposalLimits {
    fn default() -> Self {
        Self {
            max_note_chars: 2000,
            max_items: 200,
        }
    }
}

impl ProposalLimits {
    fn unbounded() -> Self {
        Self {
            max_note_chars: usize::MAX,
            max_items: usize::MAX,
        }
    }
}

/// Proposal exactly as submitted by a client, before any checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProposal {
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<RawItemChange>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItemChange {
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    /// Signed delta; accepted as a JSON number or a numeric string.
    #[serde(default)]
    pub quantity_change: Option<Value>,
    #[serde(default, alias = "snTracked")]
    pub is_sn: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sn_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_sn_list: Option<Vec<String>>,
}

/// What a serial-tracked item change does to the line's instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialChange {
    /// New units, one serial per unit.
    Add(Vec<String>),
    /// Units to drop; `None` lets the applier pick pending units itself.
    Remove(Option<Vec<String>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tracking {
    Quantity,
    Serial(SerialChange),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    pub barcode: String,
    pub product_name: String,
    pub quantity_change: i32,
    pub tracking: Tracking,
}

impl ItemChange {
    pub fn is_sn_tracked(&self) -> bool {
        matches!(self.tracking, Tracking::Serial(_))
    }

    /// Serial numbers this change introduces into the order.
    pub fn added_sns(&self) -> &[String] {
        match &self.tracking {
            Tracking::Serial(SerialChange::Add(sns)) => sns,
            _ => &[],
        }
    }
}

/// A validated set of item-level changes for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "RawProposal")]
pub struct Proposal {
    note: String,
    items: Vec<ItemChange>,
}

impl Proposal {
    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn items(&self) -> &[ItemChange] {
        &self.items
    }

    /// Checks a raw proposal and builds the typed form. Every rule is a hard
    /// failure; item entries beyond `limits.max_items` are dropped.
    pub fn validate(raw: RawProposal, limits: &ProposalLimits) -> Result<Self, ServiceError> {
        let note = raw.note.as_deref().map(str::trim).unwrap_or_default();
        if note.is_empty() {
            return Err(ServiceError::ValidationError(
                "note is required".to_string(),
            ));
        }
        if note.chars().count() > limits.max_note_chars {
            return Err(ServiceError::ValidationError(format!(
                "note must be at most {} characters",
                limits.max_note_chars
            )));
        }

        let raw_items = raw.items.unwrap_or_default();
        if raw_items.is_empty() {
            return Err(ServiceError::ValidationError(
                "items must contain at least one change".to_string(),
            ));
        }

        let items = raw_items
            .into_iter()
            .take(limits.max_items)
            .enumerate()
            .map(|(index, item)| validate_item(index, item))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            note: note.to_string(),
            items,
        })
    }

    /// Rebuilds a stored proposal. Size limits were enforced when it was
    /// stored, so only the structural rules run again and nothing is dropped.
    pub fn from_snapshot(snapshot: Value) -> Result<Self, ServiceError> {
        let raw: RawProposal = serde_json::from_value(snapshot).map_err(|e| {
            ServiceError::ValidationError(format!("stored proposal is invalid: {}", e))
        })?;
        Proposal::validate(raw, &ProposalLimits::unbounded())
    }
}

impl From<Proposal> for RawProposal {
    fn from(proposal: Proposal) -> Self {
        let items = proposal
            .items
            .into_iter()
            .map(|item| {
                let (is_sn, sn_list, removed_sn_list) = match item.tracking {
                    Tracking::Quantity => (false, None, None),
                    Tracking::Serial(SerialChange::Add(sns)) => (true, Some(sns), None),
                    Tracking::Serial(SerialChange::Remove(sns)) => (true, None, sns),
                };
                RawItemChange {
                    barcode: Some(item.barcode),
                    product_name: Some(item.product_name),
                    quantity_change: Some(Value::from(item.quantity_change)),
                    is_sn,
                    sn_list,
                    removed_sn_list,
                }
            })
            .collect();

        RawProposal {
            note: Some(proposal.note),
            items: Some(items),
        }
    }
}

fn validate_item(index: usize, raw: RawItemChange) -> Result<ItemChange, ServiceError> {
    let invalid = |msg: &str| ServiceError::ValidationError(format!("items[{index}]: {msg}"));

    let barcode = raw.barcode.as_deref().map(str::trim).unwrap_or_default();
    if barcode.is_empty() {
        return Err(invalid("barcode is required"));
    }
    let product_name = raw.product_name.as_deref().map(str::trim).unwrap_or_default();
    if product_name.is_empty() {
        return Err(invalid("productName is required"));
    }

    let quantity_change = raw
        .quantity_change
        .as_ref()
        .and_then(parse_quantity)
        .filter(|delta| *delta != 0)
        .ok_or_else(|| invalid("quantityChange must be a non-zero integer"))?;
    if quantity_change.unsigned_abs() > MAX_QUANTITY_CHANGE.unsigned_abs() {
        return Err(invalid(&format!(
            "quantityChange must be between -{MAX_QUANTITY_CHANGE} and {MAX_QUANTITY_CHANGE}"
        )));
    }

    let tracking = if !raw.is_sn {
        Tracking::Quantity
    } else if quantity_change > 0 {
        let sns = normalize_sn_list(raw.sn_list.as_deref().unwrap_or_default());
        if sns.len() != quantity_change as usize {
            return Err(invalid(&format!(
                "snList has {} serial numbers but quantityChange is {}",
                sns.len(),
                quantity_change
            )));
        }
        Tracking::Serial(SerialChange::Add(sns))
    } else {
        let removed = match raw.removed_sn_list {
            Some(list) => {
                let sns = normalize_sn_list(&list);
                let expected = quantity_change.unsigned_abs() as usize;
                if sns.len() != expected {
                    return Err(invalid(&format!(
                        "removedSnList has {} serial numbers but {} units are removed",
                        sns.len(),
                        expected
                    )));
                }
                Some(sns)
            }
            None => None,
        };
        Tracking::Serial(SerialChange::Remove(removed))
    };

    Ok(ItemChange {
        barcode: barcode.to_string(),
        product_name: product_name.to_string(),
        quantity_change,
        tracking,
    })
}

fn parse_quantity(value: &Value) -> Option<i32> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    i32::try_from(parsed).ok()
}

/// Strips a leading `SN:` / `SN：` marker, case-insensitive.
fn strip_sn_prefix(value: &str) -> &str {
    let mut chars = value.char_indices();
    match (chars.next(), chars.next(), chars.next()) {
        (Some((_, s)), Some((_, n)), Some((idx, colon)))
            if s.eq_ignore_ascii_case(&'s')
                && n.eq_ignore_ascii_case(&'n')
                && (colon == ':' || colon == '：') =>
        {
            &value[idx + colon.len_utf8()..]
        }
        _ => value,
    }
}

/// Canonical form of one scanned serial, or `None` if nothing is left.
pub fn normalize_sn(value: &str) -> Option<String> {
    let sn = strip_sn_prefix(value.trim()).trim();
    (!sn.is_empty()).then(|| sn.to_string())
}

/// Key used for case-insensitive serial comparisons.
pub fn sn_key(sn: &str) -> String {
    sn.to_uppercase()
}

/// Normalizes every entry, drops blanks and removes case-insensitive
/// duplicates keeping the first occurrence.
pub fn normalize_sn_list<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter_map(|value| normalize_sn(value.as_ref()))
        .filter(|sn| seen.insert(sn_key(sn)))
        .collect()
}
