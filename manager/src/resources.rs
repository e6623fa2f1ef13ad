//! Resource slot model and arithmetic
//!
//! Slots are open-ended maps from slot name (`cpu`, `mem`, `cuda.device`,
//! `cuda.shares`, ...) to non-negative decimal quantities. All arithmetic is
//! exact decimal; floating point never enters slot math. `mem` is integral
//! bytes; fractional accelerators carry at most six decimal places.

use crate::error::{Result, SchedulingError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum fractional digits for non-integral slot quantities
pub const MAX_SLOT_SCALE: u32 = 6;

/// A componentwise resource quantity map
///
/// Missing keys are treated as zero in comparisons and arithmetic. Iteration
/// order is the lexicographic slot-name order (BTreeMap), which keeps
/// tie-breaking and logging deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlot(BTreeMap<String, Decimal>);

impl ResourceSlot {
    /// Empty slot map
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build from (name, quantity) pairs
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Quantity for a slot name; zero when absent
    pub fn get(&self, name: &str) -> Decimal {
        self.0.get(name).copied().unwrap_or(Decimal::ZERO)
    }

    /// Set a slot quantity, dropping the entry when zero
    pub fn set(&mut self, name: impl Into<String>, amount: Decimal) {
        let name = name.into();
        if amount.is_zero() {
            self.0.remove(&name);
        } else {
            self.0.insert(name, amount);
        }
    }

    /// True when every component is zero
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.is_zero())
    }

    /// Iterate (name, quantity) in deterministic order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Slot names present in this map
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Componentwise addition; missing keys count as zero
    pub fn add(&self, other: &ResourceSlot) -> ResourceSlot {
        let mut out = self.0.clone();
        for (name, amount) in &other.0 {
            let entry = out.entry(name.clone()).or_insert(Decimal::ZERO);
            *entry += *amount;
        }
        ResourceSlot(out).pruned()
    }

    /// Componentwise subtraction; fails with `InsufficientSlot` on underflow
    pub fn checked_sub(&self, other: &ResourceSlot) -> Result<ResourceSlot> {
        let mut out = self.0.clone();
        for (name, amount) in &other.0 {
            let have = out.get(name).copied().unwrap_or(Decimal::ZERO);
            if have < *amount {
                return Err(SchedulingError::InsufficientSlot(name.clone()));
            }
            out.insert(name.clone(), have - *amount);
        }
        Ok(ResourceSlot(out).pruned())
    }

    /// True iff every component of `self` is <= the corresponding component
    /// of `other` (missing keys on either side count as zero)
    pub fn le(&self, other: &ResourceSlot) -> bool {
        self.0
            .iter()
            .all(|(name, amount)| *amount <= other.get(name))
    }

    /// Componentwise scalar multiplication
    pub fn scale(&self, factor: Decimal) -> ResourceSlot {
        ResourceSlot(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), *v * factor))
                .collect(),
        )
        .pruned()
    }

    /// Sum of slot maps over an iterator
    pub fn sum<'a, I>(slots: I) -> ResourceSlot
    where
        I: IntoIterator<Item = &'a ResourceSlot>,
    {
        slots
            .into_iter()
            .fold(ResourceSlot::new(), |acc, s| acc.add(s))
    }

    /// Ceiling check for resource policies: every slot *named by the
    /// ceiling* must satisfy `usage + demand <= ceiling`. Slots absent from
    /// the ceiling are unconstrained.
    pub fn fits_ceiling(usage: &ResourceSlot, demand: &ResourceSlot, ceiling: &ResourceSlot) -> bool {
        ceiling
            .0
            .iter()
            .all(|(name, cap)| usage.get(name) + demand.get(name) <= *cap)
    }

    fn pruned(mut self) -> Self {
        self.0.retain(|_, v| !v.is_zero());
        self
    }
}

impl std::fmt::Display for ResourceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        write!(f, "{{")?;
        for (name, amount) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, amount)?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// Unit semantics of a registered slot type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotUnit {
    /// Whole or fractional device counts (cpu cores, cuda.shares)
    Count,
    /// Integral byte quantities (mem)
    Bytes,
}

/// A registered slot type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotType {
    /// Slot name as it appears in slot maps
    pub name: String,
    /// Unit semantics used during normalization
    pub unit: SlotUnit,
}

/// Registry of known slot types, loaded from configuration at startup
///
/// Slot names are free-form strings registered by device plugins; any name
/// not present here hard-fails normalization with `UnknownSlot`.
#[derive(Debug, Clone)]
pub struct SlotRegistry {
    types: BTreeMap<String, SlotUnit>,
}

impl SlotRegistry {
    /// Build a registry from slot type definitions
    pub fn new<I>(types: I) -> Self
    where
        I: IntoIterator<Item = SlotType>,
    {
        Self {
            types: types.into_iter().map(|t| (t.name, t.unit)).collect(),
        }
    }

    /// The baseline registry every deployment carries
    pub fn builtin() -> Self {
        Self::new([
            SlotType { name: "cpu".into(), unit: SlotUnit::Count },
            SlotType { name: "mem".into(), unit: SlotUnit::Bytes },
        ])
    }

    /// True when the slot name is registered
    pub fn knows(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Register an additional slot type (device plugin announcement)
    pub fn register(&mut self, slot: SlotType) {
        self.types.insert(slot.name, slot.unit);
    }

    /// Widen a slot map to canonical form
    ///
    /// Fails `UnknownSlot` for unregistered names, rejects negative
    /// quantities, requires `Bytes` slots to be integral, and caps fractional
    /// slots at [`MAX_SLOT_SCALE`] decimal places.
    pub fn normalize(&self, slots: &ResourceSlot) -> Result<ResourceSlot> {
        let mut out = ResourceSlot::new();
        for (name, amount) in slots.iter() {
            let unit = self
                .types
                .get(name)
                .ok_or_else(|| SchedulingError::UnknownSlot(name.to_string()))?;
            if amount < Decimal::ZERO {
                return Err(SchedulingError::InsufficientSlot(name.to_string()));
            }
            let canonical = match unit {
                SlotUnit::Bytes => {
                    if amount.fract() != Decimal::ZERO {
                        return Err(SchedulingError::ConfigInvalid {
                            detail: format!("byte slot {} must be integral, got {}", name, amount),
                        });
                    }
                    amount.normalize()
                }
                SlotUnit::Count => {
                    let mut v = amount;
                    if v.scale() > MAX_SLOT_SCALE {
                        v = v.round_dp(MAX_SLOT_SCALE);
                    }
                    v.normalize()
                }
            };
            out.set(name, canonical);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn slots(pairs: &[(&str, &str)]) -> ResourceSlot {
        ResourceSlot::from_pairs(pairs.iter().map(|(k, v)| (*k, dec(v))))
    }

    #[test]
    fn test_add_missing_keys_are_zero() {
        let a = slots(&[("cpu", "2"), ("mem", "1024")]);
        let b = slots(&[("cpu", "1"), ("cuda.device", "1")]);
        let sum = a.add(&b);
        assert_eq!(sum.get("cpu"), dec("3"));
        assert_eq!(sum.get("mem"), dec("1024"));
        assert_eq!(sum.get("cuda.device"), dec("1"));
    }

    #[test]
    fn test_checked_sub_underflow_names_slot() {
        let a = slots(&[("cpu", "2")]);
        let b = slots(&[("cpu", "1"), ("mem", "1")]);
        match a.checked_sub(&b) {
            Err(SchedulingError::InsufficientSlot(name)) => assert_eq!(name, "mem"),
            other => panic!("expected InsufficientSlot, got {:?}", other),
        }
    }

    #[test]
    fn test_le_with_missing_keys() {
        let demand = slots(&[("cpu", "2")]);
        let free = slots(&[("cpu", "2"), ("mem", "4096")]);
        assert!(demand.le(&free));
        assert!(!free.le(&demand)); // mem 4096 > 0
    }

    #[test]
    fn test_sum_over_kernels() {
        let kernels = vec![slots(&[("cpu", "1")]), slots(&[("cpu", "1.5"), ("mem", "512")])];
        let total = ResourceSlot::sum(kernels.iter());
        assert_eq!(total.get("cpu"), dec("2.5"));
        assert_eq!(total.get("mem"), dec("512"));
    }

    #[test]
    fn test_scale_prunes_zero() {
        let a = slots(&[("cpu", "2")]);
        assert!(a.scale(Decimal::ZERO).is_empty());
    }

    #[test]
    fn test_ceiling_ignores_unnamed_slots() {
        let ceiling = slots(&[("cpu", "4")]);
        let usage = slots(&[("cpu", "2"), ("mem", "1000000")]);
        let demand = slots(&[("cpu", "2"), ("mem", "9999999")]);
        assert!(ResourceSlot::fits_ceiling(&usage, &demand, &ceiling));
        let demand2 = slots(&[("cpu", "3")]);
        assert!(!ResourceSlot::fits_ceiling(&usage, &demand2, &ceiling));
    }

    #[test]
    fn test_normalize_rejects_unknown_slot() {
        let reg = SlotRegistry::builtin();
        let s = slots(&[("cuda.device", "1")]);
        assert!(matches!(
            reg.normalize(&s),
            Err(SchedulingError::UnknownSlot(_))
        ));
    }

    #[test]
    fn test_normalize_rejects_fractional_bytes() {
        let reg = SlotRegistry::builtin();
        let s = slots(&[("mem", "1024.5")]);
        assert!(matches!(
            reg.normalize(&s),
            Err(SchedulingError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_normalize_caps_fractional_scale() {
        let mut reg = SlotRegistry::builtin();
        reg.register(SlotType { name: "cuda.shares".into(), unit: SlotUnit::Count });
        let s = slots(&[("cuda.shares", "0.123456789")]);
        let n = reg.normalize(&s).unwrap();
        assert_eq!(n.get("cuda.shares"), dec("0.123457"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_slots() -> impl Strategy<Value = ResourceSlot> {
            proptest::collection::btree_map("[a-z]{1,4}", 0u64..1_000_000, 0..5).prop_map(|m| {
                ResourceSlot::from_pairs(m.into_iter().map(|(k, v)| (k, Decimal::from(v))))
            })
        }

        proptest! {
            #[test]
            fn add_then_sub_is_identity(a in arb_slots(), b in arb_slots()) {
                let roundtrip = a.add(&b).checked_sub(&b).unwrap();
                prop_assert_eq!(roundtrip, a);
            }

            #[test]
            fn sub_never_goes_negative(a in arb_slots(), b in arb_slots()) {
                if let Ok(diff) = a.checked_sub(&b) {
                    for (_, v) in diff.iter() {
                        prop_assert!(v >= Decimal::ZERO);
                    }
                }
            }

            #[test]
            fn le_is_consistent_with_sub(a in arb_slots(), b in arb_slots()) {
                prop_assert_eq!(a.le(&b), b.checked_sub(&a).is_ok());
            }
        }
    }
}
