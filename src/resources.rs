use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::warn;

use crate::error::{Error, Result};

/// Per-GPU bookkeeping: resource name to a non-negative count.
///
/// All bulk operations are transactional: they validate on a copy and commit
/// only when every element succeeds, so a failed adjustment leaves the map
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceMap(HashMap<String, i64>);

impl ResourceMap {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &i64)> {
        self.0.iter()
    }

    /// Add `amount` to `name`, creating the entry when absent.
    pub fn add(&mut self, name: &str, amount: i64) -> Result<()> {
        if amount < 0 {
            return Err(Error::Input(format!(
                "cannot add negative amount {amount} of {name}"
            )));
        }
        let current = self.get(name);
        // values and deltas are non-negative, so overflow is the only way down
        let sum = current.checked_add(amount).ok_or_else(|| {
            Error::Overflow(format!("adding {amount} of {name} to {current} wraps"))
        })?;
        self.0.insert(name.to_string(), sum);
        Ok(())
    }

    /// Subtract `amount` from `name`. A missing key is an error; a result that
    /// would go negative is capped to zero. The cap is tolerated so the node
    /// map stays usable when external bookkeeping has drifted.
    pub fn subtract(&mut self, name: &str, amount: i64) -> Result<()> {
        if amount < 0 {
            return Err(Error::Input(format!(
                "cannot subtract negative amount {amount} of {name}"
            )));
        }
        match self.0.entry(name.to_string()) {
            Entry::Vacant(_) => Err(Error::Input(format!(
                "cannot subtract {amount} of {name}: no such resource"
            ))),
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if amount > current {
                    warn!(
                        resource = name,
                        wanted = amount,
                        have = current,
                        "subtraction would go negative, capping to zero"
                    );
                    entry.insert(0);
                } else {
                    entry.insert(current - amount);
                }
                Ok(())
            }
        }
    }

    /// Add every entry of `other`; commits only when all entries fit.
    pub fn add_all(&mut self, other: &ResourceMap) -> Result<()> {
        let mut copy = self.new_copy();
        for (name, amount) in other.iter() {
            copy.add(name, *amount)?;
        }
        *self = copy;
        Ok(())
    }

    /// Subtract every entry of `other`; commits only when all entries apply.
    pub fn subtract_all(&mut self, other: &ResourceMap) -> Result<()> {
        let mut copy = self.new_copy();
        for (name, amount) in other.iter() {
            copy.subtract(name, *amount)?;
        }
        *self = copy;
        Ok(())
    }

    /// Integer-divide every value by `divider`. A divider of one is a no-op.
    pub fn divide(&mut self, divider: i64) -> Result<()> {
        if divider < 1 {
            return Err(Error::Input(format!("cannot divide resources by {divider}")));
        }
        if divider == 1 {
            return Ok(());
        }
        for value in self.0.values_mut() {
            *value /= divider;
        }
        Ok(())
    }

    /// Deep copy.
    pub fn new_copy(&self) -> ResourceMap {
        self.clone()
    }
}

impl FromIterator<(String, i64)> for ResourceMap {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
