//! Per-group sequence counters for collision-free resource names

use crate::error::{ArmadaError, Result};
use crate::naming::ResourceName;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Monotonic counter seeded from the highest sequence seen live
#[derive(Debug, Default)]
pub struct Sequence {
    current: Mutex<u64>,
}

impl Sequence {
    /// Create a counter starting at `start`
    pub fn new(start: u64) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Increment and return the counter
    pub fn next(&self) -> Result<u64> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| ArmadaError::Lock("Failed to acquire sequence lock".to_string()))?;
        *current += 1;
        Ok(*current)
    }

    /// Raise the counter to `n` if it is larger
    pub fn observe(&self, n: u64) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| ArmadaError::Lock("Failed to acquire sequence lock".to_string()))?;
        if n > *current {
            *current = n;
        }
        Ok(())
    }
}

/// Sequences keyed by group
#[derive(Debug, Default)]
pub struct SequenceRegistry {
    groups: RwLock<HashMap<String, Arc<Sequence>>>,
}

impl SequenceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the sequence for a group, creating it at zero
    pub fn group(&self, group: &str) -> Result<Arc<Sequence>> {
        {
            let groups = self
                .groups
                .read()
                .map_err(|_| ArmadaError::Lock("Failed to acquire read lock".to_string()))?;
            if let Some(seq) = groups.get(group) {
                return Ok(seq.clone());
            }
        }

        let mut groups = self
            .groups
            .write()
            .map_err(|_| ArmadaError::Lock("Failed to acquire write lock".to_string()))?;
        Ok(groups
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(Sequence::default()))
            .clone())
    }

    /// Reseed from a live resource name; returns false if it does not parse
    pub fn observe_name(&self, name: &str) -> Result<bool> {
        match ResourceName::parse(name) {
            Some(parsed) => {
                self.group(&parsed.group)?.observe(parsed.seq)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reseed from a batch of live names, logging the ones that do not parse
    pub fn observe_names<'a, I>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            if !self.observe_name(name)? {
                tracing::debug!("'{}' is not a sequenced resource name", name);
            }
        }
        Ok(())
    }

    /// Allocate the next `{group}-{n}` name
    pub fn next_name(&self, group: &str) -> Result<String> {
        let seq = self.group(group)?.next()?;
        Ok(ResourceName::new(group, seq).format())
    }
}
