//! The boolean proposal vector that seeds block consensus.
//!
//! Entry i (1-based proposer index) is true iff proposer i's proposal had a
//! DA proof when consensus for the block started. The vector is persisted
//! alongside the block id so a restarting node can resume consensus with
//! the same inputs.

use {
    crate::error::{ConsensusError, Result},
    crate::ids::NodeIndex,
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Length-N vector of per-proposer DA availability flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooleanProposalVector {
    values: Vec<bool>,
}

impl BooleanProposalVector {
    /// All-false vector for a chain of `node_count` validators.
    pub fn new(node_count: u64) -> Self {
        Self {
            values: vec![false; node_count as usize],
        }
    }

    /// Build from explicit flags (index 0 of the slice = proposer 1).
    pub fn from_values(values: Vec<bool>) -> Self {
        Self { values }
    }

    pub fn node_count(&self) -> u64 {
        self.values.len() as u64
    }

    /// Flag for a 1-based proposer index.
    pub fn get(&self, proposer_index: NodeIndex) -> Result<bool> {
        self.values
            .get(self.slot(proposer_index)?)
            .copied()
            .ok_or_else(|| {
                ConsensusError::InvalidArgument(format!(
                    "proposer index {proposer_index} out of range"
                ))
            })
    }

    /// Mark a 1-based proposer index as having a DA proof.
    pub fn set(&mut self, proposer_index: NodeIndex) -> Result<()> {
        let slot = self.slot(proposer_index)?;
        if slot >= self.values.len() {
            return Err(ConsensusError::InvalidArgument(format!(
                "proposer index {proposer_index} out of range"
            )));
        }
        self.values[slot] = true;
        Ok(())
    }

    pub fn count_true(&self) -> usize {
        self.values.iter().filter(|v| **v).count()
    }

    fn slot(&self, proposer_index: NodeIndex) -> Result<usize> {
        if proposer_index == 0 {
            return Err(ConsensusError::InvalidArgument(
                "proposer index 0 is reserved for the empty block".into(),
            ));
        }
        Ok((proposer_index - 1) as usize)
    }
}

impl fmt::Display for BooleanProposalVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for v in &self.values {
            f.write_str(if *v { "1" } else { "0" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_all_false() {
        let v = BooleanProposalVector::new(4);
        assert_eq!(v.count_true(), 0);
        assert_eq!(v.node_count(), 4);
    }

    #[test]
    fn test_set_and_get_one_based() {
        let mut v = BooleanProposalVector::new(4);
        v.set(1).unwrap();
        v.set(4).unwrap();
        assert!(v.get(1).unwrap());
        assert!(!v.get(2).unwrap());
        assert!(v.get(4).unwrap());
        assert_eq!(v.count_true(), 2);
    }

    #[test]
    fn test_index_zero_rejected() {
        let mut v = BooleanProposalVector::new(4);
        assert!(v.set(0).is_err());
        assert!(v.get(0).is_err());
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut v = BooleanProposalVector::new(4);
        assert!(v.set(5).is_err());
        assert!(v.get(5).is_err());
    }

    #[test]
    fn test_display() {
        let mut v = BooleanProposalVector::new(4);
        v.set(2).unwrap();
        assert_eq!(v.to_string(), "0100");
    }
}
