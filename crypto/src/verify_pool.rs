//! Dedicated pool for signature-share verification.
//!
//! Pairing checks dominate the cost of the DA and finalization paths, so
//! they run on their own rayon pool instead of the protocol threads.

use {
    crate::{CryptoError, CryptoManager, Result},
    rayon::prelude::*,
    strand_types::NodeIndex,
};

/// One share to check.
#[derive(Debug, Clone)]
pub struct ShareVerifyJob {
    pub signer: NodeIndex,
    pub share_hex: String,
}

/// Fixed-size verification pool.
pub struct SigVerifyPool {
    pool: rayon::ThreadPool,
}

impl SigVerifyPool {
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("strandSigVerify{i}"))
            .build()
            .map_err(|e| CryptoError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Run a closure inside the pool, so `rayon` parallel iterators used
    /// within are scheduled on the verification threads.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Verify a batch of DA shares in parallel. Returns, per job, whether
    /// the share verified.
    pub fn verify_da_shares(
        &self,
        manager: &CryptoManager,
        proposal_hash: &strand_types::BlockHash,
        jobs: &[ShareVerifyJob],
    ) -> Vec<bool> {
        self.pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    manager
                        .verify_da_share(job.signer, &job.share_hex, proposal_hash)
                        .is_ok()
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::manager::{generate_key_sets, KeySet},
    };

    #[test]
    fn test_batch_verification_flags_bad_shares() {
        let (pk_set, shares) = generate_key_sets(4, 13);
        let managers: Vec<CryptoManager> = shares
            .into_iter()
            .enumerate()
            .map(|(i, share)| {
                let keys = KeySet::new(i as u64 + 1, share, pk_set.clone()).unwrap();
                CryptoManager::new(11, 4, keys).unwrap()
            })
            .collect();

        let hash = strand_types::hashing::hashv(&[b"block"]);
        let mut jobs: Vec<ShareVerifyJob> = managers
            .iter()
            .map(|m| ShareVerifyJob {
                signer: m.node_index(),
                share_hex: m.sign_da_share(&hash),
            })
            .collect();
        // Corrupt one share and mis-attribute another.
        jobs[1].share_hex = "00ff".into();
        jobs[2].signer = 4;

        let pool = SigVerifyPool::new(2).unwrap();
        let results = pool.verify_da_shares(&managers[0], &hash, &jobs);
        assert_eq!(results, vec![true, false, false, true]);
    }
}
