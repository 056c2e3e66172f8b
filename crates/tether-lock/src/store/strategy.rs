/// Decides whether a quorum of stores agreed on an operation.
pub trait Strategy: Send + Sync + std::fmt::Debug {
    /// Whether `success` positive answers out of `total` stores satisfy the quorum.
    fn is_met(&self, success: usize, total: usize) -> bool;

    /// Whether the quorum is still reachable after `failed` negative answers.
    fn can_be_met(&self, failed: usize, total: usize) -> bool;
}

/// Every store must agree.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnanimousStrategy;

impl Strategy for UnanimousStrategy {
    fn is_met(&self, success: usize, total: usize) -> bool {
        success == total
    }

    fn can_be_met(&self, failed: usize, _total: usize) -> bool {
        failed == 0
    }
}

/// Strictly more than half of the stores must agree.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusStrategy;

impl Strategy for ConsensusStrategy {
    fn is_met(&self, success: usize, total: usize) -> bool {
        success * 2 > total
    }

    fn can_be_met(&self, failed: usize, total: usize) -> bool {
        total.saturating_sub(failed) * 2 > total
    }
}
