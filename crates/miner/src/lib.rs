//! The mining worker: reference-coordinated block production.

mod build;
mod recommit;
mod unconfirmed;
mod worker;

#[cfg(test)]
mod tests;

pub use recommit::{
    recalc_recommit, sanitize_recommit, IntervalAdjust, INTERVAL_ADJUST_BIAS,
    INTERVAL_ADJUST_RATIO, MAX_RECOMMIT_INTERVAL, MIN_RECOMMIT_INTERVAL,
};
pub use unconfirmed::UnconfirmedBlocks;
pub use worker::{
    Worker, WorkerConfig, MINING_LOG_AT_DEPTH, RESUBMIT_ADJUST_CHAN_SIZE, RESULT_QUEUE_SIZE,
    STALE_THRESHOLD, TX_CHAN_SIZE,
};
