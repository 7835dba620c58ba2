//! Observability support: block I/O counters.

mod metrics;

pub use metrics::{
    describe_metrics, record_block_create, record_block_lookup, record_block_register,
};
