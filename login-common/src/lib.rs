pub mod mask;
pub mod metrics;
pub mod queue;
pub mod record;
pub mod sink;
