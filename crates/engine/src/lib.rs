pub mod backoff;
pub mod clock;
pub mod executor;
pub mod finalizer;
pub mod lease;
pub mod manager;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod processor;
pub mod purger;
pub mod recovery;
pub mod resolver;
pub mod scheduler;
pub mod store;
