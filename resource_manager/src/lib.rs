// Shared request budget and egress rotation for the fetch stages

pub mod egress;
pub mod provider;
pub mod rate_limiter;
pub mod resource_pool;

pub use egress::EgressClients;
pub use provider::{KeyedEgress, KeyedLease, ResourceProvider};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot, RatePermit};
pub use resource_pool::{
    PoolConfig, PoolError, Resource, ResourceKind, ResourcePool, ResourceSnapshot, DIRECT_EGRESS,
    MAX_FAILURES,
};
