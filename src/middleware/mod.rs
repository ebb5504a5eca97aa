pub mod api_key;
pub mod rate_limit;

pub use api_key::require_api_key;
pub use rate_limit::{rate_limit_middleware, RateLimitLayer};
