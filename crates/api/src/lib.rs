//! shardq API surface: caller-facing errors, tenant resolution and per-tenant limits.
//!
//! Everything that leaves the sharding core as an error is an [`ApiError`];
//! the HTTP layer renders it with [`ApiError::into_response`].

#![forbid(unsafe_code)]

mod error;
mod limits;
mod tenant;

pub use error::{response_from_error, ApiError, ErrorType};
pub use limits::{Limits, LimitsOverride, StaticLimits, TenantLimits};
pub use tenant::tenant_id;

pub type ApiResult<T> = Result<T, ApiError>;
