//! Authentication module for the storefront API

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager, Role};
pub use middleware::{require_auth, AuthError, AuthUser};
