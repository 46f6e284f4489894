//! Authentication for HTTP routes and WebSocket connections

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{bearer_token, require_auth, AuthUser};
