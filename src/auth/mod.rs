//! Authentication and request security state

pub mod anomaly;
pub mod gate;
pub mod jwt;
pub mod middleware;
pub mod rate_limit;
pub mod reputation;
pub mod session;

pub use gate::{extract_token, AuthContext, AuthGate, SecurityMetrics};
pub use jwt::{Claims, JwtService, TokenError};
pub use middleware::{security_middleware, Guard};
