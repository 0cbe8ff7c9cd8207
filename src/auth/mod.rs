//! Client and admin authentication.

pub mod jwt;
pub mod session;
pub mod verification;

pub use jwt::{AdminClaims, JwtKeys};
pub use session::{AuthUser, SessionBinder};
pub use verification::Verification;
