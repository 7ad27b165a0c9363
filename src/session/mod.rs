pub mod manager;
pub mod session;

pub use manager::{NoopProvisioner, SessionManager, SessionProvisioner};
pub use session::{Session, SessionStatus};
