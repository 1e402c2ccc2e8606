pub mod manager;
pub mod persist;
pub mod session;
pub mod session_id;

pub use manager::{SessionLease, SessionManager};
pub use persist::{read_session_file, write_session_file};
pub use session::{Session, SessionCookie, WidgetSession};
pub use session_id::SessionId;
