pub mod filter;
pub mod pool;
pub mod socket;

pub use filter::{AlpnTlsFilter, IdentityFilter, NegotiatedProtocol};
pub use pool::{FilteredSocketLease, SocketPool};
pub use socket::{FilteredSocket, SocketHandler};
