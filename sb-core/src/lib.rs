pub mod cancellable;
pub mod config;
pub mod error;
pub mod http_address;
pub mod resource_address;

pub use cancellable::CancelHandle;
pub use config::AppConfig;
pub use error::PipelineError;
pub use http_address::{HttpAddress, HttpVersion};
pub use resource_address::{ResourceAddress, ResourceRequestParams};
