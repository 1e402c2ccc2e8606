pub mod any_http_client;
pub mod blocking;
pub mod buffered;
pub mod direct;
pub mod failing;
pub mod filter;
pub mod http_transport;
pub mod mirror;
pub mod resource_loader;

pub use any_http_client::{AnyHttpClient, ProbeState};
pub use blocking::BlockingResourceLoader;
pub use buffered::BufferedResourceLoader;
pub use direct::DirectResourceLoader;
pub use failing::FailingResourceLoader;
pub use filter::FilterResourceLoader;
pub use mirror::MirrorResourceLoader;
pub use resource_loader::{deliver, drain_to_vec, HttpResponseHandler, LoaderBody, ResourceLoader, ResourceRequest, ResourceResponse};
