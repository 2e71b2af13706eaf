pub mod azure_sig;
pub mod client;
pub mod request;
pub mod response;
pub mod sigv4;
pub mod uri;

pub use client::{HttpClient, HttpClientConfig, RequestSpec, Session};
pub use request::Request;
pub use response::Response;
