//! Peeper - a TLS-terminating HTTPS interception proxy
//!
//! Peeper accepts HTTPS connections meant for any host and provides:
//! - Per-host self-signed certificates chosen from the SNI name
//! - Cached hostname to IPv4 resolution
//! - Full request/response logging, gunzipping bodies for display
//! - Transparent forwarding to the real upstream on port 443

pub mod certificate;
pub mod context;
pub mod pipeline;
pub mod proxy;
pub mod resolver;
pub mod upstream;

pub use certificate::{CertificateProvisioner, CertificateStore, IdentityGenerator, SelfSignedGenerator};
pub use context::{ErrorRecord, RequestId};
pub use pipeline::{Pipeline, PipelineError};
pub use proxy::{ProxyConfig, ProxyServer};
pub use resolver::{AddressResolver, Lookup, SystemLookup};
pub use upstream::{HttpsUpstream, Upstream, UpstreamVerification};
