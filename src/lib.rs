//! Stubrig
//!
//! A programmable HTTP stub server. Requests are matched against a
//! prioritized set of stubs and answered with canned, templated or proxied
//! responses, optionally delayed or broken on purpose.
//!
//! # Features
//!
//! - **Request Matching**: Match by URL, method, headers, query params, body
//! - **Priorities**: Lower priority numbers win, newer stubs break ties
//! - **Dynamic Templates**: Handlebars templates with `jsonPath` and `pickRandom`
//! - **Latency Simulation**: Fixed or random delays before responding
//! - **Failure Injection**: Dropped connections, errors, timeouts, corrupt bodies
//! - **Proxying**: Forward matched requests to a real upstream
//! - **Admin API**: Add and remove stubs at runtime under `/__admin/`
//!
//! # Example Configuration
//!
//! ```yaml
//! stubs:
//!   - id: client-123
//!     priority: 10
//!     request:
//!       method: [GET]
//!       url:
//!         type: exact
//!         value: /client/123
//!     response:
//!       status: 200
//!       body:
//!         type: json
//!         content:
//!           firstName: Ivan
//!           orderHistory: 10
//! ```

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod json_path;
pub mod matcher;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod synthesizer;
pub mod template;

pub use config::{MockServerConfig, RequestMatcher, ResponseDefinition, StubDefinition, UrlPattern};
pub use dispatch::{DispatchEngine, Outcome};
pub use error::{ProxyError, StubError};
pub use matcher::MatchRequest;
pub use registry::{StubId, StubRegistry};
pub use server::MockServer;
pub use synthesizer::MockResponse;
