//! DNS query handling.

pub mod handler;
pub mod queue;
pub mod resolver;
pub mod writer;

pub use handler::{Dispatch, HandlerOptions, QueryHandler, normalize_name, reply_to};
pub use queue::ErrorQueue;
pub use resolver::{DnsResolver, MAX_UDP_DNS_SIZE, UpstreamResolver};
pub use writer::{ResponseWriter, UdpResponder};
