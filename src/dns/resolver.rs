//! Upstream resolver trait and the UDP implementation.
//!
//! One resolver stands for one upstream server. The handler owns them in
//! their configured order and falls through the list on failure.

use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Error, Result};

/// Receive buffer size for upstream replies.
///
/// Larger than the classic 512 byte limit so EDNS answers are not cut off.
pub const MAX_UDP_DNS_SIZE: usize = 4096;

/// A single upstream DNS server.
pub trait DnsResolver: Send + Sync + Clone + 'static {
    /// Address reported in logs and errors.
    fn upstream(&self) -> SocketAddr;

    /// Send `query` upstream and return the reply.
    fn resolve(&self, query: &Message) -> impl Future<Output = Result<Message>> + Send;
}

/// Plain DNS over UDP to one upstream, bounded by a timeout.
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    upstream_addr: SocketAddr,
    timeout: Duration,
}

impl UpstreamResolver {
    pub const fn new(upstream_addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            upstream_addr,
            timeout,
        }
    }

    /// Resolve a `host:port` upstream, keeping the first address returned.
    pub async fn lookup(address: &str, timeout: Duration) -> Result<Self> {
        let mut addrs = tokio::net::lookup_host(address)
            .await
            .map_err(|source| Error::UpstreamLookup {
                address: address.to_string(),
                source,
            })?;
        let upstream_addr = addrs
            .next()
            .ok_or_else(|| Error::NoUpstreamAddress(address.to_string()))?;

        debug!(address, upstream = %upstream_addr, "resolved upstream");
        Ok(Self::new(upstream_addr, timeout))
    }

    /// One resolver per configured upstream, keeping the order.
    pub async fn lookup_all(addresses: &[String], timeout: Duration) -> Result<Vec<Self>> {
        let mut resolvers = Vec::with_capacity(addresses.len());
        for address in addresses {
            resolvers.push(Self::lookup(address, timeout).await?);
        }
        Ok(resolvers)
    }

    async fn exchange(&self, query: &Message) -> Result<Message> {
        let local: SocketAddr = if self.upstream_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(self.upstream_addr).await?;

        let query_bytes = query.to_bytes()?;
        socket.send(&query_bytes).await?;

        let mut response_buf = vec![0u8; MAX_UDP_DNS_SIZE];
        let len = socket.recv(&mut response_buf).await?;

        let response = Message::from_bytes(&response_buf[..len])?;
        if response.id() != query.id() {
            return Err(Error::IdMismatch {
                upstream: self.upstream_addr,
                expected: query.id(),
                got: response.id(),
            });
        }

        Ok(response)
    }
}

impl DnsResolver for UpstreamResolver {
    fn upstream(&self) -> SocketAddr {
        self.upstream_addr
    }

    async fn resolve(&self, query: &Message) -> Result<Message> {
        tokio::time::timeout(self.timeout, self.exchange(query))
            .await
            .map_err(|_| Error::Timeout(self.upstream_addr))?
    }
}
