//! Query handling for the DNS responder
//!
//! Names under the local tld resolve to loopback. Everything else is
//! forwarded to the system's upstream resolver.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use dh_core::naming::is_under_tld;

/// Resolver for forwarded queries
///
/// An explicit upstream wins. Otherwise the system configuration is used,
/// or a public resolver when the system configuration cannot be read.
pub fn build_resolver(upstream: Option<SocketAddr>) -> TokioAsyncResolver {
    if let Some(addr) = upstream {
        let servers = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), servers);
        return TokioAsyncResolver::tokio(config, ResolverOpts::default());
    }
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        tracing::warn!(
            "Failed to load system resolver config: {}. Forwarding to Cloudflare DNS.",
            e
        );
        TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
    })
}

/// Loopback records for a query under the local tld
///
/// Types other than A, AAAA and ANY get an empty answer.
pub fn local_records(name: &Name, query_type: RecordType, ttl: u32) -> Vec<Record> {
    let mut records = Vec::new();
    if matches!(query_type, RecordType::A | RecordType::ANY) {
        records.push(Record::from_rdata(name.clone(), ttl, RData::A(A(Ipv4Addr::LOCALHOST))));
    }
    if matches!(query_type, RecordType::AAAA | RecordType::ANY) {
        records.push(Record::from_rdata(
            name.clone(),
            ttl,
            RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
        ));
    }
    records
}

pub struct LocalTldHandler {
    tld: String,
    ttl: u32,
    resolver: TokioAsyncResolver,
}

impl LocalTldHandler {
    pub fn new(tld: String, ttl: u32, resolver: TokioAsyncResolver) -> Self {
        Self { tld, ttl, resolver }
    }

    async fn forward(&self, name: &str, query_type: RecordType) -> (ResponseCode, Vec<Record>) {
        match self.resolver.lookup(name, query_type).await {
            Ok(lookup) => (ResponseCode::NoError, lookup.records().to_vec()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. } => (*response_code, Vec::new()),
                _ => {
                    tracing::debug!("Upstream lookup of {} {} failed: {}", name, query_type, e);
                    (ResponseCode::ServFail, Vec::new())
                }
            },
        }
    }
}

#[async_trait]
impl RequestHandler for LocalTldHandler {
    async fn handle_request<R>(&self, request: &Request, mut response_handle: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        let qname = query.name().to_string();
        let qtype = query.query_type();

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        let (code, records) = if is_under_tld(&qname, &self.tld) {
            header.set_authoritative(true);
            let name: Name = query.name().clone().into();
            (ResponseCode::NoError, local_records(&name, qtype, self.ttl))
        } else {
            self.forward(&qname, qtype).await
        };
        header.set_response_code(code);
        tracing::trace!("{} {} -> {:?} ({} records)", qname, qtype, code, records.len());

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            records.iter(),
            std::iter::empty(),
            std::iter::empty(),
            std::iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Failed to send DNS response for {}: {}", qname, e);
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_records_by_type() {
        let name = Name::from_ascii("api.test.").unwrap();

        let a = local_records(&name, RecordType::A, 5);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].record_type(), RecordType::A);
        assert_eq!(a[0].ttl(), 5);

        assert_eq!(local_records(&name, RecordType::AAAA, 5)[0].record_type(), RecordType::AAAA);
        assert_eq!(local_records(&name, RecordType::ANY, 5).len(), 2);
        assert!(local_records(&name, RecordType::MX, 5).is_empty());
    }
}
