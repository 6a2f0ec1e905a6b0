//! Per-query resolution: sink, answer from cache, or forward upstream.

use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::queue::ErrorQueue;
use super::resolver::DnsResolver;
use super::writer::ResponseWriter;
use crate::cache::{AnswerCache, Cache, DecisionCache};
use crate::config::Config;
use crate::error::ResolveError;
use crate::metrics::{
    ANSWER_CACHE_HITS_TOTAL, QUERIES_FORWARDED_TOTAL, QUERIES_SUNK_TOTAL, QUERIES_TOTAL,
    UPSTREAM_FAILURES_TOTAL,
};
use crate::rules::RuleSet;

/// Handler settings derived from the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerOptions {
    /// Log every query decision at info level instead of debug.
    pub verbose: bool,
}

impl HandlerOptions {
    pub const fn from_config(config: &Config) -> Self {
        Self {
            verbose: config.log.verbose,
        }
    }
}

/// What the handler did with a query.
#[derive(Debug)]
pub enum Dispatch {
    /// Answered with an empty reply.
    Sunk,
    /// Answered from the answer cache.
    Cached,
    /// Handed to a forwarding task.
    Forwarding(JoinHandle<()>),
    /// Not answered at all.
    Dropped,
}

/// Lower-case `name` and strip one trailing dot, keeping the root `.` intact.
pub fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.strip_suffix('.') {
        Some(stripped) if lower.len() > 1 => stripped.to_string(),
        _ => lower,
    }
}

/// An empty `NoError` reply mirroring the request header and question.
pub fn reply_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_authoritative(request.authoritative())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_checking_disabled(request.checking_disabled())
        .set_response_code(ResponseCode::NoError);
    reply.add_queries(request.queries().to_vec());
    reply
}

/// Resolves queries against the rule set, the caches and the upstreams.
///
/// Cloning is cheap: every shared piece sits behind an `Arc`.
pub struct QueryHandler<R>
where
    R: DnsResolver,
{
    rules: Arc<RuleSet>,
    decisions: Arc<DecisionCache>,
    answers: Arc<AnswerCache>,
    resolvers: Arc<[R]>,
    errors: ErrorQueue,
    options: HandlerOptions,
}

impl<R> QueryHandler<R>
where
    R: DnsResolver,
{
    pub fn new(
        rules: Arc<RuleSet>,
        decisions: Arc<DecisionCache>,
        answers: Arc<AnswerCache>,
        resolvers: Vec<R>,
        errors: ErrorQueue,
        options: HandlerOptions,
    ) -> Self {
        Self {
            rules,
            decisions,
            answers,
            resolvers: resolvers.into(),
            errors,
            options,
        }
    }

    /// Handle one query.
    ///
    /// Sink decisions and cache hits are answered before this returns;
    /// anything else is forwarded from a spawned task.
    #[instrument(skip(self, query, writer), fields(domain, peer = %writer.peer()))]
    pub async fn handle<W>(&self, query: Message, writer: W) -> Dispatch
    where
        W: ResponseWriter,
    {
        counter!(QUERIES_TOTAL).increment(1);

        let Some(question) = query.queries().first().cloned() else {
            warn!(id = query.id(), "dropping query without question");
            return Dispatch::Dropped;
        };

        let domain = normalize_name(&question.name().to_ascii());
        tracing::Span::current().record("domain", domain.as_str());

        if self.should_sink(&domain) {
            counter!(QUERIES_SUNK_TOTAL).increment(1);
            self.log_decision(&domain, "sunk");
            self.write_reply(&writer, &reply_to(&query), &domain).await;
            return Dispatch::Sunk;
        }

        if let Some(records) = self.answers.lookup(&question) {
            counter!(ANSWER_CACHE_HITS_TOTAL).increment(1);
            self.log_decision(&domain, "cached");
            let mut reply = reply_to(&query);
            reply.add_answers(records);
            self.write_reply(&writer, &reply, &domain).await;
            return Dispatch::Cached;
        }

        let handler = self.clone();
        Dispatch::Forwarding(tokio::spawn(async move {
            handler.forward(query, question, domain, writer).await;
        }))
    }

    /// Consult the decision cache, falling back to the rule set.
    ///
    /// Both verdicts are cached with the decision cache's default TTL.
    fn should_sink(&self, domain: &str) -> bool {
        let key = domain.to_string();
        if let Some(sink) = self.decisions.get(&key) {
            return sink;
        }

        let sink = self.rules.test(domain);
        self.decisions.put_default(key, sink);
        sink
    }

    /// Try each upstream in order; the first reply wins.
    async fn forward<W>(&self, query: Message, question: Query, domain: String, writer: W)
    where
        W: ResponseWriter,
    {
        counter!(QUERIES_FORWARDED_TOTAL).increment(1);
        let mut last_error = None;

        for resolver in self.resolvers.iter() {
            match resolver.resolve(&query).await {
                Ok(response) => {
                    if response.response_code() == ResponseCode::NoError
                        && !response.answers().is_empty()
                    {
                        self.answers.store(&question, response.answers().to_vec());
                    }
                    self.log_decision(&domain, "forwarded");
                    self.write_reply(&writer, &response, &domain).await;
                    return;
                }
                Err(err) => {
                    counter!(UPSTREAM_FAILURES_TOTAL).increment(1);
                    debug!(
                        domain = %domain,
                        upstream = %resolver.upstream(),
                        error = %err,
                        "upstream attempt failed"
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        self.errors.publish(ResolveError::UpstreamsExhausted {
            query: domain,
            upstreams: self.resolvers.iter().map(R::upstream).collect(),
            last_error: last_error.unwrap_or_else(|| "no upstream configured".to_string()),
        });
    }

    async fn write_reply<W>(&self, writer: &W, reply: &Message, domain: &str)
    where
        W: ResponseWriter,
    {
        if let Err(source) = writer.write(reply).await {
            self.errors.publish(ResolveError::ReplyWrite {
                query: domain.to_string(),
                peer: writer.peer(),
                source,
            });
        }
    }

    fn log_decision(&self, domain: &str, outcome: &str) {
        if self.options.verbose {
            info!(domain = %domain, outcome, "query resolved");
        } else {
            debug!(domain = %domain, outcome, "query resolved");
        }
    }
}

impl<R> Clone for QueryHandler<R>
where
    R: DnsResolver,
{
    fn clone(&self) -> Self {
        Self {
            rules: Arc::clone(&self.rules),
            decisions: Arc::clone(&self.decisions),
            answers: Arc::clone(&self.answers),
            resolvers: Arc::clone(&self.resolvers),
            errors: self.errors.clone(),
            options: self.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{QueryKey, Ttl};
    use crate::dns::resolver::tests::MockResolver;
    use crate::dns::writer::tests::RecordingWriter;
    use crate::rules::Rule;
    use hickory_proto::op::OpCode;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const DAY: Ttl = Ttl::Finite(Duration::from_secs(86400));

    struct Fixture {
        handler: QueryHandler<MockResolver>,
        decisions: Arc<DecisionCache>,
        answers: Arc<AnswerCache>,
        errors: UnboundedReceiver<ResolveError>,
    }

    fn fixture(rules: &[&str], resolvers: Vec<MockResolver>) -> Fixture {
        let rules = RuleSet::new(
            rules
                .iter()
                .map(|line| Rule::parse_line(line).unwrap().unwrap()),
        );
        let decisions = Arc::new(DecisionCache::new(DAY));
        let answers = Arc::new(AnswerCache::new(DAY));
        let (queue, errors) = ErrorQueue::new();
        let handler = QueryHandler::new(
            Arc::new(rules),
            Arc::clone(&decisions),
            Arc::clone(&answers),
            resolvers,
            queue,
            HandlerOptions::default(),
        );
        Fixture {
            handler,
            decisions,
            answers,
            errors,
        }
    }

    fn create_query(domain: &str, id: u16) -> Message {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        message
    }

    fn a_record(domain: &str, ip: [u8; 4]) -> Record {
        Record::from_rdata(
            Name::from_str(domain).unwrap(),
            60,
            RData::A(A(Ipv4Addr::from(ip))),
        )
    }

    async fn finish(dispatch: Dispatch) {
        match dispatch {
            Dispatch::Forwarding(handle) => handle.await.unwrap(),
            other => panic!("expected forwarding, got {other:?}"),
        }
    }

    #[test]
    fn should_normalize_names() {
        assert_eq!(normalize_name("Example.COM."), "example.com");
        assert_eq!(normalize_name("example.com"), "example.com");
        assert_eq!(normalize_name("."), ".");
        assert_eq!(normalize_name("a.."), "a.");
    }

    #[test]
    fn should_mirror_request_in_reply() {
        let mut request = create_query("example.com.", 321);
        request.set_authoritative(true).set_checking_disabled(true);

        let reply = reply_to(&request);

        assert_eq!(reply.id(), 321);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert!(reply.authoritative());
        assert!(reply.recursion_desired());
        assert!(reply.checking_disabled());
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.queries(), request.queries());
        assert!(reply.answers().is_empty());
    }

    #[tokio::test]
    async fn should_sink_blacklisted_domain_without_upstream_call() {
        let upstream = MockResolver::new("10.0.0.1:53");
        let fx = fixture(&["c;;ads"], vec![upstream.clone()]);
        let writer = RecordingWriter::new();

        let dispatch = fx.handler.handle(create_query("ads.example.com.", 5), writer.clone()).await;

        assert!(matches!(dispatch, Dispatch::Sunk));
        let sent = writer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 5);
        assert!(sent[0].answers().is_empty());
        assert_eq!(upstream.resolve_count(), 0);
        assert_eq!(fx.decisions.get(&"ads.example.com".to_string()), Some(true));
    }

    #[tokio::test]
    async fn should_mirror_authoritative_flag_when_sinking() {
        let fx = fixture(&["e;;blocked.com"], vec![MockResolver::new("10.0.0.1:53")]);
        let writer = RecordingWriter::new();
        let mut query = create_query("blocked.com.", 1);
        query.set_authoritative(true);

        fx.handler.handle(query, writer.clone()).await;

        assert!(writer.sent()[0].authoritative());
    }

    #[tokio::test]
    async fn should_not_sink_whitelisted_domain() {
        let upstream = MockResolver::new("10.0.0.1:53");
        upstream.answer_with("456.google.com.", [8, 8, 8, 8]).await;
        let fx = fixture(&["c;;google.com", "c;w;456.google.com"], vec![upstream.clone()]);
        let writer = RecordingWriter::new();

        let dispatch = fx.handler.handle(create_query("456.google.com.", 9), writer.clone()).await;
        finish(dispatch).await;

        assert_eq!(upstream.resolve_count(), 1);
        assert_eq!(writer.sent()[0].answers().len(), 1);
        assert_eq!(fx.decisions.get(&"456.google.com".to_string()), Some(false));
    }

    #[tokio::test]
    async fn should_use_cached_decision_over_rules() {
        let upstream = MockResolver::new("10.0.0.1:53");
        let fx = fixture(&[], vec![upstream.clone()]);
        fx.decisions.put("pinned.example".to_string(), true, Ttl::Infinite);
        let writer = RecordingWriter::new();

        let dispatch = fx.handler.handle(create_query("Pinned.Example.", 2), writer.clone()).await;

        assert!(matches!(dispatch, Dispatch::Sunk));
        assert_eq!(upstream.resolve_count(), 0);
    }

    #[tokio::test]
    async fn should_answer_from_cache_without_upstream_call() {
        let upstream = MockResolver::new("10.0.0.1:53");
        let fx = fixture(&[], vec![upstream.clone()]);
        let records = vec![a_record("cached.com.", [1, 2, 3, 4])];
        fx.answers
            .store(&Query::query(Name::from_str("cached.com.").unwrap(), RecordType::A), records.clone());
        let writer = RecordingWriter::new();

        let dispatch = fx.handler.handle(create_query("CACHED.com.", 123), writer.clone()).await;

        assert!(matches!(dispatch, Dispatch::Cached));
        let sent = writer.sent();
        assert_eq!(sent[0].id(), 123);
        assert_eq!(sent[0].answers(), records.as_slice());
        assert_eq!(upstream.resolve_count(), 0);
    }

    #[tokio::test]
    async fn should_forward_and_cache_answers() {
        let upstream = MockResolver::new("10.0.0.1:53");
        upstream.answer_with("example.com.", [93, 184, 216, 34]).await;
        let fx = fixture(&[], vec![upstream.clone()]);
        let writer = RecordingWriter::new();

        finish(fx.handler.handle(create_query("example.com.", 456), writer.clone()).await).await;

        let sent = writer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 456);
        assert_eq!(upstream.resolve_count(), 1);
        let key = QueryKey::new(&Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        assert_eq!(fx.answers.get(&key), Some(sent[0].answers().to_vec()));

        // The second query is served from the cache.
        let dispatch = fx.handler.handle(create_query("example.com.", 457), writer.clone()).await;
        assert!(matches!(dispatch, Dispatch::Cached));
        assert_eq!(upstream.resolve_count(), 1);
    }

    #[tokio::test]
    async fn should_not_cache_negative_answers() {
        let upstream = MockResolver::new("10.0.0.1:53");
        let fx = fixture(&[], vec![upstream.clone()]);
        let writer = RecordingWriter::new();

        finish(fx.handler.handle(create_query("missing.com.", 1), writer.clone()).await).await;

        assert_eq!(writer.sent()[0].response_code(), ResponseCode::NXDomain);
        assert!(fx.answers.is_empty());
    }

    #[tokio::test]
    async fn should_fall_through_to_next_upstream() {
        let broken = MockResolver::failing("10.0.0.1:53", "timed out");
        let working = MockResolver::new("10.0.0.2:53");
        working.answer_with("example.com.", [1, 1, 1, 1]).await;
        let unused = MockResolver::new("10.0.0.3:53");
        let fx = fixture(&[], vec![broken.clone(), working.clone(), unused.clone()]);
        let writer = RecordingWriter::new();

        finish(fx.handler.handle(create_query("example.com.", 3), writer.clone()).await).await;

        assert_eq!(broken.resolve_count(), 1);
        assert_eq!(working.resolve_count(), 1);
        assert_eq!(unused.resolve_count(), 0);
        assert_eq!(writer.sent().len(), 1);
    }

    #[tokio::test]
    async fn should_publish_one_error_when_all_upstreams_fail() {
        let first = MockResolver::failing("10.0.0.1:53", "timed out");
        let second = MockResolver::failing("10.0.0.2:53", "refused");
        let mut fx = fixture(&[], vec![first, second]);
        let writer = RecordingWriter::new();

        finish(fx.handler.handle(create_query("nowhere.com.", 4), writer.clone()).await).await;

        assert!(writer.sent().is_empty());
        match fx.errors.try_recv().unwrap() {
            ResolveError::UpstreamsExhausted {
                query,
                upstreams,
                last_error,
            } => {
                assert_eq!(query, "nowhere.com");
                assert_eq!(
                    upstreams,
                    vec![
                        "10.0.0.1:53".parse::<std::net::SocketAddr>().unwrap(),
                        "10.0.0.2:53".parse().unwrap()
                    ]
                );
                assert!(last_error.contains("refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fx.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn should_publish_reply_write_failures() {
        let mut fx = fixture(&["e;;blocked.com"], vec![MockResolver::new("10.0.0.1:53")]);

        let dispatch = fx
            .handler
            .handle(create_query("blocked.com.", 1), RecordingWriter::failing())
            .await;

        assert!(matches!(dispatch, Dispatch::Sunk));
        assert!(matches!(
            fx.errors.try_recv().unwrap(),
            ResolveError::ReplyWrite { query, .. } if query == "blocked.com"
        ));
    }

    #[tokio::test]
    async fn should_drop_query_without_question() {
        let upstream = MockResolver::new("10.0.0.1:53");
        let fx = fixture(&[], vec![upstream.clone()]);
        let writer = RecordingWriter::new();
        let mut query = Message::new();
        query.set_id(8);

        let dispatch = fx.handler.handle(query, writer.clone()).await;

        assert!(matches!(dispatch, Dispatch::Dropped));
        assert!(writer.sent().is_empty());
        assert_eq!(upstream.resolve_count(), 0);
    }

    #[tokio::test]
    async fn should_not_fail_after_error_queue_closed() {
        let mut fx = fixture(&[], vec![MockResolver::failing("10.0.0.1:53", "down")]);
        fx.handler.errors.close();

        finish(fx.handler.handle(create_query("late.com.", 1), RecordingWriter::new()).await).await;

        assert!(fx.errors.recv().await.is_none());
    }
}
