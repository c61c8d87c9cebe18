//! Interceptor: classification and routing of observed exchanges.
//!
//! Consumes `ExchangeEvent`s from one boundary connection. Matched traffic
//! is tracked per proxied exchange until its response completes (whole body
//! or terminal stream frame); everything else is dropped at classification
//! and never decoded. Completed turns are handed to the sync queue without
//! waiting on it. Every failure path logs and drops the one exchange; the
//! interceptor itself never stops observing.

use std::collections::HashMap;

use chrono::Utc;

use memtap_core::config::InterceptConfig;
use memtap_core::ipc::ExchangeEvent;
use memtap_core::models::ConversationTurn;

use super::assemble::{AbortReason, StreamAssembler};
use super::decode;
use super::sync::SyncHandle;

/// Traffic filter: exact host match plus path prefix match. Anything
/// outside this window is invisible to the pipeline.
#[derive(Debug, Clone)]
pub struct TrafficMatcher {
    host: String,
    path_prefix: String,
}

impl TrafficMatcher {
    pub fn new(config: &InterceptConfig) -> Self {
        Self {
            host: config.match_host.clone(),
            path_prefix: config.match_path_prefix.clone(),
        }
    }

    pub fn matches(&self, host: &str, path: &str) -> bool {
        host.eq_ignore_ascii_case(&self.host) && path.starts_with(&self.path_prefix)
    }
}

/// One matched exchange awaiting its response. The assembler appears only
/// once the first stream frame proves the response is streamed.
struct PendingExchange {
    host: String,
    path: String,
    request_body: Vec<u8>,
    assembler: Option<StreamAssembler>,
}

pub struct Interceptor {
    matcher: TrafficMatcher,
    user_id: String,
    sync: SyncHandle,
    pending: HashMap<u64, PendingExchange>,
}

impl Interceptor {
    pub fn new(config: &InterceptConfig, user_id: impl Into<String>, sync: SyncHandle) -> Self {
        Self {
            matcher: TrafficMatcher::new(config),
            user_id: user_id.into(),
            sync,
            pending: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Route one observed event. Never blocks and never fails the caller.
    pub fn observe(&mut self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::RequestCaptured {
                connection_id,
                host,
                path,
                body,
            } => self.on_request(connection_id, &host, &path, body),
            ExchangeEvent::ResponseComplete {
                connection_id,
                content_type,
                body,
            } => self.on_response_complete(connection_id, &content_type, &body),
            ExchangeEvent::ResponseFrame {
                connection_id,
                payload,
            } => self.on_response_frame(connection_id, &payload),
            ExchangeEvent::StreamClosed { connection_id } => self.on_stream_closed(connection_id),
        }
    }

    /// Abandon all in-flight exchanges when the boundary connection ends
    /// or the process shuts down.
    pub fn close(&mut self, reason: AbortReason) {
        for (connection_id, exchange) in self.pending.drain() {
            if let Some(assembler) = &exchange.assembler {
                if assembler.is_accumulating() {
                    let abort = assembler.abort(reason);
                    tracing::warn!(
                        connection_id,
                        reason = abort.reason.as_str(),
                        buffered_bytes = abort.buffered_bytes,
                        "in-flight stream abandoned at boundary teardown"
                    );
                    continue;
                }
            }
            tracing::debug!(connection_id, "pending exchange dropped at boundary teardown");
        }
    }

    fn on_request(&mut self, connection_id: u64, host: &str, path: &str, body: Vec<u8>) {
        if !self.matcher.matches(host, path) {
            tracing::trace!(connection_id, host, path, "exchange outside match window");
            return;
        }
        let previous = self.pending.insert(
            connection_id,
            PendingExchange {
                host: host.to_string(),
                path: path.to_string(),
                request_body: body,
                assembler: None,
            },
        );
        if previous.is_some() {
            tracing::debug!(connection_id, "exchange id reused, previous state discarded");
        }
    }

    fn on_response_complete(&mut self, connection_id: u64, content_type: &str, body: &[u8]) {
        let exchange = match self.pending.remove(&connection_id) {
            Some(exchange) => exchange,
            None => {
                tracing::trace!(connection_id, "response for unmatched exchange ignored");
                return;
            }
        };

        // A proxy may buffer an event-stream response and deliver it whole.
        let result = if content_type.starts_with("text/event-stream") {
            Self::assemble_buffered(connection_id, &self.user_id, &exchange.request_body, body)
        } else {
            decode::decode_direct(&exchange.request_body, body, &self.user_id, Utc::now())
                .map_err(|e| e.to_string())
        };

        match result {
            Ok(turn) => self.sync.submit(turn),
            Err(error) => {
                tracing::warn!(
                    connection_id,
                    host = %exchange.host,
                    path = %exchange.path,
                    response_bytes = body.len(),
                    error = %error,
                    "exchange dropped, not decodable"
                );
            }
        }
    }

    fn on_response_frame(&mut self, connection_id: u64, payload: &[u8]) {
        let exchange = match self.pending.get_mut(&connection_id) {
            Some(exchange) => exchange,
            None => {
                tracing::trace!(connection_id, "stream frame for unmatched exchange ignored");
                return;
            }
        };

        // First frame: the request side is parsed once, then reused for
        // every subsequent frame of the stream.
        if exchange.assembler.is_none() {
            match decode::request_messages(&exchange.request_body) {
                Ok(messages) => {
                    exchange.assembler = Some(StreamAssembler::new(
                        connection_id,
                        self.user_id.clone(),
                        messages,
                    ));
                }
                Err(error) => {
                    tracing::warn!(
                        connection_id,
                        error = %error,
                        "unreadable request side, stream dropped"
                    );
                    self.pending.remove(&connection_id);
                    return;
                }
            }
        }
        let assembler = match exchange.assembler.as_mut() {
            Some(assembler) => assembler,
            None => return,
        };

        let chunk = String::from_utf8_lossy(payload);
        let mut finished: Option<ConversationTurn> = None;
        let mut aborted = false;
        for data in decode::sse_data_payloads(&chunk) {
            let frame = match decode::parse_frame(&data) {
                Ok(frame) => frame,
                Err(error) => {
                    tracing::warn!(connection_id, error = %error, "unparseable stream frame skipped");
                    continue;
                }
            };
            match assembler.on_frame(frame) {
                Ok(None) => {}
                Ok(Some(turn)) => {
                    finished = Some(turn);
                    break;
                }
                Err(abort) => {
                    tracing::warn!(
                        connection_id,
                        reason = abort.reason.as_str(),
                        buffered_bytes = abort.buffered_bytes,
                        "stream assembly aborted"
                    );
                    aborted = true;
                    break;
                }
            }
        }

        if finished.is_some() || aborted {
            self.pending.remove(&connection_id);
        }
        if let Some(turn) = finished {
            self.sync.submit(turn);
        }
    }

    fn on_stream_closed(&mut self, connection_id: u64) {
        if let Some(exchange) = self.pending.remove(&connection_id) {
            if let Some(assembler) = &exchange.assembler {
                if assembler.is_accumulating() {
                    let abort = assembler.abort(AbortReason::ConnectionClosed);
                    tracing::warn!(
                        connection_id,
                        buffered_bytes = abort.buffered_bytes,
                        "stream closed mid-response, partial content discarded"
                    );
                    return;
                }
            }
            tracing::debug!(connection_id, "exchange closed without a response");
        }
    }

    /// Run a fully buffered event-stream body through the same assembly
    /// path live frames take.
    fn assemble_buffered(
        connection_id: u64,
        user_id: &str,
        request_body: &[u8],
        body: &[u8],
    ) -> Result<ConversationTurn, String> {
        let messages = decode::request_messages(request_body).map_err(|e| e.to_string())?;
        let mut assembler = StreamAssembler::new(connection_id, user_id, messages);

        let chunk = String::from_utf8_lossy(body);
        for data in decode::sse_data_payloads(&chunk) {
            let frame = match decode::parse_frame(&data) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            match assembler.on_frame(frame) {
                Ok(None) => {}
                Ok(Some(turn)) => return Ok(turn),
                Err(abort) => return Err(abort.reason.as_str().to_string()),
            }
        }
        Err("stream body ended without a terminal frame".to_string())
    }
}
