//! Server-sent change events → core change stream.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use log::{debug, error};
use pointsync_core::rewards::{BalanceRow, Transaction};
use pointsync_core::sync::{ChangeEvent, ChangeKind, ChangeRecord, ChangeStream};
use pointsync_core::Error as CoreError;
use std::collections::VecDeque;

use crate::types::{ChangePayload, TransactionRow, BALANCES_TABLE, TRANSACTIONS_TABLE};

/// One `event:`/`data:` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental event-stream decoder; frames may span chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = Self::parse_block(&String::from_utf8_lossy(&block[..end])) {
                frames.push(frame);
            }
        }
        frames
    }

    fn parse_block(block: &str) -> Option<SseFrame> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }
        if data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event,
            data: data.join("\n"),
        })
    }
}

/// Maps a frame to a change event. `None` for frames that carry nothing to
/// apply (keep-alives, other tables, undecodable rows).
pub(crate) fn decode_frame(frame: &SseFrame) -> Option<pointsync_core::Result<ChangeEvent>> {
    match frame.event.as_deref() {
        Some("error") => {
            return Some(Err(CoreError::subscription(format!(
                "change feed reported: {}",
                frame.data
            ))))
        }
        Some("heartbeat") | Some("ping") => return None,
        _ => {}
    }

    let payload: ChangePayload = match serde_json::from_str(&frame.data) {
        Ok(payload) => payload,
        Err(err) => {
            error!("[RewardsApi] Undecodable change event ({}): {}", err, frame.data);
            return None;
        }
    };
    let row = match payload.event_type {
        ChangeKind::Delete => payload.old.or(payload.new),
        _ => payload.new,
    }?;

    let record = match payload.table.as_str() {
        BALANCES_TABLE => serde_json::from_value::<BalanceRow>(row).map(ChangeRecord::Balance),
        TRANSACTIONS_TABLE => serde_json::from_value::<TransactionRow>(row)
            .map(|row| ChangeRecord::Transaction(Transaction::from(row))),
        other => {
            debug!("[RewardsApi] Ignoring change on table {}", other);
            return None;
        }
    };
    match record {
        Ok(record) => Some(Ok(ChangeEvent {
            kind: payload.event_type,
            record,
            commit_timestamp: payload.commit_timestamp,
        })),
        Err(err) => {
            error!(
                "[RewardsApi] Undecodable {} row in change event: {}",
                payload.table, err
            );
            None
        }
    }
}

struct FeedState {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<pointsync_core::Result<ChangeEvent>>,
    done: bool,
}

/// Turns a response body into a change stream. A transport error yields one
/// `Err` and ends the stream.
pub(crate) fn change_stream<S, B>(bytes: S) -> ChangeStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = FeedState {
        bytes: bytes.map(|chunk| chunk.map(|b| b.as_ref().to_vec())).boxed(),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.decoder.push(&chunk) {
                        if let Some(event) = decode_frame(&frame) {
                            state.pending.push_back(event);
                        }
                    }
                }
                Some(Err(err)) => {
                    state.done = true;
                    state.pending.push_back(Err(CoreError::subscription(format!(
                        "change feed interrupted: {}",
                        err
                    ))));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
