//! One supervised subscription per instrument.
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Streaming -> Reconnecting -> Disconnected
//!                     |             |                          ^
//!                     +-------------+--------------------------+
//! any state -> Closed
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use pipeline_core::retry::Backoff;
use pipeline_core::{
    BookUpdateKind, Error, Instrument, OrderBookRecord, Result, RetryPolicy, TimestampMs,
};

use super::book::LocalBook;
use super::message::{parse_frame, subscribe_message, BookSnapshot, FeedEvent, PriceChangeBatch};
use super::transport::{FeedConnector, FeedFrame, FeedTransport};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting)
            | (Connecting, Subscribed)
            | (Connecting, Reconnecting)
            | (Subscribed, Streaming)
            | (Subscribed, Reconnecting)
            | (Streaming, Reconnecting)
            | (Reconnecting, Disconnected) => true,
            _ => false,
        }
    }
}

/// Enforces the transition graph and keeps the visited states.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
    history: Vec<SessionState>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            history: vec![SessionState::Disconnected],
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Other(format!(
                "illegal session transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Successful handshakes.
    pub connects: u64,
    /// Connections lost or refused.
    pub reconnects: u64,
    /// Records handed to the sink.
    pub records: u64,
    pub snapshots: u64,
    pub deltas: u64,
    /// Deltas received before the first snapshot of a connection.
    pub discarded_deltas: u64,
    /// Updates older than the last emitted record for their token.
    pub stale_dropped: u64,
    pub sequence_gaps: u64,
    pub protocol_errors: u64,
    /// Undecodable events skipped inside otherwise valid frames.
    pub malformed: u64,
    /// Events for unknown tokens or of unrecorded types.
    pub ignored_events: u64,
}

impl SessionStats {
    pub fn merge(&mut self, other: &SessionStats) {
        self.connects += other.connects;
        self.reconnects += other.reconnects;
        self.records += other.records;
        self.snapshots += other.snapshots;
        self.deltas += other.deltas;
        self.discarded_deltas += other.discarded_deltas;
        self.stale_dropped += other.stale_dropped;
        self.sequence_gaps += other.sequence_gaps;
        self.protocol_errors += other.protocol_errors;
        self.malformed += other.malformed;
        self.ignored_events += other.ignored_events;
    }
}

/// Timing and shaping parameters shared by all sessions of one stream.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub max_depth: usize,
    pub reconnect: RetryPolicy,
    /// Sessions close at this instant.
    pub deadline: Instant,
}

#[derive(Debug, Default)]
struct TokenState {
    book: LocalBook,
    market: Option<String>,
    snapshot_seen: bool,
    last_sequence: Option<u64>,
    last_emitted_ms: Option<TimestampMs>,
}

impl TokenState {
    fn is_stale(&self, ts: TimestampMs) -> bool {
        self.last_emitted_ms.is_some_and(|last| ts < last)
    }
}

enum ConnectionEnd {
    Stopped,
    Failed(Error),
    SinkClosed,
}

/// Resolves once the stop flag is set. A dropped sender never stops.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct SubscriptionSession {
    instrument: Instrument,
    connector: Arc<dyn FeedConnector>,
    params: SessionParams,
    tx: mpsc::Sender<OrderBookRecord>,
    machine: SessionStateMachine,
    tokens: HashMap<String, TokenState>,
    stats: SessionStats,
}

impl SubscriptionSession {
    pub fn new(
        instrument: Instrument,
        connector: Arc<dyn FeedConnector>,
        params: SessionParams,
        tx: mpsc::Sender<OrderBookRecord>,
    ) -> Self {
        let tokens = instrument
            .token_ids
            .iter()
            .map(|id| {
                let state = TokenState {
                    market: instrument.condition_id.clone(),
                    ..TokenState::default()
                };
                (id.clone(), state)
            })
            .collect();
        Self {
            instrument,
            connector,
            params,
            tx,
            machine: SessionStateMachine::default(),
            tokens,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Close without ever connecting.
    pub fn abandon(mut self) -> SessionStats {
        self.enter(SessionState::Closed);
        self.stats
    }

    /// Stream until `stop` is set or the deadline passes, reconnecting with
    /// backoff after every failure.
    pub async fn run(self, stop: watch::Receiver<bool>) -> SessionStats {
        self.run_with_history(stop).await.0
    }

    pub(crate) async fn run_with_history(
        mut self,
        mut stop: watch::Receiver<bool>,
    ) -> (SessionStats, Vec<SessionState>) {
        let label = self.instrument.label();
        let deadline = self.params.deadline;
        let mut backoff = self.params.reconnect.backoff();

        loop {
            if *stop.borrow() || Instant::now() >= deadline {
                break;
            }
            self.enter(SessionState::Connecting);
            match self.connect_and_stream(&mut stop, &mut backoff).await {
                ConnectionEnd::Stopped => break,
                ConnectionEnd::SinkClosed => {
                    warn!(instrument = %label, "record sink closed, ending session");
                    break;
                }
                ConnectionEnd::Failed(err) => {
                    self.enter(SessionState::Reconnecting);
                    self.stats.reconnects += 1;
                    self.reset_epoch();
                    let delay = backoff.next_delay();
                    warn!(
                        instrument = %label,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        attempt = backoff.attempts(),
                        "feed connection lost, reconnecting"
                    );
                    let stopped = tokio::select! {
                        _ = sleep(delay) => false,
                        _ = stop_requested(&mut stop) => true,
                        _ = sleep_until(deadline) => true,
                    };
                    if stopped {
                        break;
                    }
                    self.enter(SessionState::Disconnected);
                }
            }
        }

        self.enter(SessionState::Closed);
        debug!(instrument = %label, stats = ?self.stats, "session closed");
        (self.stats, self.machine.history)
    }

    fn enter(&mut self, next: SessionState) {
        if let Err(e) = self.machine.transition(next) {
            error!(instrument = %self.instrument.label(), error = %e, "session state violation");
        }
    }

    /// Books and sequences do not survive a reconnect; the next snapshot
    /// rebuilds them.
    fn reset_epoch(&mut self) {
        for token in self.tokens.values_mut() {
            token.book.clear();
            token.snapshot_seen = false;
            token.last_sequence = None;
        }
    }

    async fn connect_and_stream(
        &mut self,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> ConnectionEnd {
        let deadline = self.params.deadline;
        let connector = self.connector.clone();
        let connected = tokio::select! {
            res = connector.connect() => res,
            _ = stop_requested(stop) => return ConnectionEnd::Stopped,
            _ = sleep_until(deadline) => return ConnectionEnd::Stopped,
        };
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => return ConnectionEnd::Failed(e),
        };

        if let Err(e) = transport
            .send_text(subscribe_message(&self.instrument.token_ids))
            .await
        {
            return ConnectionEnd::Failed(e);
        }
        self.stats.connects += 1;
        self.enter(SessionState::Subscribed);
        info!(
            instrument = %self.instrument.label(),
            tokens = self.instrument.token_ids.len(),
            "subscribed to feed"
        );

        let end = self.pump(transport.as_mut(), stop, backoff).await;
        if let Err(e) = transport.close().await {
            debug!(error = %e, "feed close failed");
        }
        end
    }

    async fn pump(
        &mut self,
        transport: &mut dyn FeedTransport,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> ConnectionEnd {
        let deadline = self.params.deadline;
        let liveness = self.params.liveness_timeout;
        let period = self.params.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();

        loop {
            let silence = sleep_until(last_frame + liveness);
            let end = tokio::select! {
                _ = stop_requested(stop) => Some(ConnectionEnd::Stopped),
                _ = sleep_until(deadline) => Some(ConnectionEnd::Stopped),
                _ = silence => Some(ConnectionEnd::Failed(Error::transient(format!(
                    "no frames within {}ms",
                    liveness.as_millis()
                )))),
                _ = ping.tick() => transport
                    .send_text("PING".to_string())
                    .await
                    .err()
                    .map(ConnectionEnd::Failed),
                frame = transport.next_frame() => match frame {
                    None => Some(ConnectionEnd::Failed(Error::transient("feed stream ended"))),
                    Some(Err(e)) => Some(ConnectionEnd::Failed(e)),
                    Some(Ok(FeedFrame::Close)) => {
                        Some(ConnectionEnd::Failed(Error::transient("feed closed by server")))
                    }
                    Some(Ok(FeedFrame::Text(text))) => {
                        last_frame = Instant::now();
                        self.handle_text(&text, backoff).await.err()
                    }
                },
            };
            if let Some(end) = end {
                return end;
            }
        }
    }

    async fn handle_text(
        &mut self,
        text: &str,
        backoff: &mut Backoff,
    ) -> std::result::Result<(), ConnectionEnd> {
        let events = match parse_frame(text) {
            Ok(events) => events,
            Err(e) => {
                self.stats.protocol_errors += 1;
                return Err(ConnectionEnd::Failed(e));
            }
        };

        for event in events {
            match event {
                FeedEvent::Pong => {}
                FeedEvent::Ignored(_) => self.stats.ignored_events += 1,
                FeedEvent::Malformed(reason) => {
                    self.stats.malformed += 1;
                    warn!(
                        instrument = %self.instrument.label(),
                        reason = %reason,
                        "skipping malformed feed event"
                    );
                }
                FeedEvent::Book(snapshot) => {
                    self.mark_streaming(backoff);
                    self.on_book(snapshot).await?;
                }
                FeedEvent::PriceChange(batch) => {
                    self.mark_streaming(backoff);
                    self.on_price_change(batch).await?;
                }
            }
        }
        Ok(())
    }

    fn mark_streaming(&mut self, backoff: &mut Backoff) {
        if self.machine.state() == SessionState::Subscribed {
            self.enter(SessionState::Streaming);
            backoff.reset();
        }
    }

    async fn on_book(&mut self, snapshot: BookSnapshot) -> std::result::Result<(), ConnectionEnd> {
        let depth = self.params.max_depth;
        let Some(token) = self.tokens.get_mut(&snapshot.asset_id) else {
            self.stats.ignored_events += 1;
            return Ok(());
        };

        token.book.apply_snapshot(&snapshot.bids, &snapshot.asks);
        token.snapshot_seen = true;
        token.last_sequence = snapshot.sequence;
        if snapshot.market.is_some() {
            token.market = snapshot.market.clone();
        }
        self.stats.snapshots += 1;

        if token.is_stale(snapshot.timestamp_ms) {
            self.stats.stale_dropped += 1;
            return Ok(());
        }
        token.last_emitted_ms = Some(snapshot.timestamp_ms);
        let record = token.book.to_record(
            &snapshot.asset_id,
            token.market.clone(),
            snapshot.timestamp_ms,
            snapshot.sequence,
            snapshot.hash,
            BookUpdateKind::Snapshot,
            depth,
        );
        self.emit(record).await
    }

    async fn on_price_change(
        &mut self,
        batch: PriceChangeBatch,
    ) -> std::result::Result<(), ConnectionEnd> {
        let depth = self.params.max_depth;
        let mut assets: Vec<&str> = Vec::new();
        for change in &batch.changes {
            if !assets.contains(&change.asset_id.as_str()) {
                assets.push(&change.asset_id);
            }
        }

        for asset in assets {
            let Some(token) = self.tokens.get_mut(asset) else {
                self.stats.ignored_events += 1;
                continue;
            };
            if !token.snapshot_seen {
                self.stats.discarded_deltas += 1;
                continue;
            }
            if let (Some(last), Some(seq)) = (token.last_sequence, batch.sequence) {
                if seq > last + 1 {
                    self.stats.sequence_gaps += 1;
                    return Err(ConnectionEnd::Failed(Error::SequenceGap {
                        token_id: asset.to_string(),
                        expected: last + 1,
                        got: seq,
                    }));
                }
                if seq <= last {
                    self.stats.stale_dropped += 1;
                    continue;
                }
            }
            if batch.sequence.is_some() {
                token.last_sequence = batch.sequence;
            }

            let mut hash = None;
            for change in batch.changes.iter().filter(|c| c.asset_id == asset) {
                token.book.apply_change(change.side, change.price, change.size);
                if change.hash.is_some() {
                    hash = change.hash.clone();
                }
            }
            self.stats.deltas += 1;
            if batch.market.is_some() {
                token.market = batch.market.clone();
            }

            if token.is_stale(batch.timestamp_ms) {
                self.stats.stale_dropped += 1;
                continue;
            }
            token.last_emitted_ms = Some(batch.timestamp_ms);
            let record = token.book.to_record(
                asset,
                token.market.clone(),
                batch.timestamp_ms,
                batch.sequence,
                hash,
                BookUpdateKind::Delta,
                depth,
            );
            self.emit(record).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, record: OrderBookRecord) -> std::result::Result<(), ConnectionEnd> {
        self.tx
            .send(record)
            .await
            .map_err(|_| ConnectionEnd::SinkClosed)?;
        self.stats.records += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::{FakeFeed, Step};
    use super::*;

    fn params(liveness_ms: u64) -> SessionParams {
        SessionParams {
            ping_interval: Duration::from_secs(3_600),
            liveness_timeout: Duration::from_millis(liveness_ms),
            max_depth: 10,
            reconnect: RetryPolicy::new(1, 1, 5, 0.0),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    fn book(token: &str, ts: i64, bid: f64) -> Step {
        Step::Frame(format!(
            r#"{{"event_type":"book","asset_id":"{token}","timestamp":"{ts}","bids":[{{"price":"{bid}","size":"10"}}],"asks":[{{"price":"0.9","size":"10"}}]}}"#
        ))
    }

    fn book_seq(token: &str, ts: i64, seq: u64) -> Step {
        Step::Frame(format!(
            r#"{{"event_type":"book","asset_id":"{token}","timestamp":"{ts}","seq":{seq},"bids":[{{"price":"0.4","size":"10"}}],"asks":[]}}"#
        ))
    }

    fn change(token: &str, ts: i64, price: f64, size: f64) -> Step {
        Step::Frame(format!(
            r#"{{"event_type":"price_change","timestamp":"{ts}","price_changes":[{{"asset_id":"{token}","price":"{price}","size":"{size}","side":"BUY"}}]}}"#
        ))
    }

    fn change_seq(token: &str, ts: i64, seq: u64) -> Step {
        Step::Frame(format!(
            r#"{{"event_type":"price_change","timestamp":"{ts}","seq":{seq},"price_changes":[{{"asset_id":"{token}","price":"0.41","size":"5","side":"BUY"}}]}}"#
        ))
    }

    async fn drive(
        feed: Arc<FakeFeed>,
        params: SessionParams,
        parked: usize,
    ) -> (SessionStats, Vec<SessionState>, Vec<OrderBookRecord>) {
        let (tx, mut rx) = mpsc::channel(1_024);
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = SubscriptionSession::new(Instrument::token("1"), feed.clone(), params, tx);
        let handle = tokio::spawn(session.run_with_history(stop_rx));

        feed.wait_parked(parked).await;
        stop_tx.send(true).unwrap();
        let (stats, history) = handle.await.unwrap();

        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        (stats, history, records)
    }

    #[test]
    fn test_transition_graph() {
        use SessionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Subscribed));
        assert!(Subscribed.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Disconnected));
        assert!(Streaming.can_transition_to(Closed));

        assert!(!Disconnected.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Connecting));
        assert!(!Reconnecting.can_transition_to(Streaming));
        assert!(!Closed.can_transition_to(Connecting));

        let mut machine = SessionStateMachine::default();
        assert!(machine.transition(Subscribed).is_err());
        assert_eq!(machine.state(), Disconnected);
        machine.transition(Connecting).unwrap();
        machine.transition(Closed).unwrap();
        assert!(machine.transition(Disconnected).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_then_deltas() {
        let feed = Arc::new(FakeFeed::new(vec![vec![
            change("1", 5, 0.3, 1.0),
            book("1", 10, 0.4),
            change("1", 11, 0.45, 2.0),
            change("1", 12, 0.45, 0.0),
        ]]));
        let (stats, history, records) = drive(feed.clone(), params(60_000), 1).await;

        assert_eq!(stats.discarded_deltas, 1);
        assert_eq!(stats.snapshots, 1);
        assert_eq!(stats.deltas, 2);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, BookUpdateKind::Snapshot);
        assert_eq!(records[1].best_bid(), Some(0.45));
        assert_eq!(records[2].best_bid(), Some(0.4));

        use SessionState::*;
        assert_eq!(
            history,
            vec![Disconnected, Connecting, Subscribed, Streaming, Closed]
        );
        assert_eq!(feed.sent_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_stale_updates_are_dropped() {
        let feed = Arc::new(FakeFeed::new(vec![vec![
            book("1", 20, 0.4),
            change("1", 15, 0.45, 2.0),
            change("1", 25, 0.46, 2.0),
        ]]));
        let (stats, _, records) = drive(feed, params(60_000), 1).await;

        assert_eq!(stats.stale_dropped, 1);
        let stamps: Vec<i64> = records.iter().map(|r| r.captured_at_ms).collect();
        assert_eq!(stamps, vec![20, 25]);
    }

    #[tokio::test]
    async fn test_reconnect_after_server_close_resubscribes() {
        let feed = Arc::new(FakeFeed::new(vec![
            vec![book("1", 10, 0.4), Step::Close],
            vec![change("1", 15, 0.3, 1.0), book("1", 20, 0.41)],
        ]));
        let (stats, history, records) = drive(feed.clone(), params(60_000), 1).await;

        assert_eq!(stats.connects, 2);
        assert_eq!(stats.reconnects, 1);
        // the delta before the second snapshot is discarded
        assert_eq!(stats.discarded_deltas, 1);
        assert_eq!(records.len(), 2);
        assert_eq!(feed.sent_subscriptions(), 2);

        use SessionState::*;
        assert_eq!(
            history,
            vec![
                Disconnected, Connecting, Subscribed, Streaming, Reconnecting, Disconnected,
                Connecting, Subscribed, Streaming, Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_sequence_gap_triggers_resubscribe() {
        let feed = Arc::new(FakeFeed::new(vec![
            vec![book_seq("1", 10, 1), change_seq("1", 11, 2), change_seq("1", 12, 5)],
            vec![book_seq("1", 13, 9), change_seq("1", 14, 10)],
        ]));
        let (stats, _, records) = drive(feed, params(60_000), 1).await;

        assert_eq!(stats.sequence_gaps, 1);
        assert_eq!(stats.reconnects, 1);
        let seqs: Vec<Option<u64>> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![Some(1), Some(2), Some(9), Some(10)]);
    }

    #[tokio::test]
    async fn test_liveness_timeout_reconnects() {
        let feed = Arc::new(FakeFeed::new(vec![
            vec![book("1", 10, 0.4), Step::Silence],
            vec![book("1", 20, 0.4)],
        ]));
        let (stats, _, records) = drive(feed, params(200), 1).await;

        assert_eq!(stats.reconnects, 1);
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_failures_back_off_and_recover() {
        let feed = Arc::new(
            FakeFeed::new(vec![vec![book("1", 10, 0.4)]]).refuse_first(2),
        );
        let (stats, _, records) = drive(feed, params(60_000), 1).await;

        assert_eq!(stats.reconnects, 2);
        assert_eq!(stats.connects, 1);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_reconnects() {
        let feed = Arc::new(FakeFeed::new(vec![
            vec![book("1", 10, 0.4), Step::Frame("not json".to_string())],
            vec![book("1", 20, 0.4)],
        ]));
        let (stats, _, _) = drive(feed, params(60_000), 1).await;
        assert_eq!(stats.protocol_errors, 1);
        assert_eq!(stats.reconnects, 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_skipped_without_reconnect() {
        let feed = Arc::new(FakeFeed::new(vec![vec![
            Step::Frame(
                r#"[
                    {"event_type":"book","asset_id":"1","timestamp":"10","bids":[{"price":"0.4","size":"10"}],"asks":[]},
                    {"event_type":"price_change","timestamp":"11","price_changes":[{"asset_id":"1","price":"abc","size":"5","side":"BUY"}]}
                ]"#
                .to_string(),
            ),
            change("1", 12, 0.45, 2.0),
        ]]));
        let (stats, history, records) = drive(feed.clone(), params(60_000), 1).await;

        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.protocol_errors, 0);
        assert_eq!(stats.reconnects, 0);
        let stamps: Vec<i64> = records.iter().map(|r| r.captured_at_ms).collect();
        assert_eq!(stamps, vec![10, 12]);
        assert_eq!(records[1].best_bid(), Some(0.45));
        assert_eq!(feed.sent_subscriptions(), 1);

        use SessionState::*;
        assert_eq!(
            history,
            vec![Disconnected, Connecting, Subscribed, Streaming, Closed]
        );
    }

    #[tokio::test]
    async fn test_stream_end_without_close_reconnects() {
        let feed = Arc::new(FakeFeed::new(vec![
            vec![book("1", 10, 0.4), Step::End],
            vec![book("1", 20, 0.4)],
        ]));
        let (stats, _, records) = drive(feed.clone(), params(60_000), 1).await;

        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.connects, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(feed.sent_subscriptions(), 2);
    }

    #[tokio::test]
    async fn test_deadline_closes_session() {
        let feed = Arc::new(FakeFeed::new(vec![vec![book("1", 10, 0.4)]]));
        let (tx, _rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut p = params(60_000);
        p.deadline = Instant::now() + Duration::from_millis(50);
        let session = SubscriptionSession::new(Instrument::token("1"), feed, p, tx);

        let (stats, history) = session.run_with_history(stop_rx).await;
        assert_eq!(stats.records, 1);
        assert_eq!(history.last(), Some(&SessionState::Closed));
    }
}
