//! Session controller: request the full stream, then heal gaps with
//! single-packet resend rounds until the store is complete.
//!
//! Rounds run strictly one after another. Each round opens a fresh stream,
//! writes one request and drains the response until the server closes it.
//! Malformed frames are logged and counted but otherwise treated as lost;
//! the gap check picks them up like any other missing sequence.
//!
//! Resend passes are bounded by [`SessionConfig::max_resend_passes`], with
//! exponential backoff between passes.
use std::io::{self, Read, Write};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{SessionError, TransportError};
use crate::frame::FrameDecoder;
use crate::integrity;
use crate::packet::Frame;
use crate::protocol::Request;
use crate::record::{Recorder, RoundKind};
use crate::sink::PacketSink;
use crate::store::{Ingested, PacketStore};
use crate::transport::Connector;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sweeps over the gap list before giving up. 0 fails on the first gap.
    pub max_resend_passes: u32,
    /// Delay before the second pass; doubles for each later pass.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Largest gap list a pass may work through, one connection per gap. A
    /// bigger list fails the session before any resend is sent.
    pub max_gaps_per_pass: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_resend_passes: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_gaps_per_pass: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Requesting,
    StreamingInitial,
    ClosedGapsFound,
    ResendRound(i32),
    ClosedComplete,
    Exported,
    Failed,
}

/// Counters describing a finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub packets: usize,
    pub frames_received: u64,
    /// Frames dropped because they failed validation.
    pub discarded: u64,
    /// Valid frames whose sequence was already stored.
    pub duplicates: u64,
    pub partial_bytes_dropped: u64,
    pub resend_passes: u32,
    pub resend_rounds: u32,
    pub abandoned_rounds: u32,
}

pub struct Session<C: Connector> {
    connector: C,
    config: SessionConfig,
    store: PacketStore,
    state: SessionState,
    report: SessionReport,
    recorder: Option<Recorder>,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            store: PacketStore::new(),
            state: SessionState::Connecting,
            report: SessionReport::default(),
            recorder: None,
        }
    }

    /// Record every raw frame received to a capture file.
    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store(&self) -> &PacketStore {
        &self.store
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    pub fn take_recorder(&mut self) -> Option<Recorder> {
        self.recorder.take()
    }

    /// Drive the session to completion and hand the sorted packets to `sink`.
    ///
    /// Nothing reaches the sink unless the final integrity check passes.
    pub fn run<S: PacketSink>(&mut self, sink: &mut S) -> Result<SessionReport, SessionError> {
        match self.drive(sink) {
            Ok(()) => Ok(self.report.clone()),
            Err(e) => {
                self.set_state(SessionState::Failed);
                error!(reason = e.reason_code(), error = %e, "session failed");
                Err(e)
            }
        }
    }

    fn drive<S: PacketSink>(&mut self, sink: &mut S) -> Result<(), SessionError> {
        let endpoint = self.connector.endpoint();
        info!(%endpoint, "requesting full stream");
        self.stream_round(Request::StreamAll)?;
        info!(
            stored = self.store.len(),
            max_seq = self.store.max_sequence(),
            "initial stream closed"
        );

        loop {
            // A single corrupt but positive sequence can claim billions of gaps;
            // check the count before building the list.
            let gaps = self.store.gap_count();
            if gaps == 0 {
                break;
            }
            self.set_state(SessionState::ClosedGapsFound);
            if gaps > self.config.max_gaps_per_pass {
                let limit = self.config.max_gaps_per_pass;
                return Err(SessionError::TooManyGaps { gaps, limit });
            }
            let missing = self.store.missing_sequences();
            info!(count = missing.len(), first = missing[0], "gaps found");

            let passes = self.report.resend_passes;
            if passes >= self.config.max_resend_passes {
                return Err(SessionError::StillMissing { missing, passes });
            }
            if passes > 0 {
                let delay = self.backoff_delay(passes);
                debug!(?delay, pass = passes + 1, "backing off before resend pass");
                std::thread::sleep(delay);
            }
            self.report.resend_passes += 1;

            for seq in missing {
                // An earlier response in this pass may already have filled it.
                if self.store.contains(seq) {
                    continue;
                }
                self.report.resend_rounds += 1;
                if let Err(e) = self.stream_round(Request::Resend(seq)) {
                    self.report.abandoned_rounds += 1;
                    warn!(
                        seq,
                        error = %e,
                        cause = ?std::error::Error::source(&e),
                        "resend round abandoned"
                    );
                }
            }
        }

        self.set_state(SessionState::ClosedComplete);
        let packets = self.store.export_sorted();
        integrity::verify(&packets)?;
        info!(count = packets.len(), "integrity check passed");
        sink.write_packets(&packets)?;
        self.report.packets = packets.len();
        self.set_state(SessionState::Exported);
        Ok(())
    }

    /// One request/response cycle on a fresh stream.
    fn stream_round(&mut self, request: Request) -> Result<(), TransportError> {
        let (round, initial) = match request {
            Request::StreamAll => {
                self.set_state(SessionState::Connecting);
                (RoundKind::Initial, true)
            }
            Request::Resend(seq) => {
                self.set_state(SessionState::ResendRound(seq));
                (RoundKind::Resend { target: seq }, false)
            }
        };
        let endpoint = self.connector.endpoint();
        let mut stream = self
            .connector
            .connect()
            .map_err(|source| TransportError::Connect { endpoint: endpoint.clone(), source })?;

        if initial {
            self.set_state(SessionState::Requesting);
        }
        stream
            .write_all(&request.encode())
            .and_then(|_| stream.flush())
            .map_err(|source| TransportError::Write { endpoint: endpoint.clone(), source })?;
        if initial {
            self.set_state(SessionState::StreamingInitial);
        }

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => return Err(TransportError::Read { endpoint, source }),
            };
            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.next_frame() {
                self.accept_frame(round, &frame);
            }
        }

        let leftover = decoder.finish();
        if leftover > 0 {
            debug!(bytes = leftover, "partial frame dropped at end of stream");
            self.report.partial_bytes_dropped += leftover as u64;
        }
        Ok(())
    }

    fn accept_frame(&mut self, round: RoundKind, frame: &Frame) {
        self.report.frames_received += 1;
        if let Some(rec) = self.recorder.as_mut() {
            rec.record(round, frame);
        }
        match self.store.ingest(frame) {
            Ingested::Stored(p) => debug!(seq = p.sequence(), "packet stored"),
            Ingested::Duplicate(p) => {
                self.report.duplicates += 1;
                debug!(seq = p.sequence(), "duplicate packet ignored");
            }
            Ingested::Malformed(e) => {
                self.report.discarded += 1;
                warn!(field = %e.field, value = %e.value, ?round, "discarding malformed packet");
            }
        }
    }

    fn backoff_delay(&self, completed_passes: u32) -> Duration {
        let factor = 1u32.checked_shl(completed_passes.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config.initial_backoff.saturating_mul(factor).min(self.config.max_backoff)
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IntegrityViolation;
    use crate::packet::{encode_frame, Packet};
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::rc::Rc;

    /// In-process stand-in for the feed server.
    #[derive(Default)]
    struct Feed {
        max_seq: i32,
        drop_initial: HashSet<i32>,
        corrupt_initial: HashSet<i32>,
        duplicate_initial: HashSet<i32>,
        never_resend: HashSet<i32>,
        refuse_connections: HashSet<usize>,
        trailing_garbage: usize,
        /// Raw frames appended to the full stream after the numbered ones.
        extra_initial: Vec<Frame>,
        connections: usize,
        requests: Vec<[u8; 2]>,
    }

    impl Feed {
        fn frame(seq: i32) -> Frame {
            let side = if seq % 2 == 0 { b'S' } else { b'B' };
            encode_frame(b"AAPL", side, 10 * seq, 1_000 + seq, seq)
        }

        fn respond(&mut self, req: [u8; 2]) -> Vec<u8> {
            self.requests.push(req);
            let mut out = Vec::new();
            match req[0] {
                1 => {
                    for seq in 1..=self.max_seq {
                        if self.drop_initial.contains(&seq) {
                            continue;
                        }
                        if self.corrupt_initial.contains(&seq) {
                            out.extend_from_slice(&encode_frame(b"ZZZZ", b'B', 1, 1, seq));
                            continue;
                        }
                        out.extend_from_slice(&Self::frame(seq));
                        if self.duplicate_initial.contains(&seq) {
                            out.extend_from_slice(&Self::frame(seq));
                        }
                    }
                    for frame in &self.extra_initial {
                        out.extend_from_slice(frame);
                    }
                    out.extend(std::iter::repeat(0xAB).take(self.trailing_garbage));
                }
                2 => {
                    let seq = req[1] as i32;
                    if (1..=self.max_seq).contains(&seq) && !self.never_resend.contains(&seq) {
                        out.extend_from_slice(&Self::frame(seq));
                    }
                }
                _ => {}
            }
            out
        }
    }

    struct MockStream {
        feed: Rc<RefCell<Feed>>,
        written: Vec<u8>,
        response: Option<Cursor<Vec<u8>>>,
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.response.is_none() {
                let mut req = [0u8; 2];
                req.copy_from_slice(&self.written[..2]);
                self.response = Some(Cursor::new(self.feed.borrow_mut().respond(req)));
            }
            // Small reads so frames straddle chunk boundaries.
            let limit = buf.len().min(5);
            self.response.as_mut().map_or(Ok(0), |r| r.read(&mut buf[..limit]))
        }
    }

    struct MockConnector(Rc<RefCell<Feed>>);

    impl Connector for MockConnector {
        type Stream = MockStream;

        fn endpoint(&self) -> String {
            "mock:3000".into()
        }

        fn connect(&mut self) -> io::Result<MockStream> {
            let mut feed = self.0.borrow_mut();
            let idx = feed.connections;
            feed.connections += 1;
            if feed.refuse_connections.contains(&idx) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            Ok(MockStream { feed: self.0.clone(), written: Vec::new(), response: None })
        }
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            max_resend_passes: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn session(feed: Feed) -> (Session<MockConnector>, Rc<RefCell<Feed>>) {
        session_with(feed, quick_config())
    }

    fn session_with(
        feed: Feed,
        config: SessionConfig,
    ) -> (Session<MockConnector>, Rc<RefCell<Feed>>) {
        let feed = Rc::new(RefCell::new(feed));
        (Session::new(MockConnector(feed.clone()), config), feed)
    }

    fn seqs(packets: &[Packet]) -> Vec<i32> {
        packets.iter().map(|p| p.sequence()).collect()
    }

    #[test]
    fn lossless_stream_completes_in_one_round() {
        let (mut s, feed) = session(Feed { max_seq: 4, ..Default::default() });
        let mut out = Vec::new();
        let report = s.run(&mut out).unwrap();
        assert_eq!(seqs(&out), vec![1, 2, 3, 4]);
        assert_eq!(report.packets, 4);
        assert_eq!(report.resend_rounds, 0);
        assert_eq!(s.state(), SessionState::Exported);
        assert_eq!(feed.borrow().requests, vec![[1, 0]]);
    }

    #[test]
    fn dropped_packet_is_resent() {
        let (mut s, feed) =
            session(Feed { max_seq: 4, drop_initial: [3].into(), ..Default::default() });
        let mut out = Vec::new();
        let report = s.run(&mut out).unwrap();
        assert_eq!(seqs(&out), vec![1, 2, 3, 4]);
        assert_eq!(report.resend_passes, 1);
        assert_eq!(report.resend_rounds, 1);
        assert_eq!(feed.borrow().requests, vec![[1, 0], [2, 3]]);
    }

    #[test]
    fn malformed_packet_is_discarded_then_resent() {
        let (mut s, feed) =
            session(Feed { max_seq: 4, corrupt_initial: [2].into(), ..Default::default() });
        let mut out = Vec::new();
        let report = s.run(&mut out).unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(seqs(&out), vec![1, 2, 3, 4]);
        assert_eq!(feed.borrow().requests, vec![[1, 0], [2, 2]]);
    }

    #[test]
    fn duplicates_and_partial_tail_are_absorbed() {
        let (mut s, _) = session(Feed {
            max_seq: 3,
            duplicate_initial: [2].into(),
            trailing_garbage: 9,
            ..Default::default()
        });
        let mut out = Vec::new();
        let report = s.run(&mut out).unwrap();
        assert_eq!(seqs(&out), vec![1, 2, 3]);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.frames_received, 4);
        assert_eq!(report.partial_bytes_dropped, 9);
    }

    #[test]
    fn unrecoverable_gap_fails_after_pass_budget() {
        let (mut s, feed) = session(Feed {
            max_seq: 4,
            drop_initial: [3].into(),
            never_resend: [3].into(),
            ..Default::default()
        });
        let mut out = Vec::new();
        let err = s.run(&mut out).unwrap_err();
        match err {
            SessionError::StillMissing { missing, passes } => {
                assert_eq!(missing, vec![3]);
                assert_eq!(passes, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(out.is_empty());
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(feed.borrow().requests.len(), 1 + 3);
    }

    #[test]
    fn zero_pass_budget_fails_on_first_gap() {
        let config = SessionConfig { max_resend_passes: 0, ..quick_config() };
        let feed = Feed { max_seq: 4, drop_initial: [2].into(), ..Default::default() };
        let (mut s, feed) = session_with(feed, config);
        let mut out = Vec::new();
        match s.run(&mut out).unwrap_err() {
            SessionError::StillMissing { missing, passes } => {
                assert_eq!(missing, vec![2]);
                assert_eq!(passes, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(out.is_empty());
        assert_eq!(feed.borrow().requests, vec![[1, 0]]);
    }

    #[test]
    fn gap_above_255_never_heals() {
        // Resend of 300 goes out as 44; the server answers with packet 44,
        // which is already stored, so the pass budget ends the session.
        let (mut s, feed) =
            session(Feed { max_seq: 301, drop_initial: [300].into(), ..Default::default() });
        let mut out = Vec::new();
        match s.run(&mut out).unwrap_err() {
            SessionError::StillMissing { missing, passes } => {
                assert_eq!(missing, vec![300]);
                assert_eq!(passes, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(out.is_empty());
        assert_eq!(feed.borrow().requests, vec![[1, 0], [2, 44], [2, 44], [2, 44]]);
        assert_eq!(s.report().duplicates, 3);
    }

    #[test]
    fn huge_sequence_fails_before_any_resend() {
        let (mut s, feed) = session(Feed {
            max_seq: 3,
            extra_initial: vec![encode_frame(b"AAPL", b'B', 1, 1, i32::MAX)],
            ..Default::default()
        });
        let mut out = Vec::new();
        match s.run(&mut out).unwrap_err() {
            SessionError::TooManyGaps { gaps, limit } => {
                assert_eq!(gaps, i32::MAX as usize - 4);
                assert_eq!(limit, 1024);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(s.state(), SessionState::Failed);
        assert!(out.is_empty());
        assert_eq!(feed.borrow().requests, vec![[1, 0]]);
    }

    #[test]
    fn initial_connect_failure_is_fatal() {
        let (mut s, _) =
            session(Feed { max_seq: 4, refuse_connections: [0].into(), ..Default::default() });
        let mut out = Vec::new();
        let err = s.run(&mut out).unwrap_err();
        assert_eq!(err.reason_code(), "transport");
        assert_eq!(s.state(), SessionState::Failed);
        assert!(out.is_empty());
    }

    #[test]
    fn failed_resend_round_is_retried_next_pass() {
        let (mut s, _) = session(Feed {
            max_seq: 5,
            drop_initial: [2, 4].into(),
            refuse_connections: [1].into(),
            ..Default::default()
        });
        let mut out = Vec::new();
        let report = s.run(&mut out).unwrap();
        assert_eq!(seqs(&out), vec![1, 2, 3, 4, 5]);
        assert_eq!(report.abandoned_rounds, 1);
        assert_eq!(report.resend_passes, 2);
        assert_eq!(report.resend_rounds, 3);
    }

    #[test]
    fn export_failure_is_reported() {
        struct Broken;
        impl PacketSink for Broken {
            fn write_packets(&mut self, _: &[Packet]) -> Result<(), crate::error::ExportError> {
                Err(io::Error::other("disk full").into())
            }
        }
        let (mut s, _) = session(Feed { max_seq: 2, ..Default::default() });
        let err = s.run(&mut Broken).unwrap_err();
        assert_eq!(err.reason_code(), "export");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = SessionConfig {
            max_resend_passes: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        let feed = Rc::new(RefCell::new(Feed::default()));
        let s = Session::new(MockConnector(feed), config);
        assert_eq!(s.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(s.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(s.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(s.backoff_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn empty_stream_exports_nothing() {
        let (mut s, _) = session(Feed::default());
        let mut out = Vec::new();
        let report = s.run(&mut out).unwrap();
        assert_eq!(report.packets, 0);
        assert!(out.is_empty());
        // Integrity agrees that an empty set is complete.
        assert_eq!(integrity::verify(&out), Ok::<(), IntegrityViolation>(()));
    }
}
