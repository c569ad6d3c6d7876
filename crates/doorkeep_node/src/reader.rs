#![forbid(unsafe_code)]

//! RFID polling loop.
//!
//! The loop owns the transceiver through a [`ReaderSession`], which releases
//! the hardware on every exit path. Each detected card is normalized to a
//! [`CardId`] and handed to a [`CardSubmitter`] exactly once; submission
//! failures are logged and not retried here.

use std::io::{self, BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use doorkeep_contracts::access::CardId;
use doorkeep_contracts::{ContractViolation, UnixTimeNs};

use crate::backoff::{Backoff, BackoffPolicy, BACKOFF_JITTER_RATIO_DEFAULT};

pub const READER_POLL_MS_DEFAULT: u64 = 100;
pub const READER_COOLDOWN_MS_DEFAULT: u64 = 1_000;
pub const READER_RETRY_MS_DEFAULT: u64 = 200;
pub const READER_RETRY_MAX_MS: u64 = 2_000;
pub const READER_SUBMIT_TIMEOUT_MS: u64 = 5_000;

const SHUTDOWN_CHECK_SLICE_MS: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("transceiver read failed: {0}")]
    Hardware(String),
    #[error("transceiver disconnected")]
    Disconnected,
    #[error("card uid rejected: {0}")]
    InvalidUid(#[from] ContractViolation),
    #[error("card submission failed: {0}")]
    Submit(String),
}

/// Minimal surface of an RFID transceiver driver.
pub trait RfidTransceiver {
    /// Whether a card is in the field right now. Must not block for long.
    fn detect_card(&mut self) -> Result<bool, ReaderError>;
    /// Raw UID bytes of the card that was just detected.
    fn read_uid(&mut self) -> Result<Vec<u8>, ReaderError>;
    /// Returns the hardware to a safe state. Called exactly once.
    fn release(&mut self);
}

/// Scoped ownership of a transceiver: released when dropped.
pub struct ReaderSession<T: RfidTransceiver> {
    transceiver: T,
}

impl<T: RfidTransceiver> ReaderSession<T> {
    pub fn acquire(transceiver: T) -> Self {
        Self { transceiver }
    }

    pub fn transceiver(&mut self) -> &mut T {
        &mut self.transceiver
    }
}

impl<T: RfidTransceiver> Drop for ReaderSession<T> {
    fn drop(&mut self) {
        self.transceiver.release();
        info!("rfid transceiver released");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub status: u16,
    pub decision: Option<String>,
}

pub trait CardSubmitter {
    fn submit(&self, card_id: &CardId) -> Result<SubmitReceipt, ReaderError>;
}

#[derive(Debug, Serialize)]
struct CardSubmission<'a> {
    card_uid: &'a str,
}

/// Posts `{"card_uid": ...}` to the node's intake endpoint.
pub struct HttpCardSubmitter {
    agent: ureq::Agent,
    intake_url: String,
}

impl HttpCardSubmitter {
    pub fn new(intake_url: impl Into<String>, timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms.max(100));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            agent,
            intake_url: intake_url.into(),
        }
    }
}

impl CardSubmitter for HttpCardSubmitter {
    fn submit(&self, card_id: &CardId) -> Result<SubmitReceipt, ReaderError> {
        let body = CardSubmission {
            card_uid: card_id.as_str(),
        };
        let response = match self.agent.post(&self.intake_url).send_json(&body) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(ReaderError::Submit(format!(
                    "intake returned http {status}: {}",
                    detail.trim()
                )));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(ReaderError::Submit(transport.to_string()))
            }
        };
        let status = response.status();
        let decision = response
            .into_json::<serde_json::Value>()
            .ok()
            .and_then(|v| v.get("decision").and_then(|d| d.as_str()).map(str::to_string));
        Ok(SubmitReceipt { status, decision })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    pub poll_ms: u64,
    pub cooldown_ms: u64,
    pub retry_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_ms: READER_POLL_MS_DEFAULT,
            cooldown_ms: READER_COOLDOWN_MS_DEFAULT,
            retry_ms: READER_RETRY_MS_DEFAULT,
        }
    }
}

/// What the loop should do after one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderStep {
    /// No card present.
    Idle,
    /// Hardware or decode error; wait the given delay before polling again.
    Retry(Duration),
    /// A card was submitted (successfully or not); debounce.
    Submitted { card_id: CardId, accepted: bool },
    /// The transceiver is gone; the loop must end.
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderSummary {
    pub polls: u64,
    pub submitted: u64,
    pub submit_failures: u64,
    pub read_errors: u64,
}

pub struct ReaderLoop<T: RfidTransceiver, S: CardSubmitter> {
    session: ReaderSession<T>,
    submitter: S,
    config: ReaderConfig,
    read_backoff: Backoff,
    summary: ReaderSummary,
}

impl<T: RfidTransceiver, S: CardSubmitter> ReaderLoop<T, S> {
    pub fn new(transceiver: T, submitter: S, config: ReaderConfig) -> Self {
        let retry_ms = config.retry_ms.max(1);
        Self {
            session: ReaderSession::acquire(transceiver),
            submitter,
            config,
            read_backoff: Backoff::new(BackoffPolicy::new(
                retry_ms,
                READER_RETRY_MAX_MS.max(retry_ms),
                BACKOFF_JITTER_RATIO_DEFAULT,
            )),
            summary: ReaderSummary::default(),
        }
    }

    pub fn summary(&self) -> ReaderSummary {
        self.summary
    }

    pub fn run_once(&mut self) -> ReaderStep {
        self.summary.polls += 1;
        match self.session.transceiver().detect_card() {
            Ok(false) => return ReaderStep::Idle,
            Ok(true) => {}
            Err(err) => return self.read_failed(err),
        }
        let uid = match self.session.transceiver().read_uid() {
            Ok(uid) => uid,
            Err(err) => return self.read_failed(err),
        };
        let card_id = match CardId::from_uid_bytes(&uid) {
            Ok(card_id) => card_id,
            Err(err) => return self.read_failed(ReaderError::InvalidUid(err)),
        };
        self.read_backoff.record_success();
        debug!(card_id = %card_id, "card read");

        let accepted = match self.submitter.submit(&card_id) {
            Ok(receipt) => {
                self.summary.submitted += 1;
                info!(
                    card_id = %card_id,
                    status = receipt.status,
                    decision = receipt.decision.as_deref().unwrap_or("unknown"),
                    "card submitted"
                );
                true
            }
            Err(err) => {
                self.summary.submit_failures += 1;
                warn!(card_id = %card_id, error = %err, "card submission failed");
                false
            }
        };
        ReaderStep::Submitted { card_id, accepted }
    }

    fn read_failed(&mut self, err: ReaderError) -> ReaderStep {
        if matches!(err, ReaderError::Disconnected) {
            warn!("rfid transceiver disconnected");
            return ReaderStep::Stop;
        }
        self.summary.read_errors += 1;
        let delay_ms = self.read_backoff.record_failure(UnixTimeNs::now());
        warn!(error = %err, retry_in_ms = delay_ms, "rfid read error");
        ReaderStep::Retry(Duration::from_millis(delay_ms))
    }

    /// Delay to wait after `step`, or `None` when the loop should end.
    pub fn delay_after(&self, step: &ReaderStep) -> Option<Duration> {
        match step {
            ReaderStep::Idle => Some(Duration::from_millis(self.config.poll_ms)),
            ReaderStep::Retry(delay) => Some(*delay),
            ReaderStep::Submitted { .. } => Some(Duration::from_millis(self.config.cooldown_ms)),
            ReaderStep::Stop => None,
        }
    }

    /// Polls until `shutdown` is set or the transceiver disconnects. The
    /// transceiver is released before this returns.
    pub fn run(mut self, shutdown: &AtomicBool) -> ReaderSummary {
        info!(
            poll_ms = self.config.poll_ms,
            cooldown_ms = self.config.cooldown_ms,
            "rfid reader loop started"
        );
        while !shutdown.load(Ordering::SeqCst) {
            let step = self.run_once();
            let Some(delay) = self.delay_after(&step) else {
                break;
            };
            sleep_unless_shutdown(delay, shutdown);
        }
        let summary = self.summary;
        info!(
            polls = summary.polls,
            submitted = summary.submitted,
            submit_failures = summary.submit_failures,
            read_errors = summary.read_errors,
            "rfid reader loop stopped"
        );
        summary
    }
}

fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(SHUTDOWN_CHECK_SLICE_MS)));
    }
}

/// Parses one line of UID bytes: decimal or `0x` hex tokens separated by
/// whitespace, commas, colons or dashes.
pub fn parse_uid_line(line: &str) -> Result<Vec<u8>, String> {
    let tokens: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | ':' | '-'))
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return Err("empty uid line".to_string());
    }
    tokens
        .into_iter()
        .map(|token| {
            let parsed = match token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
            {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => token.parse::<u8>(),
            };
            parsed.map_err(|_| format!("invalid uid byte {token:?}"))
        })
        .collect()
}

enum LineEvent {
    Uid(Result<Vec<u8>, String>),
    Closed,
}

/// Transceiver fed by a line-oriented source (serial bridge, pipe, stdin).
/// A background thread does the blocking reads so polling never stalls.
pub struct LineTransceiver {
    events: Receiver<LineEvent>,
    pending: Option<Result<Vec<u8>, String>>,
    closed: bool,
}

impl LineTransceiver {
    pub fn spawn<R>(source: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in source.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        let _ = tx.send(LineEvent::Uid(Err(format!("source read error: {err}"))));
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(LineEvent::Uid(parse_uid_line(&line))).is_err() {
                    return;
                }
            }
            let _ = tx.send(LineEvent::Closed);
        });
        Self {
            events: rx,
            pending: None,
            closed: false,
        }
    }

    /// Opens `path`, or stdin when `path` is `-`.
    pub fn open(path: &str) -> io::Result<Self> {
        if path == "-" {
            return Ok(Self::spawn(BufReader::new(io::stdin())));
        }
        let file = std::fs::File::open(path)?;
        Ok(Self::spawn(BufReader::new(file)))
    }
}

impl RfidTransceiver for LineTransceiver {
    fn detect_card(&mut self) -> Result<bool, ReaderError> {
        if self.pending.is_some() {
            return Ok(true);
        }
        if self.closed {
            return Err(ReaderError::Disconnected);
        }
        match self.events.try_recv() {
            Ok(LineEvent::Uid(uid)) => {
                self.pending = Some(uid);
                Ok(true)
            }
            Ok(LineEvent::Closed) | Err(TryRecvError::Disconnected) => {
                self.closed = true;
                Err(ReaderError::Disconnected)
            }
            Err(TryRecvError::Empty) => Ok(false),
        }
    }

    fn read_uid(&mut self) -> Result<Vec<u8>, ReaderError> {
        match self.pending.take() {
            Some(Ok(uid)) => Ok(uid),
            Some(Err(reason)) => Err(ReaderError::Hardware(reason)),
            None => Err(ReaderError::Hardware("no card in field".to_string())),
        }
    }

    fn release(&mut self) {
        self.pending = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::rc::Rc;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    enum Poll {
        Empty,
        Card(Vec<u8>),
        ReadError,
        Gone,
    }

    struct ScriptedTransceiver {
        script: VecDeque<Poll>,
        current: Option<Poll>,
        released: Rc<RefCell<u32>>,
    }

    impl ScriptedTransceiver {
        fn new(script: Vec<Poll>, released: Rc<RefCell<u32>>) -> Self {
            Self {
                script: script.into(),
                current: None,
                released,
            }
        }
    }

    impl RfidTransceiver for ScriptedTransceiver {
        fn detect_card(&mut self) -> Result<bool, ReaderError> {
            match self.script.pop_front().unwrap_or(Poll::Gone) {
                Poll::Empty => Ok(false),
                Poll::Gone => Err(ReaderError::Disconnected),
                other => {
                    self.current = Some(other);
                    Ok(true)
                }
            }
        }

        fn read_uid(&mut self) -> Result<Vec<u8>, ReaderError> {
            match self.current.take() {
                Some(Poll::Card(uid)) => Ok(uid),
                _ => Err(ReaderError::Hardware("anticollision failed".to_string())),
            }
        }

        fn release(&mut self) {
            *self.released.borrow_mut() += 1;
        }
    }

    #[derive(Default)]
    struct RecordingSubmitter {
        submitted: RefCell<Vec<String>>,
        fail: bool,
    }

    impl CardSubmitter for RecordingSubmitter {
        fn submit(&self, card_id: &CardId) -> Result<SubmitReceipt, ReaderError> {
            self.submitted.borrow_mut().push(card_id.as_str().to_string());
            if self.fail {
                return Err(ReaderError::Submit("connection refused".to_string()));
            }
            Ok(SubmitReceipt {
                status: 200,
                decision: Some("admitted".to_string()),
            })
        }
    }

    impl CardSubmitter for &RecordingSubmitter {
        fn submit(&self, card_id: &CardId) -> Result<SubmitReceipt, ReaderError> {
            (**self).submit(card_id)
        }
    }

    fn fast_config() -> ReaderConfig {
        ReaderConfig {
            poll_ms: 1,
            cooldown_ms: 1,
            retry_ms: 1,
        }
    }

    #[test]
    fn at_reader_01_steps_follow_hardware_state() {
        let released = Rc::new(RefCell::new(0));
        let submitter = RecordingSubmitter::default();
        let transceiver = ScriptedTransceiver::new(
            vec![Poll::Empty, Poll::ReadError, Poll::Card(vec![12, 34, 56, 78]), Poll::Gone],
            released.clone(),
        );
        let mut reader = ReaderLoop::new(transceiver, &submitter, ReaderConfig::default());

        assert_eq!(reader.run_once(), ReaderStep::Idle);
        assert_eq!(
            reader.delay_after(&ReaderStep::Idle),
            Some(Duration::from_millis(READER_POLL_MS_DEFAULT))
        );

        let step = reader.run_once();
        let ReaderStep::Retry(delay) = &step else {
            panic!("expected retry, got {step:?}");
        };
        assert!(*delay <= Duration::from_millis(READER_RETRY_MAX_MS));

        let step = reader.run_once();
        assert_eq!(
            step,
            ReaderStep::Submitted {
                card_id: CardId::new("12-34-56-78").unwrap(),
                accepted: true
            }
        );
        assert_eq!(
            reader.delay_after(&step),
            Some(Duration::from_millis(READER_COOLDOWN_MS_DEFAULT))
        );

        assert_eq!(reader.run_once(), ReaderStep::Stop);
        assert_eq!(reader.delay_after(&ReaderStep::Stop), None);
        assert_eq!(*submitter.submitted.borrow(), vec!["12-34-56-78".to_string()]);

        drop(reader);
        assert_eq!(*released.borrow(), 1);
    }

    #[test]
    fn at_reader_02_submission_failure_is_not_retried() {
        let released = Rc::new(RefCell::new(0));
        let submitter = RecordingSubmitter {
            fail: true,
            ..RecordingSubmitter::default()
        };
        let transceiver = ScriptedTransceiver::new(
            vec![Poll::Card(vec![1, 2]), Poll::Empty, Poll::Gone],
            released.clone(),
        );
        let reader = ReaderLoop::new(transceiver, &submitter, fast_config());
        let shutdown = AtomicBool::new(false);

        let summary = reader.run(&shutdown);
        assert_eq!(summary.submit_failures, 1);
        assert_eq!(summary.submitted, 0);
        assert_eq!(submitter.submitted.borrow().len(), 1);
        assert_eq!(*released.borrow(), 1);
    }

    #[test]
    fn at_reader_03_shutdown_flag_stops_loop_and_releases() {
        let released = Rc::new(RefCell::new(0));
        let submitter = RecordingSubmitter::default();
        let transceiver =
            ScriptedTransceiver::new(vec![Poll::Empty; 1_000], released.clone());
        let reader = ReaderLoop::new(transceiver, &submitter, fast_config());
        let shutdown = AtomicBool::new(true);

        let summary = reader.run(&shutdown);
        assert_eq!(summary.polls, 0);
        assert_eq!(*released.borrow(), 1);
    }

    #[test]
    fn at_reader_04_uid_lines_parse_decimal_and_hex() {
        assert_eq!(parse_uid_line("12 34 56 78").unwrap(), vec![12, 34, 56, 78]);
        assert_eq!(parse_uid_line("0x04,0xA3,0x1b").unwrap(), vec![4, 163, 27]);
        assert_eq!(parse_uid_line("12-34").unwrap(), vec![12, 34]);
        assert!(parse_uid_line("256").is_err());
        assert!(parse_uid_line("zz").is_err());
        assert!(parse_uid_line("  ").is_err());
    }

    #[test]
    fn at_reader_05_line_transceiver_feeds_loop_until_eof() {
        let source = Cursor::new("12 34 56 78\n\nnot-a-uid\n1 2\n");
        let transceiver = LineTransceiver::spawn(source);
        let submitter = RecordingSubmitter::default();
        let reader = ReaderLoop::new(transceiver, &submitter, fast_config());
        let shutdown = Arc::new(AtomicBool::new(false));

        let summary = reader.run(&shutdown);
        assert_eq!(summary.submitted, 2);
        assert_eq!(summary.read_errors, 1);
        assert_eq!(
            *submitter.submitted.borrow(),
            vec!["12-34-56-78".to_string(), "1-2".to_string()]
        );
    }
}
