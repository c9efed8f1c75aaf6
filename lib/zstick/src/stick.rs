use crate::bridge::{AckBridge, WaitOutcome};
use crate::cc::{manufacturer, security};
use crate::config::{ConfigStore, EngineConfig, NetworkKey};
use crate::frame::{self, FrameType, InboundFrame};
use crate::message::{OutboundMessage, Priority};
use crate::nonce::NonceCache;
use crate::port::{SerialLink, SystemPort};
use crate::queue::{InboundQueue, OutboundQueue};
use crate::shared::{ErrorType, LinkError, LinkResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use zcore::crypto::SecureKeys;
use zcore::time;
use zcore::logging::{debug, error, info, Logger, Trace, TraceLevel};
use zcore::{cls, func, learn, NodeId, NAK, NODE_BROADCAST};

// Reference size for the cancel queue usage percentage. The queue itself
// is unbounded; in practice it holds one or two entries.
const CAN_QUEUE_REF: usize = 32;

/// The transmit state machine. Exactly one outbound message is current at
/// any time; every other one queues.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum IoState {
    Idle,
    WaitPingAck,
    WaitPingTransAck,
    WaitNonceAck,
    WaitNonceTransAck,
    WaitNonce,
    SendEncrypted,
    WaitAck,
    WaitCallback,
}

impl IoState {
    fn name(self) -> &'static str {
        match self {
            IoState::Idle => "Idle",
            IoState::WaitPingAck => "WaitPingAck",
            IoState::WaitPingTransAck => "WaitPingTransAck",
            IoState::WaitNonceAck => "WaitNonceAck",
            IoState::WaitNonceTransAck => "WaitNonceTransAck",
            IoState::WaitNonce => "WaitNonce",
            IoState::SendEncrypted => "SendEncrypted",
            IoState::WaitAck => "WaitAck",
            IoState::WaitCallback => "WaitCallback",
        }
    }
}

/// Which of the three message slots the state machine is driving.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Slot {
    Cur,
    Ping,
    NonceReq,
}

/// State shared between the driver-facing handle and the I/O thread. The
/// queues and the bridge lock internally; everything else is atomics.
pub(crate) struct EngineShared {
    pub(crate) out_queue: OutboundQueue,
    pub(crate) in_queue: InboundQueue,
    pub(crate) bridge: AckBridge,
    pub(crate) shutdown: AtomicBool,
    pub(crate) connected: AtomicBool,
    pub(crate) can_used: AtomicUsize,
    pub(crate) man_ids: AtomicU64,
    pub(crate) ctrl_id: AtomicU8,
}

impl EngineShared {
    fn new(cfg: &EngineConfig, trace: Trace) -> EngineShared {
        EngineShared {
            out_queue: OutboundQueue::new(cfg.out_queue_bound, trace),
            in_queue: InboundQueue::new(cfg.in_queue_bound),
            bridge: AckBridge::new(),
            shutdown: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            can_used: AtomicUsize::new(0),
            man_ids: AtomicU64::new(0),
            ctrl_id: AtomicU8::new(1),
        }
    }
}

/// The driver-facing handle for the Z-Wave stick. Owns the I/O thread;
/// the driver thread only ever touches the queues, the ack bridge and a
/// few atomics.
pub struct Stick {
    shared: Arc<EngineShared>,
    store: Arc<Mutex<Box<dyn ConfigStore>>>,
    cfg: EngineConfig,
    trace: Trace,
    log: Logger,
    thread: Option<JoinHandle<()>>,
}

impl Stick {
    pub fn new(cfg: EngineConfig, store: Box<dyn ConfigStore>, log: Logger) -> Stick {
        let trace = Trace::new(log.clone(), TraceLevel::Low);
        Stick {
            shared: Arc::new(EngineShared::new(&cfg, trace.clone())),
            store: Arc::new(Mutex::new(store)),
            cfg,
            trace,
            log,
            thread: None,
        }
    }

    /// Opens the serial port with explicit line settings.
    pub fn open_with(&mut self, path: &str, port_cfg: crate::config::PortConfig) -> LinkResult<()> {
        self.cfg.port = port_cfg;
        self.open(path)
    }

    /// Opens the serial port and starts the I/O thread. Any previous
    /// session is shut down first.
    pub fn open(&mut self, path: &str) -> LinkResult<()> {
        if self.thread.is_some() {
            self.close();
        }

        self.shared.out_queue.clear();
        self.shared.in_queue.clear();
        self.shared.can_used.store(0, Ordering::Relaxed);
        self.shared.shutdown.store(false, Ordering::Relaxed);

        let mut port = SystemPort::open(path, &self.cfg.port)?;

        // A solitary NAK both confirms the port writes and resyncs the
        // stick's frame parser
        port.write_all(&[NAK], Duration::from_millis(100))?;

        let key = self
            .store
            .lock()
            .expect("Config store poisoned")
            .load_network_key()
            .map_err(LinkError::from)?;
        let keys = SecureKeys::derive(&key);

        let mut io = Io::new(
            self.shared.clone(),
            Box::new(port),
            self.cfg.clone(),
            self.store.clone(),
            keys,
            self.trace.clone(),
        );

        self.shared.connected.store(true, Ordering::Relaxed);
        self.thread = Some(
            thread::Builder::new()
                .name("zw-io".to_string())
                .spawn(move || io.run())
                .expect("I/O thread spawn failed"),
        );

        info!(self.log, "stick opened"; "port" => path);
        Ok(())
    }

    /// Requests I/O thread shutdown and waits for it. The serial port is
    /// closed last, when the thread drops it.
    pub fn close(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            drop(handle.join());
        }
        self.shared.connected.store(false, Ordering::Relaxed);
        info!(self.log, "stick closed");
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Queues a message for transmission and returns its ack id for a
    /// later `wait_ack`.
    pub fn enqueue(&self, msg: OutboundMessage) -> u32 {
        let ack_id = msg.ack_id();
        self.shared.out_queue.enqueue(msg);
        ack_id
    }

    /// Queues a message and blocks until it reaches a terminal state or
    /// the timeout elapses.
    pub fn send_sync(&self, msg: OutboundMessage, timeout: Duration) -> WaitOutcome {
        let ack_id = self.enqueue(msg);
        self.wait_ack(ack_id, timeout)
    }

    /// Blocks until the engine reports a terminal state for the given ack
    /// id. Single waiter by contract.
    pub fn wait_ack(&self, ack_id: u32, timeout: Duration) -> WaitOutcome {
        self.shared.bridge.wait(ack_id, timeout, &self.shared.shutdown)
    }

    /// The next inbound frame for the upper layer, in arrival order.
    pub fn next_inbound(&self, timeout: Duration) -> Option<InboundFrame> {
        self.shared.in_queue.pop(timeout)
    }

    pub fn set_trace_level(&self, level: TraceLevel) {
        self.trace.set_level(level);
    }

    pub fn flush_trace(&self) {
        self.trace.flush();
    }

    pub fn reset_trace(&self) {
        self.trace.reset();
    }

    /// Controller identity used to synthesise manufacturer specific
    /// reports.
    pub fn set_manufacturer_ids(&self, man_ids: u64) {
        self.shared.man_ids.store(man_ids, Ordering::Relaxed);
    }

    /// Our own node id, learned from the controller info query. The secure
    /// envelope authenticates the receiver by it.
    pub fn set_ctrl_id(&self, ctrl_id: NodeId) {
        self.shared.ctrl_id.store(ctrl_id, Ordering::Relaxed);
    }

    pub fn out_queue_pct(&self) -> usize {
        self.shared.out_queue.used_pct()
    }

    pub fn can_queue_pct(&self) -> usize {
        (self.shared.can_used.load(Ordering::Relaxed) * 100 / CAN_QUEUE_REF).min(100)
    }
}

impl Drop for Stick {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close();
        }
    }
}

/// The I/O thread: sole owner of the serial link, the cancel queue, the
/// nonce caches and the state machine.
struct Io {
    shared: Arc<EngineShared>,
    link: Box<dyn SerialLink>,
    cfg: EngineConfig,
    store: Arc<Mutex<Box<dyn ConfigStore>>>,
    keys: SecureKeys,
    trace: Trace,

    state: IoState,
    cur: Option<OutboundMessage>,
    ping: Option<OutboundMessage>,
    nonce_req: Option<OutboundMessage>,

    nonces: NonceCache,
    can_queue: VecDeque<InboundFrame>,
    last_ping: [Option<Instant>; 256],

    // Earliest instant the next wire write may happen, and when the last
    // one did (drives the per-state timeouts)
    next_send: Instant,
    last_sent: Instant,
}

impl Io {
    fn new(
        shared: Arc<EngineShared>,
        link: Box<dyn SerialLink>,
        cfg: EngineConfig,
        store: Arc<Mutex<Box<dyn ConfigStore>>>,
        keys: SecureKeys,
        trace: Trace,
    ) -> Io {
        let now = Instant::now();
        let nonces = NonceCache::new(
            Duration::from_secs(cfg.nonce_ttl_in_secs),
            Duration::from_secs(cfg.nonce_ttl_out_secs),
            trace.clone(),
        );

        Io {
            shared,
            link,
            cfg,
            store,
            keys,
            trace,
            state: IoState::Idle,
            cur: None,
            ping: None,
            nonce_req: None,
            nonces,
            can_queue: VecDeque::new(),
            last_ping: [None; 256],
            next_send: now,
            last_sent: now,
        }
    }

    fn run(&mut self) {
        self.state = IoState::Idle;

        while !self.shared.shutdown.load(Ordering::Relaxed) {
            match self.step() {
                Ok(()) => (),
                Err(LinkError::Wait) => (),
                Err(LinkError::Fatal(ErrorType::Io(_))) => {
                    if self.recover_port().is_err() {
                        break;
                    }
                }
                Err(LinkError::Fatal(kind)) => self.reset_all(kind),
            }
        }

        self.shared.connected.store(false, Ordering::Relaxed);
        self.log_term_trace();
    }

    /// One pass of the I/O loop: take a frame (cancel queue first, then
    /// the wire), interpret it against the current state, forward what the
    /// driver should see.
    fn step(&mut self) -> LinkResult<()> {
        let mut frame = match self.can_queue.pop_front() {
            Some(frame) => {
                self.shared
                    .can_used
                    .store(self.can_queue.len(), Ordering::Relaxed);
                frame
            }
            None => frame::read_frame(
                self.link.as_mut(),
                self.cfg.read_window_ms,
                self.cfg.read_extend_ms,
                &self.shared.shutdown,
                &self.trace,
            )?,
        };

        let ftype = frame.frame_type;
        let prev_state = self.state;

        if ftype == FrameType::TransmitAck {
            if let Some(slot) = self.slot_for_state() {
                let expected = self.slot_ref(slot).callback_id();
                if frame.callback_id() != Some(expected) && self.trace.medium() {
                    debug!(self.trace.log(), "got trans ack for unexpected callback id";
                           "got" => frame.callback_id().unwrap_or(0),
                           "expected" => expected);
                }
            }
            if frame.transmit_status().unwrap_or(0) != 0 && self.trace.low() {
                debug!(self.trace.log(), "got transmit error status";
                       "callback_id" => frame.callback_id().unwrap_or(0),
                       "status" => frame.transmit_status().unwrap_or(0));
            }
        }

        // Per-state deadline enforcement while nothing is arriving
        if ftype == FrameType::Timeout
            && self.state != IoState::Idle
            && self.last_sent.elapsed() > self.state_timeout()
        {
            self.next_send = time::future_ms(self.cfg.failure_backoff_ms);
            self.try_resend(true, self.cfg.timeout_cost)?;
        }

        let mut special = self.dispatch_special(&mut frame)?;

        match ftype {
            FrameType::Cancel => {
                // The stick rejected our transmit because a frame came in
                // first. Read that frame, stash it for normal dispatch,
                // then retry ours after a short back-off.
                loop {
                    let stashed = frame::read_frame(
                        self.link.as_mut(),
                        self.cfg.read_window_ms,
                        self.cfg.read_extend_ms,
                        &self.shared.shutdown,
                        &self.trace,
                    )?;
                    if stashed.frame_type == FrameType::Timeout {
                        break;
                    }
                    if self.trace.medium() {
                        debug!(self.trace.log(), "stashed frame behind a cancel";
                               "frame" => stashed.digest());
                    }
                    self.can_queue.push_back(stashed);
                    self.shared
                        .can_used
                        .store(self.can_queue.len(), Ordering::Relaxed);
                }

                // A delayed cancel can arrive while idle; nothing to resend
                if self.state != IoState::Idle {
                    self.next_send = time::future_ms(self.cfg.cancel_backoff_ms);
                    self.try_resend(false, self.cfg.cancel_cost)?;
                }
            }
            FrameType::Nak => {
                if self.state != IoState::Idle {
                    self.next_send = time::future_ms(self.cfg.failure_backoff_ms);
                    self.try_resend(true, self.cfg.nak_cost)?;
                }
            }
            _ => {
                match self.state {
                    IoState::Idle => {
                        let wait = Duration::from_millis(self.cfg.idle_dequeue_ms);
                        if let Some(msg) = self.shared.out_queue.dequeue(wait) {
                            self.cur = Some(msg);
                            self.start_new_message()?;
                        }
                    }
                    IoState::WaitPingAck => {
                        if ftype == FrameType::Ack {
                            self.state = IoState::WaitPingTransAck;
                            self.last_sent = Instant::now();
                        }
                    }
                    IoState::WaitPingTransAck => {
                        if ftype == FrameType::TransmitAck {
                            let ping_cb = self.ping.as_ref().map(OutboundMessage::callback_id);
                            if frame.callback_id() == ping_cb {
                                if frame.transmit_status() == Some(0) {
                                    // Target is awake; now the real message
                                    let secure = self
                                        .cur
                                        .as_ref()
                                        .expect("Current slot must be loaded behind a ping")
                                        .is_secure();
                                    if secure {
                                        self.start_secure()?;
                                    } else {
                                        self.state = IoState::WaitAck;
                                        self.transmit(Slot::Cur)?;
                                    }
                                } else {
                                    self.next_send =
                                        time::future_ms(self.cfg.failure_backoff_ms);
                                    self.try_resend(true, self.cfg.timeout_cost)?;
                                }
                            }
                        }
                    }
                    IoState::WaitNonceAck => {
                        if ftype == FrameType::Ack {
                            self.state = IoState::WaitNonceTransAck;
                            self.last_sent = Instant::now();
                        }
                    }
                    IoState::WaitNonceTransAck => {
                        if ftype == FrameType::TransmitAck {
                            let req_cb = self.nonce_req.as_ref().map(OutboundMessage::callback_id);
                            if frame.callback_id() == req_cb {
                                if frame.transmit_status() == Some(0) {
                                    self.state = IoState::WaitNonce;
                                    self.last_sent = Instant::now();
                                } else {
                                    self.next_send =
                                        time::future_ms(self.cfg.failure_backoff_ms);
                                    self.try_resend(true, self.cfg.timeout_cost)?;
                                }
                            }
                        }
                    }
                    IoState::WaitNonce => {
                        // The dispatcher completes this state when the
                        // nonce report arrives
                    }
                    IoState::SendEncrypted => {
                        if self.trace.medium() {
                            let digest = self
                                .cur
                                .as_ref()
                                .map_or_else(String::new, OutboundMessage::digest);
                            debug!(self.trace.log(), "encrypted transmission"; "msg" => digest);
                        }
                        self.state = IoState::WaitAck;
                        self.transmit(Slot::Cur)?;
                    }
                    IoState::WaitAck => {
                        if ftype == FrameType::Ack {
                            let needs_callback = self
                                .cur
                                .as_ref()
                                .expect("Current slot must be loaded in WaitAck")
                                .needs_callback();
                            if needs_callback {
                                self.state = IoState::WaitCallback;
                                self.last_sent = Instant::now();
                            } else {
                                self.finish_current(true);
                            }
                        }
                    }
                    IoState::WaitCallback => {
                        if ftype == FrameType::TransmitAck {
                            let cur_cb = self.cur.as_ref().map(OutboundMessage::callback_id);
                            if frame.callback_id() == cur_cb {
                                if frame.transmit_status() == Some(0) {
                                    // Fabricate a no-op reply for a completed
                                    // ping so the driver can await it like any
                                    // other report
                                    let cur = self
                                        .cur
                                        .as_ref()
                                        .expect("Current slot must be loaded in WaitCallback");
                                    if cur.is_ping() {
                                        frame = InboundFrame::faux_noop_reply(cur.target());
                                        special = false;
                                    }
                                    self.finish_current(true);
                                } else {
                                    self.next_send =
                                        time::future_ms(self.cfg.failure_backoff_ms);
                                    // On give-up the driver gets to see the failure
                                    special = self.try_resend(true, self.cfg.timeout_cost)?;
                                }
                            }
                        }
                    }
                }

                if prev_state != self.state && self.trace.low() {
                    debug!(self.trace.log(), "state transition";
                           "from" => prev_state.name(),
                           "to" => self.state.name());
                }

                if !special {
                    self.shared.in_queue.push(frame)?;
                }
            }
        }

        Ok(())
    }

    /// Classifies an inbound frame before the upper layer may see it.
    /// Returns true when the frame was consumed here.
    fn dispatch_special(&mut self, frame: &mut InboundFrame) -> LinkResult<bool> {
        match frame.frame_type {
            FrameType::Timeout => return Ok(true),
            FrameType::Ack | FrameType::Nak | FrameType::Cancel | FrameType::TransmitAck => {
                if self.trace.low() {
                    debug!(self.trace.log(), "in frame"; "frame" => frame.digest());
                }
                return Ok(true);
            }
            _ => (),
        }

        let (mut class, mut cmd) = match frame.app_cmd() {
            Some(ids) => ids,
            None => {
                // Replication start invalidates every nonce; the network
                // key may be about to change
                if frame.func_id == func::ZW_SET_LEARN_MODE
                    && frame.payload.get(1) == Some(&learn::STARTED)
                {
                    self.nonces.flush_all();
                }
                if self.trace.low() {
                    debug!(self.trace.log(), "in frame"; "frame" => frame.digest());
                }
                return Ok(false);
            }
        };
        let src = frame.src_node().expect("App command frames carry a source id");

        // Decryption first: an end point encapsulation can ride inside a
        // secure one
        if class == cls::SECURITY
            && (cmd == security::MESSAGE_ENCAP || cmd == security::MESSAGE_ENCAP_NONCE_GET)
        {
            let content = frame.cc_args();
            if content.len() < 17 {
                if self.trace.low() {
                    debug!(self.trace.log(), "malformed secure envelope, dropping";
                           "frame" => frame.digest());
                }
                return Ok(true);
            }
            let nonce_id = content[content.len() - 9];

            match self.nonces.consume_incoming(nonce_id, src) {
                Some(nonce) => {
                    if self.trace.high() {
                        debug!(self.trace.log(), "decrypting with nonce"; "nonce_id" => nonce_id);
                    }
                    let ctrl_id = self.shared.ctrl_id.load(Ordering::Relaxed);
                    if !frame.decrypt_in_place(&self.keys, &nonce, ctrl_id) {
                        if self.trace.low() {
                            debug!(self.trace.log(), "decryption failed"; "node" => src);
                        }
                        return Ok(true);
                    }

                    let owe_nonce = cmd == security::MESSAGE_ENCAP_NONCE_GET;
                    let inner = frame.app_cmd().expect("Decrypted frame must carry CC ids");
                    class = inner.0;
                    cmd = inner.1;

                    if owe_nonce {
                        self.send_nonce_report(src)?;
                    }
                }
                None => {
                    if self.trace.low() {
                        debug!(self.trace.log(), "no nonce available for incoming msg, dropping";
                               "node" => src,
                               "nonce_id" => nonce_id);
                    }
                    return Ok(true);
                }
            }
        }

        if class == cls::MULTI_CHANNEL && cmd == crate::cc::multi_channel::CMD_ENCAP {
            if frame.unwrap_multi_channel() {
                if self.trace.medium() {
                    debug!(self.trace.log(), "expanded end point msg";
                           "src_ep" => frame.src_endpoint.unwrap_or(0),
                           "tar_ep" => frame.tar_endpoint.unwrap_or(0));
                }
                let inner = frame.app_cmd().expect("Unwrapped frame must carry CC ids");
                class = inner.0;
                cmd = inner.1;
            }
        }

        if self.trace.low() {
            debug!(self.trace.log(), "in msg"; "frame" => frame.digest());
        }

        if class == cls::MANUFACTURER_SPECIFIC && cmd == manufacturer::GET {
            // Typically asked during replication; answer from the
            // configured ids, secure if the query was. The driver still
            // gets to see the query.
            let man_ids = self.shared.man_ids.load(Ordering::Relaxed);
            let report = manufacturer::report(src, man_ids, frame.secure);
            self.shared.out_queue.enqueue(report);
        } else if class == cls::SECURITY {
            match cmd {
                security::NETWORK_KEY_SET => {
                    let args = frame.cc_args();
                    if args.len() >= NetworkKey::SIZE {
                        let mut key = NetworkKey::zeroed();
                        key.copy_from_slice(&args[..NetworkKey::SIZE]);

                        if let Err(err) = self
                            .store
                            .lock()
                            .expect("Config store poisoned")
                            .store_network_key(&key)
                        {
                            error!(self.trace.log(), "failed to persist network key";
                                   "error" => err.to_string());
                        }
                        self.keys = SecureKeys::derive(&key);
                        if self.trace.low() {
                            debug!(self.trace.log(), "network key updated"; "node" => src);
                        }
                    }
                    // Forwarded as well; the replication workflow watches
                    // for it
                }
                security::NONCE_GET => {
                    self.send_nonce_report(src)?;
                    return Ok(true);
                }
                security::NONCE_REPORT => {
                    let args = frame.cc_args();
                    if args.len() >= 8 {
                        let mut nonce = [0u8; 8];
                        nonce.copy_from_slice(&args[..8]);

                        let waiting = self.state == IoState::WaitNonce
                            && self.cur.as_ref().map_or(false, |cur| cur.target() == src);
                        if waiting {
                            if self.trace.medium() {
                                debug!(self.trace.log(), "got nonce, encrypting staged msg";
                                       "nonce_id" => nonce[0]);
                            }
                            let ctrl_id = self.shared.ctrl_id.load(Ordering::Relaxed);
                            self.cur
                                .as_mut()
                                .expect("Current slot must be loaded in WaitNonce")
                                .encrypt(&self.keys, &nonce, ctrl_id);
                            self.state = IoState::SendEncrypted;
                        } else {
                            self.nonces.store_outgoing(src, nonce);
                        }
                    }
                    return Ok(true);
                }
                _ => (),
            }
        }

        Ok(false)
    }

    /// Looks at a freshly dequeued message and starts the phase sequence
    /// it needs: ping for frequent listeners, nonce acquisition for secure
    /// targets, or a plain transmit.
    fn start_new_message(&mut self) -> LinkResult<()> {
        let (target, freq_listener, is_ping, secure) = {
            let cur = self.cur.as_ref().expect("Current slot must be loaded");
            if self.trace.low() {
                debug!(self.trace.log(), "sending a new msg"; "msg" => cur.digest());
            }
            (cur.target(), cur.freq_listener(), cur.is_ping(), cur.is_secure())
        };

        let mut pinged = false;
        if freq_listener && target != NODE_BROADCAST && !is_ping {
            let window = Duration::from_millis(self.cfg.ping_window_ms);
            let recent = self.last_ping[target as usize]
                .map_or(false, |at| at.elapsed() < window);

            if !recent {
                self.last_ping[target as usize] = Some(Instant::now());
                if self.trace.high() {
                    debug!(self.trace.log(), "target is frequent listener, sending ping";
                           "node" => target);
                }
                self.ping = Some(OutboundMessage::ping(target, Priority::Command));
                self.state = IoState::WaitPingAck;
                self.transmit(Slot::Ping)?;
                pinged = true;
            } else if self.trace.high() {
                debug!(self.trace.log(), "ping sent very recently, not sending another";
                       "node" => target);
            }
        }

        if !pinged {
            if secure {
                self.start_secure()?;
            } else {
                self.state = IoState::WaitAck;
                self.transmit(Slot::Cur)?;
            }
        }
        Ok(())
    }

    /// Secure path: encrypt with a cached nonce if one is still valid,
    /// otherwise ask the target for one.
    fn start_secure(&mut self) -> LinkResult<()> {
        let target = self
            .cur
            .as_ref()
            .expect("Current slot must be loaded for secure start")
            .target();

        if let Some(nonce) = self.nonces.consume_outgoing(target) {
            let ctrl_id = self.shared.ctrl_id.load(Ordering::Relaxed);
            self.cur
                .as_mut()
                .expect("Current slot must be loaded for secure start")
                .encrypt(&self.keys, &nonce, ctrl_id);
            self.state = IoState::WaitAck;
            self.transmit(Slot::Cur)
        } else {
            self.nonce_req = Some(security::nonce_get(target));
            self.state = IoState::WaitNonceAck;
            self.transmit(Slot::NonceReq)
        }
    }

    /// Issues a nonce and reports it to the asking node, immediately when
    /// idle, otherwise via the queue at nonce priority.
    fn send_nonce_report(&mut self, target: NodeId) -> LinkResult<()> {
        let nonce = self.nonces.issue(target);
        let msg = security::nonce_report(target, &nonce);

        if self.state == IoState::Idle {
            if self.trace.medium() {
                debug!(self.trace.log(), "idle, sending nonce immediately";
                       "nonce_id" => nonce[0],
                       "node" => target);
            }
            self.cur = Some(msg);
            self.state = IoState::WaitAck;
            self.transmit(Slot::Cur)
        } else {
            if self.trace.medium() {
                debug!(self.trace.log(), "queued outgoing nonce";
                       "nonce_id" => nonce[0],
                       "node" => target);
            }
            self.shared.out_queue.enqueue(msg);
            Ok(())
        }
    }

    /// Retries the in-flight message unless its accumulated cost crossed
    /// the limit, in which case the message is abandoned and the waiter
    /// woken with failure. Returns false on give-up.
    fn try_resend(&mut self, new_callback: bool, increment: u32) -> LinkResult<bool> {
        let slot = self
            .slot_for_state()
            .expect("Got to resend without any output msg");

        let cost = self.slot_mut(slot).bump_cost(increment);
        if cost > self.cfg.retry_limit {
            if self.trace.medium() {
                debug!(self.trace.log(), "too many failures, giving up";
                       "state" => self.state.name(),
                       "msg" => self.slot_ref(slot).digest());
            }

            let ack_id = self.cur.as_ref().map(OutboundMessage::ack_id);
            self.state = IoState::Idle;
            self.cur = None;
            self.ping = None;
            self.nonce_req = None;
            if let Some(ack_id) = ack_id {
                self.shared.bridge.complete(ack_id, false);
            }
            return Ok(false);
        }

        // Fall back to the start of the current phase
        self.state = match self.state {
            IoState::WaitPingAck | IoState::WaitPingTransAck => IoState::WaitPingAck,
            IoState::WaitNonceAck | IoState::WaitNonceTransAck | IoState::WaitNonce => {
                IoState::WaitNonceAck
            }
            IoState::WaitAck | IoState::WaitCallback => IoState::WaitAck,
            other => other,
        };

        if new_callback {
            let msg = self.slot_mut(slot);
            if msg.needs_callback() {
                msg.update_callback();
            }
        }
        if self.trace.medium() {
            debug!(self.trace.log(), "retrying msg";
                   "state" => self.state.name(),
                   "new_callback" => new_callback,
                   "msg" => self.slot_ref(slot).digest());
        }

        self.transmit(slot)?;
        Ok(self.state != IoState::Idle)
    }

    /// Writes one message to the wire, honoring the inter-message gap. A
    /// write failure abandons the message and surfaces the error so the
    /// loop can attempt port recovery.
    fn transmit(&mut self, slot: Slot) -> LinkResult<()> {
        let now = Instant::now();
        if now < self.next_send {
            thread::sleep(self.next_send - now);
        }

        let (data, ack_id, attempt) = {
            let msg = self.slot_mut(slot);
            msg.note_sent();
            (msg.data().to_vec(), msg.ack_id(), msg.send_count())
        };

        if self.trace.low() {
            debug!(self.trace.log(), "sending msg";
                   "ack_id" => ack_id,
                   "attempt" => attempt);
        }

        match frame::write_frame(self.link.as_mut(), &data) {
            Ok(()) => {
                let now = Instant::now();
                self.next_send = now;
                self.last_sent = now;
                Ok(())
            }
            Err(err) => {
                if self.trace.medium() {
                    debug!(self.trace.log(), "message could not be transmitted, dropping it";
                           "ack_id" => ack_id);
                }
                self.state = IoState::Idle;
                self.shared.bridge.complete(ack_id, false);
                self.next_send = time::future_ms(self.cfg.failure_backoff_ms);
                Err(err)
            }
        }
    }

    /// Terminal transition for the current message.
    fn finish_current(&mut self, success: bool) {
        if let Some(cur) = self.cur.take() {
            self.shared.bridge.complete(cur.ack_id(), success);
        }
        self.state = IoState::Idle;
    }

    fn slot_for_state(&self) -> Option<Slot> {
        match self.state {
            IoState::WaitPingAck | IoState::WaitPingTransAck => Some(Slot::Ping),
            IoState::WaitNonceAck | IoState::WaitNonceTransAck | IoState::WaitNonce => {
                Some(Slot::NonceReq)
            }
            IoState::WaitAck | IoState::WaitCallback | IoState::SendEncrypted => Some(Slot::Cur),
            IoState::Idle => None,
        }
    }

    fn slot_ref(&self, slot: Slot) -> &OutboundMessage {
        let msg = match slot {
            Slot::Cur => self.cur.as_ref(),
            Slot::Ping => self.ping.as_ref(),
            Slot::NonceReq => self.nonce_req.as_ref(),
        };
        msg.expect("Message slot for state must be loaded")
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut OutboundMessage {
        let msg = match slot {
            Slot::Cur => self.cur.as_mut(),
            Slot::Ping => self.ping.as_mut(),
            Slot::NonceReq => self.nonce_req.as_mut(),
        };
        msg.expect("Message slot for state must be loaded")
    }

    fn state_timeout(&self) -> Duration {
        let timeouts = &self.cfg.timeouts;
        let base = match self.state {
            IoState::WaitPingAck => timeouts.ping_ack_ms,
            IoState::WaitPingTransAck => timeouts.ping_trans_ack_ms,
            IoState::WaitNonceAck => timeouts.nonce_ack_ms,
            IoState::WaitNonceTransAck => timeouts.nonce_trans_ack_ms,
            IoState::WaitNonce => timeouts.nonce_ms,
            IoState::WaitAck => timeouts.ack_ms,
            IoState::WaitCallback => timeouts.callback_ms,
            // Synthetic and idle states are not timed
            IoState::Idle | IoState::SendEncrypted => return Duration::from_secs(3600),
        };

        let extra = if self.cur.as_ref().map_or(false, |cur| cur.freq_listener()) {
            timeouts.freq_listener_extra_ms
        } else {
            0
        };
        Duration::from_millis(base + extra)
    }

    /// Blunt containment for anything unexpected inside the loop: reset
    /// the machine, flush every queue and cache, release the waiter. The
    /// loop then continues.
    fn reset_all(&mut self, kind: ErrorType) {
        error!(self.trace.log(), "internal error in I/O loop, resetting engine state";
               "kind" => format!("{:?}", kind),
               "state" => self.state.name(),
               "msg" => self.cur.as_ref().map_or_else(String::new, OutboundMessage::digest));

        self.state = IoState::Idle;
        self.cur = None;
        self.ping = None;
        self.nonce_req = None;
        self.can_queue.clear();
        self.shared.can_used.store(0, Ordering::Relaxed);

        let dropped_out = self.shared.out_queue.clear().len();
        let dropped_in = self.shared.in_queue.clear().len();
        if (dropped_out > 0 || dropped_in > 0) && self.trace.low() {
            debug!(self.trace.log(), "flushed engine queues";
                   "out" => dropped_out,
                   "in" => dropped_in);
        }

        self.nonces.flush_all();
        self.shared.bridge.release_failure();
    }

    /// One recovery attempt after a serial failure: cycle the port and
    /// confirm it writes with a trial NAK. A second failure gives up and
    /// lets the thread die so the driver can reconnect.
    fn recover_port(&mut self) -> LinkResult<()> {
        error!(self.trace.log(), "serial failure, recycling the port");

        let result = self
            .link
            .cycle()
            .and_then(|_| self.link.write_all(&[NAK], Duration::from_millis(500)));

        if result.is_err() {
            error!(self.trace.log(), "recycle failed, closing the port");
            self.shared.connected.store(false, Ordering::Relaxed);
        }
        result
    }

    /// Final dump of whatever never got delivered, for the trace.
    fn log_term_trace(&mut self) {
        let leftovers = self.shared.out_queue.clear();
        if !leftovers.is_empty() {
            info!(self.trace.log(), "final outstanding out msg count"; "count" => leftovers.len());
            for msg in &leftovers {
                debug!(self.trace.log(), "undelivered out msg"; "msg" => msg.digest());
            }
        }

        let inbound = self.shared.in_queue.clear();
        if !inbound.is_empty() {
            info!(self.trace.log(), "final outstanding in msg count"; "count" => inbound.len());
            for frame in &inbound {
                debug!(self.trace.log(), "unconsumed in msg"; "frame" => frame.digest());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::port::testutil::{ScriptHandle, ScriptedLink};
    use zcore::logging::discard;
    use zcore::{ACK, CAN, REQUEST, SOF};

    struct Rig {
        io: Io,
        handle: ScriptHandle,
        shared: Arc<EngineShared>,
        store: Arc<Mutex<Box<dyn ConfigStore>>>,
    }

    fn test_cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.read_window_ms = 5;
        cfg.read_extend_ms = 10;
        cfg.idle_dequeue_ms = 5;
        cfg.cancel_backoff_ms = 20;
        cfg.failure_backoff_ms = 20;
        cfg.ping_window_ms = 200;
        cfg
    }

    fn rig_with(cfg: EngineConfig) -> Rig {
        let (link, handle) = ScriptedLink::pair();
        let trace = Trace::new(discard(), TraceLevel::Off);
        let shared = Arc::new(EngineShared::new(&cfg, trace.clone()));
        let store: Arc<Mutex<Box<dyn ConfigStore>>> =
            Arc::new(Mutex::new(Box::new(MemoryStore::new(NetworkKey::zeroed()))));

        let io = Io::new(
            shared.clone(),
            Box::new(link),
            cfg,
            store.clone(),
            SecureKeys::derive(&NetworkKey::zeroed()),
            trace,
        );

        Rig {
            io,
            handle,
            shared,
            store,
        }
    }

    fn rig() -> Rig {
        rig_with(test_cfg())
    }

    fn encode(frame_type: u8, func_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![(payload.len() + 3) as u8, frame_type, func_id];
        data.extend_from_slice(payload);

        let mut wire = vec![SOF];
        wire.extend_from_slice(&data);
        wire.push(frame::checksum(&data));
        wire
    }

    fn app_cmd_wire(src: NodeId, cc: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x00, src, cc.len() as u8];
        payload.extend_from_slice(cc);
        encode(REQUEST, func::APPLICATION_COMMAND_HANDLER, &payload)
    }

    fn transack_wire(callback_id: u8, status: u8) -> Vec<u8> {
        encode(REQUEST, func::ZW_SEND_DATA, &[callback_id, status, 0x00, 0x02])
    }

    /// Splits recorded wire output into frames; single control bytes come
    /// back as one element vectors.
    fn sent_frames(handle: &ScriptHandle) -> Vec<Vec<u8>> {
        let bytes = handle.take_tx();
        let mut frames = Vec::new();
        let mut index = 0;

        while index < bytes.len() {
            match bytes[index] {
                SOF => {
                    let len = bytes[index + 1] as usize;
                    frames.push(bytes[index..index + len + 2].to_vec());
                    index += len + 2;
                }
                _ => {
                    frames.push(vec![bytes[index]]);
                    index += 1;
                }
            }
        }
        frames
    }

    fn switch_set(target: NodeId) -> OutboundMessage {
        let mut msg = OutboundMessage::command(target, cls::SWITCH_BINARY, 0x01, Priority::Command);
        msg.push(0xFF);
        msg.append_trans_opts();
        msg.append_callback();
        msg.finalize(false, false);
        msg
    }

    fn spawn_waiter(
        shared: &Arc<EngineShared>,
        ack_id: u32,
    ) -> thread::JoinHandle<WaitOutcome> {
        let shared = shared.clone();
        let handle = thread::spawn(move || {
            shared
                .bridge
                .wait(ack_id, Duration::from_secs(5), &shared.shutdown)
        });
        // Give the waiter time to register its ack id
        thread::sleep(Duration::from_millis(30));
        handle
    }

    #[test]
    fn test_plain_command_to_listener() {
        let mut rig = rig();

        let msg = switch_set(0x05);
        let ack_id = msg.ack_id();
        let callback = msg.callback_id();
        rig.shared.out_queue.enqueue(msg);

        // Idle pass dequeues and transmits
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);

        let frames = sent_frames(&rig.handle);
        assert_eq!(frames.len(), 1);
        let wire = &frames[0];
        assert_eq!(wire[0], SOF);
        assert_eq!(wire[3], func::ZW_SEND_DATA);
        assert_eq!(wire[4], 0x05);
        assert_eq!(wire[6], cls::SWITCH_BINARY);
        assert_eq!(wire[7], 0x01);
        assert_eq!(wire[8], 0xFF);

        let waiter = spawn_waiter(&rig.shared, ack_id);

        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitCallback);

        rig.handle.feed(&transack_wire(callback, 0));
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::Idle);

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Success);

        // No nonce traffic, no ping, nothing for the driver
        assert_eq!(rig.io.nonces.total_incoming(), 0);
        assert_eq!(rig.io.nonces.total_outgoing(), 0);
        assert!(rig.shared.in_queue.pop(Duration::from_millis(0)).is_none());
    }

    #[test]
    fn test_secure_command_without_cached_nonce() {
        let mut rig = rig();
        let keys = SecureKeys::derive(&NetworkKey::zeroed());

        let mut msg = OutboundMessage::command(0x07, 0x62, 0x01, Priority::Command);
        msg.push(0xFF);
        msg.append_trans_opts();
        msg.append_callback();
        msg.finalize(false, true);
        let ack_id = msg.ack_id();

        assert_eq!(rig.io.nonces.total_outgoing(), 0);
        rig.shared.out_queue.enqueue(msg);

        // The engine must first go get a nonce
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitNonceAck);

        let frames = sent_frames(&rig.handle);
        let nonce_get = &frames[0];
        assert_eq!(nonce_get[6], cls::SECURITY);
        assert_eq!(nonce_get[7], security::NONCE_GET);
        let nonce_req_cb = rig.io.nonce_req.as_ref().unwrap().callback_id();

        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitNonceTransAck);

        rig.handle.feed(&transack_wire(nonce_req_cb, 0));
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitNonce);

        // The target answers with nonce id 0x42
        let nonce = [0x42u8, 10, 20, 30, 40, 50, 60, 70];
        let mut cc = vec![cls::SECURITY, security::NONCE_REPORT];
        cc.extend_from_slice(&nonce);
        rig.handle.feed(&app_cmd_wire(0x07, &cc));

        // Same pass encrypts and transmits the staged message
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);

        let frames = sent_frames(&rig.handle);
        // The codec acked the nonce report, then sent the encrypted frame
        assert_eq!(frames[0], vec![ACK]);
        let encrypted = &frames[1];

        let cc_len = encrypted[5] as usize;
        let cc = &encrypted[6..6 + cc_len];
        assert_eq!(cc[0], cls::SECURITY);
        assert_eq!(cc[1], security::MESSAGE_ENCAP);

        // Envelope: sender IV half, ciphertext, receiver nonce id, tag
        let cipher_len = cc_len - 2 - 8 - 1 - 8;
        assert_eq!(cipher_len, 3);
        assert_eq!(cc[2 + 8 + cipher_len], 0x42);

        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&cc[2..10]);
        iv[8..].copy_from_slice(&nonce);
        let mut cipher = cc[10..10 + cipher_len].to_vec();
        keys.ofb_apply(&iv, &mut cipher);
        assert_eq!(cipher, vec![0x62, 0x01, 0xFF]);

        let callback = rig.io.cur.as_ref().unwrap().callback_id();
        let waiter = spawn_waiter(&rig.shared, ack_id);

        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitCallback);

        rig.handle.feed(&transack_wire(callback, 0));
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::Idle);

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Success);

        // The nonce was consumed in flight, never cached
        assert_eq!(rig.io.nonces.total_outgoing(), 0);
    }

    #[test]
    fn test_frequent_listener_gets_pinged_once_per_window() {
        let mut rig = rig();

        let mut msg = switch_set(0x0A);
        msg.finalize(true, false);
        rig.shared.out_queue.enqueue(msg);

        // A ping goes out before the real command
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitPingAck);

        let frames = sent_frames(&rig.handle);
        let ping_wire = &frames[0];
        assert_eq!(ping_wire[4], 0x0A);
        assert_eq!(ping_wire[5], 1);
        assert_eq!(ping_wire[6], cls::NO_OPERATION);
        let ping_cb = rig.io.ping.as_ref().unwrap().callback_id();

        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitPingTransAck);

        rig.handle.feed(&transack_wire(ping_cb, 0));
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);

        // Now the real command went out
        let frames = sent_frames(&rig.handle);
        let real = frames.iter().find(|frame| frame.len() > 1).unwrap();
        assert_eq!(real[6], cls::SWITCH_BINARY);

        let cur_cb = rig.io.cur.as_ref().unwrap().callback_id();
        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        rig.handle.feed(&transack_wire(cur_cb, 0));
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::Idle);

        // A second command inside the window skips the ping
        let mut msg = switch_set(0x0A);
        msg.finalize(true, false);
        rig.shared.out_queue.enqueue(msg);

        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);
        let frames = sent_frames(&rig.handle);
        let direct = frames.iter().find(|frame| frame.len() > 1).unwrap();
        assert_eq!(direct[6], cls::SWITCH_BINARY);

        let cur_cb = rig.io.cur.as_ref().unwrap().callback_id();
        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        rig.handle.feed(&transack_wire(cur_cb, 0));
        rig.io.step().unwrap();

        // After the window expires a new ping is due
        thread::sleep(Duration::from_millis(250));
        let mut msg = switch_set(0x0A);
        msg.finalize(true, false);
        rig.shared.out_queue.enqueue(msg);

        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitPingAck);
    }

    #[test]
    fn test_cancel_storm_preserves_callback_and_inbound() {
        let mut rig = rig();

        let msg = switch_set(0x05);
        let callback = msg.callback_id();
        let ack_id = msg.ack_id();
        rig.shared.out_queue.enqueue(msg);

        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);
        sent_frames(&rig.handle);

        // Three cancels in a row, each bringing an unrelated sensor report
        for round in 0..3 {
            let mut wire = vec![CAN];
            wire.extend_from_slice(&app_cmd_wire(0x03, &[0x20, 0x03, round]));
            rig.handle.feed(&wire);

            rig.io.step().unwrap();
            assert_eq!(rig.io.state, IoState::WaitAck);

            // The resend reuses the same callback id
            let frames = sent_frames(&rig.handle);
            let resent = frames.iter().find(|frame| frame.len() > 1).unwrap();
            assert_eq!(*resent.last().unwrap() , frame::checksum(&resent[1..resent.len() - 1]));
            assert_eq!(resent[resent.len() - 2], callback);

            // Next pass dispatches the stashed frame to the driver
            rig.io.step().unwrap();
            let inbound = rig.shared.in_queue.pop(Duration::from_millis(0)).unwrap();
            assert_eq!(inbound.src_node(), Some(0x03));
            assert_eq!(inbound.cc_args(), &[round]);
        }

        // The fourth attempt succeeds
        let waiter = spawn_waiter(&rig.shared, ack_id);
        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        rig.handle.feed(&transack_wire(callback, 0));
        rig.io.step().unwrap();

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Success);
    }

    #[test]
    fn test_retry_exhaustion_frees_the_machine() {
        let mut rig = rig();

        let msg = switch_set(0x09);
        let ack_id = msg.ack_id();
        rig.shared.out_queue.enqueue(msg);

        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);

        let waiter = spawn_waiter(&rig.shared, ack_id);

        // NAK every attempt; cost 2 each crosses the limit of 9 on the
        // fifth
        for _ in 0..5 {
            rig.handle.feed(&[zcore::NAK]);
            rig.io.step().unwrap();
        }
        assert_eq!(rig.io.state, IoState::Idle);
        assert!(rig.io.cur.is_none());

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Failure);

        // The machine is free for the next message
        let msg = switch_set(0x04);
        let callback = msg.callback_id();
        rig.shared.out_queue.enqueue(msg);
        sent_frames(&rig.handle);

        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);

        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        rig.handle.feed(&transack_wire(callback, 0));
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::Idle);
    }

    #[test]
    fn test_network_key_set_persists_and_forwards() {
        let mut rig = rig();

        let mut cc = vec![cls::SECURITY, security::NETWORK_KEY_SET];
        cc.extend_from_slice(&[
            0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E,
            0x1F, 0x20,
        ]);
        rig.handle.feed(&app_cmd_wire(0x01, &cc));

        rig.io.step().unwrap();

        // Persisted through the collaborator
        let stored = rig
            .store
            .lock()
            .unwrap()
            .load_network_key()
            .unwrap();
        assert_eq!(stored[0], 0x11);
        assert_eq!(stored[15], 0x20);
        assert!(!stored.is_default());

        // And forwarded to the upper layer
        let inbound = rig.shared.in_queue.pop(Duration::from_millis(0)).unwrap();
        assert_eq!(inbound.app_cmd(), Some((cls::SECURITY, security::NETWORK_KEY_SET)));

        // Learn mode start flushes the nonce caches
        let mut nonce = [0u8; 8];
        nonce[0] = 0x55;
        rig.io.nonces.store_outgoing(0x07, nonce);

        rig.handle
            .feed(&encode(REQUEST, func::ZW_SET_LEARN_MODE, &[0x01, learn::STARTED]));
        rig.io.step().unwrap();

        assert_eq!(rig.io.nonces.total_outgoing(), 0);
        assert_eq!(rig.io.nonces.total_incoming(), 0);
    }

    #[test]
    fn test_bare_nonce_get_answered_immediately_when_idle() {
        let mut rig = rig();

        rig.handle
            .feed(&app_cmd_wire(0x0C, &[cls::SECURITY, security::NONCE_GET]));
        rig.io.step().unwrap();

        // The engine went straight into sending the report
        assert_eq!(rig.io.state, IoState::WaitAck);
        assert_eq!(rig.io.nonces.total_incoming(), 1);

        let frames = sent_frames(&rig.handle);
        let report = frames.iter().find(|frame| frame.len() > 1).unwrap();
        assert_eq!(report[6], cls::SECURITY);
        assert_eq!(report[7], security::NONCE_REPORT);

        // Not forwarded to the driver
        assert!(rig.shared.in_queue.pop(Duration::from_millis(0)).is_none());
    }

    #[test]
    fn test_unsolicited_nonce_report_is_cached() {
        let mut rig = rig();

        let nonce = [0x77u8, 1, 2, 3, 4, 5, 6, 7];
        let mut cc = vec![cls::SECURITY, security::NONCE_REPORT];
        cc.extend_from_slice(&nonce);
        rig.handle.feed(&app_cmd_wire(0x0D, &cc));

        rig.io.step().unwrap();

        assert_eq!(rig.io.nonces.total_outgoing(), 1);
        assert_eq!(rig.io.nonces.consume_outgoing(0x0D), Some(nonce));
        assert!(rig.shared.in_queue.pop(Duration::from_millis(0)).is_none());
    }

    #[test]
    fn test_manufacturer_get_is_answered_and_forwarded() {
        let mut rig = rig();
        rig.shared.man_ids.store(0x0001_0203_0405, Ordering::Relaxed);

        rig.handle.feed(&app_cmd_wire(
            0x02,
            &[cls::MANUFACTURER_SPECIFIC, manufacturer::GET],
        ));
        rig.io.step().unwrap();

        // The synthesised report was queued at reply priority and picked
        // up by the idle pass of the same step
        assert_eq!(rig.io.state, IoState::WaitAck);
        let frames = sent_frames(&rig.handle);
        let report = frames.iter().find(|frame| frame.len() > 1).unwrap();
        assert_eq!(report[4], 0x02);
        assert_eq!(report[6], cls::MANUFACTURER_SPECIFIC);
        assert_eq!(report[7], manufacturer::REPORT);
        assert_eq!(&report[8..14], &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);

        // The driver still sees the query
        let inbound = rig.shared.in_queue.pop(Duration::from_millis(0)).unwrap();
        assert_eq!(
            inbound.app_cmd(),
            Some((cls::MANUFACTURER_SPECIFIC, manufacturer::GET))
        );
    }

    #[test]
    fn test_completed_ping_synthesises_noop_reply() {
        let mut rig = rig();

        let msg = OutboundMessage::ping(0x0A, Priority::Command);
        let callback = msg.callback_id();
        rig.shared.out_queue.enqueue(msg);

        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);

        rig.handle.feed(&[ACK]);
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitCallback);

        rig.handle.feed(&transack_wire(callback, 0));
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::Idle);

        let inbound = rig.shared.in_queue.pop(Duration::from_millis(0)).unwrap();
        assert_eq!(inbound.app_cmd(), Some((cls::NO_OPERATION, 0)));
        assert_eq!(inbound.src_node(), Some(0x0A));
    }

    #[test]
    fn test_secure_send_uses_cached_nonce() {
        let mut rig = rig();

        let nonce = [0x21u8, 9, 9, 9, 9, 9, 9, 9];
        rig.io.nonces.store_outgoing(0x07, nonce);

        let mut msg = OutboundMessage::command(0x07, 0x62, 0x01, Priority::Command);
        msg.push(0x00);
        msg.append_trans_opts();
        msg.append_callback();
        msg.finalize(false, true);
        rig.shared.out_queue.enqueue(msg);

        // No nonce request needed; straight to the encrypted send
        rig.io.step().unwrap();
        assert_eq!(rig.io.state, IoState::WaitAck);
        assert_eq!(rig.io.nonces.total_outgoing(), 0);

        let frames = sent_frames(&rig.handle);
        let wire = &frames[0];
        assert_eq!(wire[6], cls::SECURITY);
        assert_eq!(wire[7], security::MESSAGE_ENCAP);
    }

    #[test]
    fn test_write_failure_fails_message_and_recovers_port() {
        let mut rig = rig();

        let msg = switch_set(0x05);
        let ack_id = msg.ack_id();
        rig.shared.out_queue.enqueue(msg);

        let waiter = spawn_waiter(&rig.shared, ack_id);

        rig.handle.fail_writes(true);
        let result = rig.io.step();
        assert!(result.is_err());
        assert_eq!(rig.io.state, IoState::Idle);
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Failure);

        // The recovery path cycles the link once
        rig.handle.fail_writes(false);
        rig.io.recover_port().unwrap();
        assert_eq!(rig.handle.cycles(), 1);
    }

    #[test]
    fn test_inbound_overflow_resets_engine() {
        let mut cfg = test_cfg();
        cfg.in_queue_bound = 1;
        let mut rig = rig_with(cfg);

        rig.handle.feed(&app_cmd_wire(0x03, &[0x20, 0x03, 1]));
        rig.io.step().unwrap();

        // Second frame overflows the bound; the loop resets and continues
        rig.handle.feed(&app_cmd_wire(0x03, &[0x20, 0x03, 2]));
        let err = rig.io.step().unwrap_err();
        assert_eq!(err, LinkError::Fatal(ErrorType::QueueOverflow));

        rig.io.reset_all(ErrorType::QueueOverflow);
        assert_eq!(rig.io.state, IoState::Idle);
        assert_eq!(rig.shared.in_queue.len(), 0);
    }
}
