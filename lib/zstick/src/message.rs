use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use zcore::crypto::{self, SecureKeys};
use zcore::{cls, func, NodeId, REQUEST, TRANSMIT_OPTIONS};

// Monotonic ack ids, never reused. Callback ids wrap and skip zero, which
// the protocol reserves for "no callback".
static NEXT_ACK_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_CALLBACK_ID: AtomicU8 = AtomicU8::new(1);

fn next_ack_id() -> u32 {
    NEXT_ACK_ID.fetch_add(1, Ordering::Relaxed)
}

fn next_callback_id() -> u8 {
    loop {
        let id = NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Outbound priority bands, highest wins. The numeric values are the queue
/// band indices; the gaps are intentional and keep room for future bands.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Priority {
    Async = 0,
    Query = 2,
    Command = 3,
    Reply = 5,
    Wakeup = 6,
    SpecialCmd = 7,
    Security = 8,
    Nonce = 9,
    Local = 10,
}

pub const BAND_COUNT: usize = 11;

impl Priority {
    #[inline]
    pub fn band(self) -> usize {
        self as usize
    }
}

/// One controller initiated message. Built by the typed constructors below
/// or the command class helpers; owned by the transmit state machine from
/// dequeue to terminal state.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    // LEN, TYPE, FUNC_ID, payload... — the checksum is computed at
    // transmit time so a callback id retry needs no rebuild
    data: Vec<u8>,

    target: NodeId,
    priority: Priority,
    class_id: u8,
    cmd_id: u8,

    // Index of the class id byte within data, and the CC byte count.
    // Zero cc_start means this is not a CC message.
    cc_start: usize,
    cc_len_at: usize,

    callback_at: usize,
    callback_id: u8,
    needs_callback: bool,

    secure: bool,
    is_ping: bool,
    freq_listener: bool,
    expect_reply: Option<(u8, u8)>,

    ack_id: u32,
    send_cost: u32,
    send_count: u32,
}

impl OutboundMessage {
    /// A plain controller command with no target node.
    pub fn controller(func_id: u8, priority: Priority) -> OutboundMessage {
        OutboundMessage {
            data: vec![0, REQUEST, func_id],
            target: 0,
            priority,
            class_id: 0,
            cmd_id: 0,
            cc_start: 0,
            cc_len_at: 0,
            callback_at: 0,
            callback_id: 0,
            needs_callback: false,
            secure: false,
            is_ping: false,
            freq_listener: false,
            expect_reply: None,
            ack_id: next_ack_id(),
            send_cost: 0,
            send_count: 0,
        }
    }

    /// A node addressed command class message. The CC length byte is fixed
    /// up when the transmit options are appended.
    pub fn command(target: NodeId, class_id: u8, cmd_id: u8, priority: Priority) -> OutboundMessage {
        let mut msg = Self::controller(func::ZW_SEND_DATA, priority);
        msg.target = target;
        msg.class_id = class_id;
        msg.cmd_id = cmd_id;

        msg.data.push(target);
        msg.cc_len_at = msg.data.len();
        msg.data.push(0);
        msg.cc_start = msg.data.len();
        msg.data.push(class_id);
        msg.data.push(cmd_id);
        msg
    }

    /// The minimal NO_OPERATION frame used to wake a frequent listener. It
    /// carries only the class byte, no command id.
    pub fn ping(target: NodeId, priority: Priority) -> OutboundMessage {
        let mut msg = Self::controller(func::ZW_SEND_DATA, priority);
        msg.target = target;
        msg.class_id = cls::NO_OPERATION;
        msg.is_ping = true;

        msg.data.push(target);
        msg.data.push(1);
        msg.data.push(cls::NO_OPERATION);
        msg.data.push(TRANSMIT_OPTIONS);

        msg.callback_id = next_callback_id();
        msg.callback_at = msg.data.len();
        msg.data.push(msg.callback_id);
        msg.needs_callback = true;

        msg.seal();
        msg
    }

    /// Appends a raw payload byte.
    #[inline]
    pub fn push(&mut self, byte: u8) -> &mut Self {
        self.data.push(byte);
        self
    }

    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Closes the CC byte region and appends the transmit options byte.
    pub fn append_trans_opts(&mut self) -> &mut Self {
        if self.cc_start > 0 {
            self.data[self.cc_len_at] = (self.data.len() - self.cc_start) as u8;
        }
        self.data.push(TRANSMIT_OPTIONS);
        self
    }

    /// Appends a fresh callback id and marks the message as waiting for the
    /// matching transmit ack.
    pub fn append_callback(&mut self) -> &mut Self {
        self.callback_id = next_callback_id();
        self.callback_at = self.data.len();
        self.data.push(self.callback_id);
        self.needs_callback = true;
        self
    }

    /// Appends a real callback id without arming the callback wait. Used
    /// for operations like learn mode whose callback can arrive many
    /// seconds later; the caller watches for it instead of the engine.
    pub fn append_detached_callback(&mut self) -> &mut Self {
        self.callback_id = next_callback_id();
        self.callback_at = self.data.len();
        self.data.push(self.callback_id);
        self.needs_callback = false;
        self
    }

    /// Appends the zero "no callback" byte.
    pub fn append_null_callback(&mut self) -> &mut Self {
        self.data.push(0);
        self
    }

    /// Finishes construction: fixes the length byte and records the flags
    /// the state machine drives on.
    pub fn finalize(&mut self, freq_listener: bool, secure: bool) -> &mut Self {
        self.freq_listener = freq_listener;
        self.secure = secure;
        self.seal();
        self
    }

    #[inline]
    fn seal(&mut self) {
        self.data[0] = self.data.len() as u8;
    }

    /// The message carried in the callback-reply the caller will await,
    /// when one is expected after the transmit ack.
    pub fn expect_reply(&mut self, class_id: u8, cmd_id: u8) -> &mut Self {
        self.expect_reply = Some((class_id, cmd_id));
        self
    }

    /// Regenerates the callback id in place. Called on a retry after the
    /// peer saw the previous transmission; the peer treats the callback id
    /// as a fresh transaction.
    pub fn update_callback(&mut self) {
        if self.callback_at > 0 {
            self.callback_id = next_callback_id();
            self.data[self.callback_at] = self.callback_id;
        }
    }

    /// Rewrites the message as its secure encapsulation, consuming the
    /// receiver nonce. The CC bytes are replaced with the encapsulated
    /// envelope; the transmit options and callback tail are rebuilt.
    pub fn encrypt(&mut self, keys: &SecureKeys, receiver_nonce: &[u8; 8], ctrl_id: NodeId) {
        debug_assert!(self.cc_start > 0, "Only CC messages can be encrypted");

        let cc_end = if self.callback_at > 0 {
            // tx options + callback tail
            self.data.len() - 2
        } else {
            self.data.len() - 1
        };
        let mut inner: Vec<u8> = self.data[self.cc_start..cc_end].to_vec();

        let mut sender_half = [0u8; 8];
        crypto::random_bytes(&mut sender_half);

        let mut iv = [0u8; crypto::BLOCK_SIZE];
        iv[..8].copy_from_slice(&sender_half);
        iv[8..].copy_from_slice(receiver_nonce);

        keys.ofb_apply(&iv, &mut inner);
        let header = [0x81, ctrl_id, self.target, inner.len() as u8];
        let tag = keys.cbc_mac(&iv, &header, &inner);

        let mut envelope = Vec::with_capacity(2 + 8 + inner.len() + 1 + crypto::MAC_SIZE);
        envelope.push(cls::SECURITY);
        envelope.push(0x81);
        envelope.extend_from_slice(&sender_half);
        envelope.extend_from_slice(&inner);
        envelope.push(receiver_nonce[0]);
        envelope.extend_from_slice(&tag);

        // Rebuild: header, target, cc length, envelope, then the existing
        // tail so the callback id survives
        let mut data = Vec::with_capacity(5 + envelope.len() + 2);
        data.extend_from_slice(&self.data[..self.cc_len_at]);
        data.push(envelope.len() as u8);
        data.extend_from_slice(&envelope);
        data.extend_from_slice(&self.data[cc_end..]);

        self.callback_at = if self.callback_at > 0 { data.len() - 1 } else { 0 };
        self.data = data;
        self.seal();
    }

    /// Bumps the retry cost and returns the new value.
    #[inline]
    pub fn bump_cost(&mut self, increment: u32) -> u32 {
        self.send_cost += increment;
        self.send_cost
    }

    #[inline]
    pub fn note_sent(&mut self) {
        self.send_count += 1;
    }

    // Accessors the state machine and helpers drive on

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn target(&self) -> NodeId {
        self.target
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn class_id(&self) -> u8 {
        self.class_id
    }

    #[inline]
    pub fn cmd_id(&self) -> u8 {
        self.cmd_id
    }

    #[inline]
    pub fn is_cc(&self) -> bool {
        self.cc_start > 0
    }

    #[inline]
    pub fn callback_id(&self) -> u8 {
        self.callback_id
    }

    #[inline]
    pub fn needs_callback(&self) -> bool {
        self.needs_callback
    }

    #[inline]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    #[inline]
    pub fn is_ping(&self) -> bool {
        self.is_ping
    }

    #[inline]
    pub fn freq_listener(&self) -> bool {
        self.freq_listener
    }

    #[inline]
    pub fn expected_reply(&self) -> Option<(u8, u8)> {
        self.expect_reply
    }

    #[inline]
    pub fn ack_id(&self) -> u32 {
        self.ack_id
    }

    #[inline]
    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Short digest for trace lines and abort diagnostics.
    pub fn digest(&self) -> String {
        if self.is_cc() {
            format!(
                "func=0x{:02X} tar={} cc=0x{:02X}/0x{:02X} ack_id={} cb=0x{:02X} cost={}",
                self.data[2],
                self.target,
                self.class_id,
                self.cmd_id,
                self.ack_id,
                self.callback_id,
                self.send_cost
            )
        } else {
            format!(
                "func=0x{:02X} ack_id={} cost={}",
                self.data[2], self.ack_id, self.send_cost
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::checksum;

    #[test]
    fn test_command_layout() {
        let mut msg = OutboundMessage::command(0x05, cls::SWITCH_BINARY, 0x01, Priority::Command);
        msg.push(0xFF);
        msg.append_trans_opts();
        msg.append_callback();
        msg.finalize(false, false);

        let data = msg.data();
        // LEN TYPE FUNC TARGET CC_LEN CLASS CMD VALUE TX_OPTS CALLBACK
        assert_eq!(data.len(), 10);
        assert_eq!(data[0], 10);
        assert_eq!(data[1], REQUEST);
        assert_eq!(data[2], func::ZW_SEND_DATA);
        assert_eq!(data[3], 0x05);
        assert_eq!(data[4], 3);
        assert_eq!(data[5], cls::SWITCH_BINARY);
        assert_eq!(data[6], 0x01);
        assert_eq!(data[7], 0xFF);
        assert_eq!(data[8], TRANSMIT_OPTIONS);
        assert_eq!(data[9], msg.callback_id());
        assert!(msg.needs_callback());
    }

    #[test]
    fn test_ping_layout() {
        let msg = OutboundMessage::ping(0x0A, Priority::Command);
        let data = msg.data();

        assert_eq!(data.len(), 8);
        assert_eq!(data[0], 8);
        assert_eq!(data[3], 0x0A);
        assert_eq!(data[4], 1);
        assert_eq!(data[5], cls::NO_OPERATION);
        assert_eq!(data[6], TRANSMIT_OPTIONS);
        assert!(msg.is_ping());
        assert!(msg.needs_callback());
    }

    #[test]
    fn test_callback_ids_nonzero_and_cycling() {
        // The counter is shared with concurrently running tests, so assert
        // the invariants rather than exact sequencing: never zero, never
        // the same id twice in a row, and a healthy spread of values.
        let mut seen = Vec::new();
        for _ in 0..300 {
            let mut msg = OutboundMessage::command(1, cls::BASIC, 0x02, Priority::Query);
            msg.append_trans_opts();
            msg.append_callback();
            msg.finalize(false, false);
            assert_ne!(msg.callback_id(), 0);
            seen.push(msg.callback_id());
        }

        for pair in seen.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }

        let mut distinct = seen.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert!(distinct.len() >= 150);
    }

    #[test]
    fn test_ack_ids_monotonic() {
        let a = OutboundMessage::controller(func::ZW_SET_DEFAULT, Priority::SpecialCmd);
        let b = OutboundMessage::controller(func::ZW_SET_DEFAULT, Priority::SpecialCmd);
        assert!(b.ack_id() > a.ack_id());
    }

    #[test]
    fn test_update_callback_patches_in_place() {
        let mut msg = OutboundMessage::command(2, cls::BASIC, 0x01, Priority::Command);
        msg.push(0x00);
        msg.append_trans_opts();
        msg.append_callback();
        msg.finalize(false, false);

        let before = msg.callback_id();
        let len_before = msg.data().len();
        msg.update_callback();

        assert_ne!(msg.callback_id(), before);
        assert_eq!(msg.data().len(), len_before);
        assert_eq!(*msg.data().last().unwrap(), msg.callback_id());
    }

    #[test]
    fn test_detached_callback_does_not_arm_wait() {
        let mut msg = OutboundMessage::controller(func::ZW_SET_LEARN_MODE, Priority::SpecialCmd);
        msg.push(0x01);
        msg.append_detached_callback();
        msg.finalize(false, false);

        assert_ne!(msg.callback_id(), 0);
        assert!(!msg.needs_callback());
    }

    #[test]
    fn test_encrypt_envelope_shape() {
        use zcore::crypto::SecureKeys;

        let keys = SecureKeys::derive(&[1u8; 16]);
        let receiver_nonce = [0x42u8, 9, 8, 7, 6, 5, 4, 3];

        let mut msg = OutboundMessage::command(0x07, 0x62, 0x01, Priority::Command);
        msg.push(0xFF);
        msg.append_trans_opts();
        msg.append_callback();
        msg.finalize(false, true);
        let callback = msg.callback_id();

        msg.encrypt(&keys, &receiver_nonce, 0x01);

        let data = msg.data();
        assert_eq!(data[0] as usize, data.len());
        assert_eq!(data[3], 0x07);

        let cc_len = data[4] as usize;
        let cc = &data[5..5 + cc_len];
        assert_eq!(cc[0], cls::SECURITY);
        assert_eq!(cc[1], 0x81);
        // sender half (8) + cipher (3) + nonce id + tag (8)
        assert_eq!(cc_len, 2 + 8 + 3 + 1 + 8);
        assert_eq!(cc[2 + 8 + 3], receiver_nonce[0]);

        // Tail survives the rewrite
        assert_eq!(data[data.len() - 2], TRANSMIT_OPTIONS);
        assert_eq!(data[data.len() - 1], callback);

        // The ciphertext decrypts back to the inner command
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&cc[2..10]);
        iv[8..].copy_from_slice(&receiver_nonce);
        let mut cipher = cc[10..13].to_vec();
        keys.ofb_apply(&iv, &mut cipher);
        assert_eq!(cipher, vec![0x62, 0x01, 0xFF]);
    }

    #[test]
    fn test_wire_image_checksums() {
        let mut msg = OutboundMessage::command(0x05, cls::SWITCH_BINARY, 0x01, Priority::Command);
        msg.push(0xFF);
        msg.append_trans_opts();
        msg.append_callback();
        msg.finalize(false, false);

        // The frame writer XORs everything between SOF and checksum
        let sum = checksum(msg.data());
        let folded = msg.data().iter().fold(0xFFu8, |acc, &b| acc ^ b);
        assert_eq!(sum, folded);
    }
}
