use crate::port::SerialLink;
use crate::shared::LinkResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use zcore::crypto::SecureKeys;
use zcore::logging::{debug, Trace};
use zcore::{cls, func, NodeId, ACK, CAN, NAK, REQUEST, RESPONSE, SOF};

// App command handler payload layout: rx status, source node, CC byte
// count, then the CC bytes themselves.
const CC_START: usize = 3;

const BYTE_WRITE_MS: u64 = 100;
const BODY_WRITE_MS: u64 = 250;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameType {
    Ack,
    Nak,
    Cancel,
    TransmitAck,
    Request,
    Response,
    Timeout,
}

/// One completed frame off the wire. Created by the codec; the dispatcher
/// may rewrite the payload in place when it unwraps an encapsulation.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub frame_type: FrameType,
    pub func_id: u8,
    pub payload: Vec<u8>,
    pub secure: bool,
    pub src_endpoint: Option<u8>,
    pub tar_endpoint: Option<u8>,
}

impl InboundFrame {
    #[inline]
    pub fn control(frame_type: FrameType) -> InboundFrame {
        InboundFrame {
            frame_type,
            func_id: 0,
            payload: Vec::new(),
            secure: false,
            src_endpoint: None,
            tar_endpoint: None,
        }
    }

    #[inline]
    pub fn timeout() -> InboundFrame {
        Self::control(FrameType::Timeout)
    }

    /// The class and command ids when this is an application command frame.
    #[inline]
    pub fn app_cmd(&self) -> Option<(u8, u8)> {
        if self.func_id == func::APPLICATION_COMMAND_HANDLER && self.payload.len() >= CC_START + 2 {
            Some((self.payload[CC_START], self.payload[CC_START + 1]))
        } else {
            None
        }
    }

    #[inline]
    pub fn src_node(&self) -> Option<NodeId> {
        if self.func_id == func::APPLICATION_COMMAND_HANDLER && self.payload.len() >= 2 {
            Some(self.payload[1])
        } else {
            None
        }
    }

    /// Callback id of a transmit ack (first payload byte).
    #[inline]
    pub fn callback_id(&self) -> Option<u8> {
        match self.frame_type {
            FrameType::TransmitAck if !self.payload.is_empty() => Some(self.payload[0]),
            FrameType::Request if !self.payload.is_empty() => Some(self.payload[0]),
            _ => None,
        }
    }

    /// Delivery status of a transmit ack: zero is success.
    #[inline]
    pub fn transmit_status(&self) -> Option<u8> {
        match self.frame_type {
            FrameType::TransmitAck if self.payload.len() >= 2 => Some(self.payload[1]),
            _ => None,
        }
    }

    /// The CC bytes (class, command, arguments) of an application command.
    #[inline]
    pub fn cc_bytes(&self) -> &[u8] {
        if self.payload.len() > CC_START {
            &self.payload[CC_START..]
        } else {
            &[]
        }
    }

    /// The argument bytes after the class and command ids.
    #[inline]
    pub fn cc_args(&self) -> &[u8] {
        let cc = self.cc_bytes();
        if cc.len() > 2 {
            &cc[2..]
        } else {
            &[]
        }
    }

    /// Short digest for trace lines.
    pub fn digest(&self) -> String {
        match self.app_cmd() {
            Some((class, cmd)) => format!(
                "{:?} func=0x{:02X} src={} cc=0x{:02X}/0x{:02X} len={}",
                self.frame_type,
                self.func_id,
                self.src_node().unwrap_or(0),
                class,
                cmd,
                self.payload.len()
            ),
            None => format!(
                "{:?} func=0x{:02X} len={}",
                self.frame_type,
                self.func_id,
                self.payload.len()
            ),
        }
    }

    /// Replaces the CC bytes, keeping the app command wrapper intact.
    fn splice_cc(&mut self, inner: &[u8]) {
        let mut payload = Vec::with_capacity(CC_START + inner.len());
        payload.extend_from_slice(&self.payload[..2]);
        payload.push(inner.len() as u8);
        payload.extend_from_slice(inner);
        self.payload = payload;
    }

    /// Decrypts a secure encapsulation in place using the nonce we issued
    /// earlier. On success the frame carries the inner class and command and
    /// is flagged secure. Returns false when the envelope is malformed or
    /// the authentication tag does not match.
    pub fn decrypt_in_place(
        &mut self,
        keys: &SecureKeys,
        receiver_nonce: &[u8; 8],
        ctrl_id: NodeId,
    ) -> bool {
        let (class, cmd) = match self.app_cmd() {
            Some(ids) => ids,
            None => return false,
        };
        if class != cls::SECURITY {
            return false;
        }
        let src = match self.src_node() {
            Some(src) => src,
            None => return false,
        };

        // Envelope: sender IV half (8) | ciphertext | receiver nonce id (1)
        // | auth tag (8)
        let content = self.cc_args();
        if content.len() < 17 {
            return false;
        }
        let cipher_len = content.len() - 17;

        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&content[..8]);
        iv[8..].copy_from_slice(receiver_nonce);

        let mut cipher = content[8..8 + cipher_len].to_vec();
        let expected_tag = &content[9 + cipher_len..];

        let header = [cmd, src, ctrl_id, cipher_len as u8];
        let tag = keys.cbc_mac(&iv, &header, &cipher);
        if tag[..] != expected_tag[..] {
            return false;
        }

        keys.ofb_apply(&iv, &mut cipher);
        if cipher.len() < 2 {
            return false;
        }

        self.splice_cc(&cipher);
        self.secure = true;
        true
    }

    /// Unwraps a multi-channel encapsulation in place, recording the source
    /// and target end point ids.
    pub fn unwrap_multi_channel(&mut self) -> bool {
        let cc = self.cc_bytes().to_vec();
        if cc.len() < 6 {
            return false;
        }

        self.src_endpoint = Some(cc[2]);
        self.tar_endpoint = Some(cc[3]);

        let inner = cc[4..].to_vec();
        self.splice_cc(&inner);
        true
    }

    /// The reply the engine fabricates when a ping completes, so callers can
    /// await ping completions the same way they await any other report.
    pub fn faux_noop_reply(target: NodeId) -> InboundFrame {
        InboundFrame {
            frame_type: FrameType::Request,
            func_id: func::APPLICATION_COMMAND_HANDLER,
            payload: vec![0, target, 2, cls::NO_OPERATION, 0],
            secure: false,
            src_endpoint: None,
            tar_endpoint: None,
        }
    }
}

/// The standard frame checksum: 0xFF XORed with every byte between the SOF
/// and the checksum, exclusive. `data` is exactly those bytes.
#[inline]
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0xFF, |sum, &byte| sum ^ byte)
}

enum ReadState {
    WaitSof,
    Length,
    Type,
    FuncId,
    DataBytes,
    Checksum,
}

/// Reads one frame off the wire. Uses a short window so the caller keeps
/// its loop cadence; once a partial frame is in flight the deadline is
/// extended one time to absorb the tail. A parsed request, response or
/// transmit ack is acked on the wire before returning; a checksum mismatch
/// naks and resyncs.
pub fn read_frame(
    link: &mut dyn SerialLink,
    window_ms: u64,
    extend_ms: u64,
    shutdown: &AtomicBool,
    trace: &Trace,
) -> LinkResult<InboundFrame> {
    let mut state = ReadState::WaitSof;
    let mut extended = false;
    let mut deadline = Instant::now() + Duration::from_millis(window_ms);

    let mut frame_type = FrameType::Timeout;
    let mut func_id = 0u8;
    let mut payload_len = 0usize;
    let mut payload: Vec<u8> = Vec::new();
    let mut sum = 0xFFu8;
    let mut done = false;

    while !done && !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        let remaining = if deadline > now {
            deadline - now
        } else {
            Duration::from_millis(0)
        };

        if let Some(byte) = link.read_byte(remaining)? {
            match state {
                ReadState::WaitSof => match byte {
                    ACK => return Ok(InboundFrame::control(FrameType::Ack)),
                    CAN => return Ok(InboundFrame::control(FrameType::Cancel)),
                    NAK => {
                        if trace.medium() {
                            debug!(trace.log(), "got a NAK byte"; "context" => "read_frame");
                        }
                        return Ok(InboundFrame::control(FrameType::Nak));
                    }
                    SOF => state = ReadState::Length,
                    // Junk byte, keep waiting for a SOF
                    _ => (),
                },
                ReadState::Length => {
                    if byte < 3 {
                        // Shorter than a full header, drop it and complain
                        link.write_all(&[NAK], Duration::from_millis(BYTE_WRITE_MS))?;
                        state = ReadState::WaitSof;
                    } else {
                        payload_len = byte as usize - 3;
                        payload = Vec::with_capacity(payload_len);
                        sum = 0xFF ^ byte;
                        state = ReadState::Type;
                    }
                }
                ReadState::Type => match byte {
                    REQUEST => {
                        frame_type = FrameType::Request;
                        sum ^= byte;
                        state = ReadState::FuncId;
                    }
                    RESPONSE => {
                        frame_type = FrameType::Response;
                        sum ^= byte;
                        state = ReadState::FuncId;
                    }
                    _ => {
                        if trace.medium() {
                            debug!(trace.log(), "bad frame type byte, resyncing";
                                   "context" => "read_frame",
                                   "byte" => byte);
                        }
                        state = ReadState::WaitSof;
                    }
                },
                ReadState::FuncId => {
                    func_id = byte;
                    sum ^= byte;
                    state = if payload_len > 0 {
                        ReadState::DataBytes
                    } else {
                        ReadState::Checksum
                    };
                }
                ReadState::DataBytes => {
                    payload.push(byte);
                    sum ^= byte;
                    if payload.len() == payload_len {
                        state = ReadState::Checksum;
                    }
                }
                ReadState::Checksum => {
                    if sum != byte {
                        if trace.medium() {
                            debug!(trace.log(), "bad checksum, naking";
                                   "context" => "read_frame",
                                   "expected" => sum,
                                   "got" => byte);
                        }
                        link.write_all(&[NAK], Duration::from_millis(BYTE_WRITE_MS))?;
                        state = ReadState::WaitSof;
                    } else {
                        done = true;
                    }
                }
            }
        }

        if !done {
            let now = Instant::now();
            if now >= deadline {
                let mid_frame = !matches!(state, ReadState::WaitSof);
                if mid_frame && !extended {
                    deadline = now + Duration::from_millis(extend_ms);
                    extended = true;
                } else {
                    break;
                }
            }
        }
    }

    if !done {
        return Ok(InboundFrame::timeout());
    }

    // The second, end-to-end receipt ack for SEND_DATA arrives marked as a
    // SEND_DATA request with a four byte payload
    if func_id == func::ZW_SEND_DATA && payload_len == 4 {
        frame_type = FrameType::TransmitAck;
    }

    // Ack anything that expects one before handing the frame up, so the
    // timing cannot slip
    if matches!(
        frame_type,
        FrameType::TransmitAck | FrameType::Request | FrameType::Response
    ) {
        link.write_all(&[ACK], Duration::from_millis(BYTE_WRITE_MS))?;
    }

    Ok(InboundFrame {
        frame_type,
        func_id,
        payload,
        secure: false,
        src_endpoint: None,
        tar_endpoint: None,
    })
}

/// Writes one framed message: SOF, the message bytes, then the checksum
/// computed over them. `data` starts with its own length byte. Failures
/// are surfaced to the caller, which owns the retry and port recovery
/// policy.
pub fn write_frame(link: &mut dyn SerialLink, data: &[u8]) -> LinkResult<()> {
    link.write_all(&[SOF], Duration::from_millis(BYTE_WRITE_MS))?;
    link.write_all(data, Duration::from_millis(BODY_WRITE_MS))?;
    link.write_all(&[checksum(data)], Duration::from_millis(BYTE_WRITE_MS))?;
    Ok(())
}
