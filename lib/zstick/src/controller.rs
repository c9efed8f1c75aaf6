//! One-shot controller primitives used at connect time and by the
//! inclusion workflow. All of these run on the driver thread against the
//! public engine surface; the quiet connect-time wire makes the simple
//! await-matching-frame policy safe.

use crate::bridge::WaitOutcome;
use crate::frame::{FrameType, InboundFrame};
use crate::message::{OutboundMessage, Priority};
use crate::shared::{ErrorType, LinkError, LinkResult};
use crate::stick::Stick;
use byteorder::{BigEndian, ByteOrder};
use std::thread;
use std::time::{Duration, Instant};
use zcore::{cls, devtype, func, NodeId, NODE_BROADCAST, SUC_FUNC_BASIC};

const CTRL_TIMEOUT: Duration = Duration::from_millis(3000);
const RESET_TIMEOUT: Duration = Duration::from_millis(4000);

// Stick-side serial timeouts, in 10 ms units: 3.5 s for the ack (our own
// per-state deadlines are slightly longer), 500 ms between bytes. The ack
// value exceeds the one byte wire field and is truncated on send.
const ACK_TIMEOUT_10MS: u16 = 350;
const BYTE_TIMEOUT_10MS: u8 = 50;

/// Identity and capabilities of the attached controller.
#[derive(Debug, Clone)]
pub struct ControllerInfo {
    pub home_id: u32,
    pub node_id: NodeId,
    pub library_version: String,
    pub library_type: u8,
    pub app_version: (u8, u8),
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
}

impl Stick {
    /// Programs the stick's own serial timeouts. Done once at connect,
    /// before anything else goes out.
    pub fn set_serial_timeouts(&self) -> LinkResult<()> {
        let mut msg = OutboundMessage::controller(func::SERIAL_API_SET_TIMEOUTS, Priority::SpecialCmd);
        msg.push(ACK_TIMEOUT_10MS as u8);
        msg.push(BYTE_TIMEOUT_10MS);
        msg.finalize(false, false);

        self.send_await_response(msg, func::SERIAL_API_SET_TIMEOUTS, CTRL_TIMEOUT)?;
        Ok(())
    }

    /// Queries home id, our node id, library version and the product
    /// identity off the controller.
    pub fn query_controller_info(&self) -> LinkResult<ControllerInfo> {
        let mut msg = OutboundMessage::controller(func::ZW_MEMORY_GET_ID, Priority::SpecialCmd);
        msg.finalize(false, false);
        let ids = self.send_await_response(msg, func::ZW_MEMORY_GET_ID, CTRL_TIMEOUT)?;
        if ids.payload.len() < 5 {
            return Err(LinkError::Fatal(ErrorType::BadFraming));
        }
        let home_id = BigEndian::read_u32(&ids.payload[0..4]);
        let node_id = ids.payload[4];

        let mut msg = OutboundMessage::controller(func::ZW_GET_VERSION, Priority::SpecialCmd);
        msg.finalize(false, false);
        let version = self.send_await_response(msg, func::ZW_GET_VERSION, CTRL_TIMEOUT)?;
        let (library_version, library_type) = parse_version_payload(&version.payload);

        let mut msg = OutboundMessage::controller(func::SERIAL_API_GET_CAPABILITIES, Priority::SpecialCmd);
        msg.finalize(false, false);
        let caps = self.send_await_response(msg, func::SERIAL_API_GET_CAPABILITIES, CTRL_TIMEOUT)?;
        if caps.payload.len() < 8 {
            return Err(LinkError::Fatal(ErrorType::BadFraming));
        }

        let info = ControllerInfo {
            home_id,
            node_id,
            library_version,
            library_type,
            app_version: (caps.payload[0], caps.payload[1]),
            manufacturer_id: BigEndian::read_u16(&caps.payload[2..4]),
            product_type: BigEndian::read_u16(&caps.payload[4..6]),
            product_id: BigEndian::read_u16(&caps.payload[6..8]),
        };

        // The secure envelope authenticates against our node id
        self.set_ctrl_id(info.node_id);
        Ok(info)
    }

    /// Enters or leaves learn mode. The completion callback can take many
    /// seconds, so the callback id is detached: the engine does not block
    /// on it, the caller watches the inbound stream for the learn state
    /// requests carrying the returned id.
    pub fn set_learn_mode(&self, enable: bool) -> LinkResult<u8> {
        let mut msg = OutboundMessage::controller(func::ZW_SET_LEARN_MODE, Priority::SpecialCmd);
        msg.push(if enable { 0x01 } else { 0x00 });
        if enable {
            msg.append_detached_callback();
        } else {
            msg.append_null_callback();
        }
        msg.finalize(false, false);
        let callback_id = msg.callback_id();

        match self.send_sync(msg, CTRL_TIMEOUT) {
            WaitOutcome::Success => Ok(callback_id),
            WaitOutcome::Failure => Err(LinkError::Fatal(ErrorType::RetryExhausted)),
            WaitOutcome::TimedOut => Err(LinkError::Fatal(ErrorType::Timeout)),
        }
    }

    /// Factory resets the controller and waits for its completion
    /// callback.
    pub fn set_default(&self) -> LinkResult<()> {
        let mut msg = OutboundMessage::controller(func::ZW_SET_DEFAULT, Priority::SpecialCmd);
        msg.append_detached_callback();
        msg.finalize(false, false);

        match self.send_sync(msg, CTRL_TIMEOUT) {
            WaitOutcome::Success => (),
            WaitOutcome::Failure => return Err(LinkError::Fatal(ErrorType::RetryExhausted)),
            WaitOutcome::TimedOut => return Err(LinkError::Fatal(ErrorType::Timeout)),
        }

        self.await_request(func::ZW_SET_DEFAULT, RESET_TIMEOUT)?;
        Ok(())
    }

    /// Declares our device type and advertised classes. In secure mode
    /// only the security class is shown; everything else moves behind the
    /// secure commands-supported report. A fresh NIF broadcast follows.
    pub fn set_application_node_info(&self, secure: bool) -> LinkResult<()> {
        let mut msg =
            OutboundMessage::controller(func::SERIAL_API_APPL_NODE_INFORMATION, Priority::SpecialCmd);
        msg.push(0x01);
        msg.push(devtype::GENERIC_STATIC_CONTROLLER);
        msg.push(devtype::SPECIFIC_PC_CONTROLLER);
        if secure {
            msg.push(1);
            msg.push(cls::SECURITY);
        } else {
            msg.push(2);
            msg.push(cls::SECURITY);
            msg.push(cls::MANUFACTURER_SPECIFIC);
        }
        msg.finalize(false, false);
        self.enqueue(msg);

        self.broadcast_node_info()?;

        // No transmission callback to wait on for a broadcast; give the
        // network a moment before anything else goes out
        thread::sleep(Duration::from_millis(2000));
        Ok(())
    }

    /// Broadcasts our node information frame.
    pub fn broadcast_node_info(&self) -> LinkResult<()> {
        let mut msg =
            OutboundMessage::controller(func::ZW_SEND_NODE_INFORMATION, Priority::SpecialCmd);
        msg.push(NODE_BROADCAST);
        msg.push(zcore::TRANSMIT_OPTIONS);
        msg.append_null_callback();
        msg.finalize(false, false);

        match self.send_sync(msg, CTRL_TIMEOUT) {
            WaitOutcome::Success => Ok(()),
            WaitOutcome::Failure => Err(LinkError::Fatal(ErrorType::RetryExhausted)),
            WaitOutcome::TimedOut => Err(LinkError::Fatal(ErrorType::Timeout)),
        }
    }

    /// Which node is the static update controller, zero when there is
    /// none.
    pub fn query_suc_node_id(&self) -> LinkResult<NodeId> {
        let mut msg = OutboundMessage::controller(func::ZW_GET_SUC_NODE_ID, Priority::SpecialCmd);
        msg.finalize(false, false);

        let reply = self.send_await_response(msg, func::ZW_GET_SUC_NODE_ID, CTRL_TIMEOUT)?;
        reply
            .payload
            .first()
            .copied()
            .ok_or(LinkError::Fatal(ErrorType::BadFraming))
    }

    /// Claims the SUC role for ourselves. Done after inclusion when the
    /// network has no SUC yet.
    pub fn claim_suc_role(&self, our_node: NodeId) -> LinkResult<()> {
        let mut msg = OutboundMessage::controller(func::ZW_ENABLE_SUC, Priority::SpecialCmd);
        msg.push(0x01);
        msg.push(SUC_FUNC_BASIC);
        msg.finalize(false, false);
        self.send_await_response(msg, func::ZW_ENABLE_SUC, CTRL_TIMEOUT)?;

        let mut msg = OutboundMessage::controller(func::ZW_SET_SUC_NODE_ID, Priority::SpecialCmd);
        msg.push(our_node);
        msg.push(0x01);
        msg.push(0x00);
        msg.push(SUC_FUNC_BASIC);
        msg.append_null_callback();
        msg.finalize(false, false);
        self.send_await_response(msg, func::ZW_SET_SUC_NODE_ID, CTRL_TIMEOUT)?;
        Ok(())
    }

    /// Announces our manufacturer ids to the network. Broadcast rather
    /// than addressed to the master: some lock devices refuse secure
    /// traffic until they have seen it this way.
    pub fn announce_manufacturer_ids(&self, man_ids: u64) -> LinkResult<()> {
        let msg = crate::cc::manufacturer::report(NODE_BROADCAST, man_ids, false);
        match self.send_sync(msg, CTRL_TIMEOUT) {
            WaitOutcome::Success => Ok(()),
            WaitOutcome::Failure => Err(LinkError::Fatal(ErrorType::RetryExhausted)),
            WaitOutcome::TimedOut => Err(LinkError::Fatal(ErrorType::Timeout)),
        }
    }

    /// Sends a controller message and waits for the Response frame with
    /// the same function id. Unrelated frames arriving meanwhile are
    /// dropped; these primitives run on an otherwise quiet wire.
    fn send_await_response(
        &self,
        msg: OutboundMessage,
        func_id: u8,
        timeout: Duration,
    ) -> LinkResult<InboundFrame> {
        match self.send_sync(msg, timeout) {
            WaitOutcome::Success => (),
            WaitOutcome::Failure => return Err(LinkError::Fatal(ErrorType::RetryExhausted)),
            WaitOutcome::TimedOut => return Err(LinkError::Fatal(ErrorType::Timeout)),
        }
        self.await_frame(FrameType::Response, func_id, timeout)
    }

    fn await_request(&self, func_id: u8, timeout: Duration) -> LinkResult<InboundFrame> {
        self.await_frame(FrameType::Request, func_id, timeout)
    }

    fn await_frame(
        &self,
        frame_type: FrameType,
        func_id: u8,
        timeout: Duration,
    ) -> LinkResult<InboundFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::Fatal(ErrorType::Timeout));
            }

            if let Some(frame) = self.next_inbound(deadline - now) {
                if frame.frame_type == frame_type && frame.func_id == func_id {
                    return Ok(frame);
                }
            }
        }
    }
}

/// The version payload is a zero terminated ASCII string followed by the
/// library type byte.
fn parse_version_payload(payload: &[u8]) -> (String, u8) {
    let text_end = payload
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or_else(|| payload.len().saturating_sub(1));

    let text = payload[..text_end]
        .iter()
        .map(|&byte| byte as char)
        .collect();
    let library_type = payload.last().copied().unwrap_or(0);
    (text, library_type)
}
