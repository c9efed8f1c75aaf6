//! Builders for the security command class. The nonce exchange and the
//! encapsulation envelope live in the transmit state machine; what is here
//! is the frame shapes.

use crate::frame::InboundFrame;
use crate::message::{OutboundMessage, Priority};
use zcore::crypto::NONCE_SIZE;
use zcore::{cls, NodeId};

pub const COMMANDS_SUPPORTED_GET: u8 = 0x02;
pub const COMMANDS_SUPPORTED_REPORT: u8 = 0x03;
pub const SCHEME_GET: u8 = 0x04;
pub const SCHEME_REPORT: u8 = 0x05;
pub const NETWORK_KEY_SET: u8 = 0x06;
pub const NETWORK_KEY_VERIFY: u8 = 0x07;
pub const SCHEME_INHERIT: u8 = 0x08;
pub const NONCE_GET: u8 = 0x40;
pub const NONCE_REPORT: u8 = 0x80;
pub const MESSAGE_ENCAP: u8 = 0x81;
pub const MESSAGE_ENCAP_NONCE_GET: u8 = 0xC1;

/// Asks the target for a nonce so we can encrypt toward it. Always at
/// nonce priority; nonces have very limited lifetimes.
pub fn nonce_get(target: NodeId) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::SECURITY, NONCE_GET, Priority::Nonce);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(false, false);
    msg
}

/// Hands a freshly issued nonce to the node that asked for one.
pub fn nonce_report(target: NodeId, nonce: &[u8; NONCE_SIZE]) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::SECURITY, NONCE_REPORT, Priority::Nonce);
    msg.push_bytes(nonce);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(false, false);
    msg
}

/// Scheme negotiation during inclusion. Sent in the clear; byte zero is
/// the scheme-0 request.
pub fn scheme_get(target: NodeId) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::SECURITY, SCHEME_GET, Priority::Security);
    msg.push(0);
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::SECURITY, SCHEME_REPORT);
    msg.finalize(false, false);
    msg
}

pub fn scheme_inherit(target: NodeId) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::SECURITY, SCHEME_INHERIT, Priority::Security);
    msg.push(0);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(false, true);
    msg
}

/// Delivers the network key. Encrypted with the keys derived from the
/// all-zero key during inclusion, which the engine handles like any other
/// secure send.
pub fn network_key_set(target: NodeId, key: &[u8; 16]) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::SECURITY, NETWORK_KEY_SET, Priority::Security);
    msg.push_bytes(key);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(false, true);
    msg
}

pub fn network_key_verify(target: NodeId) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::SECURITY, NETWORK_KEY_VERIFY, Priority::Security);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(false, true);
    msg
}

pub fn commands_supported_get(target: NodeId) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::SECURITY, COMMANDS_SUPPORTED_GET, Priority::Security);
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::SECURITY, COMMANDS_SUPPORTED_REPORT);
    msg.finalize(false, true);
    msg
}

/// Our own answer to a commands-supported query: report counter zero, then
/// the advertised classes.
pub fn commands_supported_report(target: NodeId, classes: &[u8]) -> OutboundMessage {
    let mut msg = OutboundMessage::command(
        target,
        cls::SECURITY,
        COMMANDS_SUPPORTED_REPORT,
        Priority::Reply,
    );
    msg.push(0);
    msg.push_bytes(classes);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(false, true);
    msg
}

pub fn parse_scheme_report(frame: &InboundFrame) -> Option<u8> {
    match frame.app_cmd() {
        Some((cls::SECURITY, SCHEME_REPORT)) => frame.cc_args().first().copied(),
        _ => None,
    }
}

pub fn parse_commands_supported_report(frame: &InboundFrame) -> Option<(u8, Vec<u8>)> {
    match frame.app_cmd() {
        Some((cls::SECURITY, COMMANDS_SUPPORTED_REPORT)) => {
            let args = frame.cc_args();
            let to_follow = *args.first()?;
            Some((to_follow, args[1..].to_vec()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;
    use zcore::func;

    #[test]
    fn test_nonce_get_shape() {
        let msg = nonce_get(0x07);
        let data = msg.data();

        assert_eq!(msg.priority(), Priority::Nonce);
        assert_eq!(data[4], 2);
        assert_eq!(data[5], cls::SECURITY);
        assert_eq!(data[6], NONCE_GET);
        assert!(msg.needs_callback());
        assert!(!msg.is_secure());
    }

    #[test]
    fn test_nonce_report_carries_nonce() {
        let nonce = [0x42u8, 1, 2, 3, 4, 5, 6, 7];
        let msg = nonce_report(0x09, &nonce);
        let data = msg.data();

        assert_eq!(data[4], 10);
        assert_eq!(&data[7..15], &nonce);
        // A nonce report itself is never encrypted
        assert!(!msg.is_secure());
    }

    #[test]
    fn test_network_key_set_is_secure() {
        let key = [0x11u8; 16];
        let msg = network_key_set(0x03, &key);
        assert!(msg.is_secure());
        assert_eq!(msg.data()[4], 18);
    }

    #[test]
    fn test_parse_commands_supported_report() {
        let frame = InboundFrame {
            frame_type: FrameType::Request,
            func_id: func::APPLICATION_COMMAND_HANDLER,
            payload: vec![0, 5, 6, cls::SECURITY, COMMANDS_SUPPORTED_REPORT, 0, 0x25, 0x72, 0x86],
            secure: true,
            src_endpoint: None,
            tar_endpoint: None,
        };

        let (to_follow, classes) = parse_commands_supported_report(&frame).unwrap();
        assert_eq!(to_follow, 0);
        assert_eq!(classes, vec![0x25, 0x72, 0x86]);
    }
}
