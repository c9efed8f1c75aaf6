use crate::cc::TargetProfile;
use crate::frame::InboundFrame;
use crate::message::{OutboundMessage, Priority};
use zcore::{cls, NodeId};

pub const END_POINT_GET: u8 = 0x07;
pub const END_POINT_REPORT: u8 = 0x08;
pub const CAPABILITY_GET: u8 = 0x09;
pub const CAPABILITY_REPORT: u8 = 0x0A;
pub const CMD_ENCAP: u8 = 0x0D;

pub fn endpoint_get(target: NodeId, profile: TargetProfile) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::MULTI_CHANNEL, END_POINT_GET, profile.query_priority());
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::MULTI_CHANNEL, END_POINT_REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

pub fn capability_get(target: NodeId, endpoint: u8, profile: TargetProfile) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::MULTI_CHANNEL, CAPABILITY_GET, profile.query_priority());
    msg.push(endpoint & 0x7F);
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::MULTI_CHANNEL, CAPABILITY_REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Wraps a command for a sub-device end point in the encapsulation the
/// class defines: source end point, target end point, then the inner
/// command.
pub fn encap(
    target: NodeId,
    tar_endpoint: u8,
    inner_class: u8,
    inner_cmd: u8,
    args: &[u8],
    priority: Priority,
    profile: TargetProfile,
) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::MULTI_CHANNEL, CMD_ENCAP, priority);
    // We always send from our root end point
    msg.push(0);
    msg.push(tar_endpoint);
    msg.push(inner_class);
    msg.push(inner_cmd);
    msg.push_bytes(args);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

#[derive(Debug, Eq, PartialEq)]
pub struct EndpointReport {
    pub dynamic: bool,
    pub identical: bool,
    pub count: u8,
}

pub fn parse_endpoint_report(frame: &InboundFrame) -> Option<EndpointReport> {
    match frame.app_cmd() {
        Some((cls::MULTI_CHANNEL, END_POINT_REPORT)) => {
            let args = frame.cc_args();
            if args.len() < 2 {
                return None;
            }
            Some(EndpointReport {
                dynamic: args[0] & 0x80 != 0,
                identical: args[0] & 0x40 != 0,
                count: args[1] & 0x7F,
            })
        }
        _ => None,
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct CapabilityReport {
    pub endpoint: u8,
    pub dynamic: bool,
    pub generic: u8,
    pub specific: u8,
    pub classes: Vec<u8>,
}

pub fn parse_capability_report(frame: &InboundFrame) -> Option<CapabilityReport> {
    match frame.app_cmd() {
        Some((cls::MULTI_CHANNEL, CAPABILITY_REPORT)) => {
            let args = frame.cc_args();
            if args.len() < 3 {
                return None;
            }
            Some(CapabilityReport {
                endpoint: args[0] & 0x7F,
                dynamic: args[0] & 0x80 != 0,
                generic: args[1],
                specific: args[2],
                classes: args[3..].to_vec(),
            })
        }
        _ => None,
    }
}
