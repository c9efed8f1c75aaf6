use crate::cc::TargetProfile;
use crate::frame::InboundFrame;
use crate::message::OutboundMessage;
use zcore::{cls, NodeId};

pub const SET: u8 = 0x01;
pub const GET: u8 = 0x02;
pub const REPORT: u8 = 0x03;
pub const REMOVE: u8 = 0x04;
pub const GROUPINGS_GET: u8 = 0x05;
pub const GROUPINGS_REPORT: u8 = 0x06;

// Separates node ids from (node, end point) pairs in the multi-channel
// variant
const ENDPOINT_MARKER: u8 = 0x00;

pub fn set(target: NodeId, group: u8, nodes: &[NodeId], profile: TargetProfile) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::ASSOCIATION, SET, profile.command_priority());
    msg.push(group);
    msg.push_bytes(nodes);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

pub fn remove(target: NodeId, group: u8, nodes: &[NodeId], profile: TargetProfile) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::ASSOCIATION, REMOVE, profile.command_priority());
    msg.push(group);
    msg.push_bytes(nodes);
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Queries the members of one association group.
pub fn get(target: NodeId, group: u8, profile: TargetProfile) -> OutboundMessage {
    let mut msg = OutboundMessage::command(target, cls::ASSOCIATION, GET, profile.query_priority());
    msg.push(group);
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::ASSOCIATION, REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Queries how many association groups the node supports.
pub fn groupings_get(target: NodeId, profile: TargetProfile) -> OutboundMessage {
    let mut msg =
        OutboundMessage::command(target, cls::ASSOCIATION, GROUPINGS_GET, profile.query_priority());
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::ASSOCIATION, GROUPINGS_REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

/// Multi-channel association set: plain node ids first, then the marker,
/// then (node, end point) pairs.
pub fn mc_set(
    target: NodeId,
    group: u8,
    endpoints: &[(NodeId, u8)],
    profile: TargetProfile,
) -> OutboundMessage {
    let mut msg = OutboundMessage::command(
        target,
        cls::MULTI_CHANNEL_ASSOCIATION,
        SET,
        profile.command_priority(),
    );
    msg.push(group);
    msg.push(ENDPOINT_MARKER);
    for &(node, endpoint) in endpoints {
        msg.push(node);
        msg.push(endpoint);
    }
    msg.append_trans_opts();
    msg.append_callback();
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

pub fn mc_get(target: NodeId, group: u8, profile: TargetProfile) -> OutboundMessage {
    let mut msg = OutboundMessage::command(
        target,
        cls::MULTI_CHANNEL_ASSOCIATION,
        GET,
        profile.query_priority(),
    );
    msg.push(group);
    msg.append_trans_opts();
    msg.append_null_callback();
    msg.expect_reply(cls::MULTI_CHANNEL_ASSOCIATION, REPORT);
    msg.finalize(profile.freq_listener, profile.secure);
    msg
}

#[derive(Debug, Eq, PartialEq)]
pub struct AssociationReport {
    pub group: u8,
    pub max_nodes: u8,
    pub reports_to_follow: u8,
    pub nodes: Vec<NodeId>,
}

pub fn parse_report(frame: &InboundFrame) -> Option<AssociationReport> {
    match frame.app_cmd() {
        Some((cls::ASSOCIATION, REPORT)) | Some((cls::MULTI_CHANNEL_ASSOCIATION, REPORT)) => {
            let args = frame.cc_args();
            if args.len() < 3 {
                return None;
            }
            Some(AssociationReport {
                group: args[0],
                max_nodes: args[1],
                reports_to_follow: args[2],
                nodes: args[3..].to_vec(),
            })
        }
        _ => None,
    }
}

pub fn parse_groupings_report(frame: &InboundFrame) -> Option<u8> {
    match frame.app_cmd() {
        Some((cls::ASSOCIATION, GROUPINGS_REPORT))
        | Some((cls::MULTI_CHANNEL_ASSOCIATION, GROUPINGS_REPORT)) => {
            frame.cc_args().first().copied()
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
    fn test_set_layout() {
        let msg = set(0x10, 1, &[0x01, 0x05], TargetProfile::default());
        let data = msg.data();
        assert_eq!(&data[7..10], &[1, 0x01, 0x05]);
    }

    #[test]
    fn test_mc_set_inserts_marker() {
        let msg = mc_set(0x10, 2, &[(0x05, 1), (0x05, 2)], TargetProfile::default());
        let data = msg.data();
        assert_eq!(data[5], cls::MULTI_CHANNEL_ASSOCIATION);
        assert_eq!(&data[7..13], &[2, ENDPOINT_MARKER, 0x05, 1, 0x05, 2]);
    }

    #[test]
    fn test_parse_report() {
        let frame = InboundFrame {
            frame_type: FrameType::Request,
            func_id: func::APPLICATION_COMMAND_HANDLER,
            payload: vec![0, 0x10, 7, cls::ASSOCIATION, REPORT, 1, 5, 0, 0x01, 0x07],
            secure: false,
            src_endpoint: None,
            tar_endpoint: None,
        };

        assert_eq!(
            parse_report(&frame),
            Some(AssociationReport {
                group: 1,
                max_nodes: 5,
                reports_to_follow: 0,
                nodes: vec![0x01, 0x07],
            })
        );
    }
}
