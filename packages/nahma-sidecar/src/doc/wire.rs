//! Binary framing for the document endpoint.
//!
//! The relay is framing-agnostic about CRDT content: every payload is
//! opaque bytes. The one-byte tag only routes the frame:
//!
//! ```text
//! ┌──────┬─────────────────────────────────────────────────────────┐
//! │ 0x00 │ sync-request  — client state vector (opaque)            │
//! │ 0x01 │ sync-reply    — diff: [u32 len ‖ update]* concatenated  │
//! │ 0x02 │ sync-ack      — handshake complete                      │
//! │ 0x03 │ update        — one CRDT update, appended + fanned out  │
//! │ 0x04 │ awareness     — ephemeral presence, fanned out only     │
//! │ 0x05 │ error         — JSON error{code, message} payload       │
//! └──────┴─────────────────────────────────────────────────────────┘
//! ```
//!
//! Frames shorter than [`MIN_FRAME_LEN`] are rejected before decoding.

pub const SYNC_REQUEST: u8 = 0x00;
pub const SYNC_REPLY: u8 = 0x01;
pub const SYNC_ACK: u8 = 0x02;
pub const UPDATE: u8 = 0x03;
pub const AWARENESS: u8 = 0x04;
pub const ERROR: u8 = 0x05;

/// Minimum length of any inbound frame (tag + at least one payload byte).
pub const MIN_FRAME_LEN: usize = 2;

/// A decoded inbound frame. Payload slices borrow from the wire buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum DocFrame<'a> {
    SyncRequest(&'a [u8]),
    SyncAck,
    Update(&'a [u8]),
    Awareness(&'a [u8]),
}

/// Decode an inbound frame. Returns `None` for short or unknown frames.
pub fn decode(frame: &[u8]) -> Option<DocFrame<'_>> {
    if frame.len() < MIN_FRAME_LEN {
        return None;
    }
    let body = &frame[1..];
    match frame[0] {
        SYNC_REQUEST => Some(DocFrame::SyncRequest(body)),
        SYNC_ACK => Some(DocFrame::SyncAck),
        UPDATE => Some(DocFrame::Update(body)),
        AWARENESS => Some(DocFrame::Awareness(body)),
        _ => None,
    }
}

/// Build a sync-reply: every log update, length-prefixed, in one frame.
/// A client with partial state simply re-applies what it already has —
/// convergence absorbs duplicates.
pub fn encode_sync_reply(updates: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = updates.iter().map(|u| 4 + u.len()).sum();
    let mut frame = Vec::with_capacity(1 + total.max(1));
    frame.push(SYNC_REPLY);
    for update in updates {
        frame.extend_from_slice(&(update.len() as u32).to_be_bytes());
        frame.extend_from_slice(update);
    }
    if frame.len() < MIN_FRAME_LEN {
        // An empty log still produces a well-formed (padded) reply
        frame.push(0);
    }
    frame
}

/// Split a sync-reply back into its updates (client side, and tests).
pub fn decode_sync_reply(frame: &[u8]) -> Option<Vec<Vec<u8>>> {
    if frame.is_empty() || frame[0] != SYNC_REPLY {
        return None;
    }
    let mut body = &frame[1..];
    // Empty-log padding byte
    if body.len() == 1 && body[0] == 0 {
        return Some(Vec::new());
    }

    let mut updates = Vec::new();
    while !body.is_empty() {
        if body.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
        body = &body[4..];
        if body.len() < len {
            return None;
        }
        updates.push(body[..len].to_vec());
        body = &body[len..];
    }
    Some(updates)
}

/// The two-byte sync-ack frame.
pub fn encode_sync_ack() -> Vec<u8> {
    vec![SYNC_ACK, 0]
}

/// Tagged update frame around a raw payload.
pub fn encode_update(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(UPDATE);
    frame.extend_from_slice(payload);
    frame
}

/// Tagged awareness frame around a raw payload.
pub fn encode_awareness(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(AWARENESS);
    frame.extend_from_slice(payload);
    frame
}

/// Binary error frame: tag + JSON `{code, message}`.
pub fn encode_error(code: crate::protocol::ErrorCode, message: &str) -> Vec<u8> {
    let payload = serde_json::json!({ "code": code, "message": message });
    let mut frame = vec![ERROR];
    frame.extend_from_slice(payload.to_string().as_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_short_frames() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[UPDATE]).is_none());
        assert!(decode(&[UPDATE, 1]).is_some());
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(decode(&[0x7f, 1, 2, 3]).is_none());
    }

    #[test]
    fn test_update_round_trip() {
        let frame = encode_update(b"crdt-bytes");
        match decode(&frame).unwrap() {
            DocFrame::Update(body) => assert_eq!(body, b"crdt-bytes"),
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_sync_reply_round_trip() {
        let updates = vec![b"first".to_vec(), b"second-update".to_vec(), vec![0u8; 300]];
        let frame = encode_sync_reply(&updates);

        assert_eq!(frame[0], SYNC_REPLY);
        assert_eq!(decode_sync_reply(&frame).unwrap(), updates);
    }

    #[test]
    fn test_empty_sync_reply_meets_min_length() {
        let frame = encode_sync_reply(&[]);
        assert!(frame.len() >= MIN_FRAME_LEN);
        assert_eq!(decode_sync_reply(&frame).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn test_truncated_sync_reply_fails() {
        let updates = vec![b"data".to_vec()];
        let frame = encode_sync_reply(&updates);
        assert!(decode_sync_reply(&frame[..frame.len() - 1]).is_none());
    }

    #[test]
    fn test_sync_ack_shape() {
        let frame = encode_sync_ack();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        assert_eq!(decode(&frame).unwrap(), DocFrame::SyncAck);
    }

    #[test]
    fn test_error_frame_carries_json() {
        let frame = encode_error(crate::protocol::ErrorCode::PermissionDenied, "no");
        assert_eq!(frame[0], ERROR);
        let json: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(json["code"], "PERMISSION_DENIED");
    }
}
