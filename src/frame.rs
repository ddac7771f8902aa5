//! Streaming replication message framing.
//!
//! See <https://www.postgresql.org/docs/current/protocol-replication.html>.
//! All multi-byte integers are big-endian, matching the wire format.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BridgeError;

const XLOG_DATA_TAG: u8 = b'w';
const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

const XLOG_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;
const PRIMARY_KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
const STANDBY_STATUS_UPDATE_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// A row-change chunk from the server: the tag byte, the WAL position this
/// chunk starts at, the server's current WAL end, its clock, and the
/// plugin-decoded payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: u64,
    pub wal_end: u64,
    pub server_clock: i64,
    pub payload: Bytes,
}

/// A liveness ping from the server, optionally requesting an immediate reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryKeepalive {
    pub wal_end: u64,
    pub server_clock: i64,
    pub reply_requested: bool,
}

/// Inbound messages the reader can receive on the copy-both stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    XLogData(XLogData),
    PrimaryKeepalive(PrimaryKeepalive),
    /// A tag this codec doesn't know about; carries the raw tag byte so the
    /// caller can log-and-skip without losing visibility into it.
    Unknown(u8),
}

/// Decode one copy-data payload (tag + body, no outer CopyData envelope).
pub fn decode_inbound(buf: &[u8]) -> Result<InboundMessage, BridgeError> {
    let tag = *buf
        .first()
        .ok_or_else(|| BridgeError::MalformedFrame("empty frame".to_string()))?;

    match tag {
        XLOG_DATA_TAG => {
            if buf.len() < XLOG_DATA_HEADER_LEN {
                return Err(BridgeError::MalformedFrame(format!(
                    "XLogData frame too short: {} < {}",
                    buf.len(),
                    XLOG_DATA_HEADER_LEN
                )));
            }
            let mut body = &buf[1..];
            let wal_start = body.get_u64();
            let wal_end = body.get_u64();
            let server_clock = body.get_i64();
            let payload = Bytes::copy_from_slice(body);
            Ok(InboundMessage::XLogData(XLogData {
                wal_start,
                wal_end,
                server_clock,
                payload,
            }))
        }
        PRIMARY_KEEPALIVE_TAG => {
            if buf.len() < PRIMARY_KEEPALIVE_LEN {
                return Err(BridgeError::MalformedFrame(format!(
                    "PrimaryKeepalive frame too short: {} < {}",
                    buf.len(),
                    PRIMARY_KEEPALIVE_LEN
                )));
            }
            let mut body = &buf[1..];
            let wal_end = body.get_u64();
            let server_clock = body.get_i64();
            let reply_requested = body.get_u8() != 0;
            Ok(InboundMessage::PrimaryKeepalive(PrimaryKeepalive {
                wal_end,
                server_clock,
                reply_requested,
            }))
        }
        other => Ok(InboundMessage::Unknown(other)),
    }
}

/// Outbound standby status update: "I have written/flushed/applied through
/// these LSNs". The core always sets all three fields to the same value
/// (the frontier), since there's no separate write/apply stage here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub written_lsn: u64,
    pub flushed_lsn: u64,
    pub applied_lsn: u64,
    pub client_clock: i64,
    pub reply_requested: bool,
}

pub fn encode_standby_status_update(msg: &StandbyStatusUpdate) -> Bytes {
    let mut buf = BytesMut::with_capacity(STANDBY_STATUS_UPDATE_LEN);
    buf.put_u8(STANDBY_STATUS_UPDATE_TAG);
    buf.put_u64(msg.written_lsn);
    buf.put_u64(msg.flushed_lsn);
    buf.put_u64(msg.applied_lsn);
    buf.put_i64(msg.client_clock);
    buf.put_u8(msg.reply_requested as u8);
    buf.freeze()
}

/// Decode a standby status update; used by tests to assert the wire form
/// the reader actually sends, and available for any peer that needs to read
/// its own encoded frames back.
pub fn decode_standby_status_update(buf: &[u8]) -> Result<StandbyStatusUpdate, BridgeError> {
    if buf.len() < STANDBY_STATUS_UPDATE_LEN {
        return Err(BridgeError::MalformedFrame(format!(
            "StandbyStatusUpdate frame too short: {} < {}",
            buf.len(),
            STANDBY_STATUS_UPDATE_LEN
        )));
    }
    if buf[0] != STANDBY_STATUS_UPDATE_TAG {
        return Err(BridgeError::MalformedFrame(format!(
            "unexpected tag for StandbyStatusUpdate: {:#x}",
            buf[0]
        )));
    }
    let mut body = &buf[1..];
    let written_lsn = body.get_u64();
    let flushed_lsn = body.get_u64();
    let applied_lsn = body.get_u64();
    let client_clock = body.get_i64();
    let reply_requested = body.get_u8() != 0;
    Ok(StandbyStatusUpdate {
        written_lsn,
        flushed_lsn,
        applied_lsn,
        client_clock,
        reply_requested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xlogdata_bytes(wal_start: u64, wal_end: u64, server_clock: i64, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(XLOG_DATA_TAG);
        buf.put_u64(wal_start);
        buf.put_u64(wal_end);
        buf.put_i64(server_clock);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn decodes_xlogdata() {
        let raw = xlogdata_bytes(402_348_736, 402_349_000, 42, b"{\"kind\":\"insert\"}");
        let msg = decode_inbound(&raw).unwrap();
        assert_eq!(
            msg,
            InboundMessage::XLogData(XLogData {
                wal_start: 402_348_736,
                wal_end: 402_349_000,
                server_clock: 42,
                payload: Bytes::from_static(b"{\"kind\":\"insert\"}"),
            })
        );
    }

    #[test]
    fn decodes_empty_payload_xlogdata() {
        let raw = xlogdata_bytes(1, 2, 0, b"");
        let msg = decode_inbound(&raw).unwrap();
        match msg {
            InboundMessage::XLogData(d) => assert!(d.payload.is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn rejects_short_xlogdata() {
        let raw = [XLOG_DATA_TAG, 0, 0];
        assert!(matches!(
            decode_inbound(&raw),
            Err(BridgeError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decodes_primary_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(PRIMARY_KEEPALIVE_TAG);
        buf.put_u64(555);
        buf.put_i64(7);
        buf.put_u8(1);
        let msg = decode_inbound(&buf).unwrap();
        assert_eq!(
            msg,
            InboundMessage::PrimaryKeepalive(PrimaryKeepalive {
                wal_end: 555,
                server_clock: 7,
                reply_requested: true,
            })
        );
    }

    #[test]
    fn unknown_tag_is_reported_not_rejected() {
        let raw = [b'x', 1, 2, 3];
        assert_eq!(decode_inbound(&raw).unwrap(), InboundMessage::Unknown(b'x'));
    }

    #[test]
    fn rejects_empty_frame() {
        assert!(matches!(decode_inbound(&[]), Err(BridgeError::MalformedFrame(_))));
    }

    #[test]
    fn standby_status_update_round_trips() {
        let msg = StandbyStatusUpdate {
            written_lsn: 100,
            flushed_lsn: 100,
            applied_lsn: 100,
            client_clock: 123456,
            reply_requested: false,
        };
        let encoded = encode_standby_status_update(&msg);
        let decoded = decode_standby_status_update(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }
}
