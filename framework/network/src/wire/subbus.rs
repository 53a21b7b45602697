/*! Sub-bus packet framing.

A packet is `{P_LENGTH, message octets…, CRC}`; the length octet counts
everything after itself. A first octet below the minimum message size
is a single-octet status packet carrying no CRC.
*/

use super::crc::{crc8, crc8_update};
use super::{Error, Message, Result};
use bidib_defs::{MsgType, SUBBUS_MAX_PAYLOAD};
use heapless::Deque;

/// Octets of framing around the message payload.
pub const FRAME_OVERHEAD: usize = 2;

/// Largest complete frame.
pub const MAX_FRAME: usize = SUBBUS_MAX_PAYLOAD + FRAME_OVERHEAD;

/// Total octet count of a packet whose first octet is `length`.
pub const fn declared_total(length: u8) -> usize {
    if length < 4 {
        1
    } else {
        length as usize + 1
    }
}

/// Frame message octets into `buf`; returns the frame length.
pub fn emit_frame(payload: &[u8], buf: &mut [u8]) -> Result<usize> {
    if payload.len() > SUBBUS_MAX_PAYLOAD || buf.len() < payload.len() + FRAME_OVERHEAD {
        return Err(Error);
    }
    buf[0] = (payload.len() + 1) as u8;
    buf[1..1 + payload.len()].copy_from_slice(payload);
    buf[1 + payload.len()] = crc8(&buf[..1 + payload.len()]);
    Ok(payload.len() + FRAME_OVERHEAD)
}

/// Check length and CRC of a received frame, returning the message
/// octets. The running CRC over a whole valid frame is zero.
pub fn verify_frame(frame: &[u8]) -> Result<&[u8]> {
    let &length = frame.first().ok_or(Error)?;
    if declared_total(length) != frame.len() || length < 4 {
        return Err(Error);
    }
    if crc8(frame) != 0 {
        return Err(Error);
    }
    Ok(&frame[1..frame.len() - 1])
}

/// Outcome of packing the head of a transmit queue into one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Packed {
    /// Nothing queued.
    Empty,
    /// A frame was built from the first `count` queued messages.
    Frame { len: usize, count: usize },
    /// The front message cannot fit any frame and must be discarded.
    Oversize,
}

/// Build one outbound frame from the front of `queue` without
/// consuming it; the caller pops `count` entries once the frame made
/// it over the wire.
///
/// `LocalLogonAck` always travels alone: it neither joins an earlier
/// message nor takes company.
pub fn pack<const N: usize>(queue: &Deque<Message, N>, buf: &mut [u8]) -> Packed {
    let mut used = 0;
    let mut count = 0;
    for msg in queue.iter() {
        let len = msg.wire_len();
        if len > SUBBUS_MAX_PAYLOAD {
            return if count == 0 {
                Packed::Oversize
            } else {
                finish(buf, used, count)
            };
        }
        let alone = msg.msg_type() == Some(MsgType::LocalLogonAck);
        if (alone && count > 0) || used + len > SUBBUS_MAX_PAYLOAD {
            break;
        }
        match msg.emit(&mut buf[1 + used..]) {
            Ok(n) => used += n,
            Err(_) => break,
        }
        count += 1;
        if alone {
            break;
        }
    }
    if count == 0 {
        return Packed::Empty;
    }
    finish(buf, used, count)
}

fn finish(buf: &mut [u8], used: usize, count: usize) -> Packed {
    buf[0] = (used + 1) as u8;
    let crc = buf[..1 + used].iter().fold(0, |c, &b| crc8_update(c, b));
    buf[1 + used] = crc;
    Packed::Frame {
        len: used + FRAME_OVERHEAD,
        count,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::unpack_all;
    use bidib_core::addr::AddressStack;

    fn msg(opcode: MsgType, payload: &[u8]) -> Message {
        Message::new(AddressStack::from_hops(&[1]), opcode, payload)
    }

    #[test]
    fn frame_roundtrip() {
        let mut wire = [0u8; MAX_FRAME];
        let payload = [4u8, 1, 0, 0, 0x01];
        let n = emit_frame(&payload, &mut wire).unwrap();
        assert_eq!(n, payload.len() + FRAME_OVERHEAD);
        assert_eq!(verify_frame(&wire[..n]).unwrap(), &payload);
    }

    #[test]
    fn verify_rejects_corruption() {
        let mut wire = [0u8; MAX_FRAME];
        let n = emit_frame(&[4u8, 1, 0, 0, 0x01], &mut wire).unwrap();
        let mut bad = wire;
        bad[2] ^= 0x40;
        assert!(verify_frame(&bad[..n]).is_err());
        assert!(verify_frame(&wire[..n - 1]).is_err());
        assert!(verify_frame(&[]).is_err());
    }

    #[test]
    fn pack_coalesces_until_full() {
        let mut queue: Deque<Message, 8> = Deque::new();
        for _ in 0..8 {
            queue.push_back(msg(MsgType::SysGetMagic, &[])).unwrap();
        }
        let mut buf = [0u8; MAX_FRAME];
        // each message is 5 octets on the wire; 12 would exceed 62
        match pack(&queue, &mut buf) {
            Packed::Frame { len, count } => {
                assert_eq!(count, 8);
                assert_eq!(len, 8 * 5 + FRAME_OVERHEAD);
                let inner = verify_frame(&buf[..len]).unwrap();
                assert_eq!(unpack_all(inner).unwrap().len(), 8);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn pack_respects_payload_cap() {
        let mut queue: Deque<Message, 4> = Deque::new();
        // 30 octets payload -> 35 octets on the wire
        queue.push_back(msg(MsgType::String, &[0u8; 30])).unwrap();
        queue.push_back(msg(MsgType::String, &[0u8; 30])).unwrap();
        let mut buf = [0u8; MAX_FRAME];
        assert_eq!(
            pack(&queue, &mut buf),
            Packed::Frame {
                len: 35 + FRAME_OVERHEAD,
                count: 1
            }
        );
    }

    #[test]
    fn logon_ack_travels_alone() {
        let mut queue: Deque<Message, 4> = Deque::new();
        queue
            .push_back(Message::new(
                AddressStack::SELF,
                MsgType::LocalLogonAck,
                &[1, 0x01, 0x00, 0x0D, 0xA0, 0x11, 0x22, 0x33],
            ))
            .unwrap();
        queue.push_back(msg(MsgType::SysGetMagic, &[])).unwrap();
        let mut buf = [0u8; MAX_FRAME];
        match pack(&queue, &mut buf) {
            Packed::Frame { count, .. } => assert_eq!(count, 1),
            other => panic!("{other:?}"),
        }
        // and never joins an earlier message either
        let mut queue: Deque<Message, 4> = Deque::new();
        queue.push_back(msg(MsgType::SysGetMagic, &[])).unwrap();
        queue
            .push_back(Message::new(AddressStack::SELF, MsgType::LocalLogonAck, &[1]))
            .unwrap();
        match pack(&queue, &mut buf) {
            Packed::Frame { count, .. } => assert_eq!(count, 1),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn empty_queue_packs_nothing() {
        let queue: Deque<Message, 4> = Deque::new();
        let mut buf = [0u8; MAX_FRAME];
        assert_eq!(pack(&queue, &mut buf), Packed::Empty);
    }
}
