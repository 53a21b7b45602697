use super::{Error, Result};
use bidib_core::addr::AddressStack;
use bidib_defs::{msg_is_broadcast, msg_is_local, MsgType};
use core::fmt;
use heapless::Vec;

/// Maximum message payload in octets.
pub const MAX_PAYLOAD: usize = 127;

/// Upper bound of messages one wire packet can carry.
pub const MESSAGES_PER_PACKET: usize = 16;

/// Messages unpacked from one wire packet, in order.
pub type MessageList = Vec<Message, MESSAGES_PER_PACKET>;

#[inline(never)]
#[cold]
#[track_caller]
fn payload_too_long(len: usize) -> ! {
    panic!("message payload of {} octets exceeds {}", len, MAX_PAYLOAD);
}

/// One BiDiB message.
///
/// The opcode stays a raw octet so unknown messages route byte-exact;
/// [`Message::msg_type`] is the typed view. A sequence number of zero
/// marks broadcasts, link-local traffic and counter resets.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    pub addr: AddressStack,
    pub num: u8,
    pub opcode: u8,
    payload: Vec<u8, MAX_PAYLOAD>,
}

impl Message {
    /// Construct a message with sequence number zero.
    ///
    /// # Panics
    /// The function panics if `payload` exceeds [`MAX_PAYLOAD`].
    pub fn new(addr: AddressStack, opcode: MsgType, payload: &[u8]) -> Message {
        Message::raw(addr, opcode.into(), payload)
    }

    /// As [`new`], for opcodes outside the known set.
    ///
    /// [`new`]: #method.new
    pub fn raw(addr: AddressStack, opcode: u8, payload: &[u8]) -> Message {
        let payload = match Vec::from_slice(payload) {
            Ok(v) => v,
            Err(()) => payload_too_long(payload.len()),
        };
        Message {
            addr,
            num: 0,
            opcode,
            payload,
        }
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::try_from(self.opcode).ok()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_local(&self) -> bool {
        msg_is_local(self.opcode)
    }

    pub fn is_broadcast(&self) -> bool {
        msg_is_broadcast(self.opcode)
    }

    /// Serialised size, including the length octet.
    pub fn wire_len(&self) -> usize {
        1 + self.addr.depth() + 1 + 2 + self.payload.len()
    }

    /// Serialise into `buf`, returning the octet count.
    pub fn emit(&self, buf: &mut [u8]) -> Result<usize> {
        let total = self.wire_len();
        if buf.len() < total {
            return Err(Error);
        }
        buf[0] = (total - 1) as u8;
        let mut at = 1;
        at += self.addr.emit(&mut buf[1..])?;
        buf[at] = self.num;
        buf[at + 1] = self.opcode;
        buf[at + 2..total].copy_from_slice(&self.payload);
        Ok(total)
    }

    /// Parse one message off the front of `buf`, returning it along
    /// with the octet count consumed.
    pub fn parse(buf: &[u8]) -> Result<(Message, usize)> {
        let &length = buf.first().ok_or(Error)?;
        let total = length as usize + 1;
        if buf.len() < total || length < 3 {
            return Err(Error);
        }
        let body = &buf[1..total];
        let (addr, addr_len) = AddressStack::parse(body)?;
        let rest = &body[addr_len..];
        if rest.len() < 2 || rest.len() - 2 > MAX_PAYLOAD {
            return Err(Error);
        }
        Ok((
            Message {
                addr,
                num: rest[0],
                opcode: rest[1],
                payload: Vec::from_slice(&rest[2..]).map_err(|()| Error)?,
            },
            total,
        ))
    }
}

/// Unpack the concatenated messages of one wire packet.
pub fn unpack_all(mut buf: &[u8]) -> Result<MessageList> {
    let mut list = MessageList::new();
    while !buf.is_empty() {
        let (msg, consumed) = Message::parse(buf)?;
        list.push(msg).map_err(|_| Error)?;
        buf = &buf[consumed..];
    }
    Ok(list)
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "BiDiB addr={} num={} opcode={:#04x} len={}",
            self.addr,
            self.num,
            self.opcode,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn emit_parse_roundtrip() {
        let mut msg = Message::new(
            AddressStack::from_hops(&[1, 2]),
            MsgType::SysMagic,
            &[0xFE, 0xAF],
        );
        msg.num = 7;
        let mut buf = [0u8; 16];
        let n = msg.emit(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[7, 1, 2, 0, 7, 0x81, 0xFE, 0xAF]);
        let (back, consumed) = Message::parse(&buf[..n]).unwrap();
        assert_eq!(back, msg);
        assert_eq!(consumed, n);
    }

    #[test]
    fn self_addressed() {
        let msg = Message::new(AddressStack::SELF, MsgType::SysGetMagic, &[]);
        let mut buf = [0u8; 8];
        let n = msg.emit(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[3, 0, 0, 0x01]);
    }

    #[test]
    fn parse_rejects_garbage() {
        // truncated body
        assert_eq!(Message::parse(&[5, 0, 0, 0x01]), Err(Error));
        // length shorter than the minimum message
        assert_eq!(Message::parse(&[2, 0, 0]), Err(Error));
        // no address terminator
        assert_eq!(Message::parse(&[6, 1, 2, 3, 4, 5, 6]), Err(Error));
        assert_eq!(Message::parse(&[]), Err(Error));
    }

    #[test]
    fn unpack_multiple() {
        let a = Message::new(AddressStack::SELF, MsgType::SysGetMagic, &[]);
        let b = Message::new(AddressStack::from_hops(&[1]), MsgType::SysGetPVersion, &[]);
        let mut buf = [0u8; 32];
        let n = a.emit(&mut buf).unwrap();
        let m = b.emit(&mut buf[n..]).unwrap();
        let list = unpack_all(&buf[..n + m]).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], a);
        assert_eq!(list[1], b);
        assert_eq!(unpack_all(&buf[..n + m - 1]), Err(Error));
    }
}
