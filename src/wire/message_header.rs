use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::safe_converter::PrecheckedCast;
use crate::wire::{SuperOpcode, MAX_DATALEN};

/// The 16-bit header preceding every message inside a datagram.
///
/// Bits 0-10 carry the data length, bit 11 flags a preceding ACK-ID field,
///  bit 12 flags reliability and bits 13-15 select the super-opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub data_len: u16,
    pub has_ack_id: bool,
    pub reliable: bool,
    pub sop: SuperOpcode,
}

const DATALEN_MASK: u16 = 0x7FF;
const ACK_ID_MASK: u16 = 1 << 11;
const RELIABLE_MASK: u16 = 1 << 12;
const SOP_SHIFT: u16 = 13;

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u16>();

    pub fn new(data_len: usize, has_ack_id: bool, reliable: bool, sop: SuperOpcode) -> MessageHeader {
        assert!(data_len <= MAX_DATALEN);
        MessageHeader {
            data_len: data_len.prechecked_cast(),
            has_ack_id,
            reliable,
            sop,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut raw = self.data_len & DATALEN_MASK;
        if self.has_ack_id {
            raw |= ACK_ID_MASK;
        }
        if self.reliable {
            raw |= RELIABLE_MASK;
        }
        raw |= (u8::from(self.sop) as u16) << SOP_SHIFT;
        buf.put_u16_le(raw);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        let raw = buf.try_get_u16_le()?;

        let sop = match SuperOpcode::try_from((raw >> SOP_SHIFT) as u8) {
            Ok(sop) => sop,
            Err(_) => bail!("invalid super opcode"),
        };

        Ok(MessageHeader {
            data_len: raw & DATALEN_MASK,
            has_ack_id: raw & ACK_ID_MASK != 0,
            reliable: raw & RELIABLE_MASK != 0,
            sop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::empty_unreliable(0, false, false, SuperOpcode::Data, vec![0x00, 0x00])]
    #[case::max_datalen(0x7FF, false, false, SuperOpcode::Data, vec![0xFF, 0x07])]
    #[case::ack_id_bit(5, true, true, SuperOpcode::Data, vec![0x05, 0x18])]
    #[case::reliable_bit(1, false, true, SuperOpcode::Data, vec![0x01, 0x10])]
    #[case::frag(100, true, true, SuperOpcode::Frag, vec![0x64, 0x38])]
    #[case::ack(7, false, false, SuperOpcode::Ack, vec![0x07, 0x40])]
    #[case::disco(1, false, false, SuperOpcode::Disco, vec![0x01, 0xE0])]
    fn test_ser_deser(
        #[case] data_len: usize,
        #[case] has_ack_id: bool,
        #[case] reliable: bool,
        #[case] sop: SuperOpcode,
        #[case] expected: Vec<u8>,
    ) {
        let header = MessageHeader::new(data_len, has_ack_id, reliable, sop);

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut read: &[u8] = &buf;
        let actual = MessageHeader::deser(&mut read).unwrap();
        assert!(read.is_empty());
        assert_eq!(actual, header);
    }

    #[test]
    fn test_deser_too_short() {
        let mut buf: &[u8] = &[0x01];
        assert!(MessageHeader::deser(&mut buf).is_err());
    }
}
