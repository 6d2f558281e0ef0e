//! Codecs for the variable-length ACK-ID, ROLLUP and RANGE fields.
//!
//! ACK-IDs travel compressed: only as many low bits as the receiver needs to
//!  disambiguate against its decompression base are sent. Reconstruction picks
//!  the value with matching low bits closest to the base. Retransmissions and
//!  ROLLUPs always use the full form because the remote base is unknown.

use anyhow::bail;
use bytes::{Buf, BufMut};

const CONTINUATION: u8 = 0x80;

/// A decoded ACK-ID field: the stream selector plus the transmitted low bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckIdField {
    pub stream: u8,
    pub partial: u32,
    pub bits: u32,
}

/// Nearest-to-base reconstruction of a truncated identifier.
pub fn reconstruct_id(base: u32, partial: u32, bits: u32) -> u32 {
    if bits >= 32 {
        return partial;
    }
    let window = 1i64 << bits;
    let half = window / 2;
    let base = base as i64;

    let mut candidate = (base & !(window - 1)) | partial as i64;
    if candidate < base - half {
        candidate += window;
    } else if candidate >= base + half {
        candidate -= window;
    }
    if candidate < 0 {
        candidate += window;
    }
    candidate as u32
}

/// Serialize an ACK-ID field. `base` is the remote decompression base if
///  compression is allowed; `None` forces the full three-byte form.
///
/// Layout: byte 0 = id bits 0-4, stream in bits 5-6, continuation in bit 7;
///  byte 1 = id bits 5-11 plus continuation; byte 2 = id bits 12-19.
pub fn ser_ack_id(buf: &mut impl BufMut, stream: u8, id: u32, base: Option<u32>) {
    debug_assert!(stream < 4);

    let bytes = match base {
        Some(base) => {
            let diff = (id as i64 - base as i64).unsigned_abs();
            if diff < 1 << 4 {
                1
            } else if diff < 1 << 11 {
                2
            } else {
                3
            }
        }
        None => 3,
    };

    let mut b0 = (id as u8 & 0x1F) | (stream << 5);
    if bytes > 1 {
        b0 |= CONTINUATION;
    }
    buf.put_u8(b0);

    if bytes > 1 {
        let mut b1 = ((id >> 5) & 0x7F) as u8;
        if bytes > 2 {
            b1 |= CONTINUATION;
        }
        buf.put_u8(b1);
    }
    if bytes > 2 {
        buf.put_u8(((id >> 12) & 0xFF) as u8);
    }
}

pub fn deser_ack_id(buf: &mut impl Buf) -> anyhow::Result<AckIdField> {
    let b0 = buf.try_get_u8()?;
    let stream = (b0 >> 5) & 0x03;
    let mut partial = (b0 & 0x1F) as u32;
    let mut bits = 5;

    if b0 & CONTINUATION != 0 {
        let b1 = buf.try_get_u8()?;
        partial |= ((b1 & 0x7F) as u32) << 5;
        bits = 12;

        if b1 & CONTINUATION != 0 {
            let b2 = buf.try_get_u8()?;
            partial |= (b2 as u32) << 12;
            bits = 20;
        }
    }

    Ok(AckIdField { stream, partial, bits })
}

/// One element of an ACK message's data part. A set bit 0 on the first byte
///  distinguishes a ROLLUP from a RANGE start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckElement {
    /// Next expected id on a stream, 21 transmitted bits. Acknowledges every
    ///  lower id.
    Rollup { stream: u8, partial: u32 },
    /// An out-of-order run, deltas relative to the last id emitted in the
    ///  message (start) and to the range start (end).
    Range { start_delta: u32, end_delta: Option<u32> },
}

pub const ROLLUP_BITS: u32 = 21;
const MAX_RANGE_START_DELTA: u32 = (1 << 20) - 1;
const MAX_RANGE_END_DELTA: u32 = (1 << 22) - 1;

/// Rollups are always three bytes: bit 0 = 1, stream in bits 1-2, id bits 0-4
///  in bits 3-7 of byte 0, id bits 5-20 in bytes 1-2.
pub fn ser_rollup(buf: &mut impl BufMut, stream: u8, id: u32) {
    debug_assert!(stream < 4);
    buf.put_u8(0x01 | (stream << 1) | ((id as u8 & 0x1F) << 3));
    buf.put_u8(((id >> 5) & 0xFF) as u8);
    buf.put_u8(((id >> 13) & 0xFF) as u8);
}

/// Range start: bit 0 = 0, bit 1 = has-end, delta bits 0-4 in bits 2-6,
///  continuation in bit 7; then 7 + 8 more delta bits. The end field carries
///  7 + 7 + 8 delta bits.
pub fn ser_range(buf: &mut impl BufMut, start_delta: u32, end_delta: Option<u32>) {
    debug_assert!(start_delta >= 1 && start_delta <= MAX_RANGE_START_DELTA);

    let start_bytes = if start_delta < 1 << 5 {
        1
    } else if start_delta < 1 << 12 {
        2
    } else {
        3
    };

    let mut b0 = (start_delta as u8 & 0x1F) << 2;
    if end_delta.is_some() {
        b0 |= 0x02;
    }
    if start_bytes > 1 {
        b0 |= CONTINUATION;
    }
    buf.put_u8(b0);
    if start_bytes > 1 {
        let mut b1 = ((start_delta >> 5) & 0x7F) as u8;
        if start_bytes > 2 {
            b1 |= CONTINUATION;
        }
        buf.put_u8(b1);
    }
    if start_bytes > 2 {
        buf.put_u8(((start_delta >> 12) & 0xFF) as u8);
    }

    if let Some(end_delta) = end_delta {
        debug_assert!(end_delta >= 1 && end_delta <= MAX_RANGE_END_DELTA);

        let end_bytes = if end_delta < 1 << 7 {
            1
        } else if end_delta < 1 << 14 {
            2
        } else {
            3
        };

        let mut b0 = (end_delta & 0x7F) as u8;
        if end_bytes > 1 {
            b0 |= CONTINUATION;
        }
        buf.put_u8(b0);
        if end_bytes > 1 {
            let mut b1 = ((end_delta >> 7) & 0x7F) as u8;
            if end_bytes > 2 {
                b1 |= CONTINUATION;
            }
            buf.put_u8(b1);
        }
        if end_bytes > 2 {
            buf.put_u8(((end_delta >> 14) & 0xFF) as u8);
        }
    }
}

pub fn deser_ack_element(buf: &mut impl Buf) -> anyhow::Result<AckElement> {
    let b0 = buf.try_get_u8()?;

    if b0 & 0x01 != 0 {
        let stream = (b0 >> 1) & 0x03;
        let mut partial = ((b0 >> 3) & 0x1F) as u32;
        partial |= (buf.try_get_u8()? as u32) << 5;
        partial |= (buf.try_get_u8()? as u32) << 13;
        return Ok(AckElement::Rollup { stream, partial });
    }

    let has_end = b0 & 0x02 != 0;
    let mut start_delta = ((b0 >> 2) & 0x1F) as u32;
    if b0 & CONTINUATION != 0 {
        let b1 = buf.try_get_u8()?;
        start_delta |= ((b1 & 0x7F) as u32) << 5;
        if b1 & CONTINUATION != 0 {
            start_delta |= (buf.try_get_u8()? as u32) << 12;
        }
    }
    if start_delta == 0 {
        bail!("range start delta of zero");
    }

    let end_delta = if has_end {
        let b0 = buf.try_get_u8()?;
        let mut end_delta = (b0 & 0x7F) as u32;
        if b0 & CONTINUATION != 0 {
            let b1 = buf.try_get_u8()?;
            end_delta |= ((b1 & 0x7F) as u32) << 7;
            if b1 & CONTINUATION != 0 {
                end_delta |= (buf.try_get_u8()? as u32) << 14;
            }
        }
        if end_delta == 0 {
            bail!("range end delta of zero");
        }
        Some(end_delta)
    } else {
        None
    };

    Ok(AckElement::Range { start_delta, end_delta })
}
