//! PTPv2 (IEEE 1588-2008) wire layout.
//!
//! Only the fields the slave acts on are pulled out of the 34-byte common
//! header; everything is read with explicit big-endian loads, never through
//! struct overlays.

/// Common header length.
pub const HEADER_LEN: usize = 34;

/// Header plus one 10-byte timestamp: SYNC, FOLLOW_UP and DELAY_REQ size.
pub const SYNC_LEN: usize = HEADER_LEN + 10;

pub const MSG_SYNC: u8 = 0x0;
pub const MSG_DELAY_REQ: u8 = 0x1;
pub const MSG_FOLLOW_UP: u8 = 0x8;
pub const MSG_DELAY_RESP: u8 = 0x9;

/// Flags bit announcing that the precise timestamp follows separately.
pub const FLAG_TWO_STEP: u16 = 0x0200;

#[derive(Debug, Clone)]
pub struct PtpHeader {
    pub msg_type: u8,
    pub version: u8,
    pub length: u16,
    pub domain: u8,
    pub flags: u16,
    pub source: [u8; 10],
    pub sequence: u16,
}

impl PtpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let mut source = [0u8; 10];
        source.copy_from_slice(&data[20..30]);

        Some(Self {
            msg_type: data[0] & 0x0F,
            version: data[1] & 0x0F,
            length: u16::from_be_bytes([data[2], data[3]]),
            domain: data[4],
            flags: u16::from_be_bytes([data[6], data[7]]),
            source,
            sequence: u16::from_be_bytes([data[30], data[31]]),
        })
    }

    pub fn is_two_step(&self) -> bool {
        self.flags & FLAG_TWO_STEP != 0
    }
}

/// Convert a wire timestamp (48-bit seconds, 32-bit nanoseconds, both
/// big-endian) into sample units at `rate`.
pub fn stamp(rate: u64, payload: &[u8]) -> Option<u64> {
    if payload.len() < 10 {
        return None;
    }

    let sec = u64::from_be_bytes([
        0, 0, payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
    ]);
    let nsec = u32::from_be_bytes([payload[6], payload[7], payload[8], payload[9]]) as u64;

    Some(sec.wrapping_mul(rate).wrapping_add(nsec * rate / 1_000_000_000))
}

/// Build a DELAY_REQ with a zeroed origin timestamp; the send time is taken
/// from the local sample clock instead.
pub fn build_delay_req(identity: &[u8; 10], sequence: u16) -> [u8; SYNC_LEN] {
    let mut buf = [0u8; SYNC_LEN];

    buf[0] = MSG_DELAY_REQ;
    buf[1] = 2;
    buf[2..4].copy_from_slice(&(SYNC_LEN as u16).to_be_bytes());
    buf[20..30].copy_from_slice(identity);
    buf[30..32].copy_from_slice(&sequence.to_be_bytes());

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_converts_to_sample_units() {
        // 2 seconds, 500 ms
        let mut ts = [0u8; 10];
        ts[..6].copy_from_slice(&[0, 0, 0, 0, 0, 2]);
        ts[6..].copy_from_slice(&500_000_000u32.to_be_bytes());

        assert_eq!(stamp(48000, &ts), Some(2 * 48000 + 24000));
        assert_eq!(stamp(96000, &ts), Some(2 * 96000 + 48000));
        assert_eq!(stamp(48000, &ts[..9]), None);
    }

    #[test]
    fn delay_req_roundtrips_through_parse() {
        let identity = [1, 2, 3, 0xFF, 0xFE, 4, 5, 6, 0, 2];
        let packet = build_delay_req(&identity, 77);

        let header = PtpHeader::parse(&packet).unwrap();
        assert_eq!(header.msg_type, MSG_DELAY_REQ);
        assert_eq!(header.version, 2);
        assert_eq!(header.domain, 0);
        assert_eq!(header.length as usize, SYNC_LEN);
        assert_eq!(header.source, identity);
        assert_eq!(header.sequence, 77);
        assert!(!header.is_two_step());
    }

    #[test]
    fn two_step_flag() {
        let mut packet = build_delay_req(&[0; 10], 1);
        packet[6..8].copy_from_slice(&FLAG_TWO_STEP.to_be_bytes());
        assert!(PtpHeader::parse(&packet).unwrap().is_two_step());
    }
}
