//! The wire-exact multicast job announcement.
//!
//! One record is five bytes: the literal `b'j'`, then `count` and
//! `tcp_port` as little-endian `u16`. Datagrams may concatenate several
//! records; any residue is a protocol error and the whole packet is dropped
//! by the caller.

use byteorder::{ByteOrder, LittleEndian};

use crate::ProtocolError;

pub const ANNOUNCEMENT_LEN: usize = 5;

const HEADER: u8 = b'j';

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JobAnnouncement {
    pub jobs: u16,
    pub tcp_port: u16,
}

pub fn encode_announcement(announcement: JobAnnouncement) -> [u8; ANNOUNCEMENT_LEN] {
    let mut buf = [0u8; ANNOUNCEMENT_LEN];
    buf[0] = HEADER;
    LittleEndian::write_u16(&mut buf[1..3], announcement.jobs);
    LittleEndian::write_u16(&mut buf[3..5], announcement.tcp_port);
    buf
}

pub fn decode_announcements(mut data: &[u8]) -> Result<Vec<JobAnnouncement>, ProtocolError> {
    let mut out = Vec::new();
    while data.len() >= ANNOUNCEMENT_LEN {
        if data[0] != HEADER {
            return Err(ProtocolError::BadAnnouncementHeader { header: data[0] });
        }
        out.push(JobAnnouncement {
            jobs: LittleEndian::read_u16(&data[1..3]),
            tcp_port: LittleEndian::read_u16(&data[3..5]),
        });
        data = &data[ANNOUNCEMENT_LEN..];
    }
    if !data.is_empty() {
        return Err(ProtocolError::AnnouncementResidue {
            residue: data.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_wire_exact() {
        let bytes = encode_announcement(JobAnnouncement {
            jobs: 3,
            tcp_port: 7000,
        });
        assert_eq!(bytes[0], 0x6a);
        assert_eq!(bytes[1..3], 3u16.to_le_bytes());
        assert_eq!(bytes[3..5], 7000u16.to_le_bytes());
    }

    #[test]
    fn multiple_records_decode_in_order() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&encode_announcement(JobAnnouncement {
            jobs: 1,
            tcp_port: 7000,
        }));
        packet.extend_from_slice(&encode_announcement(JobAnnouncement {
            jobs: 9,
            tcp_port: 7001,
        }));

        let records = decode_announcements(&packet).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].jobs, 9);
        assert_eq!(records[1].tcp_port, 7001);
    }

    #[test]
    fn unknown_header_is_a_protocol_error() {
        let packet = [b'x', 0, 0, 0, 0];
        match decode_announcements(&packet) {
            Err(ProtocolError::BadAnnouncementHeader { header: b'x' }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn residue_is_a_protocol_error() {
        let mut packet = encode_announcement(JobAnnouncement {
            jobs: 1,
            tcp_port: 7000,
        })
        .to_vec();
        packet.extend_from_slice(&[1, 2, 3]);
        match decode_announcements(&packet) {
            Err(ProtocolError::AnnouncementResidue { residue: 3 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_packet_is_a_noop() {
        assert!(decode_announcements(&[]).unwrap().is_empty());
    }
}
