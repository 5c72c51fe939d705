//! Fixed-layout binary codec for the GPT header and partition entry.
//!
//! Every multibyte integer on disk is little-endian; fields are packed at
//! fixed byte offsets, never laid out via host-memory transmutation.
//! `decode`/`encode` are total and side-effect free -- they do not reject
//! malformed input, they just reproduce it faithfully. Validity checks
//! (signature, CRC, geometry) live in [`crate::gpt`].

use byteorder::{ByteOrder, LittleEndian};

pub const HEADER_SIZE: usize = 92;
pub const PART_ENTRY_SIZE: usize = 128;
pub const HEADER_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const HEADER_REVISION: u32 = 0x0001_0000;

/// GPT header, decoded from its 92-byte on-disk form (itself padded to one
/// logical block when persisted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub size: u32,
    pub crc: u32,
    pub reserved: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub ptbl_lba: u64,
    pub ptbl_count: u32,
    pub ptbl_entry_size: u32,
    pub ptbl_crc: u32,
}

impl GptHeader {
    /// Decode a header from its first [`HEADER_SIZE`] bytes. `buf` must be at
    /// least that long; trailing padding is ignored.
    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= HEADER_SIZE, "header buffer too short");
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&buf[0..8]);
        let mut disk_guid = [0u8; 16];
        disk_guid.copy_from_slice(&buf[56..72]);

        GptHeader {
            signature,
            revision: LittleEndian::read_u32(&buf[8..12]),
            size: LittleEndian::read_u32(&buf[12..16]),
            crc: LittleEndian::read_u32(&buf[16..20]),
            reserved: LittleEndian::read_u32(&buf[20..24]),
            current_lba: LittleEndian::read_u64(&buf[24..32]),
            backup_lba: LittleEndian::read_u64(&buf[32..40]),
            first_usable_lba: LittleEndian::read_u64(&buf[40..48]),
            last_usable_lba: LittleEndian::read_u64(&buf[48..56]),
            disk_guid,
            ptbl_lba: LittleEndian::read_u64(&buf[72..80]),
            ptbl_count: LittleEndian::read_u32(&buf[80..84]),
            ptbl_entry_size: LittleEndian::read_u32(&buf[84..88]),
            ptbl_crc: LittleEndian::read_u32(&buf[88..92]),
        }
    }

    /// Encode into a fresh [`HEADER_SIZE`]-byte buffer (the caller pads to
    /// one logical block before writing it out).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.signature);
        LittleEndian::write_u32(&mut buf[8..12], self.revision);
        LittleEndian::write_u32(&mut buf[12..16], self.size);
        LittleEndian::write_u32(&mut buf[16..20], self.crc);
        LittleEndian::write_u32(&mut buf[20..24], self.reserved);
        LittleEndian::write_u64(&mut buf[24..32], self.current_lba);
        LittleEndian::write_u64(&mut buf[32..40], self.backup_lba);
        LittleEndian::write_u64(&mut buf[40..48], self.first_usable_lba);
        LittleEndian::write_u64(&mut buf[48..56], self.last_usable_lba);
        buf[56..72].copy_from_slice(&self.disk_guid);
        LittleEndian::write_u64(&mut buf[72..80], self.ptbl_lba);
        LittleEndian::write_u32(&mut buf[80..84], self.ptbl_count);
        LittleEndian::write_u32(&mut buf[84..88], self.ptbl_entry_size);
        LittleEndian::write_u32(&mut buf[88..92], self.ptbl_crc);
        buf
    }
}

/// GPT partition entry, decoded from its 128-byte on-disk form (itself
/// padded to one logical block when persisted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub type_guid: [u8; 16],
    pub part_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub flags: u64,
    pub name: [u8; 72],
}

impl PartitionEntry {
    pub const EMPTY: PartitionEntry = PartitionEntry {
        type_guid: [0; 16],
        part_guid: [0; 16],
        first_lba: 0,
        last_lba: 0,
        flags: 0,
        name: [0; 72],
    };

    pub fn decode(buf: &[u8]) -> Self {
        assert!(buf.len() >= PART_ENTRY_SIZE, "entry buffer too short");
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&buf[0..16]);
        let mut part_guid = [0u8; 16];
        part_guid.copy_from_slice(&buf[16..32]);
        let mut name = [0u8; 72];
        name.copy_from_slice(&buf[56..128]);

        PartitionEntry {
            type_guid,
            part_guid,
            first_lba: LittleEndian::read_u64(&buf[32..40]),
            last_lba: LittleEndian::read_u64(&buf[40..48]),
            flags: LittleEndian::read_u64(&buf[48..56]),
            name,
        }
    }

    pub fn encode(&self) -> [u8; PART_ENTRY_SIZE] {
        let mut buf = [0u8; PART_ENTRY_SIZE];
        buf[0..16].copy_from_slice(&self.type_guid);
        buf[16..32].copy_from_slice(&self.part_guid);
        LittleEndian::write_u64(&mut buf[32..40], self.first_lba);
        LittleEndian::write_u64(&mut buf[40..48], self.last_lba);
        LittleEndian::write_u64(&mut buf[48..56], self.flags);
        buf[56..128].copy_from_slice(&self.name);
        buf
    }

    /// Matches the reference opener/shell: an entry is empty iff both LBA
    /// fields are zero, not by inspecting the type GUID.
    pub fn is_empty(&self) -> bool {
        self.first_lba == 0 && self.last_lba == 0
    }

    pub fn decoded_name(&self) -> String {
        name_from_raw(&self.name)
    }
}

/// Convert a UTF-16LE name field to a `String`, taking only the ASCII plane
/// (every even byte), stopping at the first NUL -- higher Unicode is not
/// represented.
pub fn name_from_raw(raw: &[u8; 72]) -> String {
    let mut s = String::with_capacity(36);
    for i in 0..36 {
        let b = raw[i * 2];
        if b == 0 {
            break;
        }
        s.push(b as char);
    }
    s
}

/// Encode an ASCII name into the 72-byte UTF-16LE field. Non-ASCII
/// characters are replaced with `?`; only the first 36 characters fit.
pub fn name_to_raw(name: &str) -> [u8; 72] {
    let mut raw = [0u8; 72];
    for (i, ch) in name.chars().take(36).enumerate() {
        let byte = if ch.is_ascii() { ch as u8 } else { b'?' };
        raw[i * 2] = byte;
    }
    raw
}

/// Format a GUID using the GPT mixed-endian convention: the first three
/// groups are little-endian, the last two big-endian.
pub fn guid_to_string(guid: &[u8; 16]) -> String {
    let p1 = LittleEndian::read_u32(&guid[0..4]);
    let p2 = LittleEndian::read_u16(&guid[4..6]);
    let p3 = LittleEndian::read_u16(&guid[6..8]);
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        p1, p2, p3, guid[8], guid[9], guid[10], guid[11], guid[12], guid[13], guid[14], guid[15]
    )
}

/// Generate a fresh random GUID for a new disk or partition identifier.
/// Stored on disk exactly as the `uuid` crate lays out its bytes -- the same
/// shortcut the teacher's partition-table creation code takes -- so the
/// mixed-endian shuffle only ever happens at display time, in
/// [`guid_to_string`].
pub fn new_guid() -> [u8; 16] {
    *uuid::Uuid::new_v4().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> GptHeader {
        GptHeader {
            signature: *HEADER_SIGNATURE,
            revision: HEADER_REVISION,
            size: HEADER_SIZE as u32,
            crc: 0,
            reserved: 0,
            current_lba: 1,
            backup_lba: 20479,
            first_usable_lba: 34,
            last_usable_lba: 20446,
            disk_guid: new_guid(),
            ptbl_lba: 2,
            ptbl_count: 128,
            ptbl_entry_size: 128,
            ptbl_crc: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn header_round_trips() {
        let h = sample_header();
        let encoded = h.encode();
        let decoded = GptHeader::decode(&encoded);
        assert_eq!(h, decoded);
    }

    #[test]
    fn entry_round_trips() {
        let entry = PartitionEntry {
            type_guid: new_guid(),
            part_guid: new_guid(),
            first_lba: 2048,
            last_lba: 4095,
            flags: 0,
            name: name_to_raw("boot"),
        };
        let decoded = PartitionEntry::decode(&entry.encode());
        assert_eq!(entry, decoded);
        assert_eq!(decoded.decoded_name(), "boot");
    }

    #[test]
    fn empty_entry_round_trips_as_empty() {
        let decoded = PartitionEntry::decode(&PartitionEntry::EMPTY.encode());
        assert!(decoded.is_empty());
    }

    #[test]
    fn name_round_trip_for_ascii_alphabet() {
        let name: String = (0x20u8..0x7f).map(|b| b as char).take(36).collect();
        let raw = name_to_raw(&name);
        assert_eq!(name_from_raw(&raw), name);
    }

    #[test]
    fn guid_formatting_uses_mixed_endian_groups() {
        // RFC 4122 example GUID bytes, verified against the canonical
        // mixed-endian textual form used by GPT tooling.
        let guid: [u8; 16] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ];
        assert_eq!(
            guid_to_string(&guid),
            "04030201-0605-0807-090a-0b0c0d0e0f10"
        );
    }
}
