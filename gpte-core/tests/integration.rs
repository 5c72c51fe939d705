//! End-to-end exercise of the public API against a temp-file-backed disk
//! image: build a minimal valid GPT by hand, then drive it through the
//! engine the way the shell would.

use gpte_core::codec::{
    guid_to_string, name_to_raw, new_guid, GptHeader, PartitionEntry, HEADER_REVISION,
    HEADER_SIGNATURE, HEADER_SIZE,
};
use gpte_core::crc::crc32;
use gpte_core::{FileBlockDevice, Gpt, GptProfile};
use std::io::{Seek, SeekFrom, Write};

const LBSIZE: u64 = 512;
const DLEN: u64 = 20_480;
const PTBL_COUNT: u32 = 128;
const PTBL_ENTRY_SIZE: u32 = 128;

fn header_crc(header: &GptHeader) -> u32 {
    let encoded = header.encode();
    let size = header.size as usize;
    let mut block = vec![0u8; size];
    block[..HEADER_SIZE].copy_from_slice(&encoded);
    crc32(0, &block)
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Build a temp-file disk image with a valid primary+backup GPT around the
/// given entries, leaving the remaining slots empty.
fn build_disk(entries: &[(u64, u64, &str)]) -> tempfile::NamedTempFile {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.as_file().set_len(DLEN * LBSIZE).expect("size temp file");

    let first_usable = 34u64;
    let array_blocks = div_ceil(PTBL_COUNT as u64 * PTBL_ENTRY_SIZE as u64, LBSIZE);
    let last_usable = DLEN - array_blocks - 2;
    let disk_guid = new_guid();

    let mut raw_entries = vec![PartitionEntry::EMPTY; PTBL_COUNT as usize];
    for (i, (first, last, name)) in entries.iter().enumerate() {
        raw_entries[i] = PartitionEntry {
            type_guid: new_guid(),
            part_guid: new_guid(),
            first_lba: *first,
            last_lba: *last,
            flags: 0,
            name: name_to_raw(name),
        };
    }

    let mut entry_bufs = Vec::new();
    let mut ptbl_crc = 0u32;
    for e in &raw_entries {
        let mut buf = vec![0u8; PTBL_ENTRY_SIZE as usize];
        let encoded = e.encode();
        buf[..encoded.len()].copy_from_slice(&encoded);
        ptbl_crc = crc32(ptbl_crc, &buf);
        entry_bufs.push(buf);
    }

    let mut file = tmp.reopen().expect("reopen temp file");
    let mut write_copy = |current_lba: u64, backup_lba: u64, ptbl_lba: u64| {
        let mut header = GptHeader {
            signature: *HEADER_SIGNATURE,
            revision: HEADER_REVISION,
            size: HEADER_SIZE as u32,
            crc: 0,
            reserved: 0,
            current_lba,
            backup_lba,
            first_usable_lba: first_usable,
            last_usable_lba: last_usable,
            disk_guid,
            ptbl_lba,
            ptbl_count: PTBL_COUNT,
            ptbl_entry_size: PTBL_ENTRY_SIZE,
            ptbl_crc,
        };
        header.crc = header_crc(&header);
        let mut block = vec![0u8; LBSIZE as usize];
        let encoded = header.encode();
        block[..encoded.len()].copy_from_slice(&encoded);
        file.seek(SeekFrom::Start(current_lba * LBSIZE)).unwrap();
        file.write_all(&block).unwrap();
        file.seek(SeekFrom::Start(ptbl_lba * LBSIZE)).unwrap();
        for buf in &entry_bufs {
            file.write_all(buf).unwrap();
        }
    };

    let backup_lba = DLEN - 1;
    write_copy(1, backup_lba, 2);
    write_copy(backup_lba, 1, backup_lba - array_blocks);

    tmp
}

fn open_disk(tmp: &tempfile::NamedTempFile) -> Gpt<FileBlockDevice> {
    let file = tmp.reopen().expect("reopen temp file");
    let device = FileBlockDevice::from_file(file, LBSIZE as u32).expect("wrap file as device");
    Gpt::open(device, GptProfile::default()).expect("open gpt")
}

#[test]
fn full_edit_session_add_resize_save_load_write_reopen() {
    let tmp = build_disk(&[(2048, 4095, "boot"), (4096, 8191, "system")]);
    let mut gpt = open_disk(&tmp);

    assert_eq!(gpt.find("boot"), Some(0));
    assert_eq!(gpt.find("system"), Some(1));
    assert_eq!(gpt.find("data"), None);

    // Grow "system" into free trailing space (it has room for up to
    // ~12255 extra blocks before hitting last_usable_lba; ask for 8192).
    let lbsize = gpt.lbsize();
    gpt.table_mut()
        .part_resize(1, 6 * 1024 * 1024, lbsize, false)
        .expect("resize system");
    assert_eq!(gpt.table().entry(1).unwrap().last_lba, 16383);

    // Add a third partition right after "system".
    let next_lba = gpt.table().entry(1).unwrap().last_lba + 1;
    let entry = PartitionEntry {
        type_guid: [0u8; 16],
        part_guid: new_guid(),
        first_lba: next_lba,
        last_lba: next_lba + 2047,
        flags: 0,
        name: name_to_raw("data"),
    };
    gpt.table_mut().part_add(2, entry).expect("add data");
    assert_eq!(gpt.find("data"), Some(2));

    // Dump "boot" out, then restore it unchanged.
    let mut dump = tempfile::NamedTempFile::new().expect("create dump file");
    gpt.part_save(0, dump.as_file_mut()).expect("save boot");
    assert_eq!(dump.as_file().metadata().unwrap().len(), 1024 * 1024);
    let mut reload = dump.reopen().expect("reopen dump file");
    gpt.part_load(0, &mut reload).expect("load boot");

    gpt.write().expect("commit table");

    let reopened = open_disk(&tmp);
    assert_eq!(reopened.find("boot"), Some(0));
    assert_eq!(reopened.find("system"), Some(1));
    assert_eq!(reopened.find("data"), Some(2));
    assert_eq!(reopened.table().entries(), gpt.table().entries());

    // A GUID round-trips through the mixed-endian text formatter without
    // panicking or truncating.
    let guid_text = guid_to_string(&new_guid());
    assert_eq!(guid_text.len(), 36);
}

#[test]
fn recovers_from_backup_after_primary_header_corruption() {
    let tmp = build_disk(&[(2048, 4095, "boot")]);
    {
        let mut file = tmp.reopen().expect("reopen temp file");
        file.seek(SeekFrom::Start(16)).unwrap(); // primary header crc field
        file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    }

    let gpt = open_disk(&tmp);
    assert_eq!(gpt.find("boot"), Some(0));
}
