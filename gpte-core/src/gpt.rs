//! The opener/validator (§4.E) and writer (§4.F): the glue that turns a raw
//! [`BlockDevice`] into a validated [`GptTable`] and commits one back.

use crate::block::BlockDevice;
use crate::codec::{GptHeader, PartitionEntry, HEADER_REVISION, HEADER_SIGNATURE, HEADER_SIZE};
use crate::crc::crc32;
use crate::error::{GptError, Result};
use crate::profile::GptProfile;
use crate::table::GptTable;

/// An opened, validated GPT on top of some [`BlockDevice`].
#[derive(Debug)]
pub struct Gpt<D: BlockDevice> {
    device: D,
    header: GptHeader,
    backup_header: Option<GptHeader>,
    table: GptTable,
    profile: GptProfile,
}

fn validate_header(raw: &[u8], lbsize: u32, profile: &GptProfile) -> Option<GptHeader> {
    if raw.len() < HEADER_SIZE {
        return None;
    }
    let header = GptHeader::decode(raw);
    if header.signature != *HEADER_SIGNATURE {
        return None;
    }
    if header.revision != HEADER_REVISION {
        return None;
    }
    if header.size < HEADER_SIZE as u32 || header.size > lbsize {
        return None;
    }
    if header.ptbl_count < profile.min_parts || header.ptbl_count > profile.max_parts {
        return None;
    }
    if header.ptbl_entry_size < crate::codec::PART_ENTRY_SIZE as u32
        || header.ptbl_entry_size > lbsize
    {
        return None;
    }

    let size = header.size as usize;
    if raw.len() < size {
        return None;
    }
    let mut zeroed = raw[0..size].to_vec();
    zeroed[16..20].copy_from_slice(&0u32.to_le_bytes());
    if crc32(0, &zeroed) != header.crc {
        return None;
    }
    Some(header)
}

fn primary_geometry_ok(h: &GptHeader, dlen: u64) -> bool {
    if h.current_lba != 1 {
        return false;
    }
    if dlen == 0 {
        return h.first_usable_lba >= 2 && h.first_usable_lba < h.last_usable_lba;
    }
    h.backup_lba < dlen
        && h.first_usable_lba >= 2
        && h.first_usable_lba < dlen
        && h.first_usable_lba < h.last_usable_lba
        && h.last_usable_lba < dlen
        && h.ptbl_lba < dlen
}

/// The literal cross-check between a validated primary and its backup.
fn cross_ok(backup: &GptHeader, primary: &GptHeader, dlen: u64) -> bool {
    backup.current_lba == primary.backup_lba
        && backup.backup_lba == 1
        && backup.first_usable_lba == primary.first_usable_lba
        && backup.last_usable_lba == primary.last_usable_lba
        && backup.disk_guid == primary.disk_guid
        && backup.ptbl_count == primary.ptbl_count
        && backup.ptbl_entry_size == primary.ptbl_entry_size
        && (dlen == 0 || backup.ptbl_lba < dlen)
}

/// Used only when the primary is unusable: validates a candidate backup
/// header entirely on its own terms (no trustworthy primary to cross-check
/// against), at the LBA we actually read it from.
fn backup_standalone_ok(b: &GptHeader, dlen: u64, expected_current_lba: u64) -> bool {
    b.current_lba == expected_current_lba
        && b.backup_lba == 1
        && b.first_usable_lba >= 2
        && b.first_usable_lba < b.last_usable_lba
        && (dlen == 0 || (b.last_usable_lba < dlen && b.ptbl_lba < dlen))
}

fn read_and_verify_entries<D: BlockDevice>(
    device: &mut D,
    header: &GptHeader,
    lbsize: u32,
) -> Result<Option<Vec<PartitionEntry>>> {
    let stride = header.ptbl_entry_size as usize;
    let total = stride * header.ptbl_count as usize;
    let raw = device.seek_and_read(header.ptbl_lba * lbsize as u64, total)?;

    let mut crc = 0u32;
    let mut entries = Vec::with_capacity(header.ptbl_count as usize);
    for chunk in raw.chunks(stride) {
        crc = crc32(crc, chunk);
        entries.push(PartitionEntry::decode(chunk));
    }
    if crc != header.ptbl_crc {
        return Ok(None);
    }
    Ok(Some(entries))
}

fn warn_on_first_mismatch(primary: &[PartitionEntry], backup: &[PartitionEntry]) {
    for (n, (p, b)) in primary.iter().zip(backup.iter()).enumerate() {
        if p != b {
            log::warn!("mismatched backup partition entry {n}");
            return;
        }
    }
}

impl<D: BlockDevice> Gpt<D> {
    /// Open and cross-validate the primary and backup GPT, populating the
    /// in-memory table. Recovers from the backup when the primary is
    /// unusable but the backup validates on its own.
    pub fn open(mut device: D, profile: GptProfile) -> Result<Self> {
        let lbsize = device.block_size();
        let dlen = device.block_count();

        let primary_raw = device.read_block(1)?;
        let tentative = GptHeader::decode(&primary_raw);
        let primary_header =
            validate_header(&primary_raw, lbsize, &profile).filter(|h| primary_geometry_ok(h, dlen));
        let primary_entries = match &primary_header {
            Some(h) => read_and_verify_entries(&mut device, h, lbsize)?,
            None => None,
        };

        // Locate the backup at the disk's last LBA when geometry is known
        // (the only location the GPT standard actually guarantees); fall
        // back to whatever the (possibly corrupt) primary claims only when
        // the device's length isn't known at all.
        let backup_lba_guess = if dlen > 0 { dlen - 1 } else { tentative.backup_lba };
        let backup_reachable = dlen == 0 || (backup_lba_guess > 2 && backup_lba_guess < dlen);

        let mut backup_header = None;
        let mut backup_entries = None;
        if backup_reachable {
            if let Ok(raw) = device.seek_and_read(backup_lba_guess * lbsize as u64, lbsize as usize) {
                let candidate = validate_header(&raw, lbsize, &profile).filter(|b| {
                    match &primary_header {
                        Some(h) => cross_ok(b, h, dlen),
                        None => backup_standalone_ok(b, dlen, backup_lba_guess),
                    }
                });
                if let Some(b) = candidate {
                    backup_entries = read_and_verify_entries(&mut device, &b, lbsize)?;
                    backup_header = Some(b);
                }
            }
        }

        let primary_usable = primary_header.is_some() && primary_entries.is_some();
        let backup_usable = backup_header.is_some() && backup_entries.is_some();

        let (header, entries, kept_backup) = if primary_usable {
            if let Some(be) = &backup_entries {
                warn_on_first_mismatch(primary_entries.as_ref().unwrap(), be);
            }
            (primary_header.unwrap(), primary_entries.unwrap(), backup_header)
        } else if backup_usable {
            log::warn!(
                "primary GPT invalid or unreadable; recovering from backup header at lba {backup_lba_guess}"
            );
            (backup_header.clone().unwrap(), backup_entries.unwrap(), None)
        } else {
            return Err(GptError::Format(
                "no valid primary or backup GPT header found".to_string(),
            ));
        };

        let table = GptTable::new(
            entries,
            header.first_usable_lba,
            header.last_usable_lba,
            profile,
        );
        table.check_invariants()?;

        Ok(Gpt {
            device,
            header,
            backup_header: kept_backup,
            table,
            profile,
        })
    }

    pub fn table(&self) -> &GptTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut GptTable {
        &mut self.table
    }

    pub fn lbsize(&self) -> u32 {
        self.device.block_size()
    }

    pub fn profile(&self) -> GptProfile {
        self.profile
    }

    pub fn find(&self, name: &str) -> Option<u32> {
        self.table.find(name)
    }

    pub fn size(&self, idx: u32) -> Result<u64> {
        self.table.size_bytes(idx, self.lbsize())
    }

    /// Print headers and non-empty entries, in the style of the reference
    /// shell's `show` command.
    pub fn show(&self) -> String {
        let mut out = String::new();
        out.push_str(&format_header_block("Primary GPT", &self.header));
        if let Some(b) = &self.backup_header {
            out.push_str(&format_header_block("Backup GPT", b));
        }
        out.push_str(&format!(
            "Partition table: count={}\n",
            self.table.last_used_idx().map(|i| i + 1).unwrap_or(0)
        ));
        for (idx, entry) in self.table.non_empty_entries() {
            let size = (entry.last_lba - entry.first_lba + 1) * self.lbsize() as u64;
            out.push_str(&format!(
                "  p{:<2}: [{:>8}..{:>8}] size={:>8} name={}\n",
                idx,
                entry.first_lba,
                entry.last_lba,
                size,
                entry.decoded_name()
            ));
        }
        out
    }

    /// Commit the in-memory table as a primary+backup GPT pair (§4.F).
    /// Write order is primary header, primary array, backup header, backup
    /// array, so a crash mid-write leaves a valid primary and a stale
    /// (detectable) backup.
    pub fn write(&mut self) -> Result<()> {
        let lbsize = self.lbsize() as u64;
        let ptbl_count = self.header.ptbl_count;
        let stride = self.header.ptbl_entry_size as usize;

        let mut entry_bufs = Vec::with_capacity(ptbl_count as usize);
        let mut ptbl_crc = 0u32;
        for entry in self.table.entries() {
            let encoded = entry.encode();
            let mut buf = vec![0u8; stride];
            buf[..encoded.len().min(stride)].copy_from_slice(&encoded[..encoded.len().min(stride)]);
            ptbl_crc = crc32(ptbl_crc, &buf);
            entry_bufs.push(buf);
        }

        let mut primary = self.header.clone();
        primary.signature = *HEADER_SIGNATURE;
        primary.revision = HEADER_REVISION;
        primary.ptbl_crc = ptbl_crc;
        primary.crc = 0;
        primary.crc = header_crc(&primary);

        log::info!("writing primary header at lba {}", primary.current_lba);
        write_header(&mut self.device, &primary, lbsize)?;
        log::info!("writing primary partition array at lba {}", primary.ptbl_lba);
        write_entries(&mut self.device, primary.ptbl_lba, lbsize, &entry_bufs)?;

        let array_blocks = div_ceil((ptbl_count as u64) * stride as u64, lbsize);
        let mut backup = primary.clone();
        backup.current_lba = self.header.backup_lba;
        backup.backup_lba = 1;
        // The backup array always sits in the `array_blocks` immediately
        // before the backup header itself, regardless of whether the
        // device's total block count is known.
        backup.ptbl_lba = backup.current_lba - array_blocks;
        backup.crc = 0;
        backup.crc = header_crc(&backup);

        log::info!("writing backup header at lba {}", backup.current_lba);
        write_header(&mut self.device, &backup, lbsize)?;
        log::info!("writing backup partition array at lba {}", backup.ptbl_lba);
        write_entries(&mut self.device, backup.ptbl_lba, lbsize, &entry_bufs)?;

        log::debug!("syncing device after write");
        self.device.sync()?;

        self.header = primary;
        self.backup_header = Some(backup);
        Ok(())
    }

    /// Stream a partition's payload to a newly-created file.
    pub fn part_save(&mut self, idx: u32, file: &mut std::fs::File) -> Result<()> {
        let entry = self.table.entry(idx)?.clone();
        let lbsize = self.lbsize() as u64;
        let mut remaining = (entry.last_lba - entry.first_lba + 1) * lbsize;
        let mut offset = entry.first_lba * lbsize;
        const CHUNK: u64 = 4096;
        while remaining > 0 {
            let chunk = remaining.min(CHUNK) as usize;
            let data = self.device.seek_and_read(offset, chunk)?;
            std::io::Write::write_all(file, &data)?;
            offset += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Restore a partition's payload from a file, which must be exactly the
    /// partition's size.
    pub fn part_load(&mut self, idx: u32, file: &mut std::fs::File) -> Result<()> {
        let entry = self.table.entry(idx)?.clone();
        let lbsize = self.lbsize() as u64;
        let expected = (entry.last_lba - entry.first_lba + 1) * lbsize;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(GptError::Precondition(format!(
                "file is {actual} bytes, partition is {expected} bytes"
            )));
        }

        let mut offset = entry.first_lba * lbsize;
        let mut remaining = expected;
        let mut buf = [0u8; 4096];
        use std::io::Read;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            file.read_exact(&mut buf[..chunk])?;
            self.device.seek_and_write(offset, &buf[..chunk])?;
            offset += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

/// Hash the full `header.size`-byte on-disk region -- the 92-byte encoded
/// struct plus zero padding out to `size` -- matching what `validate_header`
/// hashes back on the next open.
fn header_crc(header: &GptHeader) -> u32 {
    let encoded = header.encode();
    let size = header.size as usize;
    let mut block = vec![0u8; size];
    block[..HEADER_SIZE].copy_from_slice(&encoded);
    crc32(0, &block)
}

fn write_header<D: BlockDevice>(device: &mut D, header: &GptHeader, lbsize: u64) -> Result<()> {
    let mut block = vec![0u8; lbsize as usize];
    let encoded = header.encode();
    block[..encoded.len()].copy_from_slice(&encoded);
    device.seek_and_write(header.current_lba * lbsize, &block)
}

fn write_entries<D: BlockDevice>(
    device: &mut D,
    ptbl_lba: u64,
    lbsize: u64,
    entry_bufs: &[Vec<u8>],
) -> Result<()> {
    let mut offset = ptbl_lba * lbsize;
    for buf in entry_bufs {
        device.seek_and_write(offset, buf)?;
        offset += buf.len() as u64;
    }
    Ok(())
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

fn format_header_block(label: &str, header: &GptHeader) -> String {
    format!(
        "{label}:\n  size={}\n  current_lba={}\n  backup_lba={}\n  first_usable_lba={}\n  last_usable_lba={}\n  guid={}\n  ptbl_lba={}\n  ptbl_count={}\n  ptbl_entry_size={}\n",
        header.size,
        header.current_lba,
        header.backup_lba,
        header.first_usable_lba,
        header.last_usable_lba,
        crate::codec::guid_to_string(&header.disk_guid),
        header.ptbl_lba,
        header.ptbl_count,
        header.ptbl_entry_size,
    )
}
