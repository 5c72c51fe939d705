//! In-memory partition table: an ordered, fixed-length set of entry slots
//! plus the mutation operations that keep it consistent (`§3` invariants).
//!
//! The table owns its entries outright (no shared/cyclic structure) and is
//! modeled as a plain `Vec`, not a linked list -- shifting slots on
//! add/delete is O(N) over at most `MAX_PARTS` entries, which is trivial.

use crate::codec::PartitionEntry;
use crate::error::{GptError, Result};
use crate::profile::GptProfile;

#[derive(Debug, Clone)]
pub struct GptTable {
    entries: Vec<PartitionEntry>,
    last_used_idx: Option<u32>,
    first_usable_lba: u64,
    last_usable_lba: u64,
    profile: GptProfile,
}

fn translate(entry: &PartitionEntry, delta: i64) -> Result<PartitionEntry> {
    let mut out = entry.clone();
    out.first_lba = apply_delta(entry.first_lba, delta)?;
    out.last_lba = apply_delta(entry.last_lba, delta)?;
    Ok(out)
}

fn apply_delta(lba: u64, delta: i64) -> Result<u64> {
    let shifted = lba as i64 + delta;
    if shifted < 0 {
        return Err(GptError::Format(format!(
            "lba {lba} plus delta {delta} underflows"
        )));
    }
    Ok(shifted as u64)
}

impl GptTable {
    pub fn new(
        entries: Vec<PartitionEntry>,
        first_usable_lba: u64,
        last_usable_lba: u64,
        profile: GptProfile,
    ) -> Self {
        let last_used_idx = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_empty())
            .map(|(i, _)| i as u32)
            .max();
        GptTable {
            entries,
            last_used_idx,
            first_usable_lba,
            last_usable_lba,
            profile,
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_used_idx(&self) -> Option<u32> {
        self.last_used_idx
    }

    pub fn first_usable_lba(&self) -> u64 {
        self.first_usable_lba
    }

    pub fn last_usable_lba(&self) -> u64 {
        self.last_usable_lba
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn non_empty_entries(&self) -> impl Iterator<Item = (u32, &PartitionEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i as u32, e))
            .filter(|(_, e)| !e.is_empty())
    }

    pub fn entry(&self, idx: u32) -> Result<&PartitionEntry> {
        self.entries
            .get(idx as usize)
            .ok_or_else(|| GptError::Policy(format!("index {idx} out of range")))
    }

    fn check_mutable(&self, idx: u32) -> Result<()> {
        if idx < self.profile.readonly_prefix {
            return Err(GptError::Policy(format!(
                "partition slot {idx} is read-only"
            )));
        }
        Ok(())
    }

    fn require_occupied(&self, idx: u32) -> Result<u32> {
        let last = self
            .last_used_idx
            .ok_or_else(|| GptError::Policy("partition table is empty".to_string()))?;
        if idx > last {
            return Err(GptError::Policy(format!("index {idx} out of range")));
        }
        Ok(last)
    }

    pub fn find(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.decoded_name() == name)
            .map(|i| i as u32)
    }

    pub fn name(&self, idx: u32) -> Result<String> {
        Ok(self.entry(idx)?.decoded_name())
    }

    pub fn size_bytes(&self, idx: u32, lbsize: u32) -> Result<u64> {
        let e = self.entry(idx)?;
        Ok((e.last_lba - e.first_lba + 1) * lbsize as u64)
    }

    /// The size (in bytes) that would put this partition's end exactly at
    /// `last_usable_lba` -- what the shell's `part-resize <name> max follow`
    /// resolves to.
    pub fn size_to_fill(&self, idx: u32, lbsize: u32) -> Result<u64> {
        let last = self.require_occupied(idx)?;
        let entry = self.entry(idx)?;
        let cur_len = entry.last_lba - entry.first_lba + 1;
        let tail = self.entry(last)?;
        let room = self.last_usable_lba - tail.last_lba;
        Ok((cur_len + room) * lbsize as u64)
    }

    /// Insert a non-empty entry at `idx`, shifting `idx..=last_used_idx` up
    /// by one slot. `idx` must be within `0..=last_used_idx + 1` and the
    /// table must have a free slot.
    pub fn part_add(&mut self, idx: u32, entry: PartitionEntry) -> Result<()> {
        self.check_mutable(idx)?;
        if entry.is_empty() {
            return Err(GptError::Policy("cannot add an empty entry".to_string()));
        }
        let next_free = self.last_used_idx.map_or(0, |l| l + 1);
        if idx > next_free {
            return Err(GptError::Policy(format!(
                "index {idx} is past the first free slot {next_free}"
            )));
        }
        if next_free >= self.len() {
            return Err(GptError::Policy("partition table is full".to_string()));
        }

        let lba_min = if idx == 0 {
            self.first_usable_lba
        } else {
            self.entry(idx - 1)?.last_lba + 1
        };
        let lba_max = if idx == next_free {
            self.last_usable_lba
        } else {
            self.entry(idx)?.first_lba - 1
        };
        if entry.first_lba < lba_min || entry.first_lba > entry.last_lba || entry.last_lba > lba_max
        {
            return Err(GptError::Policy(format!(
                "partition [{}, {}] outside allowed range [{lba_min}, {lba_max}]",
                entry.first_lba, entry.last_lba
            )));
        }

        if let Some(last) = self.last_used_idx {
            for n in (idx..=last).rev() {
                self.entries[(n + 1) as usize] = self.entries[n as usize].clone();
            }
        }
        self.entries[idx as usize] = entry;
        self.last_used_idx = Some(next_free);
        Ok(())
    }

    /// Remove the entry at `idx`. With `follow`, every trailing entry is
    /// translated down by the removed entry's length so it abuts its new
    /// predecessor; without, trailing LBAs are left untouched. Either way
    /// the table is re-packed so non-empty entries occupy a prefix.
    pub fn part_del(&mut self, idx: u32, follow: bool) -> Result<()> {
        self.check_mutable(idx)?;
        let last = self.require_occupied(idx)?;

        let removed = self.entry(idx)?.clone();
        let len = removed.last_lba - removed.first_lba + 1;
        let delta: i64 = -(len as i64);

        for n in idx..last {
            let mut next = self.entries[(n + 1) as usize].clone();
            if follow {
                next = translate(&next, delta)?;
            }
            self.entries[n as usize] = next;
        }
        self.entries[last as usize] = PartitionEntry::EMPTY;
        self.last_used_idx = if last == 0 { None } else { Some(last - 1) };
        Ok(())
    }

    /// Translate entry `idx` so its `first_lba` becomes `new_first_lba`.
    /// With `follow`, every entry after it is translated by the same delta.
    pub fn part_move(&mut self, idx: u32, new_first_lba: u64, follow: bool) -> Result<()> {
        self.check_mutable(idx)?;
        let last = self.require_occupied(idx)?;
        let entry = self.entry(idx)?.clone();
        let delta = new_first_lba as i64 - entry.first_lba as i64;
        if delta == 0 {
            return Ok(());
        }

        if delta < 0 {
            let lba_min = if idx == 0 {
                self.first_usable_lba
            } else {
                self.entry(idx - 1)?.last_lba + 1
            };
            if new_first_lba < lba_min {
                return Err(GptError::Policy(format!(
                    "move below minimum lba {lba_min}"
                )));
            }
        } else {
            let max_delta = if idx == last || follow {
                self.last_usable_lba as i64 - self.entry(last)?.last_lba as i64
            } else {
                self.entry(idx + 1)?.first_lba as i64 - entry.last_lba as i64 - 1
            };
            if delta > max_delta {
                return Err(GptError::Policy(
                    "move exceeds available space".to_string(),
                ));
            }
        }

        self.entries[idx as usize] = translate(&entry, delta)?;
        if follow {
            for n in (idx + 1)..=last {
                self.entries[n as usize] = translate(self.entry(n)?, delta)?;
            }
        }
        Ok(())
    }

    /// Resize entry `idx` by changing its `last_lba`. `new_size_bytes` must
    /// be a multiple of `lbsize`. With `follow`, every entry after it is
    /// translated by the same delta.
    pub fn part_resize(
        &mut self,
        idx: u32,
        new_size_bytes: u64,
        lbsize: u32,
        follow: bool,
    ) -> Result<()> {
        self.check_mutable(idx)?;
        if new_size_bytes % lbsize as u64 != 0 {
            return Err(GptError::Policy(
                "size must be a multiple of the logical block size".to_string(),
            ));
        }
        let last = self.require_occupied(idx)?;
        let entry = self.entry(idx)?.clone();
        let cur_len = entry.last_lba - entry.first_lba + 1;
        let new_len = new_size_bytes / lbsize as u64;
        let lbdelta = new_len as i64 - cur_len as i64;
        if lbdelta == 0 {
            return Ok(());
        }

        if lbdelta > 0 {
            let max_delta = if idx == last || follow {
                self.last_usable_lba as i64 - self.entry(last)?.last_lba as i64
            } else {
                self.entry(idx + 1)?.first_lba as i64 - entry.last_lba as i64 - 1
            };
            if lbdelta > max_delta {
                return Err(GptError::Policy(
                    "resize exceeds available space".to_string(),
                ));
            }
        } else {
            let new_last = entry.last_lba as i64 + lbdelta;
            if new_last < entry.first_lba as i64 {
                return Err(GptError::Policy(
                    "resize would invert partition bounds".to_string(),
                ));
            }
        }

        let mut updated = entry.clone();
        updated.last_lba = (entry.last_lba as i64 + lbdelta) as u64;
        self.entries[idx as usize] = updated;

        if follow {
            for n in (idx + 1)..=last {
                self.entries[n as usize] = translate(self.entry(n)?, lbdelta)?;
            }
        }
        Ok(())
    }

    /// Verify invariants §3(1)-(4). Exposed for tests and for the opener's
    /// post-load sanity check.
    pub fn check_invariants(&self) -> Result<()> {
        let mut prev_last: Option<u64> = None;
        let mut seen_empty = false;
        let mut count = 0u32;
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_empty() {
                seen_empty = true;
                continue;
            }
            if seen_empty {
                return Err(GptError::Format(format!(
                    "non-empty entry {i} follows an empty slot"
                )));
            }
            if e.first_lba < self.first_usable_lba
                || e.first_lba > e.last_lba
                || e.last_lba > self.last_usable_lba
            {
                return Err(GptError::Format(format!(
                    "entry {i} [{}, {}] outside usable range [{}, {}]",
                    e.first_lba, e.last_lba, self.first_usable_lba, self.last_usable_lba
                )));
            }
            if let Some(prev) = prev_last {
                if prev >= e.first_lba {
                    return Err(GptError::Format(format!(
                        "entry {i} overlaps or is out of order with its predecessor"
                    )));
                }
            }
            prev_last = Some(e.last_lba);
            count += 1;
        }
        if count > self.len() {
            return Err(GptError::Format(
                "more non-empty entries than the table's capacity".to_string(),
            ));
        }
        Ok(())
    }
}
