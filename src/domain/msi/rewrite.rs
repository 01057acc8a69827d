//! Digital-signature stream replacement.
//!
//! The rewrite patches the original file image rather than rebuilding the
//! container: when the new blob fits the currently allocated chain (in the
//! same storage class) the sectors are overwritten in place; otherwise the
//! old chain is freed and a fresh one is allocated at end-of-file, growing
//! the FAT, miniFAT and DIFAT as needed. Either way every sector not
//! belonging to the signature stream or the allocation metadata keeps its
//! exact bytes, so the MSI hash over the other streams is unaffected.

use crate::domain::msi::parse::{
    walk_chain, MsiLayout, DIFAT_IN_HEADER, DIFSECT, DIRENT_FILE_SIZE, DIRENT_SIZE,
    DIRENT_START_SECTOR_LOC, ENDOFCHAIN, FATSECT, FREESECT, HEADER_DIFAT,
    HEADER_DIFAT_SECTORS_NUM, HEADER_DIFAT_SECTOR_LOC, HEADER_FAT_SECTORS_NUM,
    HEADER_MINI_FAT_SECTORS_NUM, HEADER_MINI_FAT_SECTOR_LOC, MINI_SECTOR_SIZE,
    MINI_STREAM_CUTOFF_SIZE,
};
use crate::infra::error::{TagError, TagResult};

/// Produce a new MSI image whose `\x05DigitalSignature` stream contains
/// exactly `new_der`.
pub fn set_signature_stream(
    data: &[u8],
    layout: &MsiLayout,
    new_der: &[u8],
) -> TagResult<Vec<u8>> {
    if new_der.is_empty() {
        return Err(TagError::MalformedPkcs7(
            "refusing to write an empty signature stream".to_string(),
        ));
    }
    let sig_index = layout.signature_index.ok_or(TagError::NoSignature)?;
    let entry = layout.signature_entry()?;
    let old_size = usize::try_from(entry.stream_size).map_err(|_| {
        TagError::MalformedContainer("signature stream size too large".to_string())
    })?;
    let old_mini = entry.in_ministream();
    let new_mini = new_der.len() < MINI_STREAM_CUTOFF_SIZE as usize;

    let old_chain = if old_size == 0 {
        Vec::new()
    } else if old_mini {
        walk_chain(&layout.minifat, entry.start_sector_location, "signature")?
    } else {
        walk_chain(&layout.fat, entry.start_sector_location, "signature")?
    };
    let unit = if old_mini {
        MINI_SECTOR_SIZE
    } else {
        layout.sector_size
    };

    let mut img = Image::new(data, layout);
    // Readers pick the FAT or the miniFAT by the entry's size, so the
    // storage class must follow the new size; a fit in the old chain only
    // counts when the class does not flip.
    if !old_chain.is_empty() && old_mini == new_mini && new_der.len() <= old_chain.len() * unit {
        log::debug!(
            "overwriting signature stream in place ({} -> {} bytes)",
            old_size,
            new_der.len()
        );
        img.overwrite_in_place(&old_chain, old_mini, new_der)?;
        img.set_dir_entry(sig_index, entry.start_sector_location, new_der.len() as u64)?;
    } else {
        log::debug!(
            "reallocating signature stream ({} -> {} bytes, {})",
            old_size,
            new_der.len(),
            if new_mini { "ministream" } else { "sectors" }
        );
        // Freed units are zeroed as well: stale signature bytes would
        // otherwise keep a previous tag marker findable in the file.
        for &id in &old_chain {
            img.zero_unit(id, old_mini)?;
            if old_mini {
                img.set_minifat(id as usize, FREESECT)?;
            } else {
                img.set_fat(id, FREESECT)?;
            }
        }
        let start = if new_mini {
            img.alloc_mini(new_der)?
        } else {
            img.alloc_regular(new_der)?
        };
        img.set_dir_entry(sig_index, start, new_der.len() as u64)?;
    }

    img.write_back()?;
    Ok(img.into_bytes())
}

/// Mutable working copy of the file image plus the allocation tables that
/// may change during the rewrite. Tables are flushed back into their
/// sectors by [`Image::write_back`].
struct Image<'a> {
    out: Vec<u8>,
    layout: &'a MsiLayout,
    sector_size: usize,
    total_sectors: usize,
    fat: Vec<u32>,
    fat_sector_ids: Vec<u32>,
    minifat: Vec<u32>,
    minifat_sector_ids: Vec<u32>,
    difat_sector_ids: Vec<u32>,
    header_difat: [u32; DIFAT_IN_HEADER],
    first_minifat: u32,
    first_difat: u32,
    ministream_sector_ids: Vec<u32>,
    root_start: u32,
    root_stream_size: u64,
}

impl<'a> Image<'a> {
    fn new(data: &[u8], layout: &'a MsiLayout) -> Self {
        let sector_size = layout.sector_size;
        let total_sectors = data
            .len()
            .saturating_sub(sector_size)
            .div_ceil(sector_size);
        let root = layout.root();
        Image {
            out: data.to_vec(),
            layout,
            sector_size,
            total_sectors,
            fat: layout.fat.clone(),
            fat_sector_ids: layout.fat_sector_ids.clone(),
            minifat: layout.minifat.clone(),
            minifat_sector_ids: layout.minifat_sector_ids.clone(),
            difat_sector_ids: layout.difat_sector_ids.clone(),
            header_difat: layout.header.difat,
            first_minifat: layout.header.first_minifat_sector_location,
            first_difat: layout.header.first_difat_sector_location,
            ministream_sector_ids: layout.ministream_sector_ids.clone(),
            root_start: root.start_sector_location,
            root_stream_size: root.stream_size,
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    fn sector_offset(&self, sid: u32) -> usize {
        (sid as usize + 1) * self.sector_size
    }

    fn entries_per_sector(&self) -> usize {
        self.sector_size / 4
    }

    fn write_at(&mut self, pos: usize, bytes: &[u8]) {
        let end = pos + bytes.len();
        if end > self.out.len() {
            self.out.resize(end, 0);
        }
        self.out[pos..end].copy_from_slice(bytes);
    }

    fn read_u32_at(&self, pos: usize) -> u32 {
        u32::from_le_bytes([
            self.out[pos],
            self.out[pos + 1],
            self.out[pos + 2],
            self.out[pos + 3],
        ])
    }

    /// Append one sector at end-of-file with `content` zero-padded; the
    /// caller is responsible for its FAT entry.
    fn append_raw_sector(&mut self, content: &[u8]) -> TagResult<u32> {
        let aligned = (self.total_sectors + 1) * self.sector_size;
        if self.out.len() < aligned {
            self.out.resize(aligned, 0);
        }
        let sid = u32::try_from(self.total_sectors).map_err(|_| {
            TagError::MalformedContainer("sector counter overflow".to_string())
        })?;
        self.total_sectors += 1;
        let mut sector = vec![0u8; self.sector_size];
        sector[..content.len()].copy_from_slice(content);
        self.out.extend_from_slice(&sector);
        Ok(sid)
    }

    /// Grow the FAT until it covers every allocated sector, then re-mark
    /// the FAT and DIFAT sectors themselves.
    fn ensure_fat_coverage(&mut self) -> TagResult<()> {
        let epc = self.entries_per_sector();
        while self.fat.len() < self.total_sectors {
            let sid = self.append_raw_sector(&[])?;
            let freesect = FREESECT.to_le_bytes().repeat(epc);
            let pos = self.sector_offset(sid);
            self.write_at(pos, &freesect);
            self.fat_sector_ids.push(sid);
            self.fat.resize(self.fat_sector_ids.len() * epc, FREESECT);
            self.register_fat_sector(sid)?;
            log::debug!("appended FAT sector {sid}");
        }
        // Idempotent for pre-existing sectors; newly appended FAT or DIFAT
        // sectors may predate the capacity that now covers them.
        for &sid in &self.fat_sector_ids.clone() {
            self.set_fat(sid, FATSECT)?;
        }
        for &sid in &self.difat_sector_ids.clone() {
            self.set_fat(sid, DIFSECT)?;
        }
        Ok(())
    }

    /// Record a new FAT sector's id in the DIFAT: a free header slot first,
    /// then free slots in chained DIFAT sectors, else a fresh DIFAT sector.
    fn register_fat_sector(&mut self, sid: u32) -> TagResult<()> {
        if let Some(slot) = self.header_difat.iter().position(|&v| v == FREESECT) {
            self.header_difat[slot] = sid;
            return Ok(());
        }
        let epc = self.entries_per_sector();
        for ds in self.difat_sector_ids.clone() {
            let base = self.sector_offset(ds);
            for k in 0..epc - 1 {
                if self.read_u32_at(base + k * 4) == FREESECT {
                    self.write_at(base + k * 4, &sid.to_le_bytes());
                    return Ok(());
                }
            }
        }

        let nsid = self.append_raw_sector(&[])?;
        let base = self.sector_offset(nsid);
        let mut sector = FREESECT.to_le_bytes().repeat(epc - 1);
        sector.extend_from_slice(&ENDOFCHAIN.to_le_bytes());
        self.write_at(base, &sector);
        if let Some(&last) = self.difat_sector_ids.last() {
            let link_pos = self.sector_offset(last) + (epc - 1) * 4;
            self.write_at(link_pos, &nsid.to_le_bytes());
        } else {
            self.first_difat = nsid;
        }
        self.difat_sector_ids.push(nsid);
        self.write_at(base, &sid.to_le_bytes());
        log::debug!("appended DIFAT sector {nsid}");
        Ok(())
    }

    fn set_fat(&mut self, id: u32, value: u32) -> TagResult<()> {
        let idx = id as usize;
        if idx >= self.fat.len() {
            return Err(TagError::MalformedContainer(format!(
                "FAT index {id} out of range ({} entries)",
                self.fat.len()
            )));
        }
        self.fat[idx] = value;
        Ok(())
    }

    fn set_minifat(&mut self, idx: usize, value: u32) -> TagResult<()> {
        self.ensure_minifat_coverage(idx + 1)?;
        self.minifat[idx] = value;
        Ok(())
    }

    /// Grow the miniFAT stream until it holds at least `count` entries.
    fn ensure_minifat_coverage(&mut self, count: usize) -> TagResult<()> {
        let epc = self.entries_per_sector();
        while self.minifat.len() < count {
            let sid = self.append_raw_sector(&[])?;
            let freesect = FREESECT.to_le_bytes().repeat(epc);
            let pos = self.sector_offset(sid);
            self.write_at(pos, &freesect);
            self.ensure_fat_coverage()?;
            if let Some(&last) = self.minifat_sector_ids.last() {
                self.set_fat(last, sid)?;
            } else {
                self.first_minifat = sid;
            }
            self.set_fat(sid, ENDOFCHAIN)?;
            self.minifat_sector_ids.push(sid);
            self.minifat.resize(self.minifat_sector_ids.len() * epc, FREESECT);
            log::debug!("appended miniFAT sector {sid}");
        }
        Ok(())
    }

    /// File offset of a mini-sector, resolved through the possibly grown
    /// ministream chain.
    fn mini_file_pos(&self, index: usize) -> TagResult<usize> {
        let byte_off = index * MINI_SECTOR_SIZE;
        let slot = byte_off / self.sector_size;
        let within = byte_off % self.sector_size;
        let sid = self.ministream_sector_ids.get(slot).ok_or_else(|| {
            TagError::MalformedContainer(format!(
                "mini-sector {index} is outside the ministream chain"
            ))
        })?;
        Ok(self.sector_offset(*sid) + within)
    }

    /// Grow the ministream's backing chain until it covers `bytes`.
    fn ensure_ministream_capacity(&mut self, bytes: usize) -> TagResult<()> {
        while self.ministream_sector_ids.len() * self.sector_size < bytes {
            let sid = self.append_raw_sector(&[])?;
            self.ensure_fat_coverage()?;
            if let Some(&last) = self.ministream_sector_ids.last() {
                self.set_fat(last, sid)?;
            } else {
                self.root_start = sid;
            }
            self.set_fat(sid, ENDOFCHAIN)?;
            self.ministream_sector_ids.push(sid);
            log::debug!("appended ministream sector {sid}");
        }
        Ok(())
    }

    /// Overwrite the existing chain with `new_der` and release any units
    /// past the new end.
    fn overwrite_in_place(&mut self, chain: &[u32], mini: bool, new_der: &[u8]) -> TagResult<()> {
        let unit = if mini {
            MINI_SECTOR_SIZE
        } else {
            self.sector_size
        };
        let used = new_der.len().div_ceil(unit);
        for (i, &id) in chain.iter().take(used).enumerate() {
            let chunk = &new_der[i * unit..((i + 1) * unit).min(new_der.len())];
            let mut buf = vec![0u8; unit];
            buf[..chunk.len()].copy_from_slice(chunk);
            let pos = if mini {
                self.mini_file_pos(id as usize)?
            } else {
                self.sector_offset(id)
            };
            self.write_at(pos, &buf);
        }
        // Units past the new end are released and zeroed so no stale
        // signature bytes (or a stale tag marker) survive in the file.
        if mini {
            self.set_minifat(chain[used - 1] as usize, ENDOFCHAIN)?;
            for &id in &chain[used..] {
                self.zero_unit(id, true)?;
                self.set_minifat(id as usize, FREESECT)?;
            }
        } else {
            self.set_fat(chain[used - 1], ENDOFCHAIN)?;
            for &id in &chain[used..] {
                self.zero_unit(id, false)?;
                self.set_fat(id, FREESECT)?;
            }
        }
        Ok(())
    }

    /// Zero one sector or mini-sector worth of bytes.
    fn zero_unit(&mut self, id: u32, mini: bool) -> TagResult<()> {
        let (pos, unit) = if mini {
            (self.mini_file_pos(id as usize)?, MINI_SECTOR_SIZE)
        } else {
            (self.sector_offset(id), self.sector_size)
        };
        let zeros = vec![0u8; unit];
        self.write_at(pos, &zeros);
        Ok(())
    }

    /// Allocate fresh sectors at end-of-file holding `new_der` and chain
    /// them in the FAT. Returns the start sector.
    fn alloc_regular(&mut self, new_der: &[u8]) -> TagResult<u32> {
        let mut sids = Vec::with_capacity(new_der.len().div_ceil(self.sector_size));
        for chunk in new_der.chunks(self.sector_size) {
            sids.push(self.append_raw_sector(chunk)?);
        }
        self.ensure_fat_coverage()?;
        for pair in sids.windows(2) {
            self.set_fat(pair[0], pair[1])?;
        }
        let last = *sids.last().ok_or_else(|| {
            TagError::MalformedContainer("empty signature allocation".to_string())
        })?;
        self.set_fat(last, ENDOFCHAIN)?;
        Ok(sids[0])
    }

    /// Allocate fresh mini-sectors at the end of the ministream and chain
    /// them in the miniFAT. Returns the start mini-sector index.
    fn alloc_mini(&mut self, new_der: &[u8]) -> TagResult<u32> {
        let root_size = usize::try_from(self.root_stream_size).map_err(|_| {
            TagError::MalformedContainer("ministream size too large".to_string())
        })?;
        let first = root_size.div_ceil(MINI_SECTOR_SIZE);
        let count = new_der.len().div_ceil(MINI_SECTOR_SIZE);

        self.ensure_ministream_capacity((first + count) * MINI_SECTOR_SIZE)?;
        for (i, chunk) in new_der.chunks(MINI_SECTOR_SIZE).enumerate() {
            let mut buf = [0u8; MINI_SECTOR_SIZE];
            buf[..chunk.len()].copy_from_slice(chunk);
            let pos = self.mini_file_pos(first + i)?;
            self.write_at(pos, &buf);
        }
        self.ensure_minifat_coverage(first + count)?;
        for i in 0..count {
            let next = if i + 1 == count {
                ENDOFCHAIN
            } else {
                u32::try_from(first + i + 1).map_err(|_| {
                    TagError::MalformedContainer("mini-sector index overflow".to_string())
                })?
            };
            self.set_minifat(first + i, next)?;
        }
        self.root_stream_size = ((first + count) * MINI_SECTOR_SIZE) as u64;
        u32::try_from(first)
            .map_err(|_| TagError::MalformedContainer("mini-sector index overflow".to_string()))
    }

    /// Patch a directory entry's start sector and stream size in place.
    fn set_dir_entry(&mut self, index: usize, start: u32, size: u64) -> TagResult<()> {
        let per = self.sector_size / DIRENT_SIZE;
        let sid = *self
            .layout
            .dir_sector_ids
            .get(index / per)
            .ok_or_else(|| {
                TagError::MalformedContainer(format!(
                    "directory entry {index} outside the directory stream"
                ))
            })?;
        let pos = self.sector_offset(sid) + (index % per) * DIRENT_SIZE;
        self.write_at(pos + DIRENT_START_SECTOR_LOC, &start.to_le_bytes());
        self.write_at(pos + DIRENT_FILE_SIZE, &size.to_le_bytes());
        Ok(())
    }

    /// Flush the allocation tables, header fields and root entry back into
    /// the image.
    fn write_back(&mut self) -> TagResult<()> {
        let epc = self.entries_per_sector();

        let fat_ids = self.fat_sector_ids.clone();
        for (si, &sid) in fat_ids.iter().enumerate() {
            let base = self.sector_offset(sid);
            for k in 0..epc {
                let value = self.fat.get(si * epc + k).copied().unwrap_or(FREESECT);
                self.write_at(base + k * 4, &value.to_le_bytes());
            }
        }

        let minifat_ids = self.minifat_sector_ids.clone();
        for (si, &sid) in minifat_ids.iter().enumerate() {
            let base = self.sector_offset(sid);
            for k in 0..epc {
                let value = self.minifat.get(si * epc + k).copied().unwrap_or(FREESECT);
                self.write_at(base + k * 4, &value.to_le_bytes());
            }
        }

        let num_fat = u32::try_from(self.fat_sector_ids.len())
            .map_err(|_| TagError::MalformedContainer("FAT sector count overflow".to_string()))?;
        let num_minifat = u32::try_from(self.minifat_sector_ids.len()).map_err(|_| {
            TagError::MalformedContainer("miniFAT sector count overflow".to_string())
        })?;
        let num_difat = u32::try_from(self.difat_sector_ids.len()).map_err(|_| {
            TagError::MalformedContainer("DIFAT sector count overflow".to_string())
        })?;
        self.write_at(HEADER_FAT_SECTORS_NUM, &num_fat.to_le_bytes());
        let first_minifat = self.first_minifat;
        self.write_at(HEADER_MINI_FAT_SECTOR_LOC, &first_minifat.to_le_bytes());
        self.write_at(HEADER_MINI_FAT_SECTORS_NUM, &num_minifat.to_le_bytes());
        let first_difat = self.first_difat;
        self.write_at(HEADER_DIFAT_SECTOR_LOC, &first_difat.to_le_bytes());
        self.write_at(HEADER_DIFAT_SECTORS_NUM, &num_difat.to_le_bytes());
        let header_difat = self.header_difat;
        for (i, value) in header_difat.iter().enumerate() {
            self.write_at(HEADER_DIFAT + i * 4, &value.to_le_bytes());
        }

        let root_index = self.layout.root_index;
        let root_start = self.root_start;
        let root_size = self.root_stream_size;
        self.set_dir_entry(root_index, root_start, root_size)?;
        Ok(())
    }
}
