//! MS-CFB container parsing.
//!
//! Reads just enough of the compound file to follow the allocation
//! structures: header, DIFAT, FAT, miniFAT, directory stream, ministream.
//! Sector numbering starts after the header, so sector N lives at file
//! offset `(N + 1) * sector_size`; a final sector may be truncated on disk
//! and reads back zero-padded.

use crate::infra::error::{TagError, TagResult};

/// The CFB header is always 512 bytes, independent of sector size.
pub(crate) const HEADER_SIZE: usize = 0x200;

/// Size threshold below which a stream is stored in the mini-stream.
pub(crate) const MINI_STREAM_CUTOFF_SIZE: u32 = 4096;

/// Mini-sector size (must be 64 bytes for MSI files).
pub(crate) const MINI_SECTOR_SIZE: usize = 64;

/// Directory entry size (bytes).
pub(crate) const DIRENT_SIZE: usize = 128;

/// Special values from MS-CFB.
pub(crate) const ENDOFCHAIN: u32 = 0xFFFF_FFFE;
pub(crate) const FATSECT: u32 = 0xFFFF_FFFD;
pub(crate) const DIFSECT: u32 = 0xFFFF_FFFC;
pub(crate) const FREESECT: u32 = 0xFFFF_FFFF;
pub(crate) const NOSTREAM: u32 = 0xFFFF_FFFF;

/// The number of DIFAT entries stored in the header.
pub(crate) const DIFAT_IN_HEADER: usize = 109;

// Header offsets.
pub(crate) const HEADER_MAJOR_VER: usize = 0x1A;
pub(crate) const HEADER_BYTE_ORDER: usize = 0x1C;
pub(crate) const HEADER_SECTOR_SHIFT: usize = 0x1E;
pub(crate) const HEADER_MINI_SECTOR_SHIFT: usize = 0x20;
pub(crate) const HEADER_FAT_SECTORS_NUM: usize = 0x2C;
pub(crate) const HEADER_DIR_SECTOR_LOC: usize = 0x30;
pub(crate) const HEADER_MINI_STREAM_CUTOFF: usize = 0x38;
pub(crate) const HEADER_MINI_FAT_SECTOR_LOC: usize = 0x3C;
pub(crate) const HEADER_MINI_FAT_SECTORS_NUM: usize = 0x40;
pub(crate) const HEADER_DIFAT_SECTOR_LOC: usize = 0x44;
pub(crate) const HEADER_DIFAT_SECTORS_NUM: usize = 0x48;
pub(crate) const HEADER_DIFAT: usize = 0x4C;

// Directory entry offsets.
pub(crate) const DIRENT_NAME: usize = 0x00;
pub(crate) const DIRENT_NAME_LEN: usize = 0x40;
pub(crate) const DIRENT_TYPE: usize = 0x42;
pub(crate) const DIRENT_START_SECTOR_LOC: usize = 0x74;
pub(crate) const DIRENT_FILE_SIZE: usize = 0x78;

/// Directory entry types.
pub(crate) const DIR_STREAM: u8 = 2;
pub(crate) const DIR_ROOT: u8 = 5;

/// The `\x05DigitalSignature` stream name (UTF-16LE incl. NUL).
pub(crate) const DIGITAL_SIGNATURE_NAME_UTF16LE: &[u8] = &[
    0x05, 0x00, // U+0005
    b'D', 0x00, b'i', 0x00, b'g', 0x00, b'i', 0x00, b't', 0x00, b'a', 0x00, b'l', 0x00, b'S', 0x00,
    b'i', 0x00, b'g', 0x00, b'n', 0x00, b'a', 0x00, b't', 0x00, b'u', 0x00, b'r', 0x00, b'e', 0x00,
    0x00, 0x00, // NUL
];

/// Parsed CFB header fields.
#[derive(Debug, Clone, Copy)]
pub struct CfbHeader {
    pub major_version: u16,
    pub sector_shift: u16,
    pub mini_sector_shift: u16,
    pub num_fat_sectors: u32,
    pub first_directory_sector_location: u32,
    pub mini_stream_cutoff_size: u32,
    pub first_minifat_sector_location: u32,
    pub num_minifat_sectors: u32,
    pub first_difat_sector_location: u32,
    pub num_difat_sectors: u32,
    pub difat: [u32; DIFAT_IN_HEADER],
}

impl CfbHeader {
    /// Sector size in bytes.
    #[must_use]
    pub fn sector_size(&self) -> usize {
        1usize << self.sector_shift
    }
}

/// The directory entry fields the rewriter needs.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Index in the directory table.
    pub id: u32,
    /// Name bytes (UTF-16LE), including the NUL terminator.
    pub name_utf16le: Vec<u8>,
    /// Object type.
    pub object_type: u8,
    /// Start sector location (FAT sector id, or miniFAT id for small
    /// streams).
    pub start_sector_location: u32,
    /// Stream size in bytes.
    pub stream_size: u64,
}

impl DirEntry {
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.object_type == DIR_STREAM
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.object_type == DIR_ROOT
    }

    /// True if this entry names `\x05DigitalSignature`.
    #[must_use]
    pub fn is_digital_signature(&self) -> bool {
        self.name_utf16le == DIGITAL_SIGNATURE_NAME_UTF16LE
    }

    /// Streams below the cutoff live in the ministream.
    #[must_use]
    pub fn in_ministream(&self) -> bool {
        self.stream_size < u64::from(MINI_STREAM_CUTOFF_SIZE)
    }
}

/// MSI layout descriptor: allocation structures plus the entries the
/// rewriter touches.
#[derive(Debug, Clone)]
pub struct MsiLayout {
    pub header: CfbHeader,
    pub sector_size: usize,
    /// FAT sector ids in DIFAT order.
    pub fat_sector_ids: Vec<u32>,
    /// DIFAT sector chain.
    pub difat_sector_ids: Vec<u32>,
    /// The FAT, one entry per sector.
    pub fat: Vec<u32>,
    /// Sector chain of the miniFAT stream.
    pub minifat_sector_ids: Vec<u32>,
    /// The miniFAT, one entry per mini-sector.
    pub minifat: Vec<u32>,
    /// Sector chain of the directory stream.
    pub dir_sector_ids: Vec<u32>,
    /// Parsed directory entries.
    pub entries: Vec<DirEntry>,
    pub root_index: usize,
    /// Directory index of `\x05DigitalSignature`, when present.
    pub signature_index: Option<usize>,
    /// Sector chain backing the ministream (the root entry's stream).
    pub ministream_sector_ids: Vec<u32>,
}

impl MsiLayout {
    #[must_use]
    pub fn root(&self) -> &DirEntry {
        &self.entries[self.root_index]
    }

    /// The signature entry. Callers check `signature_index` first.
    pub fn signature_entry(&self) -> TagResult<&DirEntry> {
        self.signature_index
            .map(|i| &self.entries[i])
            .ok_or(TagError::NoSignature)
    }

    /// File offset of mini-sector `index` within the ministream, resolved
    /// through the root entry's sector chain.
    pub fn mini_file_pos(&self, index: usize) -> TagResult<usize> {
        let byte_off = index * MINI_SECTOR_SIZE;
        let sector_slot = byte_off / self.sector_size;
        let within = byte_off % self.sector_size;
        let sid = self.ministream_sector_ids.get(sector_slot).ok_or_else(|| {
            TagError::MalformedContainer(format!(
                "mini-sector {index} is outside the ministream chain"
            ))
        })?;
        Ok(sector_offset(self.sector_size, *sid) + within)
    }
}

/// File offset of sector `sid`. The header occupies one full sector slot.
#[must_use]
pub(crate) fn sector_offset(sector_size: usize, sid: u32) -> usize {
    (sid as usize + 1) * sector_size
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Read sector `sid`, zero-padding a truncated final sector.
pub(crate) fn read_sector(data: &[u8], sector_size: usize, sid: u32) -> TagResult<Vec<u8>> {
    let offset = sector_offset(sector_size, sid);
    if offset >= data.len() {
        return Err(TagError::MalformedContainer(format!(
            "sector {sid} starts past end of file (offset {offset}, file {} bytes)",
            data.len()
        )));
    }
    let available = data.len() - offset;
    if available >= sector_size {
        Ok(data[offset..offset + sector_size].to_vec())
    } else {
        log::debug!("zero-padding truncated sector {sid} ({available} of {sector_size} bytes)");
        let mut sector = vec![0u8; sector_size];
        sector[..available].copy_from_slice(&data[offset..]);
        Ok(sector)
    }
}

/// Follow a (mini)FAT chain from `start`, returning the visited ids.
pub(crate) fn walk_chain(table: &[u32], start: u32, what: &str) -> TagResult<Vec<u32>> {
    if start == NOSTREAM || start == ENDOFCHAIN {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    let mut visited = vec![false; table.len()];
    let mut cur = start;
    while cur != ENDOFCHAIN {
        let idx = cur as usize;
        if idx >= table.len() {
            return Err(TagError::MalformedContainer(format!(
                "{what} chain index {cur} out of range ({} entries)",
                table.len()
            )));
        }
        if visited[idx] {
            return Err(TagError::MalformedContainer(format!(
                "{what} chain cycle detected at {cur}"
            )));
        }
        visited[idx] = true;
        ids.push(cur);
        cur = table[idx];
        if cur == FREESECT {
            return Err(TagError::MalformedContainer(format!(
                "{what} chain runs into a free sector"
            )));
        }
    }
    Ok(ids)
}

fn parse_header(data: &[u8]) -> TagResult<CfbHeader> {
    if data.len() < HEADER_SIZE {
        return Err(TagError::MalformedContainer(
            "file too small for CFB header".to_string(),
        ));
    }
    if data[0..8] != super::MSI_MAGIC {
        return Err(TagError::MalformedContainer(
            "missing CFB signature".to_string(),
        ));
    }

    let major_version = read_u16(data, HEADER_MAJOR_VER);
    let byte_order = read_u16(data, HEADER_BYTE_ORDER);
    let sector_shift = read_u16(data, HEADER_SECTOR_SHIFT);
    let mini_sector_shift = read_u16(data, HEADER_MINI_SECTOR_SHIFT);

    if major_version != 3 && major_version != 4 {
        return Err(TagError::MalformedContainer(format!(
            "unsupported CFB major version {major_version}"
        )));
    }
    if byte_order != 0xFFFE {
        return Err(TagError::MalformedContainer(format!(
            "unexpected CFB byte order 0x{byte_order:04X}"
        )));
    }
    if sector_shift != 9 && sector_shift != 12 {
        return Err(TagError::MalformedContainer(format!(
            "unsupported sector shift {sector_shift}"
        )));
    }
    if mini_sector_shift != 6 {
        return Err(TagError::MalformedContainer(format!(
            "unexpected mini sector shift {mini_sector_shift} (expected 6)"
        )));
    }

    let mini_stream_cutoff_size = read_u32(data, HEADER_MINI_STREAM_CUTOFF);
    if mini_stream_cutoff_size != MINI_STREAM_CUTOFF_SIZE {
        return Err(TagError::MalformedContainer(format!(
            "unexpected mini-stream cutoff {mini_stream_cutoff_size} (expected 4096)"
        )));
    }

    let mut difat = [FREESECT; DIFAT_IN_HEADER];
    for (i, slot) in difat.iter_mut().enumerate() {
        *slot = read_u32(data, HEADER_DIFAT + i * 4);
    }

    Ok(CfbHeader {
        major_version,
        sector_shift,
        mini_sector_shift,
        num_fat_sectors: read_u32(data, HEADER_FAT_SECTORS_NUM),
        first_directory_sector_location: read_u32(data, HEADER_DIR_SECTOR_LOC),
        mini_stream_cutoff_size,
        first_minifat_sector_location: read_u32(data, HEADER_MINI_FAT_SECTOR_LOC),
        num_minifat_sectors: read_u32(data, HEADER_MINI_FAT_SECTORS_NUM),
        first_difat_sector_location: read_u32(data, HEADER_DIFAT_SECTOR_LOC),
        num_difat_sectors: read_u32(data, HEADER_DIFAT_SECTORS_NUM),
        difat,
    })
}

fn collect_fat_sector_ids(
    header: &CfbHeader,
    data: &[u8],
) -> TagResult<(Vec<u32>, Vec<u32>)> {
    let sector_size = header.sector_size();
    let mut fat_sector_ids = Vec::new();
    for &sid in &header.difat {
        if sid != FREESECT && sid != ENDOFCHAIN {
            fat_sector_ids.push(sid);
        }
    }

    // Additional FAT sector ids live in chained DIFAT sectors: all but the
    // last u32 of each are FAT sector locations, the last links onward.
    let mut difat_sector_ids = Vec::new();
    let mut next = header.first_difat_sector_location;
    let mut remaining = header.num_difat_sectors;
    while remaining > 0 && next != ENDOFCHAIN && next != FREESECT {
        if difat_sector_ids.contains(&next) {
            return Err(TagError::MalformedContainer(
                "DIFAT chain cycle detected".to_string(),
            ));
        }
        difat_sector_ids.push(next);
        let sector = read_sector(data, sector_size, next)?;
        for chunk in sector[..sector_size - 4].chunks_exact(4) {
            let sid = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if sid != FREESECT && sid != ENDOFCHAIN {
                fat_sector_ids.push(sid);
            }
        }
        next = read_u32(&sector, sector_size - 4);
        remaining -= 1;
    }

    if fat_sector_ids.len() != header.num_fat_sectors as usize {
        return Err(TagError::MalformedContainer(format!(
            "FAT sector count mismatch (header {}, DIFAT lists {})",
            header.num_fat_sectors,
            fat_sector_ids.len()
        )));
    }

    Ok((fat_sector_ids, difat_sector_ids))
}

fn parse_directory_entries(dir_bytes: &[u8]) -> TagResult<Vec<DirEntry>> {
    if !dir_bytes.len().is_multiple_of(DIRENT_SIZE) {
        return Err(TagError::MalformedContainer(
            "directory stream length is not a multiple of 128".to_string(),
        ));
    }

    let mut entries = Vec::new();
    for (i, chunk) in dir_bytes.chunks_exact(DIRENT_SIZE).enumerate() {
        let name_len = usize::from(read_u16(chunk, DIRENT_NAME_LEN)).min(DIRENT_NAME_LEN);
        let stream_size_lo = read_u32(chunk, DIRENT_FILE_SIZE);
        let stream_size_hi = read_u32(chunk, DIRENT_FILE_SIZE + 4);
        entries.push(DirEntry {
            id: u32::try_from(i).map_err(|_| {
                TagError::MalformedContainer("directory entry index overflow".to_string())
            })?,
            name_utf16le: chunk[DIRENT_NAME..DIRENT_NAME + name_len].to_vec(),
            object_type: chunk[DIRENT_TYPE],
            start_sector_location: read_u32(chunk, DIRENT_START_SECTOR_LOC),
            stream_size: (u64::from(stream_size_hi) << 32) | u64::from(stream_size_lo),
        });
    }
    Ok(entries)
}

/// Parse an MSI file into its layout descriptor.
///
/// # Errors
/// `MalformedContainer` on any structural inconsistency.
pub fn parse_layout(data: &[u8]) -> TagResult<MsiLayout> {
    let header = parse_header(data)?;
    let sector_size = header.sector_size();

    let (fat_sector_ids, difat_sector_ids) = collect_fat_sector_ids(&header, data)?;
    let mut fat = Vec::with_capacity(fat_sector_ids.len() * (sector_size / 4));
    for &sid in &fat_sector_ids {
        let sector = read_sector(data, sector_size, sid)?;
        for chunk in sector.chunks_exact(4) {
            fat.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
    }

    let dir_sector_ids = walk_chain(&fat, header.first_directory_sector_location, "directory")?;
    if dir_sector_ids.is_empty() {
        return Err(TagError::MalformedContainer(
            "empty directory stream".to_string(),
        ));
    }
    let mut dir_bytes = Vec::with_capacity(dir_sector_ids.len() * sector_size);
    for &sid in &dir_sector_ids {
        dir_bytes.extend_from_slice(&read_sector(data, sector_size, sid)?);
    }
    let entries = parse_directory_entries(&dir_bytes)?;

    let root_index = entries.iter().position(DirEntry::is_root).ok_or_else(|| {
        TagError::MalformedContainer("missing root directory entry".to_string())
    })?;

    let signature_index = entries
        .iter()
        .position(|e| e.is_stream() && e.is_digital_signature());

    let minifat_sector_ids = if header.num_minifat_sectors == 0 {
        Vec::new()
    } else {
        walk_chain(&fat, header.first_minifat_sector_location, "miniFAT")?
    };
    let mut minifat = Vec::with_capacity(minifat_sector_ids.len() * (sector_size / 4));
    for &sid in &minifat_sector_ids {
        let sector = read_sector(data, sector_size, sid)?;
        for chunk in sector.chunks_exact(4) {
            minifat.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
    }

    let root = &entries[root_index];
    let ministream_sector_ids = if root.stream_size == 0 {
        Vec::new()
    } else {
        walk_chain(&fat, root.start_sector_location, "ministream")?
    };

    Ok(MsiLayout {
        header,
        sector_size,
        fat_sector_ids,
        difat_sector_ids,
        fat,
        minifat_sector_ids,
        minifat,
        dir_sector_ids,
        entries,
        root_index,
        signature_index,
        ministream_sector_ids,
    })
}

/// Reconstruct the digital-signature stream bytes, truncated to the
/// directory entry's declared size.
pub fn read_signature_stream(data: &[u8], layout: &MsiLayout) -> TagResult<Vec<u8>> {
    let entry = layout.signature_entry()?;
    let len = usize::try_from(entry.stream_size)
        .map_err(|_| TagError::MalformedContainer("signature stream size too large".to_string()))?;
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::with_capacity(len);
    if entry.in_ministream() {
        let chain = walk_chain(&layout.minifat, entry.start_sector_location, "signature")?;
        for &mini in &chain {
            let pos = layout.mini_file_pos(mini as usize)?;
            let mut chunk = [0u8; MINI_SECTOR_SIZE];
            if pos < data.len() {
                let available = (data.len() - pos).min(MINI_SECTOR_SIZE);
                chunk[..available].copy_from_slice(&data[pos..pos + available]);
            }
            out.extend_from_slice(&chunk);
        }
    } else {
        let chain = walk_chain(&layout.fat, entry.start_sector_location, "signature")?;
        for &sid in &chain {
            out.extend_from_slice(&read_sector(data, layout.sector_size, sid)?);
        }
    }
    if out.len() < len {
        return Err(TagError::MalformedContainer(format!(
            "signature stream chain covers {} bytes, directory declares {len}",
            out.len()
        )));
    }
    out.truncate(len);
    Ok(out)
}

/// Absolute file offset of the first byte of the signature stream.
pub fn signature_offset(layout: &MsiLayout) -> TagResult<usize> {
    let entry = layout.signature_entry()?;
    if entry.stream_size == 0 || entry.start_sector_location == NOSTREAM {
        return Err(TagError::NoSignature);
    }
    if entry.in_ministream() {
        layout.mini_file_pos(entry.start_sector_location as usize)
    } else {
        Ok(sector_offset(layout.sector_size, entry.start_sector_location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_bad_magic() {
        let data = vec![0u8; HEADER_SIZE];
        assert!(matches!(
            parse_header(&data),
            Err(TagError::MalformedContainer(_))
        ));
    }

    #[test]
    fn header_rejects_bad_byte_order() {
        let mut data = vec![0u8; HEADER_SIZE];
        data[..8].copy_from_slice(&super::super::MSI_MAGIC);
        data[HEADER_MAJOR_VER] = 3;
        data[HEADER_BYTE_ORDER] = 0xFF;
        data[HEADER_BYTE_ORDER + 1] = 0xFF;
        assert!(matches!(
            parse_header(&data),
            Err(TagError::MalformedContainer(_))
        ));
    }

    #[test]
    fn walk_chain_detects_cycles() {
        let fat = vec![1u32, 0];
        assert!(matches!(
            walk_chain(&fat, 0, "test"),
            Err(TagError::MalformedContainer(_))
        ));
    }

    #[test]
    fn walk_chain_handles_empty_start() {
        let fat = vec![ENDOFCHAIN];
        assert!(walk_chain(&fat, NOSTREAM, "test").unwrap().is_empty());
        assert_eq!(walk_chain(&fat, 0, "test").unwrap(), vec![0]);
    }

    #[test]
    fn sector_offsets_skip_header() {
        assert_eq!(sector_offset(512, 0), 512);
        assert_eq!(sector_offset(512, 3), 2048);
        assert_eq!(sector_offset(4096, 0), 4096);
    }
}
