//! Synthetic signed binaries for integration tests.
//!
//! The PE fixture is built byte-by-byte: a parseable PE32/PE32+ image with
//! one `.text` section and a real Attribute Certificate Table. The MSI
//! fixture is produced by the `cfb` crate so the rewriter is exercised
//! against an independent CFB writer.

use certificate_tag::domain::asn1;
use certificate_tag::domain::pe::checksum;
use std::io::{Cursor, Read, Write};

/// signedData content type OID TLV (1.2.840.113549.1.7.2).
const SIGNED_DATA_OID: [u8; 11] = [
    0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02,
];

/// Build a structurally complete `ContentInfo { SignedData }` with the given
/// certificates and `signer_bulk` bytes of opaque signerInfo content.
pub fn build_test_pkcs7(certs: &[&[u8]], signer_bulk: usize) -> Vec<u8> {
    let version = [0x02, 0x01, 0x01];
    let digest_algorithms = asn1::set(&[]).unwrap();
    // encapContentInfo: SEQUENCE { OID data (1.2.840.113549.1.7.1) }
    let content_info = asn1::sequence(&[
        0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01,
    ])
    .unwrap();
    let signer = asn1::sequence(&vec![0x77u8; signer_bulk]).unwrap();
    let signer_infos = asn1::set(&signer).unwrap();

    let mut sd_body = Vec::new();
    sd_body.extend_from_slice(&version);
    sd_body.extend_from_slice(&digest_algorithms);
    sd_body.extend_from_slice(&content_info);
    if !certs.is_empty() {
        let mut certs_body = Vec::new();
        for c in certs {
            certs_body.extend_from_slice(c);
        }
        sd_body.extend_from_slice(&asn1::context(0, &certs_body).unwrap());
    }
    sd_body.extend_from_slice(&signer_infos);

    let signed_data = asn1::sequence(&sd_body).unwrap();
    let explicit = asn1::context(0, &signed_data).unwrap();
    let mut ci_body = SIGNED_DATA_OID.to_vec();
    ci_body.extend_from_slice(&explicit);
    asn1::sequence(&ci_body).unwrap()
}

/// An opaque certificate-shaped SEQUENCE for populating certificate sets.
pub fn opaque_cert(filler: u8, len: usize) -> Vec<u8> {
    asn1::sequence(&vec![filler; len]).unwrap()
}

fn align8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// Build a parseable signed PE image with one section and a single
/// PKCS_SIGNED_DATA entry in the Attribute Certificate Table at
/// end-of-file. `with_checksum` selects whether the optional-header
/// checksum is populated or left zero.
pub fn build_signed_pe(pe32_plus: bool, pkcs7: &[u8], with_checksum: bool) -> Vec<u8> {
    let pe_off = 0x80usize;
    let opt_off = pe_off + 24;
    let size_of_optional_header = if pe32_plus { 0xF0usize } else { 0xE0usize };
    let section_table_off = opt_off + size_of_optional_header;
    let section_raw_off = 0x200usize;
    let section_raw_size = 0x200usize;
    let end_of_image = section_raw_off + section_raw_size;

    let mut pe = vec![0u8; end_of_image];
    pe[0] = b'M';
    pe[1] = b'Z';
    pe[0x3C..0x40].copy_from_slice(&(pe_off as u32).to_le_bytes());
    pe[pe_off..pe_off + 4].copy_from_slice(b"PE\0\0");

    // COFF header
    let coff_off = pe_off + 4;
    let machine: u16 = if pe32_plus { 0x8664 } else { 0x014C };
    pe[coff_off..coff_off + 2].copy_from_slice(&machine.to_le_bytes());
    pe[coff_off + 2..coff_off + 4].copy_from_slice(&1u16.to_le_bytes());
    pe[coff_off + 16..coff_off + 18]
        .copy_from_slice(&(size_of_optional_header as u16).to_le_bytes());
    pe[coff_off + 18..coff_off + 20].copy_from_slice(&0x0102u16.to_le_bytes());

    // Optional header
    let magic: u16 = if pe32_plus { 0x20B } else { 0x10B };
    pe[opt_off..opt_off + 2].copy_from_slice(&magic.to_le_bytes());
    // SectionAlignment / FileAlignment
    pe[opt_off + 32..opt_off + 36].copy_from_slice(&0x1000u32.to_le_bytes());
    pe[opt_off + 36..opt_off + 40].copy_from_slice(&0x0200u32.to_le_bytes());
    // SizeOfImage / SizeOfHeaders
    pe[opt_off + 56..opt_off + 60].copy_from_slice(&0x2000u32.to_le_bytes());
    pe[opt_off + 60..opt_off + 64].copy_from_slice(&0x0200u32.to_le_bytes());
    // NumberOfRvaAndSizes
    let num_rva_off = opt_off + if pe32_plus { 108 } else { 92 };
    pe[num_rva_off..num_rva_off + 4].copy_from_slice(&16u32.to_le_bytes());

    // Section header: one .text section backed by zeros.
    pe[section_table_off..section_table_off + 8].copy_from_slice(b".text\0\0\0");
    pe[section_table_off + 8..section_table_off + 12].copy_from_slice(&0x0200u32.to_le_bytes());
    pe[section_table_off + 12..section_table_off + 16].copy_from_slice(&0x1000u32.to_le_bytes());
    pe[section_table_off + 16..section_table_off + 20]
        .copy_from_slice(&(section_raw_size as u32).to_le_bytes());
    pe[section_table_off + 20..section_table_off + 24]
        .copy_from_slice(&(section_raw_off as u32).to_le_bytes());

    // Attribute Certificate Table at end-of-image.
    let cert_table_offset = end_of_image;
    let dw_length = align8(8 + pkcs7.len());
    pe.extend_from_slice(&(dw_length as u32).to_le_bytes());
    pe.extend_from_slice(&0x0200u16.to_le_bytes());
    pe.extend_from_slice(&0x0002u16.to_le_bytes());
    pe.extend_from_slice(pkcs7);
    pe.resize(cert_table_offset + dw_length, 0);

    let dirs_off = opt_off + if pe32_plus { 112 } else { 96 };
    let cert_dir_off = dirs_off + 4 * 8;
    let table_size = pe.len() - cert_table_offset;
    pe[cert_dir_off..cert_dir_off + 4].copy_from_slice(&(cert_table_offset as u32).to_le_bytes());
    pe[cert_dir_off + 4..cert_dir_off + 8].copy_from_slice(&(table_size as u32).to_le_bytes());

    if with_checksum {
        let checksum_offset = opt_off + 64;
        checksum::update(&mut pe, checksum_offset).unwrap();
    }
    pe
}

/// Build an unsigned PE (empty Certificate Table directory entry).
pub fn build_unsigned_pe(pe32_plus: bool) -> Vec<u8> {
    let pkcs7 = build_test_pkcs7(&[], 32);
    let mut pe = build_signed_pe(pe32_plus, &pkcs7, false);
    // Truncate the certificate table and clear the directory entry.
    let opt_off = 0x80 + 24;
    let dirs_off = opt_off + if pe32_plus { 112 } else { 96 };
    let cert_dir_off = dirs_off + 4 * 8;
    let cert_table_offset = u32::from_le_bytes([
        pe[cert_dir_off],
        pe[cert_dir_off + 1],
        pe[cert_dir_off + 2],
        pe[cert_dir_off + 3],
    ]) as usize;
    pe.truncate(cert_table_offset);
    pe[cert_dir_off..cert_dir_off + 8].fill(0);
    pe
}

/// Build an MSI with a couple of content streams and the given PKCS#7 in
/// `\x05DigitalSignature`. `with_big_stream` adds a stream above the
/// ministream cutoff so the fixture exercises regular FAT chains too.
pub fn build_signed_msi(pkcs7: &[u8], with_big_stream: bool) -> Vec<u8> {
    let mut comp = cfb::CompoundFile::create(Cursor::new(Vec::new())).unwrap();
    {
        let mut s = comp.create_stream("SummaryInformation").unwrap();
        s.write_all(&[0x11u8; 600]).unwrap();
    }
    {
        let mut s = comp.create_stream("Table.Columns").unwrap();
        s.write_all(&[0x22u8; 150]).unwrap();
    }
    if with_big_stream {
        let mut s = comp.create_stream("Table.Rows").unwrap();
        s.write_all(&vec![0x33u8; 9000]).unwrap();
    }
    {
        let mut s = comp.create_stream("\u{0005}DigitalSignature").unwrap();
        s.write_all(pkcs7).unwrap();
    }
    comp.flush().unwrap();
    comp.into_inner().into_inner()
}

/// Build an MSI with no digital-signature stream.
pub fn build_unsigned_msi() -> Vec<u8> {
    let mut comp = cfb::CompoundFile::create(Cursor::new(Vec::new())).unwrap();
    {
        let mut s = comp.create_stream("SummaryInformation").unwrap();
        s.write_all(&[0x44u8; 200]).unwrap();
    }
    comp.flush().unwrap();
    comp.into_inner().into_inner()
}

/// Read one stream from an MSI image through the `cfb` crate.
pub fn read_msi_stream(data: &[u8], name: &str) -> Vec<u8> {
    let mut comp = cfb::CompoundFile::open(Cursor::new(data.to_vec())).unwrap();
    let mut stream = comp.open_stream(name).unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    buf
}

/// All stream paths in an MSI image, sorted.
pub fn list_msi_streams(data: &[u8]) -> Vec<String> {
    let comp = cfb::CompoundFile::open(Cursor::new(data.to_vec())).unwrap();
    let mut paths: Vec<String> = comp
        .walk()
        .filter(|e| e.is_stream())
        .map(|e| e.path().display().to_string())
        .collect();
    paths.sort();
    paths
}

/// Assert two buffers are equal outside the given byte ranges.
pub fn assert_eq_outside(a: &[u8], b: &[u8], skip: &[std::ops::Range<usize>]) {
    assert_eq!(a.len(), b.len(), "buffer lengths differ");
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        if skip.iter().any(|r| r.contains(&i)) {
            continue;
        }
        assert_eq!(x, y, "buffers differ at offset {i:#x}");
    }
}
