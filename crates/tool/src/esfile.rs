//! Elementary stream access unit IO.
//!
//! AVC/HEVC/VVC streams are Annex-B start code delimited; EVC streams are
//! u32 length prefixed. Access units are split at VCL boundaries: a slice
//! NAL unit closes the unit, trailing parameter sets open the next one.

use std::fs;
use std::io;
use std::path::Path;

use lcevc_enhancement::nal::BaseCoding;

/// One NAL unit, including its start code or length prefix.
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// Host codec NAL type.
    pub nal_type: u32,
    /// The complete unit as stored in the stream.
    pub data: Vec<u8>,
}

/// One access unit of the host stream.
#[derive(Debug, Clone, Default)]
pub struct AccessUnit {
    /// The NAL units in stream order.
    pub nal_units: Vec<NalUnit>,
    /// True when the unit carries an IDR picture.
    pub is_idr: bool,
}

impl AccessUnit {
    /// Concatenated bytes of the whole unit.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in &self.nal_units {
            out.extend_from_slice(&nal.data);
        }
        out
    }

    /// Inserts an enhancement NAL unit after any leading AUD and
    /// parameter sets, before the first slice.
    pub fn insert_enhancement(&mut self, codec: BaseCoding, nal_type: u32, data: Vec<u8>) {
        let offset = self
            .nal_units
            .iter()
            .position(|n| !is_leading_nal(codec, n.nal_type))
            .unwrap_or(self.nal_units.len());
        self.nal_units.insert(offset, NalUnit { nal_type, data });
    }
}

fn nal_type_of(codec: BaseCoding, header: &[u8]) -> u32 {
    let b0 = u32::from(header.first().copied().unwrap_or(0));
    match codec {
        BaseCoding::Avc => b0 & 0x1f,
        BaseCoding::Hevc => (b0 >> 1) & 0x3f,
        BaseCoding::Vvc => u32::from(header.get(1).copied().unwrap_or(0) >> 3),
        BaseCoding::Evc => (b0 >> 1) & 0x3f,
    }
}

fn is_vcl(codec: BaseCoding, nal_type: u32) -> bool {
    match codec {
        BaseCoding::Avc => (1..=5).contains(&nal_type),
        BaseCoding::Hevc => nal_type <= 31,
        BaseCoding::Vvc => nal_type <= 12,
        BaseCoding::Evc => nal_type <= 2,
    }
}

fn is_idr_nal(codec: BaseCoding, nal_type: u32) -> bool {
    match codec {
        BaseCoding::Avc => nal_type == 5,
        BaseCoding::Hevc => (16..=21).contains(&nal_type),
        BaseCoding::Vvc => (7..=9).contains(&nal_type),
        BaseCoding::Evc => nal_type == 1,
    }
}

/// AUD plus parameter sets: everything an enhancement unit must follow.
fn is_leading_nal(codec: BaseCoding, nal_type: u32) -> bool {
    match codec {
        BaseCoding::Avc => (7..=9).contains(&nal_type) || nal_type == 13 || nal_type == 15,
        BaseCoding::Hevc => (32..=35).contains(&nal_type),
        BaseCoding::Vvc => (13..=17).contains(&nal_type) || nal_type == 20,
        BaseCoding::Evc => (24..=28).contains(&nal_type),
    }
}

fn split_annex_b(data: &[u8]) -> Vec<(usize, usize, usize)> {
    // (unit start incl. start code, header offset, unit end)
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let unit_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push((unit_start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &(start, header)) in starts.iter().enumerate() {
        let end = starts.get(n + 1).map(|&(s, _)| s).unwrap_or(data.len());
        units.push((start, header, end));
    }
    units
}

/// Splits a whole elementary stream into access units.
pub fn read_access_units(path: &Path, codec: BaseCoding) -> io::Result<Vec<AccessUnit>> {
    let data = fs::read(path)?;
    Ok(split_access_units(&data, codec))
}

/// Splits an in-memory elementary stream into access units.
pub fn split_access_units(data: &[u8], codec: BaseCoding) -> Vec<AccessUnit> {
    let nal_units: Vec<NalUnit> = if codec == BaseCoding::Evc {
        let mut units = Vec::new();
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let length = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            let end = (offset + 4 + length).min(data.len());
            let nal_type = if end > offset + 4 {
                nal_type_of(codec, &data[offset + 4..end])
            } else {
                0
            };
            units.push(NalUnit {
                nal_type,
                data: data[offset..end].to_vec(),
            });
            offset = end;
        }
        units
    } else {
        split_annex_b(data)
            .into_iter()
            .map(|(start, header, end)| NalUnit {
                nal_type: nal_type_of(codec, &data[header..end.max(header + 2).min(data.len())]),
                data: data[start..end].to_vec(),
            })
            .collect()
    };

    let mut units = Vec::new();
    let mut current = AccessUnit::default();
    let mut have_vcl = false;

    for nal in nal_units {
        let vcl = is_vcl(codec, nal.nal_type);
        if have_vcl && (vcl || is_leading_nal(codec, nal.nal_type)) {
            units.push(std::mem::take(&mut current));
            have_vcl = false;
        }
        if vcl {
            have_vcl = true;
            current.is_idr |= is_idr_nal(codec, nal.nal_type);
        }
        current.nal_units.push(nal);
    }
    if !current.nal_units.is_empty() {
        units.push(current);
    }
    units
}

/// Writes access units back out as one elementary stream.
pub fn write_access_units(path: &Path, units: &[AccessUnit]) -> io::Result<()> {
    let mut out = Vec::new();
    for unit in units {
        out.extend_from_slice(&unit.to_bytes());
    }
    fs::write(path, out)
}
