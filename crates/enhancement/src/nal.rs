//! NAL and SEI encapsulation of the enhancement payload.
//!
//! The payload travels either as a dedicated LCEVC NAL unit (marker
//! delimited over AVC/HEVC/VVC, u32 length prefixed over EVC) or wrapped
//! in a registered / unregistered SEI message inside the host stream. All
//! marker-delimited forms are RBSP escaped.

use nutype_enum::nutype_enum;

use lcevc_bitio::{rbsp_escape, rbsp_unescape};

nutype_enum! {
    /// Enhancement NAL unit types.
    pub enum NalUnitType(u8) {
        /// Enhancement payload of a non-IDR picture.
        LcevcNonIdr = 28,
        /// Enhancement payload of an IDR picture.
        LcevcIdr = 29,
        /// Reserved.
        LcevcReserved = 30,
    }
}

/// How the enhancement payload is carried in the host stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encapsulation {
    /// Dedicated LCEVC NAL unit.
    #[default]
    Nal,
    /// Registered SEI (payload type 4).
    SeiRegistered,
    /// Unregistered SEI (payload type 5).
    SeiUnregistered,
}

/// Host codec of the base stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaseCoding {
    /// ITU-T H.264.
    #[default]
    Avc,
    /// ITU-T H.265.
    Hevc,
    /// ITU-T H.266.
    Vvc,
    /// MPEG-5 part 1.
    Evc,
}

/// The itu_t_t35 code identifying a registered LCEVC SEI.
pub const REGISTERED_SEI_CODE: [u8; 4] = [0xb4, 0x00, 0x50, 0x00];

/// The UUID identifying an unregistered LCEVC SEI.
pub const UNREGISTERED_SEI_UUID: [u8; 16] = [
    0xa7, 0xc4, 0x6d, 0xed, 0x49, 0xd8, 0x38, 0xeb, 0x9a, 0xad, 0x6d, 0xa6, 0x84, 0x97, 0xa7, 0x54,
];

/// One recovered enhancement payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEnhancement {
    /// The raw syntax block payload.
    pub payload: Vec<u8>,
    /// Whether it arrived in an IDR enhancement unit.
    pub is_idr: bool,
}

fn is_nal_marker(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == 0 && data[1] == 0 && data[2] == 1
}

fn lcevc_header_byte(is_idr: bool) -> u8 {
    // forbidden_zero_bit, forbidden_one_bit, nal_unit_type, reserved_flag.
    if is_idr {
        0x7b
    } else {
        0x79
    }
}

/// Builds a marker-delimited enhancement NAL unit.
pub fn enhancement_nalu(is_idr: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, lcevc_header_byte(is_idr), 0xff];
    out.extend_from_slice(&rbsp_escape(payload));
    out
}

/// Builds a u32 length prefixed enhancement NAL unit for EVC hosts; no
/// emulation prevention applies.
pub fn enhancement_nalu_evc(is_idr: bool, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 2) as u32;
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.extend_from_slice(&length.to_le_bytes());
    out.push(if is_idr { 0x3d } else { 0x3c });
    out.push(0x00);
    out.extend_from_slice(payload);
    out
}

fn sei_body(registered: bool, inner: &[u8]) -> Vec<u8> {
    let mut sei = Vec::with_capacity(inner.len() + 24);

    // SEI payload type: 4 registered, 5 unregistered.
    sei.push(if registered { 0x04 } else { 0x05 });

    let header: &[u8] = if registered { &REGISTERED_SEI_CODE } else { &UNREGISTERED_SEI_UUID };
    let mut length = inner.len() + header.len();
    while length >= 255 {
        sei.push(255);
        length -= 255;
    }
    sei.push(length as u8);

    sei.extend_from_slice(header);
    sei.extend_from_slice(inner);
    sei
}

fn sei_nalu_header(base: BaseCoding) -> &'static [u8] {
    match base {
        BaseCoding::Avc => &[0x00, 0x00, 0x01, 0x06],
        // nal_unit_type = 39 (prefix SEI).
        BaseCoding::Hevc => &[0x00, 0x00, 0x01, 0x4e, 0x01],
        BaseCoding::Vvc => &[0x00, 0x00, 0x01, 0x00, 0xb8],
        BaseCoding::Evc => &[],
    }
}

/// Wraps the payload as an SEI NAL unit of the host codec. The
/// registered form carries a complete LCEVC NAL unit; the unregistered
/// form carries the payload directly.
pub fn sei_nalu(base: BaseCoding, registered: bool, is_idr: bool, payload: &[u8]) -> Vec<u8> {
    let inner = if registered {
        enhancement_nalu(is_idr, payload)
    } else {
        payload.to_vec()
    };
    let body = sei_body(registered, &inner);

    let mut out = sei_nalu_header(base).to_vec();
    out.extend_from_slice(&rbsp_escape(&body));
    out
}

/// Byte reader over an RBSP, removing emulation prevention on the fly.
struct RbspReader<'a> {
    data: &'a [u8],
    pos: usize,
    window: u32,
    unescape: bool,
}

impl<'a> RbspReader<'a> {
    fn new(data: &'a [u8], unescape: bool) -> Self {
        Self {
            data,
            pos: 0,
            window: 0xffff_ffff,
            unescape,
        }
    }

    fn byte(&mut self) -> Option<u8> {
        let mut b = *self.data.get(self.pos)?;
        self.pos += 1;
        self.window = (self.window << 8) | u32::from(b);
        if self.unescape && self.window & 0xff_ffff == 0x00_0003 {
            b = *self.data.get(self.pos)?;
            self.pos += 1;
            self.window = (self.window << 8) | u32::from(b);
        }
        Some(b)
    }

    fn bytes(&mut self, n: usize) -> Option<Vec<u8>> {
        (0..n).map(|_| self.byte()).collect()
    }

    /// 0xff-extended SEI value.
    fn extended(&mut self) -> Option<usize> {
        let mut value = 0usize;
        loop {
            let b = self.byte()?;
            value += usize::from(b);
            if b != 0xff {
                return Some(value);
            }
        }
    }
}

/// Finds the end of a marker-delimited NAL unit starting at `start`.
fn nalu_end(data: &[u8], start: usize) -> usize {
    let mut j = start;
    while j + 3 <= data.len() {
        if is_nal_marker(&data[j..]) {
            // A four byte start code begins one byte earlier.
            if j > start && data[j - 1] == 0x00 {
                return j - 1;
            }
            return j;
        }
        j += 1;
    }
    data.len()
}

fn extract_lcevc_nalus(data: &[u8], remove: bool, out: &mut Vec<ExtractedEnhancement>) -> Vec<u8> {
    let mut remaining = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if i + 5 <= data.len() && is_nal_marker(&data[i..]) && (data[i + 3] & 0xc0) == 0x40 && data[i + 4] == 0xff {
            let nal_unit_type = (data[i + 3] & 0x3e) >> 1;
            if (NalUnitType::LcevcNonIdr.0..=NalUnitType::LcevcReserved.0).contains(&nal_unit_type) {
                let end = nalu_end(data, i + 4);
                if let Some(payload) = rbsp_unescape(&data[i + 5..end]) {
                    out.push(ExtractedEnhancement {
                        payload,
                        is_idr: nal_unit_type == NalUnitType::LcevcIdr.0,
                    });
                }
                if !remove {
                    remaining.extend_from_slice(&data[i..end]);
                }
                i = end;
                continue;
            }
        }
        remaining.push(data[i]);
        i += 1;
    }

    remaining
}

fn extract_sei(body: &[u8], registered: bool, is_base_idr: bool, out: &mut Vec<ExtractedEnhancement>) {
    let mut rbsp = RbspReader::new(body, true);

    let Some(sei_type) = rbsp.extended() else { return };
    let expected = if registered { 4 } else { 5 };
    if sei_type != expected {
        return;
    }

    let Some(sei_length) = rbsp.extended() else { return };
    if sei_length > body.len() {
        tracing::warn!("SEI length overflow");
        return;
    }

    if registered {
        let Some(code) = rbsp.bytes(REGISTERED_SEI_CODE.len()) else { return };
        if code != REGISTERED_SEI_CODE {
            return;
        }
        let Some(inner) = rbsp.bytes(sei_length - REGISTERED_SEI_CODE.len()) else {
            return;
        };
        // The SEI carries a complete LCEVC NAL unit.
        extract_lcevc_nalus(&inner, false, out);
    } else {
        let Some(uuid) = rbsp.bytes(UNREGISTERED_SEI_UUID.len()) else { return };
        if uuid != UNREGISTERED_SEI_UUID {
            return;
        }
        let Some(payload) = rbsp.bytes(sei_length - UNREGISTERED_SEI_UUID.len()) else {
            return;
        };
        out.push(ExtractedEnhancement {
            payload,
            is_idr: is_base_idr,
        });
    }
}

fn sei_nalu_matches(base: BaseCoding, data: &[u8]) -> Option<usize> {
    match base {
        BaseCoding::Avc => (data.len() >= 4 && data[3] == 0x06).then_some(4),
        BaseCoding::Hevc => (data.len() >= 5 && data[3] == 0x4e && data[4] == 0x01).then_some(5),
        BaseCoding::Vvc => (data.len() >= 5 && data[3] == 0x00 && (data[4] & 0xf8) == 0xb8).then_some(5),
        BaseCoding::Evc => None,
    }
}

fn scan_sei(data: &[u8], base: BaseCoding, registered: bool, is_base_idr: bool) -> Vec<ExtractedEnhancement> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 4 <= data.len() {
        if is_nal_marker(&data[i..]) {
            if let Some(header_len) = sei_nalu_matches(base, &data[i..]) {
                let end = nalu_end(data, i + 4);
                extract_sei(&data[i + header_len..end], registered, is_base_idr, &mut out);
                i = end;
                continue;
            }
        }
        i += 1;
    }
    out
}

fn scan_enhancement_evc(data: &[u8], out: &mut Vec<ExtractedEnhancement>) -> Vec<u8> {
    let mut remaining = Vec::with_capacity(data.len());
    let mut offset = 0usize;
    while offset + 6 <= data.len() {
        let nal_length = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let total = nal_length + 4;
        if offset + total > data.len() {
            break;
        }
        if (data[offset + 4] & 0xfe) == 0x3c && data[offset + 5] == 0x00 && nal_length >= 2 {
            out.push(ExtractedEnhancement {
                payload: data[offset + 6..offset + total].to_vec(),
                is_idr: data[offset + 4] & 0x01 != 0,
            });
        } else {
            remaining.extend_from_slice(&data[offset..offset + total]);
        }
        offset += total;
    }
    remaining.extend_from_slice(&data[offset..]);
    remaining
}

/// Scans an access unit for enhancement data.
///
/// Returns the base stream with any dedicated enhancement NAL units
/// removed (SEI survives the base decoder and is left in place), plus the
/// recovered payloads.
pub fn scan_enhancement(
    data: &[u8],
    encapsulation: Encapsulation,
    base: BaseCoding,
    is_base_idr: bool,
) -> (Vec<u8>, Vec<ExtractedEnhancement>) {
    match (encapsulation, base) {
        (Encapsulation::Nal, BaseCoding::Evc) => {
            let mut out = Vec::new();
            let remaining = scan_enhancement_evc(data, &mut out);
            (remaining, out)
        }
        (Encapsulation::Nal, _) => {
            let mut out = Vec::new();
            let remaining = extract_lcevc_nalus(data, true, &mut out);
            (remaining, out)
        }
        (Encapsulation::SeiRegistered, _) => (data.to_vec(), scan_sei(data, base, true, is_base_idr)),
        (Encapsulation::SeiUnregistered, _) => (data.to_vec(), scan_sei(data, base, false, is_base_idr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = &[0x12, 0x00, 0x00, 0x01, 0x99, 0x00, 0x00, 0x00, 0x34];

    #[test]
    fn nalu_header_encodes_idr() {
        let non_idr = enhancement_nalu(false, PAYLOAD);
        let idr = enhancement_nalu(true, PAYLOAD);
        assert_eq!(&non_idr[..5], &[0x00, 0x00, 0x01, 0x79, 0xff]);
        assert_eq!(&idr[..5], &[0x00, 0x00, 0x01, 0x7b, 0xff]);
    }

    #[test]
    fn nal_round_trip_removes_enhancement_from_base() {
        // A fake base slice NALU followed by the enhancement unit.
        let mut au = vec![0x00, 0x00, 0x01, 0x65, 0xaa, 0xbb];
        au.extend_from_slice(&enhancement_nalu(true, PAYLOAD));
        au.extend_from_slice(&[0x00, 0x00, 0x01, 0x41, 0xcc]);

        let (base, found) = scan_enhancement(&au, Encapsulation::Nal, BaseCoding::Avc, true);
        assert_eq!(found.len(), 1);
        assert!(found[0].is_idr);
        assert_eq!(found[0].payload, PAYLOAD);
        assert_eq!(base, vec![0x00, 0x00, 0x01, 0x65, 0xaa, 0xbb, 0x00, 0x00, 0x01, 0x41, 0xcc]);
    }

    #[test]
    fn nalu_payload_is_escaped() {
        let nalu = enhancement_nalu(false, &[0x00, 0x00, 0x01]);
        // Start-code emulation inside the payload is broken up.
        assert_eq!(&nalu[5..], &[0x00, 0x00, 0x03, 0x01, 0x80]);
    }

    #[test]
    fn registered_sei_round_trip_over_avc() {
        let nalu = sei_nalu(BaseCoding::Avc, true, false, PAYLOAD);
        assert_eq!(&nalu[..4], &[0x00, 0x00, 0x01, 0x06]);
        // Payload type 4, then the itu_t_t35 code after the length.
        assert_eq!(nalu[4], 0x04);

        let mut au = vec![0x00, 0x00, 0x01, 0x67, 0x42];
        au.extend_from_slice(&nalu);
        let (base, found) = scan_enhancement(&au, Encapsulation::SeiRegistered, BaseCoding::Avc, false);
        // SEI survives in the base stream.
        assert_eq!(base, au);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload, PAYLOAD);
        assert!(!found[0].is_idr);
    }

    #[test]
    fn registered_sei_round_trip_over_hevc_and_vvc() {
        for base in [BaseCoding::Hevc, BaseCoding::Vvc] {
            let nalu = sei_nalu(base, true, true, PAYLOAD);
            let (_, found) = scan_enhancement(&nalu, Encapsulation::SeiRegistered, base, false);
            assert_eq!(found.len(), 1, "{base:?}");
            assert_eq!(found[0].payload, PAYLOAD);
            assert!(found[0].is_idr);
        }
    }

    #[test]
    fn unregistered_sei_round_trip() {
        let nalu = sei_nalu(BaseCoding::Avc, false, false, PAYLOAD);
        assert_eq!(nalu[4], 0x05);
        let (_, found) = scan_enhancement(&nalu, Encapsulation::SeiUnregistered, BaseCoding::Avc, true);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload, PAYLOAD);
        // IDR follows the base frame type for the unregistered form.
        assert!(found[0].is_idr);
    }

    #[test]
    fn long_sei_uses_extended_length() {
        let payload: Vec<u8> = (0..400).map(|i| (i % 251) as u8).collect();
        let nalu = sei_nalu(BaseCoding::Avc, false, false, &payload);
        let (_, found) = scan_enhancement(&nalu, Encapsulation::SeiUnregistered, BaseCoding::Avc, false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload, payload);
    }

    #[test]
    fn evc_round_trip_is_length_prefixed() {
        let mut au = 9u32.to_le_bytes().to_vec();
        au.extend_from_slice(&[0x02, 0x01, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x01]); // base NALU
        au.extend_from_slice(&enhancement_nalu_evc(true, PAYLOAD));

        let (base, found) = scan_enhancement(&au, Encapsulation::Nal, BaseCoding::Evc, true);
        assert_eq!(found.len(), 1);
        assert!(found[0].is_idr);
        assert_eq!(found[0].payload, PAYLOAD);
        assert_eq!(base.len(), 13);
    }

    #[test]
    fn foreign_nal_units_are_left_alone() {
        let au = vec![0x00, 0x00, 0x01, 0x65, 0x12, 0x34];
        let (base, found) = scan_enhancement(&au, Encapsulation::Nal, BaseCoding::Avc, false);
        assert!(found.is_empty());
        assert_eq!(base, au);
    }
}
