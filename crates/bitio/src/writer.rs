use bytes::Bytes;

/// Serializes variable bit width fields into a growable byte buffer.
///
/// Bits are packed MSB-first within each byte; partial trailing bytes are
/// zero padded when the writer is finished.
#[derive(Default)]
pub struct BitWriter {
    data: Vec<u8>,
    bit_offset: usize,
    #[cfg(feature = "trace")]
    labels: Vec<&'static str>,
}

impl BitWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a field-context label onto the tracing stack. A no-op
    /// without the `trace` feature; never affects the written bits.
    pub fn push_label(&mut self, label: &'static str) {
        #[cfg(feature = "trace")]
        self.labels.push(label);
        #[cfg(not(feature = "trace"))]
        let _ = label;
    }

    /// Pops the innermost tracing label.
    pub fn pop_label(&mut self) {
        #[cfg(feature = "trace")]
        self.labels.pop();
    }

    /// Writes bits under a scoped tracing label.
    pub fn put_bits_labeled(&mut self, num_bits: u32, value: u32, label: &'static str) {
        #[cfg(feature = "trace")]
        tracing::trace!(
            context = self.labels.join("."),
            label,
            num_bits,
            value,
            bit_offset = self.bit_offset,
            "u"
        );
        #[cfg(not(feature = "trace"))]
        let _ = label;
        self.put_bits(num_bits, value);
    }

    /// Writes the low `num_bits` (0..=32) bits of `value`.
    pub fn put_bits(&mut self, num_bits: u32, value: u32) {
        assert!(num_bits <= 32);

        let mut num_bits = num_bits as usize;
        let value = if num_bits < 32 { value & ((1u32 << num_bits) - 1) } else { value };

        while num_bits > 0 {
            let bit = self.bit_offset % 8;
            let idx = self.bit_offset / 8;

            if idx >= self.data.len() {
                self.data.push(0);
            }

            // How many bits fit into this byte?
            let n = (8 - bit).min(num_bits);

            let v = (value >> (num_bits - n)) as u8 & ((1u16 << n) - 1) as u8;
            self.data[idx] |= v << (8 - (bit + n));

            self.bit_offset += n;
            num_bits -= n;
        }
    }

    /// Writes a single bit.
    pub fn put_bit(&mut self, bit: bool) {
        self.put_bits(1, bit as u32);
    }

    /// Writes a run of zero bits up to the next byte boundary.
    pub fn byte_align(&mut self) {
        while self.bit_offset % 8 != 0 {
            self.put_bit(false);
        }
    }

    /// Writes a byte sequence. The writer must be byte aligned.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        assert!(self.bit_offset % 8 == 0, "byte write requires byte alignment");
        self.data.extend_from_slice(bytes);
        self.bit_offset += bytes.len() * 8;
    }

    /// Current offset in bits.
    pub fn bit_offset(&self) -> usize {
        self.bit_offset
    }

    /// Number of bytes needed to hold the accumulated bits.
    pub fn byte_size(&self) -> usize {
        (self.bit_offset + 7) / 8
    }

    /// Consumes the writer and returns the packed bytes.
    pub fn finish(mut self) -> Bytes {
        self.data.truncate(self.byte_size());
        Bytes::from(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::BitWriter;

    #[test]
    fn bits_pack_msb_first() {
        let mut w = BitWriter::new();
        w.put_bits(3, 0b101);
        w.put_bits(5, 0b00111);
        assert_eq!(w.finish().as_ref(), &[0b1010_0111]);
    }

    #[test]
    fn values_are_masked_to_width() {
        let mut w = BitWriter::new();
        w.put_bits(4, 0xfff3);
        w.put_bits(4, 0x5);
        assert_eq!(w.finish().as_ref(), &[0x35]);
    }

    #[test]
    fn straddles_byte_boundaries() {
        let mut w = BitWriter::new();
        w.put_bits(12, 0xabc);
        w.put_bits(12, 0xdef);
        assert_eq!(w.finish().as_ref(), &[0xab, 0xcd, 0xef]);
    }

    #[test]
    fn trailing_bits_are_zero_padded() {
        let mut w = BitWriter::new();
        w.put_bits(2, 0b11);
        assert_eq!(w.byte_size(), 1);
        assert_eq!(w.finish().as_ref(), &[0b1100_0000]);
    }

    #[test]
    fn aligned_byte_writes() {
        let mut w = BitWriter::new();
        w.put_bits(5, 0x15);
        w.byte_align();
        w.put_bytes(&[0xde, 0xad]);
        assert_eq!(w.finish().as_ref(), &[0xa8, 0xde, 0xad]);
    }

    #[test]
    fn full_width_write() {
        let mut w = BitWriter::new();
        w.put_bits(32, 0x0123_4567);
        assert_eq!(w.finish().as_ref(), &[0x01, 0x23, 0x45, 0x67]);
    }

    #[test]
    fn labels_never_affect_output() {
        let mut plain = BitWriter::new();
        plain.put_bits(8, 0x5a);

        let mut labeled = BitWriter::new();
        labeled.push_label("header");
        labeled.put_bits_labeled(8, 0x5a, "field");
        labeled.pop_label();

        assert_eq!(plain.finish(), labeled.finish());
    }
}
