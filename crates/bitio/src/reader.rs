/// Deserializes variable bit width fields from a byte slice.
///
/// The reader mirrors [`crate::BitWriter`]: MSB-first within each byte,
/// byte-aligned byte access. Reading past the end of the data yields zero
/// bits and logs one warning for the whole packet, so malformed layer sizes
/// decay to empty symbol surfaces downstream.
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_offset: usize,
    overran: bool,
    #[cfg(feature = "trace")]
    labels: Vec<&'static str>,
}

impl<'a> BitReader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            bit_offset: 0,
            overran: false,
            #[cfg(feature = "trace")]
            labels: Vec::new(),
        }
    }

    /// Pushes a field-context label onto the tracing stack. A no-op
    /// without the `trace` feature; never affects the decoded bits.
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

    /// Reads bits under a scoped tracing label.
    pub fn read_bits_labeled(&mut self, num_bits: u32, label: &'static str) -> u32 {
        let value = self.read_bits(num_bits);
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
        value
    }

    fn overrun(&mut self) {
        if !self.overran {
            tracing::warn!("read beyond end of packet");
            self.overran = true;
        }
    }

    /// Reads `num_bits` (0..=32) bits into the low bits of the result.
    pub fn read_bits(&mut self, num_bits: u32) -> u32 {
        assert!(num_bits <= 32);

        let mut num_bits = num_bits as usize;
        let mut r = 0u32;

        while num_bits > 0 {
            let bit_used = self.bit_offset % 8;
            let idx = self.bit_offset / 8;

            let Some(&data) = self.data.get(idx) else {
                self.overrun();
                self.bit_offset += num_bits;
                return if num_bits < 32 { r << num_bits } else { 0 };
            };

            let bit_left = 8 - bit_used;
            let n = bit_left.min(num_bits);

            r = (r << n) | ((u32::from(data) >> (bit_left - n)) & ((1 << n) - 1));

            self.bit_offset += n;
            num_bits -= n;
        }

        r
    }

    /// Reads a single bit.
    pub fn read_bit(&mut self) -> bool {
        self.read_bits(1) != 0
    }

    /// Reads one byte. The reader must be byte aligned.
    pub fn read_u8(&mut self) -> u8 {
        assert!(self.bit_offset % 8 == 0, "byte read requires byte alignment");
        let idx = self.bit_offset / 8;
        self.bit_offset += 8;
        match self.data.get(idx) {
            Some(&b) => b,
            None => {
                self.overrun();
                0
            }
        }
    }

    /// Reads `n` bytes as a zero-copy slice. The reader must be byte
    /// aligned; a short packet yields a truncated slice.
    pub fn read_bytes(&mut self, n: usize) -> &'a [u8] {
        assert!(self.bit_offset % 8 == 0, "byte read requires byte alignment");
        let idx = self.bit_offset / 8;
        self.bit_offset += n * 8;
        if idx + n > self.data.len() {
            self.overrun();
            &self.data[self.data.len().min(idx)..]
        } else {
            &self.data[idx..idx + n]
        }
    }

    /// Discards bits up to the next byte boundary.
    pub fn byte_align(&mut self) {
        while self.bit_offset % 8 != 0 {
            self.read_bit();
        }
    }

    /// Current offset in bits.
    pub fn bit_offset(&self) -> usize {
        self.bit_offset
    }

    /// Total size of the underlying data in bits.
    pub fn bit_size(&self) -> usize {
        self.data.len() * 8
    }

    /// Remaining whole bytes from the current (aligned) position.
    pub fn remaining_bytes(&self) -> usize {
        self.data.len().saturating_sub((self.bit_offset + 7) / 8)
    }

    /// True once any read has run past the end of the data.
    pub fn has_overrun(&self) -> bool {
        self.overran
    }
}

#[cfg(test)]
mod tests {
    use super::BitReader;

    #[test]
    fn reads_msb_first() {
        let mut r = BitReader::new(&[0b1010_0111]);
        assert_eq!(r.read_bits(3), 0b101);
        assert_eq!(r.read_bits(5), 0b00111);
    }

    #[test]
    fn straddles_byte_boundaries() {
        let mut r = BitReader::new(&[0xab, 0xcd, 0xef]);
        assert_eq!(r.read_bits(12), 0xabc);
        assert_eq!(r.read_bits(12), 0xdef);
    }

    #[test]
    fn aligned_byte_access() {
        let mut r = BitReader::new(&[0xa8, 0xde, 0xad]);
        assert_eq!(r.read_bits(5), 0x15);
        r.byte_align();
        assert_eq!(r.read_u8(), 0xde);
        assert_eq!(r.read_bytes(1), &[0xad]);
    }

    #[test]
    fn overrun_returns_zero() {
        let mut r = BitReader::new(&[0xff]);
        assert_eq!(r.read_bits(8), 0xff);
        assert!(!r.has_overrun());
        assert_eq!(r.read_bits(8), 0);
        assert_eq!(r.read_bits(32), 0);
        assert!(r.has_overrun());
    }

    #[test]
    fn partial_overrun_pads_with_zero_bits() {
        // 4 valid bits remain but 8 are requested.
        let mut r = BitReader::new(&[0xff]);
        r.read_bits(4);
        assert_eq!(r.read_bits(8), 0xf0);
        assert!(r.has_overrun());
    }

    #[test]
    fn labeled_reads_match_plain_reads() {
        let mut r = BitReader::new(&[0xa5]);
        r.push_label("header");
        assert_eq!(r.read_bits_labeled(4, "hi"), 0xa);
        r.pop_label();
        assert_eq!(r.read_bits(4), 0x5);
    }
}
