use std::cmp::Ordering;
use std::collections::BinaryHeap;

use lcevc_bitio::{BitReader, BitWriter};

/// Exclusive upper bound on codable symbols.
pub const MAX_SYMBOL: usize = 256;

/// Sentinel length pair marking an empty code table.
const EMPTY_LENGTH: u32 = 31;

/// Field width of code length deltas: `ceil(log2(n + 1))`, as a table so
/// both sides agree bit for bit.
pub fn bit_width(n: u32) -> u32 {
    const TABLE: [u8; 32] = [
        1, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4, //
        5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5,
    ];
    u32::from(TABLE[n as usize])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HuffmanCode {
    symbol: u32,
    bits: u32,
    value: u32,
}

/// Sort by ascending code length; equal lengths by descending symbol. Code
/// values are then assigned from the rear so the shortest code ends up
/// all-zero.
fn sort_codes(codes: &mut [HuffmanCode]) {
    codes.sort_by(|a, b| a.bits.cmp(&b.bits).then(b.symbol.cmp(&a.symbol)));
}

fn assign_values(codes: &mut [HuffmanCode], max_length: u32) {
    let mut current_length = max_length;
    let mut current_value = 0u32;
    for c in codes.iter_mut().rev() {
        if c.bits < current_length {
            current_value >>= current_length - c.bits;
            current_length = c.bits;
        }
        c.value = current_value;
        current_value += 1;
    }
}

/// Accumulates symbol counts for a [`HuffmanEncoder`].
pub struct HuffmanBuilder {
    counts: [u32; MAX_SYMBOL],
}

impl Default for HuffmanBuilder {
    fn default() -> Self {
        Self {
            counts: [0; MAX_SYMBOL],
        }
    }
}

/// Heap entry ordering: smallest count pops first; equal counts pop the
/// higher symbol / node number first, leaving the lower one to combine
/// later. Deterministic across platforms.
#[derive(PartialEq, Eq)]
struct HeapEntry {
    count: u32,
    symbol: u32,
    node: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.count.cmp(&self.count).then(self.symbol.cmp(&other.symbol))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Node {
    symbol: u32,
    count: u32,
    bits: u32,
    children: Option<(usize, usize)>,
}

impl HuffmanBuilder {
    /// Adds `count` occurrences of `symbol`.
    pub fn add_symbol(&mut self, symbol: u8, count: u32) {
        self.counts[symbol as usize] += count;
    }

    /// Resolves code lengths and values into an encoder.
    pub fn finish(&self) -> HuffmanEncoder {
        let mut nodes: Vec<Node> = Vec::new();
        let mut heap = BinaryHeap::new();

        for (s, &count) in self.counts.iter().enumerate() {
            if count != 0 {
                heap.push(HeapEntry {
                    count,
                    symbol: s as u32,
                    node: nodes.len(),
                });
                nodes.push(Node {
                    symbol: s as u32,
                    count,
                    bits: 0,
                    children: None,
                });
            }
        }

        if nodes.is_empty() {
            return HuffmanEncoder { codes: Vec::new() };
        }

        let num_symbols = nodes.len();

        // Combine the two least frequent nodes until one tree remains.
        while heap.len() > 1 {
            let l = heap.pop().unwrap();
            let r = heap.pop().unwrap();
            let symbol = MAX_SYMBOL as u32 + nodes.len() as u32;
            let count = nodes[l.node].count + nodes[r.node].count;
            heap.push(HeapEntry {
                count,
                symbol,
                node: nodes.len(),
            });
            nodes.push(Node {
                symbol,
                count,
                bits: 0,
                children: Some((l.node, r.node)),
            });
        }

        // Walk from the root back down, filling in depths.
        for n in (0..nodes.len()).rev() {
            if let Some((l, r)) = nodes[n].children {
                let bits = nodes[n].bits + 1;
                nodes[l].bits = bits;
                nodes[r].bits = bits;
            }
        }

        let mut codes: Vec<HuffmanCode> = nodes[..num_symbols]
            .iter()
            .map(|n| HuffmanCode {
                symbol: n.symbol,
                bits: n.bits,
                value: 0,
            })
            .collect();

        sort_codes(&mut codes);
        let max_length = codes.last().map(|c| c.bits).unwrap_or(0);
        assign_values(&mut codes, max_length);

        HuffmanEncoder { codes }
    }
}

/// Canonical Huffman encoder for one entropy state.
pub struct HuffmanEncoder {
    codes: Vec<HuffmanCode>,
}

impl HuffmanEncoder {
    /// Writes the code table.
    pub fn write_codes(&self, w: &mut BitWriter) {
        if self.codes.is_empty() {
            w.put_bits(5, EMPTY_LENGTH);
            w.put_bits(5, EMPTY_LENGTH);
            return;
        }

        if self.codes.len() == 1 {
            w.put_bits(5, 0);
            w.put_bits(5, 0);
            w.put_bits(8, self.codes[0].symbol);
            return;
        }

        let min_code_length = self.codes.first().unwrap().bits;
        let max_code_length = self.codes.last().unwrap().bits;
        let length_bits = bit_width(max_code_length - min_code_length);

        w.put_bits(5, min_code_length);
        w.put_bits(5, max_code_length);

        if self.codes.len() > 31 {
            w.put_bit(true); // presence_bitmap

            let mut lengths = [0u32; MAX_SYMBOL];
            for c in &self.codes {
                lengths[c.symbol as usize] = c.bits;
            }

            for length in lengths {
                if length != 0 {
                    w.put_bit(true);
                    w.put_bits(length_bits, length - min_code_length);
                } else {
                    w.put_bit(false);
                }
            }
        } else {
            w.put_bit(false);

            w.put_bits(5, self.codes.len() as u32);
            for c in &self.codes {
                w.put_bits(8, c.symbol);
                w.put_bits(length_bits, c.bits - min_code_length);
            }
        }
    }

    /// Writes one coded symbol.
    pub fn write_symbol(&self, w: &mut BitWriter, symbol: u8) {
        let code = self
            .codes
            .iter()
            .find(|c| c.symbol == u32::from(symbol))
            .expect("uncoded symbol");

        if self.codes.len() > 1 {
            w.put_bits(code.bits, code.value);
        }
        // A single-symbol table codes every occurrence in zero bits.
    }

    /// (symbol, length) pairs, for tests and diagnostics.
    pub fn code_lengths(&self) -> Vec<(u8, u32)> {
        self.codes.iter().map(|c| (c.symbol as u8, c.bits)).collect()
    }
}

/// Canonical Huffman decoder for one entropy state.
#[derive(Default)]
pub struct HuffmanDecoder {
    codes: Vec<HuffmanCode>,
    single_symbol: u8,
}

impl HuffmanDecoder {
    /// Reads a code table and reconstructs the canonical code values.
    pub fn read_codes(r: &mut BitReader) -> Self {
        let min_code_length = r.read_bits(5);
        let max_code_length = r.read_bits(5);

        if min_code_length == EMPTY_LENGTH && max_code_length == EMPTY_LENGTH {
            return Self::default();
        }

        if min_code_length == 0 && max_code_length == 0 {
            return Self {
                codes: Vec::new(),
                single_symbol: r.read_bits(8) as u8,
            };
        }

        if max_code_length < min_code_length {
            tracing::warn!(min_code_length, max_code_length, "malformed code length bounds");
            return Self::default();
        }

        let length_bits = bit_width(max_code_length - min_code_length);
        let mut codes = Vec::new();

        if r.read_bit() {
            // Presence bitmap over every possible symbol.
            for symbol in 0..MAX_SYMBOL as u32 {
                if r.read_bit() {
                    codes.push(HuffmanCode {
                        symbol,
                        bits: r.read_bits(length_bits) + min_code_length,
                        value: 0,
                    });
                }
            }
        } else {
            // Sparse: count * (symbol, length).
            let count = r.read_bits(5);
            for _ in 0..count {
                let symbol = r.read_bits(8);
                codes.push(HuffmanCode {
                    symbol,
                    bits: r.read_bits(length_bits) + min_code_length,
                    value: 0,
                });
            }
        }

        sort_codes(&mut codes);
        assign_values(&mut codes, max_code_length);

        Self {
            codes,
            single_symbol: 0,
        }
    }

    /// Decodes one symbol, growing the current value bit by bit until it
    /// matches a code of that length.
    pub fn decode_symbol(&self, r: &mut BitReader) -> u8 {
        if self.codes.is_empty() {
            return self.single_symbol;
        }

        let mut bits = 0;
        let mut value = 0u32;
        for c in &self.codes {
            while bits < c.bits {
                value = (value << 1) | u32::from(r.read_bit());
                bits += 1;
            }
            if value == c.value {
                return c.symbol as u8;
            }
        }

        tracing::warn!("no matching code for prefix of {bits} bits");
        0
    }

    /// (symbol, length) pairs, for tests and diagnostics.
    pub fn code_lengths(&self) -> Vec<(u8, u32)> {
        self.codes.iter().map(|c| (c.symbol as u8, c.bits)).collect()
    }
}

#[cfg(test)]
mod tests {
    use lcevc_bitio::{BitReader, BitWriter};

    use super::{HuffmanBuilder, HuffmanDecoder};

    fn build(counts: &[(u8, u32)]) -> super::HuffmanEncoder {
        let mut b = HuffmanBuilder::default();
        for &(s, c) in counts {
            b.add_symbol(s, c);
        }
        b.finish()
    }

    fn round_trip_codes(counts: &[(u8, u32)]) -> (super::HuffmanEncoder, HuffmanDecoder) {
        let encoder = build(counts);
        let mut w = BitWriter::new();
        encoder.write_codes(&mut w);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        let decoder = HuffmanDecoder::read_codes(&mut r);
        (encoder, decoder)
    }

    #[test]
    fn empty_table() {
        let encoder = build(&[]);
        let mut w = BitWriter::new();
        encoder.write_codes(&mut w);
        // min = max = 31.
        assert_eq!(w.finish().as_ref(), &[0b11111_111, 0b11_000000]);
    }

    #[test]
    fn single_symbol_table() {
        let (_, decoder) = round_trip_codes(&[(0x42, 10)]);
        let mut r = BitReader::new(&[]);
        // Every read yields the one symbol and consumes no bits.
        assert_eq!(decoder.decode_symbol(&mut r), 0x42);
        assert_eq!(decoder.decode_symbol(&mut r), 0x42);
        assert_eq!(r.bit_offset(), 0);
    }

    #[test]
    fn skewed_counts_give_shorter_codes_to_frequent_symbols() {
        let encoder = build(&[(0, 100), (1, 10), (2, 10), (3, 1)]);
        let lengths: std::collections::HashMap<_, _> = encoder.code_lengths().into_iter().collect();
        assert_eq!(lengths[&0], 1);
        assert!(lengths[&3] >= lengths[&1]);
    }

    #[test]
    fn code_lengths_survive_the_wire() {
        let cases: &[&[(u8, u32)]] = &[
            &[(0, 5), (1, 5)],
            &[(10, 1), (20, 2), (30, 4), (40, 8), (50, 16)],
            &[(0, 7), (63, 7), (127, 7), (255, 7)],
        ];
        for &counts in cases {
            let (encoder, decoder) = round_trip_codes(counts);
            let mut enc = encoder.code_lengths();
            let mut dec = decoder.code_lengths();
            enc.sort_unstable();
            dec.sort_unstable();
            assert_eq!(enc, dec);
        }
    }

    #[test]
    fn presence_bitmap_used_above_31_symbols() {
        let counts: Vec<(u8, u32)> = (0..64).map(|s| (s as u8, 1 + (s % 5))).collect();
        let (encoder, decoder) = round_trip_codes(&counts);
        let mut enc = encoder.code_lengths();
        let mut dec = decoder.code_lengths();
        enc.sort_unstable();
        dec.sort_unstable();
        assert_eq!(enc, dec);
    }

    #[test]
    fn symbols_round_trip() {
        let counts: &[(u8, u32)] = &[(7, 50), (8, 20), (9, 10), (200, 3), (0, 1)];
        let (encoder, decoder) = round_trip_codes(counts);

        let stream: Vec<u8> = vec![7, 7, 9, 200, 0, 8, 7, 9, 7, 200];
        let mut w = BitWriter::new();
        for &s in &stream {
            encoder.write_symbol(&mut w, s);
        }
        let bytes = w.finish();

        // Skip over the codebook the decoder was built from; decode the
        // symbol stream standalone.
        let mut r = BitReader::new(&bytes);
        let decoded: Vec<u8> = stream.iter().map(|_| decoder.decode_symbol(&mut r)).collect();
        assert_eq!(decoded, stream);
    }

    #[test]
    fn deterministic_tie_break() {
        // All equal counts: the tree shape is fixed by symbol order, so
        // two builds agree exactly.
        let counts: Vec<(u8, u32)> = (30..40).map(|s| (s, 4)).collect();
        let a = build(&counts).code_lengths();
        let b = build(&counts).code_lengths();
        assert_eq!(a, b);
    }
}
