//! Bit-granular views over byte storage.
//!
//! A [`BitBuf`] is a `(bytes, bit_offset, bit_len)` triple. Bit `i` of the
//! view lives in bit `(offset + i) % 8` of byte `(offset + i) / 8`, so
//! multi-bit fields are little-endian. Reads and writes take the byte path
//! when the absolute position is byte aligned and fall back to bit-by-bit
//! copies otherwise; writes never disturb bits outside their range.
//!
//! Indices are checked like slice indices: going past the view panics.
//! Callers size their buffers from type sizes before touching them.

/// Number of 32-bit stack words needed to hold `bits` bits.
pub const fn words_for(bits: u32) -> usize {
    bits.div_ceil(32) as usize
}

/// Number of bytes needed to hold `bits` bits.
pub const fn bytes_for(bits: u32) -> usize {
    bits.div_ceil(8) as usize
}

/// Expand the first `bits` bits of `bytes` into zero-padded stack words.
pub fn to_words(bytes: &[u8], bits: u32) -> Vec<u32> {
    let mut words = vec![0u32; words_for(bits)];
    let used = bytes_for(bits).min(bytes.len());
    for (i, byte) in bytes[..used].iter().enumerate() {
        words[i / 4] |= u32::from(*byte) << ((i % 4) * 8);
    }
    if bits % 32 != 0 {
        if let Some(last) = words.last_mut() {
            *last &= (1u32 << (bits % 32)) - 1;
        }
    }
    words
}

/// Pack the first `bits` bits of `words` into their byte form.
pub fn from_words(words: &[u32], bits: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; bytes_for(bits)];
    for (i, byte) in bytes.iter_mut().enumerate() {
        if let Some(word) = words.get(i / 4) {
            *byte = (word >> ((i % 4) * 8)) as u8;
        }
    }
    if bits % 8 != 0 {
        if let Some(last) = bytes.last_mut() {
            *last &= (1u8 << (bits % 8)) - 1;
        }
    }
    bytes
}

#[derive(Clone, Copy, Debug)]
pub struct BitBuf<B> {
    bytes: B,
    offset: usize,
    len: usize,
}

impl<B: AsRef<[u8]>> BitBuf<B> {
    /// View every bit of `bytes`.
    pub fn new(bytes: B) -> Self {
        let len = bytes.as_ref().len() * 8;
        Self {
            bytes,
            offset: 0,
            len,
        }
    }

    /// View the first `len` bits of `bytes`.
    pub fn with_len(bytes: B, len: usize) -> Self {
        assert!(len <= bytes.as_ref().len() * 8, "bit view exceeds backing storage");
        Self {
            bytes,
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn into_inner(self) -> B {
        self.bytes
    }

    /// Zero-copy sub-view of bits `beg..end`.
    pub fn slice(&self, beg: usize, end: usize) -> BitBuf<&[u8]> {
        self.check_range(beg, end);
        BitBuf {
            bytes: self.bytes.as_ref(),
            offset: self.offset + beg,
            len: end - beg,
        }
    }

    pub fn get(&self, i: usize) -> bool {
        self.check_range(i, i + 1);
        let abs = self.offset + i;
        (self.bytes.as_ref()[abs / 8] >> (abs % 8)) & 1 == 1
    }

    pub fn get8(&self, i: usize) -> u8 {
        self.get_bits(i, 8) as u8
    }

    pub fn get16(&self, i: usize) -> u16 {
        self.get_bits(i, 16) as u16
    }

    pub fn get32(&self, i: usize) -> u32 {
        self.get_bits(i, 32) as u32
    }

    pub fn get64(&self, i: usize) -> u64 {
        self.get_bits(i, 64)
    }

    /// Read `n <= 64` bits starting at `i` as a little-endian integer.
    pub fn get_bits(&self, i: usize, n: usize) -> u64 {
        assert!(n <= 64, "get_bits reads at most 64 bits");
        self.check_range(i, i + n);
        let abs = self.offset + i;
        let bytes = self.bytes.as_ref();
        if abs % 8 == 0 && n % 8 == 0 {
            let start = abs / 8;
            let mut raw = [0u8; 8];
            raw[..n / 8].copy_from_slice(&bytes[start..start + n / 8]);
            return u64::from_le_bytes(raw);
        }
        let mut out = 0u64;
        for bit in 0..n {
            let pos = abs + bit;
            if (bytes[pos / 8] >> (pos % 8)) & 1 == 1 {
                out |= 1 << bit;
            }
        }
        out
    }

    /// Fill `out` with the `out.len() * 8` bits starting at `i`.
    pub fn get_bytes(&self, i: usize, out: &mut [u8]) {
        self.check_range(i, i + out.len() * 8);
        let abs = self.offset + i;
        if abs % 8 == 0 {
            let start = abs / 8;
            out.copy_from_slice(&self.bytes.as_ref()[start..start + out.len()]);
            return;
        }
        for (k, byte) in out.iter_mut().enumerate() {
            *byte = self.get_bits(i + k * 8, 8) as u8;
        }
    }

    /// Copy this view into fresh byte storage starting at bit zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len.div_ceil(8)];
        let whole = self.len / 8;
        self.get_bytes(0, &mut out[..whole]);
        let rest = self.len % 8;
        if rest != 0 {
            out[whole] = self.get_bits(whole * 8, rest) as u8;
        }
        out
    }

    /// True when every bit in `beg..end` is clear.
    pub fn check_zero(&self, beg: usize, end: usize) -> bool {
        self.check_range(beg, end);
        let mut i = beg;
        while i < end {
            let n = (end - i).min(64);
            if self.get_bits(i, n) != 0 {
                return false;
            }
            i += n;
        }
        true
    }

    fn check_range(&self, beg: usize, end: usize) {
        assert!(
            beg <= end && end <= self.len,
            "bit range {beg}..{end} outside view of {} bits",
            self.len
        );
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BitBuf<B> {
    /// Mutable zero-copy sub-view of bits `beg..end`.
    pub fn slice_mut(&mut self, beg: usize, end: usize) -> BitBuf<&mut [u8]> {
        self.check_range(beg, end);
        BitBuf {
            offset: self.offset + beg,
            len: end - beg,
            bytes: self.bytes.as_mut(),
        }
    }

    pub fn put(&mut self, i: usize, bit: bool) {
        self.check_range(i, i + 1);
        let abs = self.offset + i;
        let byte = &mut self.bytes.as_mut()[abs / 8];
        if bit {
            *byte |= 1 << (abs % 8);
        } else {
            *byte &= !(1 << (abs % 8));
        }
    }

    pub fn put8(&mut self, i: usize, v: u8) {
        self.put_bits(i, 8, u64::from(v));
    }

    pub fn put16(&mut self, i: usize, v: u16) {
        self.put_bits(i, 16, u64::from(v));
    }

    pub fn put32(&mut self, i: usize, v: u32) {
        self.put_bits(i, 32, u64::from(v));
    }

    pub fn put64(&mut self, i: usize, v: u64) {
        self.put_bits(i, 64, v);
    }

    /// Write the low `n <= 64` bits of `v` starting at `i`.
    pub fn put_bits(&mut self, i: usize, n: usize, v: u64) {
        assert!(n <= 64, "put_bits writes at most 64 bits");
        self.check_range(i, i + n);
        let abs = self.offset + i;
        let bytes = self.bytes.as_mut();
        if abs % 8 == 0 && n % 8 == 0 {
            let start = abs / 8;
            bytes[start..start + n / 8].copy_from_slice(&v.to_le_bytes()[..n / 8]);
            return;
        }
        for bit in 0..n {
            let pos = abs + bit;
            let mask = 1u8 << (pos % 8);
            if (v >> bit) & 1 == 1 {
                bytes[pos / 8] |= mask;
            } else {
                bytes[pos / 8] &= !mask;
            }
        }
    }

    /// Write `data.len() * 8` bits starting at `i`.
    pub fn put_bytes(&mut self, i: usize, data: &[u8]) {
        self.check_range(i, i + data.len() * 8);
        let abs = self.offset + i;
        if abs % 8 == 0 {
            let start = abs / 8;
            self.bytes.as_mut()[start..start + data.len()].copy_from_slice(data);
            return;
        }
        for (k, byte) in data.iter().enumerate() {
            self.put_bits(i + k * 8, 8, u64::from(*byte));
        }
    }

    /// Copy every bit of `src` into this view starting at `i`.
    pub fn put_buf<S: AsRef<[u8]>>(&mut self, i: usize, src: &BitBuf<S>) {
        let mut k = 0;
        while k < src.len() {
            let n = (src.len() - k).min(64);
            self.put_bits(i + k, n, src.get_bits(k, n));
            k += n;
        }
    }

    pub fn zero(&mut self, beg: usize, end: usize) {
        self.fill(beg, end, false);
    }

    pub fn ones(&mut self, beg: usize, end: usize) {
        self.fill(beg, end, true);
    }

    fn fill(&mut self, beg: usize, end: usize, bit: bool) {
        self.check_range(beg, end);
        let pattern = if bit { u64::MAX } else { 0 };
        let mut i = beg;
        while i < end {
            let n = (end - i).min(64);
            self.put_bits(i, n, pattern);
            i += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_fields_are_little_endian() {
        let mut buf = BitBuf::new(vec![0u8; 16]);
        buf.put32(0, 0x1122_3344);
        buf.put64(32, 0x0102_0304_0506_0708);
        assert_eq!(buf.get8(0), 0x44);
        assert_eq!(buf.get16(8), 0x2233);
        assert_eq!(buf.get32(0), 0x1122_3344);
        assert_eq!(buf.get64(32), 0x0102_0304_0506_0708);
        assert_eq!(&buf.into_inner()[..4], &[0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn misaligned_writes_keep_neighbours() {
        let mut buf = BitBuf::new(vec![0xffu8; 4]);
        buf.put8(3, 0);
        assert_eq!(buf.get8(3), 0);
        assert!(buf.get(2));
        assert!(buf.get(11));
        let bytes = buf.into_inner();
        assert_eq!(bytes[0], 0b0000_0111);
        assert_eq!(bytes[1], 0b1111_1000);
        assert_eq!(bytes[2], 0xff);
    }

    #[test]
    fn single_bits_and_ranges() {
        let mut buf = BitBuf::new(vec![0u8; 3]);
        buf.put(5, true);
        assert!(buf.get(5));
        assert!(!buf.check_zero(0, 24));
        assert!(buf.check_zero(6, 24));
        buf.ones(7, 20);
        assert!(buf.get(7) && buf.get(19));
        assert!(!buf.get(20));
        buf.zero(0, 24);
        assert!(buf.check_zero(0, 24));
    }

    #[test]
    fn slices_share_storage() {
        let mut buf = BitBuf::new(vec![0u8; 8]);
        {
            let mut sub = buf.slice_mut(5, 45);
            sub.put32(3, 0xdead_beef);
            assert_eq!(sub.len(), 40);
        }
        assert_eq!(buf.get32(8), 0xdead_beef);
        let view = buf.slice(8, 40);
        assert_eq!(view.get16(16), 0xdead);
        assert_eq!(view.to_bytes(), vec![0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn byte_spans_at_any_offset() {
        let mut buf = BitBuf::new(vec![0u8; 6]);
        buf.put_bytes(3, &[0xab, 0xcd, 0xef]);
        let mut out = [0u8; 3];
        buf.get_bytes(3, &mut out);
        assert_eq!(out, [0xab, 0xcd, 0xef]);
        assert!(buf.check_zero(0, 3));
        assert!(buf.check_zero(27, 48));
    }

    #[test]
    fn words_roundtrip_masks_padding() {
        let bytes = vec![0xff, 0xff, 0xff];
        let words = to_words(&bytes, 20);
        assert_eq!(words, vec![0x000f_ffff]);
        assert_eq!(from_words(&words, 20), vec![0xff, 0xff, 0x0f]);
        assert_eq!(words_for(0), 0);
        assert_eq!(words_for(33), 2);
    }

    #[test]
    #[should_panic]
    fn reads_past_the_view_panic() {
        let buf = BitBuf::with_len(vec![0u8; 2], 10);
        buf.get8(4);
    }
}
