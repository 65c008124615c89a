//! Running stream checksum and block content checksums.
//!
//! The wire format carries a 256-bit Fletcher-4 checksum in every END
//! record, accumulated over every stream byte since the enclosing BEGIN.
//! Fletcher-4 runs over 32-bit words; the byteswapped variant folds each
//! word through `swap_bytes` so a receiver on the opposite byte order
//! reproduces the sender's state without rewriting the stream.

use bytes::{Buf, BufMut};

/// 256-bit checksum as four 64-bit lanes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum256(pub [u64; 4]);

impl Checksum256 {
    pub const ZERO: Checksum256 = Checksum256([0; 4]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        for w in self.0 {
            buf.put_u64_ne(w);
        }
    }

    pub fn get(buf: &mut impl Buf, swap: bool) -> Checksum256 {
        let mut words = [0u64; 4];
        for w in &mut words {
            let v = buf.get_u64_ne();
            *w = if swap { v.swap_bytes() } else { v };
        }
        Checksum256(words)
    }

    pub fn from_bytes(digest: &[u8; 32]) -> Checksum256 {
        let mut words = [0u64; 4];
        for (i, w) in words.iter_mut().enumerate() {
            let mut b = [0u8; 8];
            b.copy_from_slice(&digest[i * 8..i * 8 + 8]);
            *w = u64::from_le_bytes(b);
        }
        Checksum256(words)
    }
}

/// Incremental Fletcher-4 over a byte stream.
///
/// Input need not arrive in 4-byte multiples; trailing bytes are carried
/// until the next update completes the word.
#[derive(Debug, Clone, Default)]
pub struct Fletcher4 {
    state: [u64; 4],
    carry: [u8; 4],
    carry_len: usize,
}

impl Fletcher4 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold `data` into the running checksum, words in native order.
    pub fn update(&mut self, data: &[u8]) {
        self.fold(data, false);
    }

    /// Fold `data` whose words were produced on the opposite byte order.
    pub fn update_byteswap(&mut self, data: &[u8]) {
        self.fold(data, true);
    }

    fn fold(&mut self, mut data: &[u8], swap: bool) {
        let [mut a, mut b, mut c, mut d] = self.state;

        if self.carry_len > 0 {
            let need = 4 - self.carry_len;
            let take = need.min(data.len());
            self.carry[self.carry_len..self.carry_len + take].copy_from_slice(&data[..take]);
            self.carry_len += take;
            data = &data[take..];
            if self.carry_len < 4 {
                self.state = [a, b, c, d];
                return;
            }
            let mut w = u32::from_ne_bytes(self.carry);
            if swap {
                w = w.swap_bytes();
            }
            a = a.wrapping_add(w as u64);
            b = b.wrapping_add(a);
            c = c.wrapping_add(b);
            d = d.wrapping_add(c);
            self.carry_len = 0;
        }

        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            let mut w = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if swap {
                w = w.swap_bytes();
            }
            a = a.wrapping_add(w as u64);
            b = b.wrapping_add(a);
            c = c.wrapping_add(b);
            d = d.wrapping_add(c);
        }

        let rem = chunks.remainder();
        self.carry[..rem.len()].copy_from_slice(rem);
        self.carry_len = rem.len();

        self.state = [a, b, c, d];
    }

    pub fn value(&self) -> Checksum256 {
        Checksum256(self.state)
    }
}

/// Content checksum algorithms usable for block dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentChecksum {
    None = 0,
    /// Strong 256-bit hash (blake3), collision-resistant, dedup-capable.
    Strong256 = 2,
}

impl ContentChecksum {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            2 => Some(Self::Strong256),
            _ => None,
        }
    }
}

/// Hash a data block for dedup keying.
pub fn content_checksum(data: &[u8]) -> Checksum256 {
    Checksum256::from_bytes(blake3::hash(data).as_bytes())
}
