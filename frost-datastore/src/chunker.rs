//! Two-Threshold Two-Divisor content-defined chunker.
//!
//! Rolling hash by cyclic polynomial (Buzhash) over a 64 byte window: the
//! hash update is a barrel shift and two table lookups, no multiplications.
//! A chunk boundary is declared when the hash matches the main divisor after
//! the minimum size; if the main divisor never fires before the maximum
//! size, the last match of the easier backup divisor is used, and failing
//! that the chunk is cut at the maximum. Identical bytes therefore always
//! produce identical cut points, which is what makes deduplication work.

const CHUNKER_WINDOW_SIZE: usize = 64;

/// SHA-1 digest of a chunk's plaintext, its identity in the index.
pub type ChunkDigest = [u8; 20];

const BUZHASH_TABLE: [u32; 256] = [
    0x458be752, 0xc10748cc, 0xfbbcdbb8, 0x6ded5b68, 0xb10a82b5, 0x20d75648, 0xdfc5665f, 0xa8428801,
    0x7ebf5191, 0x841135c7, 0x65cc53b3, 0x280a597c, 0x16f60255, 0xc78cbc3e, 0x294415f5, 0xb938d494,
    0xec85c4e6, 0xb7d33edc, 0xe549b544, 0xfdeda5aa, 0x882bf287, 0x3116737c, 0x05569956, 0xe8cc1f68,
    0x0806ac5e, 0x22a14443, 0x15297e10, 0x50d090e7, 0x4ba60f6f, 0xefd9f1a7, 0x5c5c885c, 0x82482f93,
    0x9bfd7c64, 0x0b3e7276, 0xf2688e77, 0x8fad8abc, 0xb0509568, 0xf1ada29f, 0xa53efdfe, 0xcb2b1d00,
    0xf2a9e986, 0x6463432b, 0x95094051, 0x5a223ad2, 0x9be8401b, 0x61e579cb, 0x1a556a14, 0x5840fdc2,
    0x9261ddf6, 0xcde002bb, 0x52432bb0, 0xbf17373e, 0x7b7c222f, 0x2955ed16, 0x9f10ca59, 0xe840c4c9,
    0xccabd806, 0x14543f34, 0x1462417a, 0x0d4a1f9c, 0x087ed925, 0xd7f8f24c, 0x7338c425, 0xcf86c8f5,
    0xb19165cd, 0x9891c393, 0x325384ac, 0x0308459d, 0x86141d7e, 0xc922116a, 0xe2ffa6b6, 0x53f52aed,
    0x2cd86197, 0xf5b9f498, 0xbf319c8f, 0xe0411fae, 0x977eb18c, 0xd8770976, 0x9833466a, 0xc674df7f,
    0x8c297d45, 0x8ca48d26, 0xc49ed8e2, 0x7344f874, 0x556f79c7, 0x6b25eaed, 0xa03e2b42, 0xf68f66a4,
    0x8e8b09a2, 0xf2e0e62a, 0x0d3a9806, 0x9729e493, 0x8c72b0fc, 0x160b94f6, 0x450e4d3d, 0x7a320e85,
    0xbef8f0e1, 0x21d73653, 0x4e3d977a, 0x1e7b3929, 0x1cc6c719, 0xbe478d53, 0x8d752809, 0xe6d8c2c6,
    0x275f0892, 0xc8acc273, 0x4cc21580, 0xecc4a617, 0xf5f7be70, 0xe795248a, 0x375a2fe9, 0x425570b6,
    0x8898dcf8, 0xdc2d97c4, 0x0106114b, 0x364dc22f, 0x1e0cad1f, 0xbe63803c, 0x5f69fac2, 0x4d5afa6f,
    0x1bc0dfb5, 0xfb273589, 0x0ea47f7b, 0x3c1c2b50, 0x21b2a932, 0x6b1223fd, 0x2fe706a8, 0xf9bd6ce2,
    0xa268e64e, 0xe987f486, 0x3eacf563, 0x1ca2018c, 0x65e18228, 0x2207360a, 0x57cf1715, 0x34c37d2b,
    0x1f8f3cde, 0x93b657cf, 0x31a019fd, 0xe69eb729, 0x8bca7b9b, 0x4c9d5bed, 0x277ebeaf, 0xe0d8f8ae,
    0xd150821c, 0x31381871, 0xafc3f1b0, 0x927db328, 0xe95effac, 0x305a47bd, 0x426ba35b, 0x1233af3f,
    0x686a5b83, 0x50e072e5, 0xd9d3bb2a, 0x8befc475, 0x487f0de6, 0xc88dff89, 0xbd664d5e, 0x971b5d18,
    0x63b14847, 0xd7d3c1ce, 0x7f583cf3, 0x72cbcb09, 0xc0d0a81c, 0x7fa3429b, 0xe9158a1b, 0x225ea19a,
    0xd8ca9ea3, 0xc763b282, 0xbb0c6341, 0x020b8293, 0xd4cd299d, 0x58cfa7f8, 0x91b4ee53, 0x37e4d140,
    0x95ec764c, 0x30f76b06, 0x5ee68d24, 0x679c8661, 0xa41979c2, 0xf2b61284, 0x4fac1475, 0x0adb49f9,
    0x19727a23, 0x15a7e374, 0xc43a18d5, 0x3fb1aa73, 0x342fc615, 0x924c0793, 0xbee2d7f0, 0x8a279de9,
    0x4aa2d70c, 0xe24dd37f, 0xbe862c0b, 0x177c22c2, 0x5388e5ee, 0xcd8a7510, 0xf901b4fd, 0xdbc13dbc,
    0x6c0bae5b, 0x64efe8c7, 0x48b02079, 0x80331a49, 0xca3d8ae6, 0xf3546190, 0xfed7108b, 0xc49b941b,
    0x32baf4a9, 0xeb833a4a, 0x88a3f1a5, 0x3a91ce0a, 0x3cc27da1, 0x7112e684, 0x4a3096b1, 0x3794574c,
    0xa3c8b6f3, 0x1d213941, 0x6e0a2e00, 0x233479f1, 0x0f4cd82f, 0x6093edd2, 0x5d7d209e, 0x464fe319,
    0xd4dcac9e, 0x0db845cb, 0xfb5e4bc3, 0xe0256ce1, 0x09fb4ed1, 0x0914be1e, 0xa5bdb2c3, 0xc6eb57bb,
    0x30320350, 0x3f397e91, 0xa67791bc, 0x86bc0e2c, 0xefa0a7e2, 0xe9ff7543, 0xe733612c, 0xd185897b,
    0x329e5388, 0x91dd236b, 0x2ecb0d93, 0xf4d82a3d, 0x35b5c03f, 0xe4e606f0, 0x05b21843, 0x37b45964,
    0x5eff22f4, 0x6027f4cc, 0x77178b3c, 0xae507131, 0x7bf7cabc, 0xf9c18d66, 0x593ade65, 0xd95ddf11,
];

/// Content-defined chunker with a tunable average chunk size.
///
/// `chunk_size_avg` must be a power of two; chunks vary between
/// `chunk_size_avg/4` and `chunk_size_avg*4`.
pub struct Chunker {
    chunk_size_min: usize,
    chunk_size_max: usize,
    break_mask_main: u32,
    break_mask_backup: u32,
}

impl Chunker {
    pub fn new(chunk_size_avg: usize) -> Self {
        if chunk_size_avg.count_ones() != 1 {
            panic!("got unexpected chunk size - not a power of two.");
        }
        if chunk_size_avg < 4 * CHUNKER_WINDOW_SIZE {
            panic!("average chunk size too small for the hash window.");
        }

        Self {
            chunk_size_min: chunk_size_avg >> 2,
            chunk_size_max: chunk_size_avg << 2,
            break_mask_main: (chunk_size_avg - 1) as u32,
            break_mask_backup: ((chunk_size_avg >> 1) - 1) as u32,
        }
    }

    pub fn chunk_size_max(&self) -> usize {
        self.chunk_size_max
    }

    /// Find the next cut point at the start of `data`.
    ///
    /// Returns the chunk length, or `None` when `data` is too short to
    /// decide and more input is needed (never when `eof` is set). The
    /// caller feeds the unconsumed remainder back in for the next chunk;
    /// no hash state survives a cut, so cut points depend only on content.
    pub fn next_cut(&self, data: &[u8], eof: bool) -> Option<usize> {
        if data.len() >= self.chunk_size_max {
            return Some(self.scan(&data[..self.chunk_size_max]));
        }
        if eof {
            if data.is_empty() {
                return None;
            }
            if data.len() <= self.chunk_size_min || data.len() <= CHUNKER_WINDOW_SIZE {
                return Some(data.len());
            }
            return Some(self.scan(data));
        }
        None
    }

    // Scan a full window of input; `data.len()` is the forced cut position.
    fn scan(&self, data: &[u8]) -> usize {
        let mut hash: u32 = 0;
        let mut window = [0u8; CHUNKER_WINDOW_SIZE];
        let mut backup_cut = 0usize;

        for (pos, &byte) in data.iter().enumerate() {
            let idx = pos & (CHUNKER_WINDOW_SIZE - 1);
            if pos < CHUNKER_WINDOW_SIZE {
                hash = hash.rotate_left(1) ^ BUZHASH_TABLE[byte as usize];
            } else {
                let leave = window[idx];
                hash = hash.rotate_left(1) ^ BUZHASH_TABLE[leave as usize] ^ BUZHASH_TABLE[byte as usize];
            }
            window[idx] = byte;

            let size = pos + 1;
            if size < self.chunk_size_min {
                continue;
            }
            if hash & self.break_mask_main == self.break_mask_main {
                return size;
            }
            if hash & self.break_mask_backup == self.break_mask_backup {
                backup_cut = size;
            }
        }

        if data.len() == self.chunk_size_max && backup_cut != 0 {
            return backup_cut;
        }
        data.len()
    }
}

/// Pulls chunks off a byte stream.
///
/// Owns a read buffer of twice the maximum chunk size and hands out
/// `(bytes, sha1)` records until the stream is exhausted.
pub struct ChunkStream<R: std::io::Read> {
    reader: R,
    chunker: Chunker,
    buffer: Vec<u8>,
    start: usize,
    eof: bool,
}

impl<R: std::io::Read> ChunkStream<R> {
    pub fn new(reader: R, chunk_size_avg: usize) -> Self {
        let chunker = Chunker::new(chunk_size_avg);
        let cap = chunker.chunk_size_max() * 2;
        Self {
            reader,
            chunker,
            buffer: Vec::with_capacity(cap),
            start: 0,
            eof: false,
        }
    }

    /// Produce the next chunk, or `None` at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<(&[u8], ChunkDigest)>, std::io::Error> {
        loop {
            let pending = &self.buffer[self.start..];
            if let Some(cut) = self.chunker.next_cut(pending, self.eof) {
                let chunk = &self.buffer[self.start..self.start + cut];
                self.start += cut;
                let mut digest = [0u8; 20];
                digest.copy_from_slice(&openssl::sha::sha1(chunk));
                return Ok(Some((&self.buffer[self.start - cut..self.start], digest)));
            }
            if self.eof {
                return Ok(None);
            }
            self.refill()?;
        }
    }

    fn refill(&mut self) -> Result<(), std::io::Error> {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
        let target = self.chunker.chunk_size_max() * 2;
        let mut len = self.buffer.len();
        self.buffer.resize(target, 0);
        while len < target {
            match self.reader.read(&mut self.buffer[len..])? {
                0 => {
                    self.eof = true;
                    break;
                }
                n => len += n,
            }
        }
        self.buffer.truncate(len);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_data() -> Vec<u8> {
        let mut buffer = Vec::new();
        for i in 0u32..(256 * 1024) {
            for j in 0..4 {
                buffer.push(((i >> (j << 3)) & 0xff) as u8);
            }
        }
        buffer
    }

    #[test]
    fn cuts_are_deterministic() {
        let buffer = test_data();
        let chunker = Chunker::new(8 * 1024);

        let mut cuts1 = Vec::new();
        let mut pos = 0;
        while pos < buffer.len() {
            let cut = chunker.next_cut(&buffer[pos..], true).unwrap();
            cuts1.push((pos, cut));
            pos += cut;
        }

        let mut cuts2 = Vec::new();
        let mut pos = 0;
        while pos < buffer.len() {
            let cut = chunker.next_cut(&buffer[pos..], true).unwrap();
            cuts2.push((pos, cut));
            pos += cut;
        }

        assert_eq!(cuts1, cuts2);
        let total: usize = cuts1.iter().map(|(_, len)| len).sum();
        assert_eq!(total, buffer.len());
        for (_, len) in &cuts1 {
            assert!(*len <= chunker.chunk_size_max());
        }
    }

    #[test]
    fn stream_matches_direct_cuts() {
        let buffer = test_data();
        let chunker = Chunker::new(8 * 1024);

        let mut direct = Vec::new();
        let mut pos = 0;
        while pos < buffer.len() {
            let cut = chunker.next_cut(&buffer[pos..], true).unwrap();
            direct.push(buffer[pos..pos + cut].to_vec());
            pos += cut;
        }

        // feed the stream through a reader that returns odd sized reads
        struct OddReader<'a>(&'a [u8]);
        impl std::io::Read for OddReader<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = self.0.len().min(buf.len()).min(977);
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }

        let mut stream = ChunkStream::new(OddReader(&buffer), 8 * 1024);
        let mut streamed = Vec::new();
        while let Some((data, digest)) = stream.next_chunk().unwrap() {
            assert_eq!(&openssl::sha::sha1(data)[..], &digest[..]);
            streamed.push(data.to_vec());
        }

        assert_eq!(direct, streamed);
    }

    #[test]
    fn small_input_is_one_chunk() {
        let chunker = Chunker::new(8 * 1024);
        assert_eq!(chunker.next_cut(b"tiny", true), Some(4));
        assert_eq!(chunker.next_cut(b"", true), None);
        assert_eq!(chunker.next_cut(b"tiny", false), None);
    }
}
