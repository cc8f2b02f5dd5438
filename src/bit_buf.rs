use anyhow::bail;

/// Writer for the bit-packed parts of the wire format.
///
/// Values are packed most-significant-bit-first into a growing byte buffer. Byte-oriented
///  writes after an unaligned bit write continue at the bit cursor - there is no realignment,
///  so a reader must consume the stream with the same sequence of widths it was written with.
pub struct BitWriter {
    buf: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    pub fn new() -> BitWriter {
        BitWriter {
            buf: Vec::new(),
            bit_len: 0,
        }
    }

    /// Write the `num_bits` least significant bits of `value`, most significant first.
    pub fn write_bits(&mut self, value: u32, num_bits: usize) {
        assert!(num_bits <= 32, "cannot write more than 32 bits from a u32");

        for i in (0..num_bits).rev() {
            self.push_bit(((value >> i) & 1) as u8);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value as u32, 8);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_u8(b);
        }
    }

    /// Write a NUL-terminated string through the bit cursor.
    pub fn write_cstr(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
        self.write_u8(0);
    }

    /// The finished buffer; trailing bits of the last byte are zero.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn push_bit(&mut self, bit: u8) {
        if self.bit_len % 8 == 0 {
            self.buf.push(0);
        }
        if bit != 0 {
            self.buf[self.bit_len / 8] |= 1 << (7 - (self.bit_len % 8));
        }
        self.bit_len += 1;
    }
}

/// Counterpart of [BitWriter]: reads values most-significant-bit-first from a byte slice.
pub struct BitReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> BitReader<'a> {
        BitReader {
            buf,
            cursor: 0,
        }
    }

    pub fn read_bits(&mut self, num_bits: usize) -> anyhow::Result<u32> {
        assert!(num_bits <= 32, "cannot read more than 32 bits into a u32");

        if self.cursor + num_bits > self.buf.len() * 8 {
            bail!("bit buffer underflow: {} bits requested but only {} left", num_bits, self.buf.len() * 8 - self.cursor);
        }

        let mut value = 0u32;
        for _ in 0..num_bits {
            let bit = (self.buf[self.cursor / 8] >> (7 - (self.cursor % 8))) & 1;
            value = (value << 1) | bit as u32;
            self.cursor += 1;
        }
        Ok(value)
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Read bytes through the bit cursor up to (and consuming) a NUL terminator.
    pub fn read_cstr(&mut self) -> anyhow::Result<String> {
        let mut bytes = Vec::new();
        loop {
            match self.read_u8()? {
                0 => break,
                b => bytes.push(b),
            }
        }
        Ok(String::from_utf8(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single_bit(vec![(1, 1)], vec![0x80])]
    #[case::six_bit_tag(vec![(1, 6)], vec![0x04])]
    #[case::tag_then_byte(vec![(3, 6), (0x62, 8)], vec![0x0d, 0x88])]
    #[case::full_byte(vec![(0xab, 8)], vec![0xab])]
    #[case::two_values(vec![(0x5, 4), (0xa, 4)], vec![0x5a])]
    #[case::wide_value(vec![(0x1234_5678, 32)], vec![0x12, 0x34, 0x56, 0x78])]
    fn test_write_bits(#[case] writes: Vec<(u32, usize)>, #[case] expected: Vec<u8>) {
        let mut writer = BitWriter::new();
        for (value, num_bits) in writes {
            writer.write_bits(value, num_bits);
        }
        assert_eq!(writer.into_bytes(), expected);
    }

    #[rstest]
    #[case::aligned(0, 8)]
    #[case::unaligned(3, 6)]
    #[case::wide(0x00ff_ffff, 24)]
    fn test_round_trip(#[case] value: u32, #[case] num_bits: usize) {
        let mut writer = BitWriter::new();
        writer.write_bits(value, num_bits);
        writer.write_cstr("trailing");

        let buf = writer.into_bytes();
        let mut reader = BitReader::new(&buf);
        assert_eq!(reader.read_bits(num_bits).unwrap(), value);
        assert_eq!(reader.read_cstr().unwrap(), "trailing");
    }

    #[rstest]
    fn test_underflow() {
        let buf = [0xffu8];
        let mut reader = BitReader::new(&buf);
        assert_eq!(reader.read_bits(6).unwrap(), 0x3f);
        assert!(reader.read_bits(6).is_err());
    }
}
