//! Source adapter producing `zero_run | data_run` sections.
//!
//! Reads fixed-size buffers and demotes buffers that are entirely
//! zero to [`Section::Zeros`], so holes in sparse images (which read
//! back as zeros) never materialize as data. The tree writer
//! canonicalizes zero handling again on its side, so the section
//! boundaries chosen here do not affect the emitted tree.

use std::io::Read;

use bytes::Bytes;

/// Read granularity of the adapter.
pub const SECTION_BUF_SIZE: usize = 128 * 1024;

#[derive(Clone, Debug)]
pub enum Section {
    /// `n` logical zero bytes.
    Zeros(u64),
    /// Literal bytes from the source.
    Data(Bytes),
}

/// Iterator of sections over any byte source.
pub struct SectionReader<R> {
    inner: R,
    buf_size: usize,
    done: bool,
}

impl<R: Read> SectionReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_buf_size(inner, SECTION_BUF_SIZE)
    }

    pub fn with_buf_size(inner: R, buf_size: usize) -> Self {
        assert!(buf_size > 0);
        Self {
            inner,
            buf_size,
            done: false,
        }
    }

    fn fill_buf(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.buf_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<R: Read> Iterator for SectionReader<R> {
    type Item = std::io::Result<Section>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let buf = match self.fill_buf() {
            Ok(buf) => buf,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if buf.is_empty() {
            self.done = true;
            return None;
        }
        if buf.len() < self.buf_size {
            self.done = true;
        }
        if buf.iter().all(|&b| b == 0) {
            Some(Ok(Section::Zeros(buf.len() as u64)))
        } else {
            Some(Ok(Section::Data(buf.into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_source_sections() {
        let mut input = vec![0u8; 64];
        input.extend_from_slice(&[1u8; 64]);
        input.extend_from_slice(&[0u8; 32]);

        let sections: Vec<_> = SectionReader::with_buf_size(&input[..], 64)
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(sections.len(), 3);
        assert!(matches!(sections[0], Section::Zeros(64)));
        assert!(matches!(&sections[1], Section::Data(d) if d.iter().all(|&b| b == 1)));
        assert!(matches!(sections[2], Section::Zeros(32)));
    }

    #[test]
    fn empty_source_yields_nothing() {
        let empty: &[u8] = &[];
        assert!(SectionReader::new(empty).next().is_none());
    }

    #[test]
    fn short_reads_are_accumulated() {
        // A reader that returns one byte at a time still produces
        // full-sized sections.
        struct OneByte(Vec<u8>);
        impl Read for OneByte {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0.remove(0);
                Ok(1)
            }
        }
        let sections: Vec<_> = SectionReader::with_buf_size(OneByte(vec![7u8; 10]), 4)
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(sections.len(), 3);
        assert!(matches!(&sections[0], Section::Data(d) if d.len() == 4));
        assert!(matches!(&sections[2], Section::Data(d) if d.len() == 2));
    }
}
