//! # framer
//!
//! Cuts the standard output of the sampler into complete documents.
//!
//! The sampler writes documents back to back, without any length prefix.
//! Every document after the first one is preceded by a NUL byte. A document
//! is considered complete as soon as the accumulated text, once stripped from
//! that padding and from surrounding whitespace, ends with the closing marker.
use super::plist::PLIST_CLOSING_TAG;
use std::io::{self, BufRead};

/// Size past which a document in progress is given up on.
pub const MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;

/// Iterator over the complete documents read from `reader`.
///
/// Ends when the reader reaches end of stream. A trailing incomplete document
/// is dropped. A read error is yielded once and ends the iteration. A document
/// growing past its size limit is dropped, up to and including its closing
/// marker.
pub struct DocumentFramer<R: BufRead> {
    reader: R,
    buffer: String,
    line: Vec<u8>,
    closing_marker: &'static str,
    max_len: usize,
    discarding: bool,
    finished: bool,
}

impl<R: BufRead> DocumentFramer<R> {
    pub fn new(reader: R) -> DocumentFramer<R> {
        DocumentFramer::with_marker(reader, PLIST_CLOSING_TAG)
    }

    pub fn with_marker(reader: R, closing_marker: &'static str) -> DocumentFramer<R> {
        DocumentFramer {
            reader,
            buffer: String::new(),
            line: Vec::new(),
            closing_marker,
            max_len: MAX_DOCUMENT_BYTES,
            discarding: false,
            finished: false,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> DocumentFramer<R> {
        self.max_len = max_len;
        self
    }

    fn strip(text: &str) -> &str {
        text.trim_start_matches('\0').trim()
    }
}

impl<R: BufRead> Iterator for DocumentFramer<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.finished = true;
                    if !Self::strip(&self.buffer).is_empty() {
                        debug!(
                            "end of stream, dropping {} bytes of incomplete document",
                            self.buffer.len()
                        );
                    }
                    self.buffer.clear();
                    return None;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&self.line);
                    if self.discarding {
                        if line.trim_end().ends_with(self.closing_marker) {
                            self.discarding = false;
                        }
                        continue;
                    }
                    self.buffer.push_str(&line);
                    let stripped = Self::strip(&self.buffer);
                    if stripped.ends_with(self.closing_marker) {
                        let document = stripped.to_string();
                        self.buffer.clear();
                        trace!("framed a document of {} bytes", document.len());
                        return Some(Ok(document));
                    }
                    if self.buffer.len() > self.max_len {
                        warn!(
                            "document exceeds {} bytes without {}, dropping it",
                            self.max_len, self.closing_marker
                        );
                        self.buffer.clear();
                        self.discarding = true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::plist;
    use std::io::{BufReader, Cursor, Read};

    fn document(value: i64) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\">\n<dict>\n\t<key>elapsed_ns</key>\n\t<integer>{value}</integer>\n</dict>\n</plist>\n"
        )
    }

    #[test]
    fn yields_each_document() {
        let stream = format!("{}\0{}\0{}", document(1), document(2), document(3));
        let framer = DocumentFramer::new(Cursor::new(stream));
        let docs: Vec<String> = framer.map(|d| d.unwrap()).collect();
        assert_eq!(docs.len(), 3);
        for (i, doc) in docs.iter().enumerate() {
            assert!(doc.starts_with("<?xml"));
            assert!(doc.ends_with("</plist>"));
            let root = plist::parse(doc).unwrap();
            assert_eq!(root.get("elapsed_ns").unwrap().as_i64(), Some(i as i64 + 1));
        }
    }

    #[test]
    fn padding_before_the_next_document_is_stripped() {
        let stream = "<plist><dict></dict></plist>\n\0<plist><dict><key>a</key><integer>1</integer></dict></plist>\n";
        let docs: Vec<String> = DocumentFramer::new(Cursor::new(stream))
            .map(|d| d.unwrap())
            .collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1], "<plist><dict><key>a</key><integer>1</integer></dict></plist>");
    }

    #[test]
    fn trailing_partial_document_is_dropped() {
        let full = document(1);
        let partial = &document(2)[..40];
        let stream = format!("{full}\0{partial}");
        let docs: Vec<_> = DocumentFramer::new(Cursor::new(stream)).collect();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        let mut framer = DocumentFramer::new(Cursor::new(""));
        assert!(framer.next().is_none());
        assert!(framer.next().is_none());
    }

    #[test]
    fn invalid_utf8_does_not_stop_the_stream() {
        let mut stream = b"<plist><dict><key>a</key><string>".to_vec();
        stream.extend_from_slice(&[0xff, 0xfe]);
        stream.extend_from_slice(b"</string></dict></plist>\n");
        stream.extend_from_slice(document(7).as_bytes());
        let docs: Vec<String> = DocumentFramer::new(Cursor::new(stream))
            .map(|d| d.unwrap())
            .collect();
        assert_eq!(docs.len(), 2);
        assert!(plist::parse(&docs[1]).is_ok());
    }

    #[test]
    fn oversized_document_is_dropped() {
        let mut big = String::from("<plist>\n<dict>\n");
        for i in 0..50 {
            big.push_str(&format!("<key>k{i}</key><integer>{i}</integer>\n"));
        }
        big.push_str("</dict>\n</plist>\n");
        let stream = format!("{big}\0{}", document(5));
        let docs: Vec<String> = DocumentFramer::new(Cursor::new(stream))
            .with_max_len(200)
            .map(|d| d.unwrap())
            .collect();
        assert_eq!(docs.len(), 1);
        let root = plist::parse(&docs[0]).unwrap();
        assert_eq!(root.get("elapsed_ns").unwrap().as_i64(), Some(5));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn read_error_is_reported_once() {
        let mut framer = DocumentFramer::new(BufReader::new(FailingReader));
        assert!(matches!(framer.next(), Some(Err(_))));
        assert!(framer.next().is_none());
    }
}
