const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const MAX_TITLE_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ScanState {
    #[default]
    Text,
    Escape,
    Osc,
    OscEscape,
}

/// Picks window titles (OSC 0 and OSC 2) out of raw terminal output.
/// Sequences may be split across chunks.
#[derive(Debug, Default)]
pub struct TitleDetector {
    state: ScanState,
    payload: Vec<u8>,
}

impl TitleDetector {
    /// Returns the last complete title found in `chunk`, if any.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<String> {
        let mut latest = None;
        for &byte in chunk {
            self.state = match (self.state, byte) {
                (ScanState::Text, ESC) => ScanState::Escape,
                (ScanState::Text, _) => ScanState::Text,
                (ScanState::Escape, b']') => {
                    self.payload.clear();
                    ScanState::Osc
                }
                (ScanState::Escape, ESC) => ScanState::Escape,
                (ScanState::Escape, _) => ScanState::Text,
                (ScanState::Osc, BEL) => {
                    if let Some(title) = self.finish() {
                        latest = Some(title);
                    }
                    ScanState::Text
                }
                (ScanState::Osc, ESC) => ScanState::OscEscape,
                (ScanState::Osc, _) if self.payload.len() >= MAX_TITLE_BYTES => ScanState::Text,
                (ScanState::Osc, _) => {
                    self.payload.push(byte);
                    ScanState::Osc
                }
                (ScanState::OscEscape, b'\\') => {
                    if let Some(title) = self.finish() {
                        latest = Some(title);
                    }
                    ScanState::Text
                }
                (ScanState::OscEscape, b']') => {
                    self.payload.clear();
                    ScanState::Osc
                }
                (ScanState::OscEscape, _) => ScanState::Text,
            };
        }
        latest
    }

    fn finish(&mut self) -> Option<String> {
        let payload = std::mem::take(&mut self.payload);
        let separator = payload.iter().position(|byte| *byte == b';')?;
        let (code, title) = payload.split_at(separator);
        if code != b"0" && code != b"2" {
            return None;
        }
        let title = String::from_utf8_lossy(&title[1..]).trim().to_owned();
        (!title.is_empty()).then_some(title)
    }
}

#[cfg(test)]
mod tests {
    use super::TitleDetector;

    #[test]
    fn detects_bel_terminated_title() {
        let mut detector = TitleDetector::default();

        assert_eq!(
            detector.feed(b"before\x1b]0;Agent: fixing tests\x07after"),
            Some("Agent: fixing tests".to_owned())
        );
    }

    #[test]
    fn detects_st_terminated_title_split_across_chunks() {
        let mut detector = TitleDetector::default();

        assert_eq!(detector.feed(b"\x1b]2;build"), None);
        assert_eq!(detector.feed(b"ing docs\x1b"), None);
        assert_eq!(detector.feed(b"\\"), Some("building docs".to_owned()));
    }

    #[test]
    fn ignores_other_osc_codes_and_csi_sequences() {
        let mut detector = TitleDetector::default();

        assert_eq!(detector.feed(b"\x1b[31mred\x1b[0m"), None);
        assert_eq!(detector.feed(b"\x1b]8;;https://example.com\x07link"), None);
        assert_eq!(detector.feed(b"\x1b]1;icon\x07"), None);
    }

    #[test]
    fn returns_the_last_title_in_a_chunk() {
        let mut detector = TitleDetector::default();

        assert_eq!(
            detector.feed(b"\x1b]0;first\x07\x1b]0;second\x07"),
            Some("second".to_owned())
        );
    }

    #[test]
    fn oversized_payload_is_abandoned() {
        let mut detector = TitleDetector::default();
        let mut chunk = b"\x1b]0;".to_vec();
        chunk.extend(std::iter::repeat_n(b'x', 4096));
        chunk.push(0x07);

        assert_eq!(detector.feed(&chunk), None);
        assert_eq!(detector.feed(b"\x1b]0;ok\x07"), Some("ok".to_owned()));
    }
}
