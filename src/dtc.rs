//! Diagnostic trouble codes: MIL status, enumeration, and reset.

use log::{debug, info, warn};
use std::{
    collections::HashMap,
    io::BufRead,
    path::Path,
    time::Duration,
};

use crate::error::{DecodeError, KernelError};
use crate::response;
use crate::transport::Transport;

const DTC_TIMEOUT: Duration = Duration::from_secs(5);

/// One stored trouble code, resolved against the dictionary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dtc {
    /// Five-character code such as `P0171`.
    pub code: String,
    /// What the code means in English.
    pub meaning: String,
    /// A hint at a fix, when the dictionary has one.
    pub solution: Option<String>,
}

/// Mapping from code strings to their meanings.
///
/// Loaded from a tab-separated text source: `code<TAB>meaning` with an
/// optional third `<TAB>solution` field. Lines of any other shape are
/// skipped.
#[derive(Default)]
pub struct DtcDictionary {
    entries: HashMap<String, (String, Option<String>)>,
}

impl DtcDictionary {
    pub fn new() -> Self {
        DtcDictionary::default()
    }

    /// Read a dictionary file from disk.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Read dictionary lines from any buffered source.
    pub fn from_reader(reader: impl BufRead) -> std::io::Result<Self> {
        let mut entries = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            let mut fields = line.split('\t');
            let (Some(code), Some(meaning)) = (fields.next(), fields.next()) else {
                continue;
            };
            if code.is_empty() || meaning.is_empty() {
                continue;
            }
            let solution = fields.next().filter(|s| !s.is_empty()).map(str::to_owned);
            entries.insert(code.to_owned(), (meaning.to_owned(), solution));
        }
        debug!("dictionary holds {} codes", entries.len());
        Ok(DtcDictionary { entries })
    }

    pub fn lookup(&self, code: &str) -> Option<&(String, Option<String>)> {
        self.entries.get(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reads and clears stored codes via the adapter.
pub struct DtcService {
    dictionary: DtcDictionary,
    mil_on: bool,
    count: u8,
    codes: Vec<Dtc>,
}

impl DtcService {
    pub fn new(dictionary: DtcDictionary) -> Self {
        DtcService {
            dictionary,
            mil_on: false,
            count: 0,
            codes: Vec::new(),
        }
    }

    /// Whether the malfunction indicator lamp is lit, per the last read.
    pub fn mil_on(&self) -> bool {
        self.mil_on
    }

    /// Number of stored codes, per the last read.
    pub fn count(&self) -> u8 {
        self.count
    }

    /// The codes found by the last enumeration.
    pub fn codes(&self) -> &[Dtc] {
        &self.codes
    }

    /// Re-read MIL status and, when codes are present, re-enumerate.
    pub fn refresh(&mut self, transport: &mut Transport) -> Result<(), KernelError> {
        self.read_status(transport)?;
        if self.count > 0 {
            self.enumerate(transport)?;
        } else {
            self.codes.clear();
        }
        Ok(())
    }

    /// Mode 01 PID 01: bit 7 of byte A is the MIL flag, bits 0-6 the
    /// count of stored codes.
    pub fn read_status(&mut self, transport: &mut Transport) -> Result<(), KernelError> {
        let raw = transport.send_and_read("0101", DTC_TIMEOUT)?;
        let bytes = response::parse_bytes(&raw)?;
        let a = *bytes.get(2).ok_or(DecodeError::NoData)?;
        self.mil_on = a & 0x80 == 0x80;
        self.count = a & 0x7F;
        info!("MIL {}, {} stored codes", self.mil_on, self.count);
        Ok(())
    }

    /// Mode 03 with headers on, so multi-ECU responses can be split.
    ///
    /// `43` is valid payload anywhere, so the response is split on the
    /// first eight characters (ECU header plus the echoed response
    /// mode), each piece loses its trailing checksum byte, and the rest
    /// reads as 4-character code tuples up to the reported count.
    fn enumerate(&mut self, transport: &mut Transport) -> Result<(), KernelError> {
        transport.send_and_read("ATH1", DTC_TIMEOUT)?;
        let outcome = transport
            .send_and_read("03", DTC_TIMEOUT)
            .map_err(KernelError::from)
            .and_then(|raw| self.parse_mode3(&raw));
        // headers must come back off even when the parse went sideways
        transport.send_and_read("ATH0", DTC_TIMEOUT)?;
        outcome
    }

    fn parse_mode3(&mut self, raw: &str) -> Result<(), KernelError> {
        let tuples = frame_tuples(raw, self.count)?;

        let mut seen = Vec::new();
        for tuple in tuples {
            let code = format_code(&tuple);
            if !seen.contains(&code) {
                seen.push(code);
            }
        }

        self.codes = seen
            .into_iter()
            .map(|code| match self.dictionary.lookup(&code) {
                Some((meaning, solution)) => Dtc {
                    code,
                    meaning: meaning.clone(),
                    solution: solution.clone(),
                },
                None => {
                    warn!("code {code} not in dictionary");
                    Dtc {
                        code,
                        meaning: "Unknown code".to_owned(),
                        solution: None,
                    }
                }
            })
            .collect();
        Ok(())
    }

    /// Forget everything read in this session.
    pub(crate) fn clear(&mut self) {
        self.mil_on = false;
        self.count = 0;
        self.codes.clear();
    }

    /// Mode 04: clear stored codes and the MIL. Refused (returning
    /// `Ok(false)`) when the ECU reports nothing stored.
    pub fn reset(&mut self, transport: &mut Transport) -> Result<bool, KernelError> {
        self.read_status(transport)?;
        if self.count == 0 {
            return Ok(false);
        }
        transport.send_and_read("04", DTC_TIMEOUT)?;
        info!("cleared stored codes and MIL");
        self.mil_on = false;
        self.count = 0;
        self.codes.clear();
        Ok(true)
    }
}

/// Split a headers-on mode-03 response into 4-character code tuples.
///
/// All-zero tuples are frame padding, not codes, and are skipped without
/// counting toward `count`.
fn frame_tuples(raw: &str, count: u8) -> Result<Vec<String>, KernelError> {
    let cleaned = response::clean(raw);
    let payload = cleaned.strip_suffix('>').ok_or(DecodeError::NoPrompt)?;
    if payload.len() < 8 {
        return Err(DecodeError::NoData.into());
    }

    let delimiter = &payload[..8];
    let mut tuples = Vec::new();

    for piece in payload.split(delimiter) {
        if piece.len() < 2 {
            continue;
        }
        // the last byte of each frame is its checksum
        let body = &piece[..piece.len() - 2];
        let mut k = 0;
        while k + 4 <= body.len() && tuples.len() < usize::from(count) {
            let tuple = &body[k..k + 4];
            if tuple != "0000" {
                tuples.push(tuple.to_owned());
            }
            k += 4;
        }
    }

    Ok(tuples)
}

/// Expand an encoded 4-nibble tuple into the printable 5-character code.
fn format_code(tuple: &str) -> String {
    let prefix = match tuple.chars().next() {
        Some('0') => "P0",
        Some('1') => "P1",
        Some('2') => "P2",
        Some('3') => "P3",
        Some('4') => "C0",
        Some('5') => "C1",
        Some('6') => "C2",
        Some('7') => "C3",
        Some('8') => "B0",
        Some('9') => "B1",
        Some('A') => "B2",
        Some('B') => "B3",
        Some('C') => "U0",
        Some('D') => "U1",
        Some('E') => "U2",
        Some('F') => "U3",
        _ => "XX",
    };
    format!("{prefix}{}", tuple.get(1..).unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockLink;

    fn dictionary() -> DtcDictionary {
        let text = "P0133\tO2 Sensor Circuit Slow Response\tCheck the oxygen sensor wiring\n\
                    P0171\tSystem Too Lean (Bank 1)\n\
                    badline\n\
                    \n";
        DtcDictionary::from_reader(text.as_bytes()).unwrap()
    }

    #[test]
    fn dictionary_parses_two_and_three_field_lines() {
        let dict = dictionary();
        assert_eq!(dict.len(), 2);
        let (meaning, solution) = dict.lookup("P0133").unwrap();
        assert_eq!(meaning, "O2 Sensor Circuit Slow Response");
        assert_eq!(solution.as_deref(), Some("Check the oxygen sensor wiring"));
        let (_, solution) = dict.lookup("P0171").unwrap();
        assert!(solution.is_none());
    }

    #[test]
    fn code_formatting_covers_all_prefixes() {
        assert_eq!(format_code("0133"), "P0133");
        assert_eq!(format_code("1133"), "P1133");
        assert_eq!(format_code("4321"), "C0321");
        assert_eq!(format_code("8456"), "B0456");
        assert_eq!(format_code("C789"), "U0789");
        assert_eq!(format_code("F00F"), "U300F");
    }

    #[test]
    fn status_decodes_mil_and_count() {
        let link = MockLink::with_responses(|cmd| match cmd {
            "0101" => "41 01 83 07 FF 00\r\r>".to_owned(),
            other => panic!("unexpected command {other:?}"),
        });
        let mut transport = Transport::new(Box::new(link));

        let mut service = DtcService::new(DtcDictionary::new());
        service.read_status(&mut transport).unwrap();
        assert!(service.mil_on());
        assert_eq!(service.count(), 3);
    }

    #[test]
    fn enumeration_dedups_across_ecus() {
        let link = MockLink::with_responses(|cmd| match cmd {
            "0101" => "41 01 83 07 FF 00\r\r>".to_owned(),
            "ATH1" | "ATH0" => "OK\r\r>".to_owned(),
            "03" => "48 6B 10 43 01 33 00 00 00 00 FF\r\
                     48 6B 10 43 01 33 00 00 00 00 FF\r\r>"
                .to_owned(),
            other => panic!("unexpected command {other:?}"),
        });
        let log = link.log();
        let mut transport = Transport::new(Box::new(link));

        let mut service = DtcService::new(dictionary());
        service.refresh(&mut transport).unwrap();

        assert_eq!(service.codes().len(), 1);
        let dtc = &service.codes()[0];
        assert_eq!(dtc.code, "P0133");
        assert_eq!(dtc.meaning, "O2 Sensor Circuit Slow Response");

        // headers bracketed the enumeration
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["0101", "ATH1", "03", "ATH0"]
        );
    }

    #[test]
    fn unknown_codes_are_retained() {
        let link = MockLink::with_responses(|cmd| match cmd {
            "0101" => "41 01 81 07 FF 00\r\r>".to_owned(),
            "ATH1" | "ATH0" => "OK\r\r>".to_owned(),
            "03" => "48 6B 10 43 04 20 00 00 00 00 FF\r\r>".to_owned(),
            other => panic!("unexpected command {other:?}"),
        });
        let mut transport = Transport::new(Box::new(link));

        let mut service = DtcService::new(dictionary());
        service.refresh(&mut transport).unwrap();

        assert_eq!(service.codes().len(), 1);
        assert_eq!(service.codes()[0].code, "P0420");
        assert_eq!(service.codes()[0].meaning, "Unknown code");
    }

    #[test]
    fn reset_is_refused_without_codes() {
        let link = MockLink::with_responses(|cmd| match cmd {
            "0101" => "41 01 00 07 FF 00\r\r>".to_owned(),
            other => panic!("unexpected command {other:?}"),
        });
        let mut transport = Transport::new(Box::new(link));

        let mut service = DtcService::new(DtcDictionary::new());
        assert!(!service.reset(&mut transport).unwrap());
    }

    #[test]
    fn reset_clears_state() {
        let link = MockLink::with_responses(|cmd| match cmd {
            "0101" => "41 01 81 07 FF 00\r\r>".to_owned(),
            "04" => "44\r\r>".to_owned(),
            other => panic!("unexpected command {other:?}"),
        });
        let mut transport = Transport::new(Box::new(link));

        let mut service = DtcService::new(DtcDictionary::new());
        assert!(service.reset(&mut transport).unwrap());
        assert!(!service.mil_on());
        assert_eq!(service.count(), 0);
    }
}
