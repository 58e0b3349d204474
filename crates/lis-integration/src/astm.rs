//! ASTM接口模块
//!
//! 包含两部分：
//! - ASTM E1394 记录解析：行以 `\n` 分隔，字段以 `|` 分隔，子字段以 `^` 分隔
//! - ASTM E1381 低层传输编解码：ENQ/ACK握手、带校验和的帧、EOT结束

use bytes::{Buf, BufMut, BytesMut};
use lis_core::{LisError, ParsedMessage, ParsedResult};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ETB: u8 = 0x17;
pub const EOT: u8 = 0x04;
pub const CR: u8 = 0x0D;
pub const LF: u8 = 0x0A;

const FIELD_SEPARATOR: char = '|';
const COMPONENT_SEPARATOR: char = '^';

/// 已识别的ASTM记录
#[derive(Debug, Clone, PartialEq)]
pub enum AstmRecord {
    /// H：传输开始
    Header,
    /// P：患者记录，之后的结果都归属于该患者
    Patient { external_id: String },
    /// R：结果记录
    Result(ParsedResult),
}

/// 单行解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Known(AstmRecord),
    /// 未处理的记录类型（O、C、Q、L等），原样保留类型标识
    Ignored(String),
}

fn field(fields: &[&str], index: usize) -> String {
    fields.get(index).map(|f| f.to_string()).unwrap_or_default()
}

/// 检验代码：复合字段取第4个子字段（`^^^GLU` → `GLU`），否则取整个字段
fn equipment_code(raw: &str) -> String {
    if raw.contains(COMPONENT_SEPARATOR) {
        if let Some(code) = raw.split(COMPONENT_SEPARATOR).nth(3) {
            if !code.is_empty() {
                return code.to_string();
            }
        }
    }
    raw.to_string()
}

/// 解析单行记录
pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();

    match fields[0] {
        "H" => ParsedLine::Known(AstmRecord::Header),
        "P" => ParsedLine::Known(AstmRecord::Patient {
            external_id: field(&fields, 2),
        }),
        "R" => ParsedLine::Known(AstmRecord::Result(ParsedResult {
            equipment_code: equipment_code(fields.get(2).copied().unwrap_or_default()),
            raw_value: field(&fields, 3),
            raw_unit: field(&fields, 4),
            raw_flag_code: field(&fields, 8),
        })),
        other => ParsedLine::Ignored(other.to_string()),
    }
}

/// 解析完整的ASTM消息文本
///
/// 结果归属于最近一条 `P` 记录；消息中没有 `P` 记录时患者标识为空字符串。
pub fn parse_message(text: &str) -> ParsedMessage {
    let mut message = ParsedMessage::default();
    let mut patient_seen = false;
    let mut ignored = 0usize;

    for line in text.split('\n') {
        match parse_line(line) {
            ParsedLine::Known(AstmRecord::Header) => {
                debug!("ASTM transmission header received");
            }
            ParsedLine::Known(AstmRecord::Patient { external_id }) => {
                if patient_seen && !message.results.is_empty() {
                    warn!(
                        "Multiple patient records in one ASTM message, results are attributed to {}",
                        external_id
                    );
                }
                patient_seen = true;
                message.patient_external_id = external_id;
            }
            ParsedLine::Known(AstmRecord::Result(result)) => {
                message.results.push(result);
            }
            ParsedLine::Ignored(_) => ignored += 1,
        }
    }

    debug!(
        "Parsed ASTM message: patient={}, results={}, ignored_lines={}",
        message.patient_external_id,
        message.results.len(),
        ignored
    );
    message
}

/// 计算E1381帧校验和：FN至ETX/ETB（含）的字节和对256取模，两位大写十六进制
pub fn frame_checksum(body: &[u8]) -> String {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    format!("{:02X}", sum)
}

/// 构造一个E1381帧
pub fn build_frame(frame_number: u8, text: &str, last: bool) -> Vec<u8> {
    let mut body = Vec::with_capacity(text.len() + 2);
    body.push(b'0' + frame_number % 8);
    body.extend_from_slice(text.as_bytes());
    body.push(if last { ETX } else { ETB });

    let checksum = frame_checksum(&body);
    let mut frame = Vec::with_capacity(body.len() + 5);
    frame.push(STX);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(checksum.as_bytes());
    frame.push(CR);
    frame.push(LF);
    frame
}

/// E1381会话事件
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// 仪器请求发送（ENQ），应回复ACK
    Enquiry,
    /// 收到一帧，`accepted` 为校验结果，应回复ACK或NAK
    Frame { accepted: bool },
    /// EOT结束，帧文本已拼接，记录分隔符已统一为 `\n`
    Message(String),
}

/// ASTM E1381 低层协议编解码器
#[derive(Debug)]
pub struct E1381Codec {
    text: Vec<u8>,
    max_frame_length: usize,
}

impl Default for E1381Codec {
    fn default() -> Self {
        Self {
            text: Vec::new(),
            max_frame_length: 64 * 1024,
        }
    }
}

impl E1381Codec {
    fn take_message(&mut self) -> Option<String> {
        if self.text.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.text).replace('\r', "\n");
        self.text.clear();
        Some(text)
    }
}

impl Decoder for E1381Codec {
    type Item = LinkEvent;
    type Error = LisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(&first) = src.first() else {
                return Ok(None);
            };

            match first {
                ENQ => {
                    src.advance(1);
                    self.text.clear();
                    return Ok(Some(LinkEvent::Enquiry));
                }
                EOT => {
                    src.advance(1);
                    if let Some(text) = self.take_message() {
                        return Ok(Some(LinkEvent::Message(text)));
                    }
                }
                STX => {
                    let Some(end) = src.iter().position(|b| *b == ETX || *b == ETB) else {
                        if src.len() > self.max_frame_length {
                            return Err(LisError::Transport(format!(
                                "ASTM帧超过最大长度 {} 字节",
                                self.max_frame_length
                            )));
                        }
                        return Ok(None);
                    };

                    // 终止符后还需要两位校验和与CR LF
                    let frame_length = end + 5;
                    if src.len() < frame_length {
                        return Ok(None);
                    }

                    let frame = src.split_to(frame_length);
                    let expected = frame_checksum(&frame[1..=end]);
                    let received = &frame[end + 1..end + 3];
                    let accepted = received.eq_ignore_ascii_case(expected.as_bytes());

                    if accepted && end > 1 {
                        self.text.extend_from_slice(&frame[2..end]);
                    } else if !accepted {
                        warn!(
                            "ASTM frame checksum mismatch: expected {}, received {}",
                            expected,
                            String::from_utf8_lossy(received)
                        );
                    }
                    return Ok(Some(LinkEvent::Frame { accepted }));
                }
                _ => {
                    // 帧间的杂散字节
                    src.advance(1);
                }
            }
        }
    }
}

impl Encoder<u8> for E1381Codec {
    type Error = LisError;

    fn encode(&mut self, item: u8, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::ClinicalFlag;

    #[test]
    fn test_patient_followed_by_results() {
        let text = "H|\\^&|||BS-200\nP|1|EXT123\nR|1|^^^GLU|98|mg/dL|||||N\nR|2|^^^UREA|41|mg/dL|||||H\nL|1|N\n";
        let message = parse_message(text);

        assert_eq!(message.patient_external_id, "EXT123");
        assert_eq!(message.results.len(), 2);
        assert_eq!(message.results[0].equipment_code, "GLU");
        assert_eq!(message.results[0].raw_value, "98");
        assert_eq!(message.results[0].raw_unit, "mg/dL");
        assert_eq!(message.results[0].flag(), ClinicalFlag::Normal);
        assert_eq!(message.results[1].flag(), ClinicalFlag::High);
    }

    #[test]
    fn test_plain_and_composite_codes() {
        assert_eq!(equipment_code("^^^GLU"), "GLU");
        assert_eq!(equipment_code("GLU"), "GLU");
        assert_eq!(equipment_code("^^^GLU^1"), "GLU");
    }

    #[test]
    fn test_missing_flag_field_maps_to_low() {
        let message = parse_message("P|1|EXT9\nR|1|HGB|13.2|g/dL\n");
        assert_eq!(message.results.len(), 1);
        assert_eq!(message.results[0].raw_flag_code, "");
        assert_eq!(message.results[0].flag(), ClinicalFlag::Low);
    }

    #[test]
    fn test_unknown_records_are_ignored() {
        assert_eq!(parse_line("O|1|SAMPLE01"), ParsedLine::Ignored("O".to_string()));
        assert_eq!(parse_line(""), ParsedLine::Ignored(String::new()));

        let message = parse_message("garbage\nC|1|comment\nP|1|EXT1\nQ|1\nR|1|K|4.1|mmol/L|||||N");
        assert_eq!(message.patient_external_id, "EXT1");
        assert_eq!(message.results.len(), 1);
    }

    #[test]
    fn test_message_without_results() {
        let message = parse_message("H|\\^&\nP|1|EXT123\nL|1|N\n");
        assert!(message.is_empty());
    }

    #[test]
    fn test_later_patient_record_takes_over() {
        let message = parse_message("P|1|A\nR|1|GLU|1\nP|2|B\nR|1|GLU|2\n");
        assert_eq!(message.patient_external_id, "B");
        assert_eq!(message.results.len(), 2);
    }

    #[test]
    fn test_frame_checksum() {
        let frame = build_frame(1, "H|\\^&\r", true);
        let body = &frame[1..frame.len() - 4];
        assert_eq!(&frame[frame.len() - 4..frame.len() - 2], frame_checksum(body).as_bytes());
        assert_eq!(frame[0], STX);
        assert_eq!(&frame[frame.len() - 2..], &[CR, LF]);
    }

    #[test]
    fn test_decoder_session() {
        let mut codec = E1381Codec::default();
        let mut buf = BytesMut::new();

        buf.put_u8(ENQ);
        buf.extend_from_slice(&build_frame(1, "H|\\^&\rP|1|EXT123\r", false));
        buf.extend_from_slice(&build_frame(2, "R|1|^^^GLU|98|mg/dL|||||N\r", true));
        buf.put_u8(EOT);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(LinkEvent::Enquiry));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(LinkEvent::Frame { accepted: true }));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(LinkEvent::Frame { accepted: true }));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(LinkEvent::Message(
                "H|\\^&\nP|1|EXT123\nR|1|^^^GLU|98|mg/dL|||||N\n".to_string()
            ))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decoder_rejects_bad_checksum() {
        let mut codec = E1381Codec::default();
        let mut frame = build_frame(1, "P|1|EXT123\r", true);
        let len = frame.len();
        frame[len - 4] = b'Z';

        let mut buf = BytesMut::from(&frame[..]);
        buf.put_u8(EOT);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(LinkEvent::Frame { accepted: false }));
        // 被拒绝的帧不计入消息
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decoder_waits_for_partial_frame() {
        let mut codec = E1381Codec::default();
        let frame = build_frame(1, "R|1|GLU|98\r", true);
        let mut buf = BytesMut::from(&frame[..frame.len() - 3]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&frame[frame.len() - 3..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(LinkEvent::Frame { accepted: true }));
    }
}
