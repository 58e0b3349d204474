//! HL7接口模块
//!
//! 处理检验仪器发出的HL7 v2.x ORU^R01观察结果消息：
//! - 段/字段/组件解析（字段编号遵循HL7标准，MSH-1为字段分隔符本身）
//! - 从PID与OBX段提取患者标识和检验结果
//! - 生成ACK应答
//! - MLLP帧编解码

use bytes::{Buf, BufMut, BytesMut};
use lis_core::{LisError, ParsedMessage, ParsedResult};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// MLLP帧起始字节
pub const MLLP_START: u8 = 0x0B;
/// MLLP帧结束字节
pub const MLLP_END: u8 = 0x1C;

#[derive(Error, Debug)]
pub enum Hl7Error {
    #[error("Invalid HL7 message format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported message type: {0}")]
    UnsupportedMessageType(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl From<Hl7Error> for LisError {
    fn from(error: Hl7Error) -> Self {
        LisError::MessageFormat(error.to_string())
    }
}

/// HL7段
#[derive(Debug, Clone, PartialEq)]
pub struct Hl7Segment {
    pub segment_type: String,
    fields: Vec<String>, // fields[n] 即 SEG-n
}

impl Hl7Segment {
    fn parse(line: &str) -> Self {
        let mut parts = line.split('|');
        let segment_type = parts.next().unwrap_or_default().to_string();

        let mut fields = vec![segment_type.clone()];
        if segment_type == "MSH" {
            fields.push("|".to_string());
        }
        fields.extend(parts.map(|p| p.to_string()));

        Self { segment_type, fields }
    }

    /// 按HL7编号读取字段，缺失时为空字符串
    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(String::as_str).unwrap_or_default()
    }

    /// 读取字段第一个重复的组件（组件编号从1开始）
    pub fn component(&self, index: usize, component: usize) -> &str {
        self.field(index)
            .split('~')
            .next()
            .and_then(|repetition| repetition.split('^').nth(component.saturating_sub(1)))
            .unwrap_or_default()
    }
}

/// 解析后的HL7消息，只能通过 [`Hl7Message::parse`] 构造
#[derive(Debug, Clone, PartialEq)]
pub struct Hl7Message {
    header: Hl7Segment,
    segments: Vec<Hl7Segment>, // MSH之后的段
}

impl Hl7Message {
    /// 解析HL7消息文本，段分隔符可以是CR或LF
    pub fn parse(text: &str) -> Result<Self, Hl7Error> {
        let mut segments = text
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Hl7Segment::parse);

        match segments.next() {
            None => Err(Hl7Error::InvalidFormat("Empty message".to_string())),
            Some(first) if first.segment_type != "MSH" => Err(Hl7Error::InvalidFormat(
                "Message must start with MSH segment".to_string(),
            )),
            Some(header) => Ok(Self {
                header,
                segments: segments.collect(),
            }),
        }
    }

    pub fn header(&self) -> &Hl7Segment {
        &self.header
    }

    /// 全部段，MSH在首位
    pub fn segments(&self) -> impl Iterator<Item = &Hl7Segment> {
        std::iter::once(&self.header).chain(self.segments.iter())
    }

    /// MSH-9.1，如 `ORU`
    pub fn message_type(&self) -> &str {
        self.header().component(9, 1)
    }

    /// MSH-10
    pub fn control_id(&self) -> &str {
        self.header().field(10)
    }

    pub fn segments_of<'a>(&'a self, segment_type: &'a str) -> impl Iterator<Item = &'a Hl7Segment> {
        self.segments()
            .filter(move |segment| segment.segment_type == segment_type)
    }

    /// 从ORU消息提取患者标识和检验结果
    ///
    /// PID-3为患者标识；每个数值型OBX（OBX-2为 `NM`、`SN` 或空）产生一条结果：
    /// OBX-3.1检验代码，OBX-5结果值，OBX-6.1单位，OBX-8异常标志。
    pub fn extract_results(&self) -> Result<ParsedMessage, Hl7Error> {
        if self.message_type() != "ORU" {
            return Err(Hl7Error::UnsupportedMessageType(self.message_type().to_string()));
        }

        let pid = self
            .segments_of("PID")
            .next()
            .ok_or_else(|| Hl7Error::MissingField("PID segment".to_string()))?;
        let patient_external_id = pid.component(3, 1).to_string();

        let mut results = Vec::new();
        for obx in self.segments_of("OBX") {
            let value_type = obx.field(2);
            if !matches!(value_type, "" | "NM" | "SN") {
                debug!("Skipping OBX with value type {}", value_type);
                continue;
            }

            results.push(ParsedResult {
                equipment_code: obx.component(3, 1).to_string(),
                raw_value: obx.field(5).to_string(),
                raw_unit: obx.component(6, 1).to_string(),
                raw_flag_code: obx.component(8, 1).to_string(),
            });
        }

        Ok(ParsedMessage { patient_external_id, results })
    }

    /// 生成ACK应答：成功为AA，失败为AE
    pub fn generate_ack(&self, success: bool, error_message: Option<&str>) -> String {
        let header = self.header();
        let now = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let ack_code = if success { "AA" } else { "AE" };
        let error_text = error_message.unwrap_or("").replace('|', "\\F\\");
        let version = match header.field(12) {
            "" => "2.5",
            version => version,
        };

        format!(
            "MSH|^~\\&|{sending_app}|{sending_facility}|{receiving_app}|{receiving_facility}|{timestamp}||ACK^R01|{control_id}|P|{version}\rMSA|{ack_code}|{original_control_id}|{error_text}\r",
            sending_app = header.field(5),
            sending_facility = header.field(6),
            receiving_app = header.field(3),
            receiving_facility = header.field(4),
            timestamp = now,
            control_id = uuid::Uuid::new_v4().simple().to_string().chars().take(20).collect::<String>(),
            version = version,
            ack_code = ack_code,
            original_control_id = self.control_id(),
            error_text = error_text
        )
    }
}

/// MLLP帧编解码器：`<VT> 消息 <FS><CR>`
#[derive(Debug)]
pub struct MllpCodec {
    max_length: usize,
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self { max_length: 1024 * 1024 }
    }
}

impl Decoder for MllpCodec {
    type Item = String;
    type Error = LisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // 丢弃起始字节之前的内容
        match src.iter().position(|b| *b == MLLP_START) {
            Some(start) => src.advance(start),
            None => {
                src.clear();
                return Ok(None);
            }
        }

        let end = src
            .windows(2)
            .position(|window| window[0] == MLLP_END && window[1] == b'\r');

        match end {
            Some(end) => {
                let frame = src.split_to(end + 2);
                let text = String::from_utf8_lossy(&frame[1..end]).into_owned();
                Ok(Some(text))
            }
            None if src.len() > self.max_length => {
                warn!("Discarding oversized MLLP frame ({} bytes)", src.len());
                src.clear();
                Err(LisError::Transport(format!(
                    "MLLP帧超过最大长度 {} 字节",
                    self.max_length
                )))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<String> for MllpCodec {
    type Error = LisError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 3);
        dst.put_u8(MLLP_START);
        dst.extend_from_slice(item.as_bytes());
        dst.put_u8(MLLP_END);
        dst.put_u8(b'\r');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::ClinicalFlag;

    const ORU: &str = "MSH|^~\\&|BC6800|LAB|LIS|HOSPITAL|20240101120000||ORU^R01|MSG00001|P|2.3.1\r\
        PID|1||EXT123^^^HOSP||PEREZ^ANA\r\
        OBR|1||SAMPLE01|CBC\r\
        OBX|1|NM|WBC^White blood cells||7.5|10*3/uL|4.0-10.0|N|||F\r\
        OBX|2|NM|HGB^Hemoglobin||11.2|g/dL|12.0-16.0|L|||F\r\
        OBX|3|ED|HIST^Histogram||^image^png^Base64^AAAA||||||F\r";

    #[test]
    fn test_msh_field_numbering() {
        let message = Hl7Message::parse(ORU).unwrap();
        let msh = message.header();
        assert_eq!(msh.field(1), "|");
        assert_eq!(msh.field(2), "^~\\&");
        assert_eq!(msh.field(3), "BC6800");
        assert_eq!(message.message_type(), "ORU");
        assert_eq!(message.control_id(), "MSG00001");
    }

    #[test]
    fn test_extract_results() {
        let message = Hl7Message::parse(ORU).unwrap();
        let parsed = message.extract_results().unwrap();

        assert_eq!(parsed.patient_external_id, "EXT123");
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].equipment_code, "WBC");
        assert_eq!(parsed.results[0].raw_value, "7.5");
        assert_eq!(parsed.results[0].raw_unit, "10*3/uL");
        assert_eq!(parsed.results[0].flag(), ClinicalFlag::Normal);
        assert_eq!(parsed.results[1].raw_unit, "g/dL");
        assert_eq!(parsed.results[1].flag(), ClinicalFlag::Low);
    }

    #[test]
    fn test_non_oru_message_rejected() {
        let message = Hl7Message::parse("MSH|^~\\&|HIS|H|LIS|L|20240101||ADT^A01|1|P|2.5\rPID|1||X").unwrap();
        assert!(matches!(
            message.extract_results(),
            Err(Hl7Error::UnsupportedMessageType(t)) if t == "ADT"
        ));
    }

    #[test]
    fn test_message_must_start_with_msh() {
        assert!(Hl7Message::parse("PID|1||X").is_err());
        assert!(Hl7Message::parse("\r\n").is_err());
    }

    #[test]
    fn test_header_is_first_segment() {
        let message = Hl7Message::parse(ORU).unwrap();
        assert_eq!(message.header().segment_type, "MSH");

        let types: Vec<&str> = message.segments().map(|s| s.segment_type.as_str()).collect();
        assert_eq!(types.first(), Some(&"MSH"));
        assert_eq!(types.iter().filter(|t| **t == "MSH").count(), 1);
        assert_eq!(types.len(), ORU.split('\r').filter(|l| !l.trim().is_empty()).count());

        let header_only = Hl7Message::parse("MSH|^~\\&|BC6800|LAB").unwrap();
        assert_eq!(header_only.header().field(3), "BC6800");
        assert_eq!(header_only.segments().count(), 1);
        assert_eq!(header_only.segments_of("OBX").count(), 0);
    }

    #[test]
    fn test_generate_ack() {
        let message = Hl7Message::parse(ORU).unwrap();
        let ack = message.generate_ack(true, None);
        let ack_message = Hl7Message::parse(&ack).unwrap();

        assert_eq!(ack_message.header().field(3), "LIS");
        assert_eq!(ack_message.header().field(5), "BC6800");
        let msa = ack_message.segments_of("MSA").next().unwrap();
        assert_eq!(msa.field(1), "AA");
        assert_eq!(msa.field(2), "MSG00001");

        let nack = message.generate_ack(false, Some("bad|value"));
        assert!(nack.contains("MSA|AE|MSG00001|bad\\F\\value"));
    }

    #[test]
    fn test_mllp_codec() {
        let mut codec = MllpCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"noise");
        codec.encode("MSH|^~\\&|A".to_string(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 1);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some("MSH|^~\\&|A".to_string()));
        assert!(partial.is_empty());
    }
}
