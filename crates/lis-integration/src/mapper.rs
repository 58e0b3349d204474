//! 参数映射
//!
//! 将设备检验代码、单位和原始数值换算为标准临床参数。

use lis_core::{
    Device, LisError, MappedResultValue, ParsedResult, Result, DEFAULT_DECIMALS, DEFAULT_FACTOR,
};

/// 四舍五入到 `decimals` 位小数，恰好位于中点时远离零取整（2.5 → 3，-2.5 → -3）
fn round_half_away(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals.min(i32::MAX as u32) as i32);
    let scaled = value * scale;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / scale
}

/// 原始数值乘以系数并按小数位格式化
pub fn format_value(code: &str, raw_value: &str, factor: f64, decimals: u32) -> Result<String> {
    let parse_error = || LisError::ValueParse {
        code: code.to_string(),
        value: raw_value.to_string(),
    };

    let number: f64 = raw_value.trim().parse().map_err(|_| parse_error())?;
    let value = number * factor;
    if !value.is_finite() {
        return Err(parse_error());
    }

    Ok(format!("{:.*}", decimals as usize, round_half_away(value, decimals)))
}

/// 映射单条结果；没有映射条目时使用默认值（参数名=检验代码，系数1，两位小数，原始单位）
pub fn map_result(device: &Device, parsed: &ParsedResult) -> Result<MappedResultValue> {
    let code = parsed.equipment_code.as_str();

    let (parameter_name, factor, decimals, unit, reference_range) = match device.find_mapping(code) {
        Some(mapping) => (
            mapping.parameter_name.clone(),
            mapping.factor,
            mapping.decimals,
            mapping.unit.clone().unwrap_or_else(|| parsed.raw_unit.clone()),
            mapping.reference_range.clone(),
        ),
        None => (
            code.to_string(),
            DEFAULT_FACTOR,
            DEFAULT_DECIMALS,
            parsed.raw_unit.clone(),
            None,
        ),
    };

    Ok(MappedResultValue {
        parameter_name,
        value: format_value(code, &parsed.raw_value, factor, decimals)?,
        unit,
        reference_range,
        flag: parsed.flag(),
    })
}

/// 按顺序映射一条消息的全部结果，任一数值无法解析则整体失败
pub fn map_results(device: &Device, results: &[ParsedResult]) -> Result<Vec<MappedResultValue>> {
    results.iter().map(|parsed| map_result(device, parsed)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::{
        ClinicalFlag, DeviceState, DeviceTelemetry, ParameterMapping, Protocol, TransportSettings,
    };

    fn device(mappings: Vec<ParameterMapping>) -> Device {
        Device {
            id: "bs200".to_string(),
            name: "Mindray BS-200".to_string(),
            protocol: Protocol::Astm,
            state: DeviceState::Active,
            transport: TransportSettings::None,
            parameter_mappings: mappings,
            telemetry: DeviceTelemetry::default(),
        }
    }

    fn mapping(code: &str, name: &str, factor: f64, decimals: u32) -> ParameterMapping {
        ParameterMapping {
            equipment_code: code.to_string(),
            parameter_name: name.to_string(),
            factor,
            decimals,
            unit: Some("mg/dL".to_string()),
            reference_range: Some("70-110".to_string()),
        }
    }

    fn parsed(code: &str, value: &str, flag: &str) -> ParsedResult {
        ParsedResult {
            equipment_code: code.to_string(),
            raw_value: value.to_string(),
            raw_unit: "mmol/L".to_string(),
            raw_flag_code: flag.to_string(),
        }
    }

    #[test]
    fn test_defaults_without_mapping() {
        let mapped = map_result(&device(vec![]), &parsed("GLU", "12.345", "N")).unwrap();
        assert_eq!(mapped.parameter_name, "GLU");
        assert_eq!(mapped.value, "12.35");
        assert_eq!(mapped.unit, "mmol/L");
        assert_eq!(mapped.reference_range, None);
        assert_eq!(mapped.flag, ClinicalFlag::Normal);
    }

    #[test]
    fn test_factor_and_decimals() {
        let device = device(vec![mapping("GLU", "Glucosa", 2.0, 1)]);
        let mapped = map_result(&device, &parsed("GLU", "5", "H")).unwrap();
        assert_eq!(mapped.parameter_name, "Glucosa");
        assert_eq!(mapped.value, "10.0");
        assert_eq!(mapped.unit, "mg/dL");
        assert_eq!(mapped.reference_range.as_deref(), Some("70-110"));
        assert_eq!(mapped.flag, ClinicalFlag::High);
    }

    #[test]
    fn test_zero_decimals_is_honored() {
        let device = device(vec![mapping("GLU", "Glucosa", 1.0, 0)]);
        assert_eq!(map_result(&device, &parsed("GLU", "98", "N")).unwrap().value, "98");
    }

    #[test]
    fn test_midpoint_rounds_away_from_zero() {
        assert_eq!(format_value("CREA", "2.5", 1.0, 0).unwrap(), "3");
        assert_eq!(format_value("CREA", "0.5", 1.0, 0).unwrap(), "1");
        assert_eq!(format_value("CREA", "-2.5", 1.0, 0).unwrap(), "-3");
        assert_eq!(format_value("CREA", "0.125", 1.0, 2).unwrap(), "0.13");
        assert_eq!(format_value("CREA", "1.125", 1.0, 2).unwrap(), "1.13");
        assert_eq!(format_value("CREA", "0.625", 2.0, 1).unwrap(), "1.3");
    }

    #[test]
    fn test_values_below_midpoint_round_down() {
        // 1.005 的二进制表示略小于 1.005
        assert_eq!(format_value("CREA", "1.005", 1.0, 2).unwrap(), "1.00");
        assert_eq!(format_value("CREA", "2.49", 1.0, 0).unwrap(), "2");
        assert_eq!(format_value("CREA", "7", 1.0, 3).unwrap(), "7.000");
    }

    #[test]
    fn test_first_mapping_wins() {
        let device = device(vec![
            mapping("GLU", "Glucosa", 1.0, 0),
            mapping("GLU", "Glucose duplicate", 10.0, 3),
        ]);
        let mapped = map_result(&device, &parsed("GLU", "98", "N")).unwrap();
        assert_eq!(mapped.parameter_name, "Glucosa");
        assert_eq!(mapped.value, "98");
    }

    #[test]
    fn test_mapping_without_unit_keeps_raw_unit() {
        let mut entry = mapping("K", "Potasio", 1.0, 1);
        entry.unit = None;
        let mapped = map_result(&device(vec![entry]), &parsed("K", "4.12", "")).unwrap();
        assert_eq!(mapped.unit, "mmol/L");
        assert_eq!(mapped.flag, ClinicalFlag::Low);
    }

    #[test]
    fn test_non_numeric_value() {
        let result = map_result(&device(vec![]), &parsed("GLU", "high", "N"));
        assert!(matches!(
            result,
            Err(LisError::ValueParse { code, value }) if code == "GLU" && value == "high"
        ));
        assert!(format_value("GLU", "NaN", 1.0, 2).is_err());
        assert!(format_value("GLU", "", 1.0, 2).is_err());
    }

    #[test]
    fn test_one_bad_value_fails_the_message() {
        let results = vec![parsed("GLU", "98", "N"), parsed("UREA", "---", "N")];
        assert!(map_results(&device(vec![]), &results).is_err());
    }
}
