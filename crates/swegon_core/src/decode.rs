//! Decodificação dos payloads em medições nomeadas.
//!
//! Cada tipo de mensagem tem layout fixo. Os nomes das medições são os
//! tópicos publicados pela unidade e mantêm a grafia histórica
//! (`bybassState`, `efficinecyAlarm`).

use std::fmt;

/// Tipos de mensagem suportados.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// 0x21 – modo de operação e velocidade do ventilador.
    ModeState,
    /// 0x71 – temperaturas, CO2, umidade e eficiência.
    Temperatures,
    /// 0x73 – bitfields de estado e alarmes.
    Status,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x21 => Some(Self::ModeState),
            0x71 => Some(Self::Temperatures),
            0x73 => Some(Self::Status),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::ModeState => 0x21,
            Self::Temperatures => 0x71,
            Self::Status => 0x73,
        }
    }

    /// Menor payload que o layout fixo consegue ler.
    pub fn min_payload_len(self) -> usize {
        match self {
            Self::ModeState => 4,
            Self::Temperatures => 13,
            Self::Status => 15,
        }
    }
}

/// Valor de uma medição.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i32),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Int(v.into())
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v.into())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

/// Uma medição decodificada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub name: &'static str,
    pub value: Value,
}

impl Measurement {
    pub fn new(name: &'static str, value: impl Into<Value>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// Erros de decodificação.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload 0x{msg_type:02X} muito curto ({actual} bytes, esperado {expected})")]
    PayloadTooShort {
        msg_type: u8,
        expected: usize,
        actual: usize,
    },
}

/// Reinterpreta um byte como inteiro com sinal (complemento de dois).
pub fn to_signed(byte: u8) -> i8 {
    if byte & 0x80 != 0 {
        (byte as i16 - 256) as i8
    } else {
        byte as i8
    }
}

/// Flags booleanas da mensagem 0x73: (nome, índice do byte, máscara).
pub const STATUS_FLAGS: [(&str, usize, u8); 31] = [
    ("heatingState", 0, 0x01),
    ("coolingState", 0, 0x02),
    ("bybassState", 0, 0x04),
    ("freezeProtectionState", 0, 0x08),
    ("preheatingState", 0, 0x10),
    ("chillingState", 0, 0x20),
    ("preheaterOverheatState", 0, 0x40),
    ("reheatingState", 0, 0x80),
    ("fireplaceFunctionState", 1, 0x01),
    ("underpressureCompensationState", 1, 0x02),
    ("externalBoostState", 1, 0x04),
    ("humidityBoostState", 1, 0x08),
    ("co2BoostState", 1, 0x10),
    ("defrostingState", 1, 0x20),
    ("defrostStarterMode", 1, 0x40),
    ("tfStopState", 1, 0x80),
    ("externalBoostFunctionState", 3, 0x04),
    ("externalFireplaceFunctionState", 3, 0x08),
    ("filterGuardStatus", 3, 0x10),
    ("irFreezeProtectionStatus", 3, 0x20),
    ("emergencyStopState", 3, 0x80),
    ("reheatingFreezingAlarm", 7, 0x01),
    ("reheatingOverheatAlarm", 7, 0x02),
    ("irSensorFailure", 7, 0x04),
    ("supplyFanFailure", 7, 0x08),
    ("extractFanFailure", 7, 0x10),
    ("temperatureDeviationFailure", 7, 0x20),
    ("efficinecyAlarm", 8, 0x01),
    ("filterGuardAlarm", 8, 0x02),
    ("serviceReminder", 8, 0x04),
    ("temperatureFailure", 8, 0x08),
];

/// Valores brutos da mensagem 0x73: (nome, índice do byte).
pub const STATUS_VALUES: [(&str, usize); 5] = [
    ("afterheatingSetpointSupplyAirRegulated", 10),
    ("afterheatingSetpointRoomRegulated", 11),
    ("supplyFanVirtualSpeed", 12),
    ("extractFanVirtualSpeed", 13),
    ("unitStatus", 14),
];

/// Decodifica o payload de um tipo conhecido.
pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Vec<Measurement>, DecodeError> {
    let expected = msg_type.min_payload_len();
    if payload.len() < expected {
        return Err(DecodeError::PayloadTooShort {
            msg_type: msg_type.as_byte(),
            expected,
            actual: payload.len(),
        });
    }

    Ok(match msg_type {
        MessageType::ModeState => decode_mode_state(payload),
        MessageType::Temperatures => decode_temperatures(payload),
        MessageType::Status => decode_status(payload),
    })
}

fn decode_mode_state(data: &[u8]) -> Vec<Measurement> {
    vec![
        Measurement::new("operatingMode", data[0]),
        Measurement::new("unitState", data[1]),
        Measurement::new("fanSpeed", data[3] & 0x0F),
    ]
}

fn decode_temperatures(data: &[u8]) -> Vec<Measurement> {
    let outdoor = to_signed(data[0]);
    let supply = to_signed(data[1]);
    let extract = to_signed(data[2]);
    let exhaust = to_signed(data[7]);
    let (supply_eff, extract_eff) = efficiencies(outdoor, supply, extract, exhaust);

    vec![
        Measurement::new("outdoorTemp", outdoor),
        Measurement::new("supplyTemp", supply),
        Measurement::new("extractTemp", extract),
        Measurement::new("supplyTempHeated", to_signed(data[3])),
        Measurement::new("t5", to_signed(data[4])),
        Measurement::new("t6", to_signed(data[5])),
        Measurement::new("t7", to_signed(data[6])),
        Measurement::new("exhaustTemp", exhaust),
        Measurement::new("co2", data[8]),
        Measurement::new("humidity", data[9]),
        Measurement::new("supplyFanSpeed", i32::from(data[10]) * 10),
        Measurement::new("extractFanSpeed", i32::from(data[11]) * 10),
        Measurement::new("efficiency", data[12]),
        Measurement::new("calcSupplyEfficiency", supply_eff),
        Measurement::new("calcExtractEfficiency", extract_eff),
    ]
}

/// Eficiências de insuflamento e extração em %, limitadas a 0–100.
///
/// Com `extract == outdoor` o denominador é zero e ambas ficam em 100.
pub fn efficiencies(outdoor: i8, supply: i8, extract: i8, exhaust: i8) -> (i32, i32) {
    let span = i32::from(extract) - i32::from(outdoor);
    if span == 0 {
        return (100, 100);
    }
    let percent = |num: i32| ((num as f64 / span as f64) * 100.0) as i32;
    let supply_eff = percent(i32::from(supply) - i32::from(outdoor));
    let extract_eff = percent(i32::from(extract) - i32::from(exhaust));
    (supply_eff.clamp(0, 100), extract_eff.clamp(0, 100))
}

fn decode_status(data: &[u8]) -> Vec<Measurement> {
    let flags = STATUS_FLAGS
        .iter()
        .map(|&(name, index, mask)| Measurement::new(name, (data[index] & mask) > 0));
    let values = STATUS_VALUES
        .iter()
        .map(|&(name, index)| Measurement::new(name, data[index]));
    flags.chain(values).collect()
}
