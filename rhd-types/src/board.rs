use serde::{Deserialize, Serialize};

use crate::{RhdError, RhdResult};

/// Частота дискретизации усилителей RHD2000 (на канал).
///
/// Набор фиксирован делителями тактовой частоты платы Rhythm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleRate {
    Hz1000,
    Hz1250,
    Hz1500,
    Hz2000,
    Hz2500,
    Hz3000,
    Hz3333,
    Hz4000,
    Hz5000,
    Hz6250,
    Hz8000,
    Hz10000,
    Hz12500,
    Hz15000,
    Hz20000,
    Hz25000,
    Hz30000,
}

/// SPI-порт платы, к которому подключён кабель с головкой RHD2000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Port {
    A = 0,
    B = 1,
    C = 2,
    D = 3,
}

impl SampleRate {
    pub const ALL: [SampleRate; 17] = [
        SampleRate::Hz1000,
        SampleRate::Hz1250,
        SampleRate::Hz1500,
        SampleRate::Hz2000,
        SampleRate::Hz2500,
        SampleRate::Hz3000,
        SampleRate::Hz3333,
        SampleRate::Hz4000,
        SampleRate::Hz5000,
        SampleRate::Hz6250,
        SampleRate::Hz8000,
        SampleRate::Hz10000,
        SampleRate::Hz12500,
        SampleRate::Hz15000,
        SampleRate::Hz20000,
        SampleRate::Hz25000,
        SampleRate::Hz30000,
    ];

    /// Частота в герцах (как пишется в заголовок shared-buffer).
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz1000 => 1_000,
            SampleRate::Hz1250 => 1_250,
            SampleRate::Hz1500 => 1_500,
            SampleRate::Hz2000 => 2_000,
            SampleRate::Hz2500 => 2_500,
            SampleRate::Hz3000 => 3_000,
            SampleRate::Hz3333 => 3_333,
            SampleRate::Hz4000 => 4_000,
            SampleRate::Hz5000 => 5_000,
            SampleRate::Hz6250 => 6_250,
            SampleRate::Hz8000 => 8_000,
            SampleRate::Hz10000 => 10_000,
            SampleRate::Hz12500 => 12_500,
            SampleRate::Hz15000 => 15_000,
            SampleRate::Hz20000 => 20_000,
            SampleRate::Hz25000 => 25_000,
            SampleRate::Hz30000 => 30_000,
        }
    }

    /// Ищет поддерживаемую частоту, точно равную `hz`.
    pub fn from_hz(hz: u32) -> RhdResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.hz() == hz)
            .ok_or_else(|| {
                RhdError::invalid_layout(format!(
                    "Unsupported sample rate {hz} Hz (RHD2000 supports 1000..=30000 in fixed steps)"
                ))
            })
    }
}

impl Port {
    pub fn from_u8(v: u8) -> RhdResult<Self> {
        match v {
            0 => Ok(Port::A),
            1 => Ok(Port::B),
            2 => Ok(Port::C),
            3 => Ok(Port::D),
            _ => Err(RhdError::invalid_layout(format!("Unknown port: {v}"))),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для SampleRate, Port
////////////////////////////////////////////////////////////////////////////////

impl std::fmt::Display for SampleRate {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

impl std::fmt::Display for Port {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let c = match self {
            Port::A => 'A',
            Port::B => 'B',
            Port::C => 'C',
            Port::D => 'D',
        };
        write!(f, "Port{c}")
    }
}

impl std::str::FromStr for SampleRate {
    type Err = String;

    /// Принимает `30000`, `30000Hz`, `30kHz`, `1.25kHz`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();

        let hz = if let Some(v) = lower.strip_suffix("khz") {
            let k: f64 = v
                .trim()
                .parse()
                .map_err(|e| format!("Invalid sample rate '{s}': {e}"))?;
            (k * 1_000.0).round() as u32
        } else {
            lower
                .strip_suffix("hz")
                .unwrap_or(&lower)
                .trim()
                .parse::<u32>()
                .map_err(|e| format!("Invalid sample rate '{s}': {e}"))?
        };

        SampleRate::from_hz(hz).map_err(|e| e.to_string())
    }
}

impl std::str::FromStr for Port {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().trim_start_matches("port") {
            "a" => Ok(Port::A),
            "b" => Ok(Port::B),
            "c" => Ok(Port::C),
            "d" => Ok(Port::D),
            _ => Err(format!("Unknown port: '{s}'. Use: A, B, C, D")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_from_hz() {
        assert_eq!(SampleRate::from_hz(30_000).unwrap(), SampleRate::Hz30000);
        assert_eq!(SampleRate::from_hz(3_333).unwrap(), SampleRate::Hz3333);
        assert!(SampleRate::from_hz(44_100).is_err());
        assert!(SampleRate::from_hz(0).is_err());
    }

    #[test]
    fn test_sample_rate_table_is_sorted_and_unique() {
        for w in SampleRate::ALL.windows(2) {
            assert!(w[0].hz() < w[1].hz());
        }
    }

    #[test]
    fn test_sample_rate_fromstr() {
        assert_eq!("30000".parse::<SampleRate>().unwrap(), SampleRate::Hz30000);
        assert_eq!("20kHz".parse::<SampleRate>().unwrap(), SampleRate::Hz20000);
        assert_eq!("1.25kHz".parse::<SampleRate>().unwrap(), SampleRate::Hz1250);
        assert_eq!("3333 Hz".parse::<SampleRate>().unwrap(), SampleRate::Hz3333);
        assert!("44.1kHz".parse::<SampleRate>().is_err());
        assert!("fast".parse::<SampleRate>().is_err());
    }

    #[test]
    fn test_port_fromstr() {
        assert_eq!("A".parse::<Port>().unwrap(), Port::A);
        assert_eq!("portb".parse::<Port>().unwrap(), Port::B);
        assert_eq!("PortD".parse::<Port>().unwrap(), Port::D);
        assert!("E".parse::<Port>().is_err());
    }

    #[test]
    fn test_port_round_trip_u8() {
        for p in [Port::A, Port::B, Port::C, Port::D] {
            assert_eq!(Port::from_u8(p.as_u8()).unwrap(), p);
        }
        assert!(Port::from_u8(4).is_err());
    }
}
