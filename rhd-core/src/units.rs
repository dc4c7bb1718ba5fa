//! Перевод сырых кодов АЦП RHD2000 в микровольты.

/// Код, соответствующий нулю на входе усилителя (offset-binary).
pub const CODE_MIDSCALE: i32 = 32_768;

/// Шаг квантования усилителя: 0.195 мкВ на единицу кода.
pub const MICROVOLTS_PER_CODE: f32 = 0.195;

/// `(code - 32768) × 0.195` мкВ.
#[inline]
pub fn physical_uv(code: u16) -> f32 {
    (code as i32 - CODE_MIDSCALE) as f32 * MICROVOLTS_PER_CODE
}

/// Обратное преобразование с насыщением на границах диапазона кода.
pub fn code_from_uv(uv: f32) -> u16 {
    let code = (uv / MICROVOLTS_PER_CODE).round() as i64 + CODE_MIDSCALE as i64;
    code.clamp(0, u16::MAX as i64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(
        a: f32,
        b: f32,
    ) -> bool {
        (a - b).abs() < 1e-2
    }

    #[test]
    fn test_midscale_is_zero() {
        assert_eq!(physical_uv(32_768), 0.0);
    }

    #[test]
    fn test_range_endpoints() {
        // -32768 × 0.195 и 32767 × 0.195
        assert!(approx_eq(physical_uv(0), -6_389.76), "{}", physical_uv(0));
        assert!(
            approx_eq(physical_uv(u16::MAX), 6_389.565),
            "{}",
            physical_uv(u16::MAX)
        );
    }

    #[test]
    fn test_one_code_step() {
        assert!(approx_eq(physical_uv(32_769), 0.195));
        assert!(approx_eq(physical_uv(32_767), -0.195));
    }

    #[test]
    fn test_monotonic() {
        let mut prev = physical_uv(0);
        for code in (1..=u16::MAX).step_by(97) {
            let v = physical_uv(code);
            assert!(v > prev);
            prev = v;
        }
    }

    #[test]
    fn test_code_from_uv_inverse_and_saturates() {
        for code in [0u16, 1, 1_000, 32_768, 40_000, 65_535] {
            assert_eq!(code_from_uv(physical_uv(code)), code);
        }
        assert_eq!(code_from_uv(1e9), u16::MAX);
        assert_eq!(code_from_uv(-1e9), 0);
    }
}
