use byteorder::{ByteOrder, LittleEndian};
use rhd_types::{BlockLayout, RawDataBlock, RhdError, RhdResult};

/// Размер одного кода в pipe-кадре (`i32`).
pub const PIPE_CODE_SIZE: usize = 4;

/// Длина pipe-кадра для раскладки: `S × C × N × 4` байт.
pub fn frame_len(layout: &BlockLayout) -> usize {
    layout.sample_count() * PIPE_CODE_SIZE
}

/// Pipe-кадр с кодами одного блока.
///
/// Формат передачи (little-endian, без разделителей):
/// ```text
/// [0..4·S·C·N]  CODES  i32 — коды в нативном порядке устройства
/// ```
/// Длину кадра получатель знает заранее из параметров сессии.
#[derive(Debug, Default)]
pub struct PipeFrameEncoder {
    buf: Vec<u8>,
}

impl PipeFrameEncoder {
    pub fn new(layout: &BlockLayout) -> Self {
        Self {
            buf: Vec::with_capacity(frame_len(layout)),
        }
    }

    /// Сериализует блок в переиспользуемый буфер.
    pub fn encode(
        &mut self,
        block: &RawDataBlock,
    ) -> &[u8] {
        let codes = block.codes();
        self.buf.resize(codes.len() * PIPE_CODE_SIZE, 0);

        for (chunk, &code) in self.buf.chunks_exact_mut(PIPE_CODE_SIZE).zip(codes) {
            LittleEndian::write_i32(chunk, code as i32);
        }

        &self.buf
    }
}

/// Разбирает кадр на стороне получателя. Длина должна совпадать точно.
pub fn decode_frame(
    buf: &[u8],
    layout: &BlockLayout,
) -> RhdResult<Vec<i32>> {
    let expected = frame_len(layout);

    if buf.len() != expected {
        return Err(RhdError::SizeMismatch {
            declared: buf.len(),
            expected,
        });
    }

    let mut codes = vec![0i32; layout.sample_count()];
    LittleEndian::read_i32_into(buf, &mut codes);

    Ok(codes)
}

#[cfg(test)]
mod tests {
    use rhd_types::NativeOrder;

    use super::*;

    #[test]
    fn test_frame_len_matches_example() {
        let layout = BlockLayout::new(1, 32, 60, NativeOrder::Interleaved).unwrap();
        assert_eq!(frame_len(&layout), 7_680);
    }

    #[test]
    fn test_encode_preserves_native_order() {
        let layout = BlockLayout::new(2, 2, 3, NativeOrder::Planar).unwrap();
        let codes: Vec<u16> = vec![0, 1, 2, 65_535, 32_768, 5, 6, 7, 8, 9, 10, 11];
        let block = RawDataBlock::new(layout, vec![0; 3], codes.clone()).unwrap();

        let mut encoder = PipeFrameEncoder::new(&layout);
        let frame = encoder.encode(&block).to_vec();

        assert_eq!(frame.len(), 48);
        assert_eq!(&frame[12..16], &[0xFF, 0xFF, 0x00, 0x00], "65535 как i32 LE");

        let decoded = decode_frame(&frame, &layout).unwrap();
        let expected: Vec<i32> = codes.iter().map(|&c| c as i32).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_encoder_reuses_buffer() {
        let layout = BlockLayout::new(1, 4, 2, NativeOrder::Planar).unwrap();
        let mut encoder = PipeFrameEncoder::new(&layout);

        let a = encoder.encode(&RawDataBlock::midscale(layout, 0)).len();
        let b = encoder.encode(&RawDataBlock::midscale(layout, 2)).len();

        assert_eq!(a, 32);
        assert_eq!(b, 32);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let layout = BlockLayout::new(1, 4, 2, NativeOrder::Planar).unwrap();
        assert!(decode_frame(&[0u8; 31], &layout).is_err());
        assert!(decode_frame(&[0u8; 36], &layout).is_err());
    }
}
