//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了JSON序列化器的实现。

use super::Serializer;
use crate::error::{CoordError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// gzip 魔数，JSON 文本不会以 0x1f 开头
#[cfg(feature = "flate2")]
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// JSON序列化器
///
/// 超过阈值的载荷用 gzip 压缩；读取时按魔数识别，压缩与未压缩的值可以混存。
#[derive(Clone, Debug, Default)]
pub struct JsonSerializer {
    /// 压缩阈值（字节），0 表示不压缩
    compression_threshold: usize,
}

impl JsonSerializer {
    /// 创建不压缩的JSON序列化器
    pub fn new() -> Self {
        Self {
            compression_threshold: 0,
        }
    }

    /// 创建超过 `threshold` 字节即压缩的JSON序列化器
    pub fn with_compression(threshold: usize) -> Self {
        Self {
            compression_threshold: threshold,
        }
    }

    #[cfg(feature = "flate2")]
    fn compress(raw: Vec<u8>) -> Result<Vec<u8>> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&raw)
            .map_err(|e| CoordError::Serialization(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CoordError::Serialization(e.to_string()))
    }

    #[cfg(not(feature = "flate2"))]
    fn compress(raw: Vec<u8>) -> Result<Vec<u8>> {
        Ok(raw)
    }

    #[cfg(feature = "flate2")]
    fn decompress(data: &[u8]) -> Result<std::borrow::Cow<'_, [u8]>> {
        use flate2::read::GzDecoder;
        use std::io::Read;

        if !data.starts_with(&GZIP_MAGIC) {
            return Ok(std::borrow::Cow::Borrowed(data));
        }
        let mut decoder = GzDecoder::new(data);
        let mut decoded = Vec::new();
        decoder
            .read_to_end(&mut decoded)
            .map_err(|e| CoordError::Serialization(e.to_string()))?;
        Ok(std::borrow::Cow::Owned(decoded))
    }

    #[cfg(not(feature = "flate2"))]
    fn decompress(data: &[u8]) -> Result<std::borrow::Cow<'_, [u8]>> {
        Ok(std::borrow::Cow::Borrowed(data))
    }
}

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        let raw =
            serde_json::to_vec(value).map_err(|e| CoordError::Serialization(e.to_string()))?;
        if self.compression_threshold > 0 && raw.len() > self.compression_threshold {
            Self::compress(raw)
        } else {
            Ok(raw)
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let raw = Self::decompress(data)?;
        serde_json::from_slice(&raw).map_err(|e| CoordError::Serialization(e.to_string()))
    }
}
