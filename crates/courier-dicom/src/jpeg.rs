//! JPEG 帧头检查
//!
//! 只接受 8 位 Baseline (SOF0) 的单分量或三分量图像，
//! 其余编码过程不属于 JPEG Baseline 传输语法。

use courier_core::{CourierError, Result};

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const SOF0: u8 = 0xC0;

/// 颜色模型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorModel {
    /// 单分量灰度
    Monochrome,
    /// 三分量 YCbCr
    Ycbcr,
}

impl ColorModel {
    pub fn samples_per_pixel(&self) -> u16 {
        match self {
            ColorModel::Monochrome => 1,
            ColorModel::Ycbcr => 3,
        }
    }

    /// (0028,0004) 光度解释
    pub fn photometric_interpretation(&self) -> &'static str {
        match self {
            ColorModel::Monochrome => "MONOCHROME2",
            ColorModel::Ycbcr => "YBR_FULL_422",
        }
    }
}

/// SOF0 帧头信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegFrameInfo {
    pub precision: u8,
    pub width: u16,
    pub height: u16,
    pub color: ColorModel,
    /// 到 EOI 为止的码流长度，之后的填充字节不计
    pub length: usize,
}

/// 解析 JPEG 标记段直到找到帧头
///
/// 采集卡常在 EOI 之后补零，码流以最后一个 EOI 结束。
pub fn inspect(data: &[u8]) -> Result<JpegFrameInfo> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != SOI {
        return Err(unsupported("缺少 JPEG SOI 标记"));
    }
    let length = match data.windows(2).rposition(|w| w == [0xFF, EOI]) {
        Some(pos) if pos >= 2 => pos + 2,
        _ => return Err(unsupported("JPEG 数据不完整, 缺少 EOI 标记")),
    };
    let data = &data[..length];

    let mut pos = 2;
    loop {
        // 标记前可以有任意个 0xFF 填充字节
        if pos >= data.len() || data[pos] != 0xFF {
            return Err(unsupported(&format!("偏移 {} 处不是 JPEG 标记", pos)));
        }
        while pos < data.len() && data[pos] == 0xFF {
            pos += 1;
        }
        let Some(&marker) = data.get(pos) else {
            return Err(unsupported("JPEG 标记被截断"));
        };
        pos += 1;

        match marker {
            0x01 | 0xD0..=0xD7 => continue,
            SOS | EOI => return Err(unsupported("扫描数据之前没有帧头")),
            _ => {}
        }

        let length = read_u16(data, pos)? as usize;
        if length < 2 || pos + length > data.len() {
            return Err(unsupported(&format!("标记 FF{:02X} 段长度无效", marker)));
        }
        let segment = &data[pos + 2..pos + length];

        match marker {
            SOF0 => return parse_sof0(segment, length),
            0xC1 => return Err(unsupported("扩展顺序 JPEG (SOF1) 不属于 Baseline")),
            0xC2 | 0xC6 | 0xCA | 0xCE => return Err(unsupported("不支持渐进式 JPEG")),
            0xC3 | 0xC7 | 0xCB | 0xCF => return Err(unsupported("不支持无损 JPEG")),
            0xC5 | 0xC9 | 0xCD => return Err(unsupported("不支持该 JPEG 编码过程")),
            _ => pos += length,
        }
    }
}

fn parse_sof0(segment: &[u8], length: usize) -> Result<JpegFrameInfo> {
    if segment.len() < 6 {
        return Err(unsupported("SOF0 段过短"));
    }
    let precision = segment[0];
    let height = u16::from_be_bytes([segment[1], segment[2]]);
    let width = u16::from_be_bytes([segment[3], segment[4]]);
    let components = segment[5];

    if precision != 8 {
        return Err(unsupported(&format!("只支持 8 位精度, 实际 {} 位", precision)));
    }
    if width == 0 || height == 0 {
        return Err(unsupported("图像尺寸为0"));
    }
    if segment.len() < 6 + 3 * components as usize {
        return Err(unsupported("SOF0 分量表不完整"));
    }
    let color = match components {
        1 => ColorModel::Monochrome,
        3 => ColorModel::Ycbcr,
        n => return Err(unsupported(&format!("不支持 {} 个颜色分量", n))),
    };

    Ok(JpegFrameInfo {
        precision,
        width,
        height,
        color,
        length,
    })
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| unsupported("JPEG 段长度被截断"))
}

fn unsupported(reason: &str) -> CourierError {
    CourierError::UnsupportedImage(reason.to_string())
}
