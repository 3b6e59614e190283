//! 封装像素数据
//!
//! 压缩像素数据以 (7FE0,0010) OB、未定义长度存放，其后依次为：
//! 基本偏移表条目 (可为空，但条目本身必须存在)、每帧一个片段条目、
//! 以及长度为 0 的序列分隔条目。条目的序列化由 dicom-rs 完成。

use dicom::core::value::PixelFragmentSequence;
use dicom::object::mem::InMemFragment;

/// JPEG 结束标记
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// 单帧：一个片段，空偏移表。压缩数据原样保留，奇数长度补一个 0x00。
pub fn single_frame(compressed: &[u8]) -> PixelFragmentSequence<InMemFragment> {
    let mut fragment = compressed.to_vec();
    if fragment.len() % 2 != 0 {
        fragment.push(0);
    }
    PixelFragmentSequence::new(Vec::<u32>::new(), vec![fragment])
}

/// 第 `index` 帧的压缩数据，去掉 JPEG 末尾的填充字节
pub fn frame(fragments: &[InMemFragment], index: usize) -> Option<&[u8]> {
    let fragment = fragments.get(index)?;
    let len = fragment.len();
    if len >= 3 && fragment[len - 1] == 0 && fragment[len - 3..len - 1] == JPEG_EOI {
        Some(&fragment[..len - 1])
    } else {
        Some(fragment)
    }
}
