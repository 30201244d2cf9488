use crate::core::mtime::Mtime;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============= 压缩块 =============

/// 块标志：时间轴不连续（seek 之后的第一个块等）
pub const BLOCK_FLAG_DISCONTINUITY: u32 = 1 << 0;
/// 块标志：数据已损坏
pub const BLOCK_FLAG_CORRUPTED: u32 = 1 << 1;
/// 块标志：预滚块（解码但不送显）
pub const BLOCK_FLAG_PREROLL: u32 = 1 << 2;
/// 块标志：flush 哨兵，由 flush 协议注入，解码线程据此清理内部状态
pub const BLOCK_FLAG_CORE_FLUSH: u32 = 1 << 3;

/// 压缩数据块 - 解封装线程产出、解码器消费的基本单位
#[derive(Debug, Clone)]
pub struct Block {
    pub data: Vec<u8>,
    pub pts: Option<Mtime>,
    pub dts: Option<Mtime>,
    pub length: Mtime, // 持续时间（微秒），未知为 0
    pub flags: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pts: None,
            dts: None,
            length: 0,
            flags: 0,
        }
    }

    /// 构造 flush 哨兵块
    pub fn flush_sentinel() -> Self {
        Self {
            data: vec![0u8; 128],
            pts: None,
            dts: None,
            length: 0,
            flags: BLOCK_FLAG_CORE_FLUSH | BLOCK_FLAG_DISCONTINUITY | BLOCK_FLAG_CORRUPTED,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

// ============= 流格式 =============

/// 四字符编码标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(tag: &[u8; 4]) -> Self {
        Self(*tag)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// 基本流类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EsCategory {
    Video,
    Audio,
    Subpicture,
}

/// 视频流参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoEsFormat {
    pub width: usize,
    pub height: usize,
    pub format: Option<PixelFormat>,
    pub aspect: AspectRatio,
}

/// 音频流参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioEsFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// 基本流格式 - 解码器的输入/输出描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsFormat {
    pub category: EsCategory,
    pub codec: FourCc,
    pub packetized: bool,
    pub video: VideoEsFormat,
    pub audio: AudioEsFormat,
}

impl EsFormat {
    pub fn video(codec: FourCc, width: usize, height: usize) -> Self {
        Self {
            category: EsCategory::Video,
            codec,
            packetized: false,
            video: VideoEsFormat {
                width,
                height,
                ..Default::default()
            },
            audio: AudioEsFormat::default(),
        }
    }

    pub fn audio(codec: FourCc, sample_rate: u32, channels: u16) -> Self {
        Self {
            category: EsCategory::Audio,
            codec,
            packetized: false,
            video: VideoEsFormat::default(),
            audio: AudioEsFormat {
                sample_rate,
                channels,
            },
        }
    }

    pub fn subpicture(codec: FourCc) -> Self {
        Self {
            category: EsCategory::Subpicture,
            codec,
            packetized: false,
            video: VideoEsFormat::default(),
            audio: AudioEsFormat::default(),
        }
    }

    /// 判断两个格式是否兼容（类别与编码一致即可继续使用同一个解码器）
    pub fn is_similar(&self, other: &EsFormat) -> bool {
        self.category == other.category && self.codec == other.codec
    }
}

// ============= 像素与画幅 =============

/// 像素格式（YUV 平面格式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuv420,
    Yuv422,
    Yuv444,
}

impl PixelFormat {
    /// 色度平面宽度
    pub fn chroma_width(&self, width: usize) -> usize {
        match self {
            PixelFormat::Yuv420 | PixelFormat::Yuv422 => width / 2,
            PixelFormat::Yuv444 => width,
        }
    }

    /// 整帧平面数据的总字节数（Y + U + V）
    pub fn frame_bytes(&self, width: usize, height: usize) -> usize {
        let chroma_width = self.chroma_width(width);
        match self {
            PixelFormat::Yuv420 => height * chroma_width * 3,
            PixelFormat::Yuv422 => height * chroma_width * 4,
            PixelFormat::Yuv444 => height * chroma_width * 3,
        }
    }

    /// 各平面在缓冲区内的起始偏移 (y, u, v)
    pub fn plane_offsets(&self, width: usize, height: usize) -> (usize, usize, usize) {
        let chroma_width = self.chroma_width(width);
        match self {
            PixelFormat::Yuv420 => (0, height * chroma_width * 2, height * chroma_width * 5 / 2),
            PixelFormat::Yuv422 => (0, height * chroma_width * 2, height * chroma_width * 3),
            PixelFormat::Yuv444 => (0, height * chroma_width, height * chroma_width * 2),
        }
    }
}

/// 画幅比例标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    /// 方形像素：显示尺寸直接按原始宽高比推算
    #[default]
    Square,
    FourThirds,
    SixteenNinths,
    TwoTwentyOne,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "sq",
            AspectRatio::FourThirds => "4:3",
            AspectRatio::SixteenNinths => "16:9",
            AspectRatio::TwoTwentyOne => "2.21:1",
        }
    }
}

// ============= 解码输出单元 =============

/// 解码后的视频帧 - 解码器产出，由属主线程写入视频输出的缓冲堆
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub format: PixelFormat,
    pub width: usize,
    pub height: usize,
    pub aspect: AspectRatio,
    pub matrix_coefficients: u32,
    pub date: Option<Mtime>,
    /// 强制显示（等待首帧结束时置位，绕过时间戳检查）
    pub force: bool,
    /// 按 plane_offsets 布局的平面数据
    pub data: Vec<u8>,
}

/// 解码后的音频缓冲
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub pts: Option<Mtime>,
    pub length: Mtime,
    pub sample_rate: u32,
    pub channels: u16,
    pub data: Vec<f32>,
}

/// 字幕单元类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpictureKind {
    Text,
    Bitmap,
}

/// 解码后的字幕单元
#[derive(Debug, Clone)]
pub struct DecodedSubpicture {
    pub kind: SubpictureKind,
    pub start: Option<Mtime>,
    pub stop: Option<Mtime>,
    pub payload: Vec<u8>,
}

/// 流附件（封面、字体等），由解码器透传
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

// ============= 统计 =============

/// 解码统计（供 UI 读取）
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DecoderStats {
    pub decoded: u64,
    pub lost_pictures: u64,
    pub displayed_pictures: u64,
    pub lost_abuffers: u64,
    pub played_abuffers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_sentinel_flags() {
        let block = Block::flush_sentinel();
        assert!(block.has_flag(BLOCK_FLAG_CORE_FLUSH));
        assert!(block.has_flag(BLOCK_FLAG_DISCONTINUITY));
        assert!(block.has_flag(BLOCK_FLAG_CORRUPTED));
        assert_eq!(block.data.len(), 128);
    }

    #[test]
    fn test_plane_offsets_yuv420() {
        // 16x8 的 4:2:0：色度宽 8，Y 平面 16*8=128 字节
        let (y, u, v) = PixelFormat::Yuv420.plane_offsets(16, 8);
        assert_eq!((y, u, v), (0, 128, 160));
        assert_eq!(PixelFormat::Yuv420.frame_bytes(16, 8), 192);
    }

    #[test]
    fn test_format_similarity() {
        let a = EsFormat::video(FourCc::new(b"mpgv"), 720, 480);
        let mut b = a.clone();
        b.video.width = 352;
        assert!(a.is_similar(&b));
        b.codec = FourCc::new(b"h264");
        assert!(!a.is_similar(&b));
    }
}
