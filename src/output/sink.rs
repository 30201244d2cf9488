use crate::core::{PixelFormat, Result};
use crate::output::surface::SurfaceConfig;
use serde::{Deserialize, Serialize};

/// 线程生命周期状态 - 创建/销毁既可阻塞等待，也可轮询此状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ThreadStatus {
    Create = 0,
    Start = 1,
    Ready = 2,
    End = 3,
    Over = 4,
    Error = 5,
    Fatal = 6,
}

impl ThreadStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadStatus::Create,
            1 => ThreadStatus::Start,
            2 => ThreadStatus::Ready,
            3 => ThreadStatus::End,
            4 => ThreadStatus::Over,
            5 => ThreadStatus::Error,
            _ => ThreadStatus::Fatal,
        }
    }

    /// 是否为终结状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ThreadStatus::Over | ThreadStatus::Error | ThreadStatus::Fatal
        )
    }
}

/// 显示后端 - 提供线性像素缓冲、事件泵与送显操作
///
/// 具体实现（X11、帧缓冲等）在本库之外。
pub trait DisplaySink: Send {
    /// 初始化后端。后端可以修改配置中的宽高、色深、行字节数
    /// 与像素字节数，输出线程以修改后的值分配渲染表面。
    fn init(&mut self, config: &mut SurfaceConfig) -> Result<()>;

    /// 事件泵。后端清除自己认领的变更位；返回 Err 视为致命错误，
    /// 输出线程将立即终止。
    fn manage(&mut self, changes: &mut u32) -> Result<()>;

    /// 送显一帧后缓冲
    fn display(&mut self, data: &[u8], config: &SurfaceConfig) -> Result<()>;

    /// 释放后端资源
    fn destroy(&mut self);
}

/// 供颜色空间转换器读取的图像平面视图
pub struct PictureView<'a> {
    pub format: PixelFormat,
    pub width: usize,
    pub height: usize,
    pub chroma_width: usize,
    pub matrix_coefficients: u32,
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
}

/// 颜色空间转换器 - YUV 平面到表面像素的转换
///
/// 查找表的生成在本库之外，这里只约定重建与转换两个入口。
/// 目标子矩形宽度保证是 16 的倍数。
pub trait YuvConverter: Send {
    /// 按伽马与灰度设置重建查找表
    fn rebuild_tables(&mut self, gamma: f32, grayscale: bool) -> Result<()>;

    /// 把图像转换写入目标子矩形。dst 从子矩形左上角对应的字节起始。
    fn convert(
        &mut self,
        dst: &mut [u8],
        bytes_per_line: usize,
        bytes_per_pixel: usize,
        view: &PictureView<'_>,
        dst_width: usize,
        dst_height: usize,
    );
}

/// 文字样式：透明背景
pub const TEXT_TRANSPARENT: u32 = 1 << 0;
/// 文字样式：描边
pub const TEXT_OUTLINED: u32 = 1 << 1;

/// 字体 - HUD 文字的栅格化接口，具体栅格化在本库之外
pub trait Font: Send {
    /// 文本的渲染尺寸 (宽, 高)
    fn text_size(&self, text: &str, style: u32) -> (usize, usize);

    /// 把文本写入 dst（dst 从文本左上角对应的字节起始）
    fn print(
        &self,
        dst: &mut [u8],
        bytes_per_line: usize,
        bytes_per_pixel: usize,
        text: &str,
        style: u32,
    );
}
