use crate::core::mtime::Mtime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("图像缓冲堆已满")]
    HeapFull,

    #[error("内存分配失败: {0}")]
    AllocationError(String),

    #[error("时钟转换失败: 时间戳 {0}")]
    ClockConversionError(Mtime),

    #[error("解码器加载失败: {0}")]
    DecoderLoadError(String),

    #[error("视频输出线程收到未授权的变更位: {0:#x}")]
    UnauthorizedChange(u32),

    #[error("显示后端错误: {0}")]
    DisplayError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("渲染错误: {0}")]
    RenderError(String),

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
