// 喜洋洋播放器核心库
//
// 实时播放流水线的核心：每路流一个解码器属主线程（decoder），
// 每个显示设备一个视频输出线程（output），二者通过图像缓冲堆
// 以时间戳驱动的方式衔接。
//
// 具体的解码器插件、显示后端、音频后端、字体与 YUV 转换表
// 均以窄接口（trait）注入，本库不依赖任何具体实现。

pub mod core;
pub mod decoder;
pub mod output;

// 重新导出常用类型
pub use crate::core::{CoreError, InputClock, Mtime, Result, SystemClock};
pub use crate::core::{mdate, msleep, mwait, CLOCK_FREQ, INPUT_RATE_DEFAULT};
pub use crate::decoder::{AudioSink, DecoderFactory, DecoderModule, InputDecoder, Resource};
pub use crate::output::{DisplaySink, Font, VideoOutput, YuvConverter};
