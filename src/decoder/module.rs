use crate::core::{
    Attachment, AudioBuffer, AudioEsFormat, Block, DecodedPicture, DecodedSubpicture, EsFormat,
    Mtime, Result, VideoEsFormat,
};
use crate::output::VideoOutput;
use std::sync::Arc;

/// 解码器模块 - 按能力集多态的插件接口
///
/// 解码接口的调用约定：输入块在首次调用时被取走（`block` 置为
/// None），之后继续以空输入调用直到返回 None，表示该块的输出已
/// 取完。整体传入 None 表示排空解码器的内部缓冲。
///
/// 打包器与解码器共用同一接口，只是走 `packetize` 入口。
pub trait DecoderModule: Send {
    fn fmt_in(&self) -> &EsFormat;
    fn fmt_out(&self) -> &EsFormat;

    /// 解码视频，每个输入块可产出零到多张图像
    fn decode_video(&mut self, block: &mut Option<Block>) -> Option<DecodedPicture> {
        let _ = block;
        None
    }

    /// 解码音频
    fn decode_audio(&mut self, block: &mut Option<Block>) -> Option<AudioBuffer> {
        let _ = block;
        None
    }

    /// 解码字幕
    fn decode_sub(&mut self, block: &mut Option<Block>) -> Option<DecodedSubpicture> {
        let _ = block;
        None
    }

    /// 打包（把截断的输入重组为完整块）
    fn packetize(&mut self, block: &mut Option<Block>) -> Option<Block> {
        let _ = block;
        None
    }

    /// 是否支持隐藏字幕提取
    fn has_cc(&self) -> bool {
        false
    }

    /// 提取隐藏字幕块，present 报告四个通道的存在性
    fn get_cc(&mut self, present: &mut [bool; 4]) -> Option<Block> {
        let _ = present;
        None
    }

    /// 透传流附件（封面、字体等），返回附件数量
    fn get_attachments(&mut self, out: &mut Vec<Attachment>) -> usize {
        let _ = out;
        0
    }
}

/// 解码器工厂 - 模块加载在本库之外，这里只约定打开入口
pub trait DecoderFactory: Send + Sync {
    fn open_decoder(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>>;
    fn open_packetizer(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>>;
}

/// 音频输出 - 不透明的音频后端
pub trait AudioSink: Send + Sync {
    /// 按给定速率播放一段缓冲
    fn play(&self, buffer: AudioBuffer, rate: i32) -> Result<()>;

    /// 清空内部缓冲；wait 为真时等待已送出的数据播完（排空）
    fn flush(&self, wait: bool);

    /// 暂停/恢复
    fn change_pause(&self, paused: bool, date: Mtime);

    /// 读取并清零后端内部的丢失计数
    fn get_reset_lost(&self) -> u64;
}

/// 资源代理 - 输出端（视频输出、音频输出）的出借方
///
/// 属主线程向代理借用输出端，停止时归还；核心内部不持有
/// 任何环形的所有权引用。
pub trait Resource: Send + Sync {
    /// 借出与格式匹配的视频输出。old 为需要回收的旧输出，
    /// 代理可以复用或销毁它。返回 None 表示无法提供。
    fn request_vout(
        &self,
        old: Option<Arc<VideoOutput>>,
        fmt: &VideoEsFormat,
    ) -> Option<Arc<VideoOutput>>;

    /// 持有当前的视频输出（字幕流渲染目标），没有则返回 None
    fn hold_vout(&self) -> Option<Arc<VideoOutput>>;

    /// 借出与格式匹配的音频输出
    fn request_aout(
        &self,
        old: Option<Arc<dyn AudioSink>>,
        fmt: &AudioEsFormat,
    ) -> Option<Arc<dyn AudioSink>>;

    /// 归还视频输出
    fn put_vout(&self, vout: Arc<VideoOutput>);

    /// 归还音频输出
    fn put_aout(&self, aout: Arc<dyn AudioSink>);
}
