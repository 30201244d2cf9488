use crate::core::error::{CoreError, Result};
use crate::core::mtime::Mtime;
use std::sync::Mutex;

/// 默认播放速率。实际播放速度 = INPUT_RATE_DEFAULT / rate，
/// 即 rate = 2000 表示半速，rate = 500 表示两倍速。
pub const INPUT_RATE_DEFAULT: i32 = 1000;

/// 输入时钟适配器 - 流时间戳到显示时间的纯转换
///
/// 属主线程在持有自身锁的情况下调用，以保证转换结果的单调性。
pub trait InputClock: Send + Sync {
    /// 把流时间戳转换为显示时间，返回 (显示时间, 当前速率)。
    /// bound 限制相对时钟基准可接受的最大超前量，超出视为损坏的时间戳。
    fn convert_ts(&self, ts: Mtime, bound: Mtime) -> Result<(Mtime, i32)>;

    /// 当前播放速率
    fn rate(&self) -> i32;
}

/// 系统时钟 - 以 (流基准, 墙钟基准) 对加整数速率实现的输入时钟
#[derive(Default)]
pub struct SystemClock {
    inner: Mutex<ClockInner>,
}

struct ClockInner {
    origin: Option<(Mtime, Mtime)>, // (流基准, 墙钟基准)
    rate: i32,
}

impl Default for ClockInner {
    fn default() -> Self {
        Self {
            origin: None,
            rate: INPUT_RATE_DEFAULT,
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置时钟基准：流时间戳 stream_ts 对应墙钟时间 wall_ts
    pub fn set_origin(&self, stream_ts: Mtime, wall_ts: Mtime) {
        let mut inner = self.inner.lock().unwrap();
        inner.origin = Some((stream_ts, wall_ts));
    }

    /// 调整播放速率，同时把基准平移到当前位置以保持连续
    pub fn set_rate(&self, rate: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.rate = rate.max(1);
    }
}

impl InputClock for SystemClock {
    fn convert_ts(&self, ts: Mtime, bound: Mtime) -> Result<(Mtime, i32)> {
        let inner = self.inner.lock().unwrap();
        let (base_stream, base_wall) = inner
            .origin
            .ok_or(CoreError::ClockConversionError(ts))?;

        // 超出边界的时间戳视为损坏，拒绝转换
        if bound != Mtime::MAX && ts > base_stream + bound {
            return Err(CoreError::ClockConversionError(ts));
        }

        let wall =
            base_wall + (ts - base_stream) * inner.rate as Mtime / INPUT_RATE_DEFAULT as Mtime;
        Ok((wall, inner.rate))
    }

    fn rate(&self) -> i32 {
        self.inner.lock().unwrap().rate
    }
}
