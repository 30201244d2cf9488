use once_cell::sync::Lazy;
use std::thread;
use std::time::{Duration, Instant};

/// 单调时间戳（微秒）
pub type Mtime = i64;

/// 每秒的微秒数
pub const CLOCK_FREQ: Mtime = 1_000_000;

// 进程级时间基准，首次取用时初始化
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// 获取当前单调时间（微秒，从进程首次取用时间起算）
pub fn mdate() -> Mtime {
    EPOCH.elapsed().as_micros() as Mtime
}

/// 睡眠到指定的时间点（已过期则立即返回）
pub fn mwait(date: Mtime) {
    let delay = date - mdate();
    if delay > 0 {
        thread::sleep(Duration::from_micros(delay as u64));
    }
}

/// 睡眠一段时间（微秒）
pub fn msleep(delay: Mtime) {
    if delay > 0 {
        thread::sleep(Duration::from_micros(delay as u64));
    }
}
