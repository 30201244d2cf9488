use crate::core::{
    mdate, msleep, AudioBuffer, AudioEsFormat, Block, CoreError, DecodedPicture,
    DecodedSubpicture, DecoderStats, EsCategory, EsFormat, FourCc, InputClock, Mtime, Result,
    VideoEsFormat, BLOCK_FLAG_CORE_FLUSH, BLOCK_FLAG_DISCONTINUITY, BLOCK_FLAG_PREROLL,
    CLOCK_FREQ, INPUT_RATE_DEFAULT,
};
use crate::decoder::fifo::{BlockFifo, Dequeued};
use crate::decoder::module::{AudioSink, DecoderFactory, DecoderModule, Resource};
use crate::output::VideoOutput;
use log::{debug, error, info, warn};
use std::process;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}

/// 默认的 PTS 提前量
const DEFAULT_PTS_DELAY: Mtime = 300_000;
/// 超前太多的视频时间戳视为伪造，不会被显示
const DECODER_BOGUS_VIDEO_DELAY: Mtime = 30 * DEFAULT_PTS_DELAY;
/// 音频提前准备时间：太早到的缓冲先等到该提前量以内再提交
pub const AOUT_MAX_PREPARE_TIME: Mtime = 2 * CLOCK_FREQ;
/// 音频时间戳允许的最大超前量
pub const AOUT_MAX_ADVANCE_TIME: Mtime = AOUT_MAX_PREPARE_TIME + CLOCK_FREQ;
/// 音频相对默认速率的最大偏离倍数
pub const AOUT_MAX_INPUT_RATE: i32 = 4;
/// 字幕提前准备时间
pub const SPU_MAX_PREPARE_TIME: Mtime = CLOCK_FREQ / 2;
/// 非限速生产者的 FIFO 字节上限（约 50mb/s 播 60 秒）
const FIFO_MAX_BYTES: usize = 400 * 1024 * 1024;
/// 限速生产者的 FIFO 块数上限
const FIFO_PACE_COUNT: usize = 10;
/// 图像堆暂时无槽位时的重试间隔
const VOUT_OUTMEM_SLEEP: Mtime = 20_000;

// 属主锁保护的全部流状态
struct OwnerState {
    // 输出端（写入需持锁；工作线程在格式更新周期之间可直接读取克隆）
    vout: Option<Arc<VideoOutput>>,
    aout: Option<Arc<dyn AudioSink>>,
    video_fmt: Option<VideoEsFormat>,
    audio_fmt: Option<AudioEsFormat>,
    // 输出格式描述已更新（读取后清除）
    fmt_description: bool,

    // 字幕渲染目标与通道
    spu_vout: Option<Arc<VideoOutput>>,
    spu_channel: usize,
    spu_order: u64,

    // 预滚水位线：Some(MAX) 表示待定（等第一个带时间戳的块）
    preroll_end: Option<Mtime>,
    last_rate: i32,
    ts_delay: Mtime,

    // 暂停
    paused: bool,
    pause_date: Mtime,
    pause_ignore: u32,

    // 同步起播（等待首帧）
    waiting: bool,
    first: bool,
    has_data: bool,

    // flush / drain
    flushing: bool,
    drained: bool,

    // 永久错误与统计
    error: bool,
    stats: DecoderStats,

    // 隐藏字幕
    cc_present: [bool; 4],
    cc_decoders: [Option<InputDecoder>; 4],
}

struct OwnerShared {
    fifo: BlockFifo,
    lock: Mutex<OwnerState>,
    // 生产者阻塞点的唤醒：暂停/等待状态变化、flush、逐帧步进
    request: Condvar,
    // 工作线程的回执：flush 完成、首帧数据就绪
    acknowledge: Condvar,

    clock: Option<Arc<dyn InputClock>>,
    factory: Arc<dyn DecoderFactory>,
    resource: Arc<dyn Resource>,

    category: EsCategory,
    codec: FourCc,
    cc_supported: bool,
}

/// 解码器属主 - 每路基本流一个，拥有压缩块 FIFO 与解码线程
///
/// 上游（解封装线程）通过 `input_decode` 推入压缩块；解码线程
/// 取块解码，把输出单元做时钟修正后路由到对应的输出端。暂停、
/// 等待首帧、flush、drain 与动态格式重建都在这条线程上收敛。
pub struct InputDecoder {
    shared: Arc<OwnerShared>,
    thread: Option<JoinHandle<()>>,
}

impl InputDecoder {
    /// 创建解码器属主并启动解码线程
    ///
    /// 解码器模块加载失败不会让创建失败：属主进入永久错误状态，
    /// 线程照常消费 FIFO 并丢弃所有块，直到被销毁。
    pub fn new(
        fmt: &EsFormat,
        clock: Option<Arc<dyn InputClock>>,
        factory: Arc<dyn DecoderFactory>,
        resource: Arc<dyn Resource>,
    ) -> Result<Self> {
        info!("{} 🧩 创建解码器: {} ({:?})", log_ctx(), fmt.codec, fmt.category);

        // 输入未打包时先装一个打包器前置级
        let packetizer = if !fmt.packetized {
            match factory.open_packetizer(fmt) {
                Ok(packetizer) => Some(packetizer),
                Err(e) => {
                    debug!("{} 打包器不可用: {}，输入直接馈入解码器", log_ctx(), e);
                    None
                }
            }
        } else {
            None
        };

        let decoder_fmt = match packetizer.as_ref() {
            Some(packetizer) => {
                let mut fmt = packetizer.fmt_out().clone();
                fmt.packetized = true;
                fmt
            }
            None => fmt.clone(),
        };

        let mut error = false;
        let decoder = match factory.open_decoder(&decoder_fmt) {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                error!("{} ❌ 解码器加载失败: {}", log_ctx(), e);
                error = true;
                None
            }
        };

        let category = decoder
            .as_ref()
            .map(|d| d.fmt_out().category)
            .unwrap_or(fmt.category);
        let cc_supported = decoder.as_ref().map_or(false, |d| d.has_cc())
            || packetizer.as_ref().map_or(false, |p| p.has_cc());

        let shared = Arc::new(OwnerShared {
            fifo: BlockFifo::new(),
            lock: Mutex::new(OwnerState {
                vout: None,
                aout: None,
                video_fmt: None,
                audio_fmt: None,
                fmt_description: false,
                spu_vout: None,
                spu_channel: 0,
                spu_order: 0,
                preroll_end: None,
                last_rate: INPUT_RATE_DEFAULT,
                ts_delay: 0,
                paused: false,
                pause_date: 0,
                pause_ignore: 0,
                waiting: false,
                first: true,
                has_data: false,
                flushing: false,
                drained: false,
                error,
                stats: DecoderStats::default(),
                cc_present: [false; 4],
                cc_decoders: [None, None, None, None],
            }),
            request: Condvar::new(),
            acknowledge: Condvar::new(),
            clock,
            factory,
            resource,
            category,
            codec: fmt.codec,
            cc_supported,
        });

        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("decoder".to_string())
            .spawn(move || decoder_thread(worker_shared, decoder, packetizer))
            .map_err(|e| CoreError::Other(format!("创建解码线程失败: {}", e)))?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// 把压缩块放入解码 FIFO
    ///
    /// - pace = false：不限速；累计字节超过上限时整个队列被丢弃
    /// - pace = true：队列达到上限时阻塞，直到解码线程消化。
    ///   等待首帧期间 FIFO 不被消费，此时绝不限速（否则会与上游
    ///   同步器互相死锁）
    pub fn input_decode(&self, block: Block, pace: bool) {
        if !pace {
            let dropped = self.shared.fifo.push_unpaced(block, FIFO_MAX_BYTES);
            if dropped > 0 {
                warn!(
                    "{} ⚠️ 解码 FIFO 已满（数据消费过慢），清空 {} 个块",
                    log_ctx(),
                    dropped
                );
            }
            return;
        }

        let waiting = self.shared.lock.lock().unwrap().waiting;
        if waiting {
            self.shared.fifo.push(block);
        } else {
            self.shared.fifo.push_paced(block, FIFO_PACE_COUNT);
        }
    }

    /// 立即丢弃所有待解码数据（seek 或取消选择流时使用）
    ///
    /// 清空 FIFO、取消未决的排空请求、注入 flush 哨兵块，
    /// 并等待解码线程的回执。连续调用是幂等的。
    pub fn flush(&self) {
        let mut state = self.shared.lock.lock().unwrap();

        let dropped = self.shared.fifo.drain_all();
        if dropped > 0 {
            debug!("{} 🗑️ flush 丢弃 {} 个待解码块", log_ctx(), dropped);
        }

        state.flushing = true;
        self.shared.request.notify_all();

        // 哨兵块穿过解码器，促使其清理内部状态
        self.shared.fifo.push(Block::flush_sentinel());

        while state.flushing {
            state = self.shared.acknowledge.wait(state).unwrap();
        }
    }

    /// 登记排空请求：FIFO 清空后给解码器馈一次空输入，把所有
    /// 中间缓冲推到输出端。本函数不等待排空完成。
    pub fn drain(&self) {
        self.shared.fifo.set_draining();
    }

    /// 流是否已经完全排空（FIFO 空且输出端无滞留）
    pub fn is_empty(&self) -> bool {
        if self.shared.fifo.count() > 0 {
            return false;
        }
        let state = self.shared.lock.lock().unwrap();
        debug_assert!(!state.waiting);
        match self.shared.category {
            EsCategory::Video => state.vout.as_ref().map_or(true, |vout| vout.is_empty()),
            EsCategory::Audio => state.drained,
            EsCategory::Subpicture => true,
        }
    }

    /// 暂停/恢复，向输出端转发
    pub fn change_pause(&self, paused: bool, date: Mtime) {
        let mut state = self.shared.lock.lock().unwrap();
        if state.paused == paused {
            return;
        }
        state.paused = paused;
        state.pause_date = date;
        state.pause_ignore = 0;
        self.shared.request.notify_all();

        match self.shared.category {
            EsCategory::Audio => {
                if let Some(aout) = state.aout.clone() {
                    aout.change_pause(paused, date);
                }
            }
            EsCategory::Video => {
                if let Some(vout) = state.vout.clone() {
                    vout.change_pause(paused, date);
                }
            }
            EsCategory::Subpicture => {}
        }
    }

    /// 调整时间戳延迟补偿
    pub fn change_delay(&self, delay: Mtime) {
        self.shared.lock.lock().unwrap().ts_delay = delay;
    }

    /// 进入同步起播等待：解码器产出首帧后挂起，等待放行
    pub fn start_wait(&self) {
        let mut state = self.shared.lock.lock().unwrap();
        debug_assert!(!state.waiting);
        state.first = true;
        state.has_data = false;
        state.waiting = true;
        self.shared.request.notify_all();
    }

    /// 结束同步起播等待，放行被挂起的输出
    pub fn stop_wait(&self) {
        let mut state = self.shared.lock.lock().unwrap();
        debug_assert!(state.waiting);
        state.waiting = false;
        self.shared.request.notify_all();
    }

    /// 等待首帧数据就绪。FIFO 为空且解码线程空转时直接返回，
    /// 避免在没有数据可解码时永远等待。
    pub fn wait(&self) {
        let mut state = self.shared.lock.lock().unwrap();
        debug_assert!(state.waiting);
        while !state.has_data {
            if self.shared.fifo.is_idle_empty() {
                warn!("{} 没有可解码的数据，无法等待首帧", log_ctx());
                break;
            }
            state = self.shared.acknowledge.wait(state).unwrap();
        }
    }

    /// 暂停状态下的逐帧步进，返回步进时长
    pub fn frame_next(&self) -> Mtime {
        let mut duration = 0;
        let mut state = self.shared.lock.lock().unwrap();
        if self.shared.category == EsCategory::Video {
            if state.paused {
                if let Some(vout) = state.vout.clone() {
                    duration = vout.next_picture().unwrap_or(0);
                    // 暂停屏障额外放行一帧
                    state.pause_ignore += 1;
                    self.shared.request.notify_all();
                }
            }
        } else {
            state.waiting = false;
            drop(state);
            self.flush();
        }
        duration
    }

    /// 输出格式描述是否更新过；更新标志在读取时清除
    pub fn has_format_changed(&self) -> Option<EsFormat> {
        let mut state = self.shared.lock.lock().unwrap();
        if !state.fmt_description {
            return None;
        }
        state.fmt_description = false;
        Some(EsFormat {
            category: self.shared.category,
            codec: self.shared.codec,
            packetized: true,
            video: state.video_fmt.unwrap_or_default(),
            audio: state.audio_fmt.unwrap_or_default(),
        })
    }

    /// FIFO 当前累计字节数
    pub fn fifo_size(&self) -> usize {
        self.shared.fifo.bytes()
    }

    /// 解码统计快照
    pub fn stats(&self) -> DecoderStats {
        self.shared.lock.lock().unwrap().stats
    }

    /// 是否处于永久错误状态
    pub fn has_error(&self) -> bool {
        self.shared.lock.lock().unwrap().error
    }

    // ========== 隐藏字幕 ==========

    /// 各 CC 通道的存在性
    pub fn is_cc_present(&self) -> [bool; 4] {
        self.shared.lock.lock().unwrap().cc_present
    }

    /// 查询某通道的 CC 子解码器是否开启
    pub fn get_cc_state(&self, channel: usize) -> bool {
        if channel >= 4 {
            return false;
        }
        self.shared.lock.lock().unwrap().cc_decoders[channel].is_some()
    }

    /// 开关某通道的 CC 子解码器
    pub fn set_cc_state(&self, enable: bool, channel: usize) -> Result<()> {
        if channel >= 4 || !self.shared.lock.lock().unwrap().cc_present[channel] {
            return Err(CoreError::Other(format!("CC 通道 {} 不可用", channel)));
        }

        if enable {
            let tags: [&[u8; 4]; 4] = [b"cc1 ", b"cc2 ", b"cc3 ", b"cc4 "];
            let fmt = EsFormat {
                packetized: true,
                ..EsFormat::subpicture(FourCc::new(tags[channel]))
            };
            let sub_decoder = InputDecoder::new(
                &fmt,
                self.shared.clock.clone(),
                self.shared.factory.clone(),
                self.shared.resource.clone(),
            )?;
            if sub_decoder.has_error() {
                sub_decoder.delete();
                return Err(CoreError::DecoderLoadError(format!(
                    "无法打开 CC 通道 {} 的解码器",
                    channel
                )));
            }
            let mut state = self.shared.lock.lock().unwrap();
            state.cc_decoders[channel] = Some(sub_decoder);
        } else {
            let sub_decoder = {
                let mut state = self.shared.lock.lock().unwrap();
                state.cc_decoders[channel].take()
            };
            if let Some(sub_decoder) = sub_decoder {
                sub_decoder.delete();
            }
        }
        Ok(())
    }

    /// 销毁解码器：取消工作线程、确定性地 join、归还输出端
    pub fn delete(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        info!(
            "{} 🗑️ 销毁解码器 {}（FIFO 中还有 {} 个块）",
            log_ctx(),
            self.shared.codec,
            self.shared.fifo.count()
        );

        // 确保工作线程不再处于暂停/等待状态，然后在 FIFO 等待点取消
        {
            let mut state = self.shared.lock.lock().unwrap();
            state.paused = false;
            state.waiting = false;
            state.flushing = true;
            self.shared.request.notify_all();
        }
        self.shared.fifo.kill();
        let _ = thread.join();

        // 拆除 CC 子解码器
        let cc_decoders: Vec<InputDecoder> = {
            let mut state = self.shared.lock.lock().unwrap();
            state.cc_decoders.iter_mut().filter_map(|d| d.take()).collect()
        };
        for sub_decoder in cc_decoders {
            sub_decoder.delete();
        }

        // 归还输出端
        let (vout, aout, spu_vout, spu_channel) = {
            let mut state = self.shared.lock.lock().unwrap();
            (
                state.vout.take(),
                state.aout.take(),
                state.spu_vout.take(),
                state.spu_channel,
            )
        };
        if let Some(aout) = aout {
            aout.flush(false);
            self.shared.resource.put_aout(aout);
        }
        if let Some(vout) = vout {
            // 把本流遗留的待显示帧清掉再归还
            vout.flush(0);
            self.shared.resource.put_vout(vout);
        }
        if self.shared.category == EsCategory::Subpicture {
            if let (Some(held), Some(spu_vout)) = (self.shared.resource.hold_vout(), spu_vout) {
                if Arc::ptr_eq(&held, &spu_vout) {
                    held.flush_spu_channel(spu_channel);
                }
            }
        }
        info!("{} ✅ 解码器已销毁", log_ctx());
    }
}

impl Drop for InputDecoder {
    fn drop(&mut self) {
        if self.thread.is_some() {
            warn!("{} ⚠ InputDecoder 被 drop 但未调用 delete()，尝试优雅停止", log_ctx());
            self.shutdown();
        }
    }
}

// ============= 解码线程 =============

fn decoder_thread(
    shared: Arc<OwnerShared>,
    mut decoder: Option<Box<dyn DecoderModule>>,
    mut packetizer: Option<Box<dyn DecoderModule>>,
) {
    info!("{} 🧩 解码线程启动 ({:?})", log_ctx(), shared.category);
    loop {
        {
            // 每轮先发回执，唤醒等待首帧数据的调用方
            let _state = shared.lock.lock().unwrap();
            shared.acknowledge.notify_all();
        }

        // 取块等待点是唯一的取消点
        let block = match shared.fifo.dequeue_wait() {
            Dequeued::Killed => break,
            Dequeued::Drain => None,
            Dequeued::Block(block) => Some(block),
        };
        let draining = block.is_none();

        process(&shared, &mut decoder, &mut packetizer, block);

        let mut state = shared.lock.lock().unwrap();
        if draining {
            // 排空：解码器输出都已提交，最后让音频输出播完余量
            if let Some(aout) = state.aout.clone() {
                aout.flush(true);
            }
        }
        state.drained = draining;
    }
    info!("{} 🛑 解码线程退出", log_ctx());
}

// 处理一个块（None 表示排空请求）
fn process(
    shared: &OwnerShared,
    decoder: &mut Option<Box<dyn DecoderModule>>,
    packetizer: &mut Option<Box<dyn DecoderModule>>,
    block: Option<Block>,
) {
    let flush_request = block
        .as_ref()
        .map_or(false, |b| b.has_flag(BLOCK_FLAG_CORE_FLUSH));

    let errored = decoder.is_none() || shared.lock.lock().unwrap().error;
    if errored {
        // 永久错误状态：继续消费 FIFO，只丢弃
        drop(block);
    } else if block
        .as_ref()
        .map_or(false, |b| b.data.is_empty() && !b.has_flag(BLOCK_FLAG_CORE_FLUSH))
    {
        // 空块没有意义
        return;
    } else {
        let mut b_flush = false;
        if let Some(b) = &block {
            let mut state = shared.lock.lock().unwrap();
            let pending = state.preroll_end == Some(Mtime::MAX);
            update_preroll(&mut state.preroll_end, b);
            b_flush = !pending && flush_request;
        }

        let decoder = decoder.as_mut().unwrap();
        match shared.category {
            EsCategory::Video => process_video(shared, decoder, packetizer.as_mut(), block, b_flush),
            EsCategory::Audio => process_audio(shared, decoder, packetizer.as_mut(), block, b_flush),
            EsCategory::Subpicture => process_spu(shared, decoder, block, b_flush),
        }
    }

    if flush_request {
        // flush 回执：哨兵已经走完解码器
        let mut state = shared.lock.lock().unwrap();
        if state.flushing {
            state.flushing = false;
            shared.acknowledge.notify_all();
        }
    }
}

// 预滚水位线更新：预滚/不连续标志使水位线待定，
// 之后第一个带时间戳的块把它压到实际位置
fn update_preroll(preroll: &mut Option<Mtime>, block: &Block) {
    if block.has_flag(BLOCK_FLAG_PREROLL) || block.has_flag(BLOCK_FLAG_DISCONTINUITY) {
        *preroll = Some(Mtime::MAX);
    } else if let Some(current) = *preroll {
        if let Some(ts) = block.dts.or(block.pts) {
            *preroll = Some(current.min(ts));
        }
    }
}

fn is_flushing(shared: &OwnerShared) -> bool {
    shared.lock.lock().unwrap().flushing
}

// ============= 生产者屏障 =============

// 同时兑现暂停与等待首帧的屏障。返回的布尔值为真表示当前
// 输出单元应当被拒绝（flush 进行中）。
// 暂停下 pause_ignore 逐帧放行；等待首帧时暂停态也放行一帧
// 以便尽快到达 has_data。
fn wait_unblock<'a>(
    shared: &'a OwnerShared,
    mut state: MutexGuard<'a, OwnerState>,
) -> (MutexGuard<'a, OwnerState>, bool) {
    loop {
        if state.flushing {
            break;
        }
        if state.paused {
            if state.waiting && !state.has_data {
                break;
            }
            if state.pause_ignore > 0 {
                state.pause_ignore -= 1;
                break;
            }
        } else if !state.waiting || !state.has_data {
            break;
        }
        state = shared.request.wait(state).unwrap();
    }
    let flushing = state.flushing;
    (state, flushing)
}

// 等到指定时间点或 flush 请求（此时把拒绝标志置真）
fn wait_date<'a>(
    shared: &'a OwnerShared,
    mut state: MutexGuard<'a, OwnerState>,
    mut reject: bool,
    deadline: Option<Mtime>,
) -> (MutexGuard<'a, OwnerState>, bool) {
    let Some(deadline) = deadline else {
        return (state, reject);
    };
    if reject || deadline <= 0 {
        return (state, reject);
    }
    loop {
        if state.flushing {
            reject = true;
            break;
        }
        let remaining = deadline - mdate();
        if remaining <= 0 {
            break;
        }
        let (guard, _) = shared
            .request
            .wait_timeout(state, Duration::from_micros(remaining as u64))
            .unwrap();
        state = guard;
    }
    (state, reject)
}

// 在属主锁内做时间戳修正：套用延迟补偿与时钟转换，返回当前速率
fn fix_ts(
    shared: &OwnerShared,
    state: &OwnerState,
    ts0: &mut Option<Mtime>,
    mut ts1: Option<&mut Option<Mtime>>,
    duration: Option<&mut Mtime>,
    bound: Mtime,
) -> i32 {
    let Some(clock) = shared.clock.as_ref() else {
        return INPUT_RATE_DEFAULT;
    };
    let delay = state.ts_delay;
    let ephemere = matches!((&*ts0, ts1.as_deref()), (Some(a), Some(Some(b))) if a == b);

    let rate;
    if let Some(t0) = *ts0 {
        let bound = if bound != Mtime::MAX { bound + delay } else { bound };
        match clock.convert_ts(t0 + delay, bound) {
            Ok((wall, r)) => {
                *ts0 = Some(wall);
                rate = r;
                if let Some(ts1) = ts1.as_deref_mut() {
                    if let Some(t1) = *ts1 {
                        *ts1 = clock.convert_ts(t1 + delay, Mtime::MAX).ok().map(|(w, _)| w);
                    }
                }
            }
            Err(_) => {
                warn!("{} 无法转换时间戳 {}", log_ctx(), t0);
                *ts0 = None;
                rate = clock.rate();
            }
        }
    } else {
        rate = clock.rate();
    }

    // 舍入可能把非瞬时单元挤成瞬时，错开结束时间
    if !ephemere {
        if let Some(ts1) = ts1.as_deref_mut() {
            if ts1.is_some() && *ts1 == *ts0 {
                *ts1 = ts1.map(|t| t + 1);
            }
        }
    }

    if let Some(duration) = duration {
        *duration = (*duration * rate as Mtime + INPUT_RATE_DEFAULT as Mtime - 1)
            / INPUT_RATE_DEFAULT as Mtime;
    }
    rate
}

// ============= 视频路径 =============

// 必要时向资源代理申请/更换视频输出（几何或格式变化）
fn update_vout(
    shared: &OwnerShared,
    state: &mut OwnerState,
    pic: &DecodedPicture,
) -> Option<Arc<VideoOutput>> {
    let fmt = VideoEsFormat {
        width: pic.width,
        height: pic.height,
        format: Some(pic.format),
        aspect: pic.aspect,
    };
    let unchanged = state.vout.is_some() && state.video_fmt == Some(fmt);
    if !unchanged {
        let old = state.vout.take();
        match shared.resource.request_vout(old, &fmt) {
            Some(vout) => {
                state.vout = Some(vout);
                state.video_fmt = Some(fmt);
                state.fmt_description = true;
            }
            None => {
                error!("{} ❌ 创建视频输出失败", log_ctx());
            }
        }
    }
    state.vout.clone()
}

// 把解码出的帧写入视频输出的缓冲堆并提交两步显示请求
fn submit_picture(
    shared: &OwnerShared,
    vout: &Arc<VideoOutput>,
    pic: &DecodedPicture,
    date: Mtime,
) -> bool {
    let id = loop {
        match vout.create_picture(pic.format, pic.width, pic.height) {
            Ok(id) => break id,
            Err(CoreError::HeapFull) => {
                // 堆满：等输出线程消化；flush/错误时放弃
                {
                    let state = shared.lock.lock().unwrap();
                    if state.flushing || state.error {
                        return false;
                    }
                }
                msleep(VOUT_OUTMEM_SLEEP);
            }
            Err(e) => {
                warn!("{} 无法获取输出图像: {}", log_ctx(), e);
                return false;
            }
        }
    };
    vout.write_picture(id, &pic.data);
    vout.configure_picture(id, pic.aspect, pic.matrix_coefficients);
    vout.date_picture(id, date);
    vout.display_picture(id);
    true
}

fn play_video(shared: &OwnerShared, pic: DecodedPicture) {
    if pic.date.is_none() && !pic.force {
        warn!("{} 收到无时间戳的视频缓冲", log_ctx());
        shared.lock.lock().unwrap().stats.lost_pictures += 1;
        return;
    }

    let mut state = shared.lock.lock().unwrap();

    if state.waiting && !state.first {
        state.has_data = true;
        shared.acknowledge.notify_all();
    }
    let first_after_wait = state.waiting && state.has_data;

    let (mut state, mut reject) = wait_unblock(shared, state);

    let mut force = pic.force;
    if !reject && state.waiting {
        debug!("{} 收到首帧图像", log_ctx());
        state.first = false;
        force = true;
    }

    let mut date = pic.date;
    let rate = fix_ts(shared, &state, &mut date, None, None, DECODER_BOGUS_VIDEO_DELAY);
    let last_rate = state.last_rate;

    let vout = if !reject {
        update_vout(shared, &mut state, &pic)
    } else {
        state.vout.clone()
    };
    drop(state);

    if !force && date.is_none() {
        reject = true;
    }

    let mut submitted = false;
    if let (Some(vout), false) = (&vout, reject) {
        if rate != last_rate || first_after_wait {
            // 速率变化：先把堆中将要过时的帧丢掉，避免旧帧后显示
            vout.flush(date.unwrap_or(0));
        }
        let submit_date = date.unwrap_or_else(mdate);
        submitted = submit_picture(shared, vout, &pic, submit_date);
    } else if date.is_some() {
        debug!("{} 丢弃被拒绝的图像", log_ctx());
    } else {
        warn!("{} 收到无时间戳的视频缓冲", log_ctx());
    }

    let mut state = shared.lock.lock().unwrap();
    state.last_rate = rate;
    if submitted {
        if let Some(vout) = &vout {
            let (displayed, lost) = vout.get_reset_statistics();
            state.stats.displayed_pictures += displayed;
            state.stats.lost_pictures += lost;
        }
    } else {
        state.stats.lost_pictures += 1;
    }
}

// 对一个输入块循环调用解码器直到不再产出图像
fn decode_video_loop(
    shared: &OwnerShared,
    decoder: &mut Box<dyn DecoderModule>,
    block: Option<Block>,
    cc_from_decoder: bool,
) {
    let mut input = block;
    while let Some(pic) = decoder.decode_video(&mut input) {
        if is_flushing(shared) {
            // flush 进行中：放弃剩余输出，防止卡死在损坏的解码器上
            break;
        }

        let mut dropped = false;
        {
            let mut state = shared.lock.lock().unwrap();
            state.stats.decoded += 1;

            if let Some(end) = state.preroll_end {
                if pic.date.map_or(true, |d| d < end) {
                    // 预滚：水位线之前的输出静默丢弃
                    dropped = true;
                } else {
                    debug!("{} 视频预滚结束", log_ctx());
                    state.preroll_end = None;
                    let vout = state.vout.clone();
                    drop(state);
                    if let Some(vout) = vout {
                        vout.flush(0);
                    }
                }
            }
        }
        if dropped {
            continue;
        }

        if cc_from_decoder {
            extract_cc(shared, decoder.as_mut());
        }
        play_video(shared, pic);
    }
}

fn process_video(
    shared: &OwnerShared,
    decoder: &mut Box<dyn DecoderModule>,
    packetizer: Option<&mut Box<dyn DecoderModule>>,
    block: Option<Block>,
    b_flush: bool,
) {
    if let Some(packetizer) = packetizer {
        let drain = block.is_none();
        let mut input = block;
        while let Some(packetized) = packetizer.packetize(&mut input) {
            if !decoder.fmt_in().is_similar(packetizer.fmt_out()) {
                info!("{} 输入格式变化，重建解码器模块", log_ctx());
                // 先排空旧解码器，保证块序不乱
                decode_video_loop(shared, decoder, None, false);
                match shared.factory.open_decoder(packetizer.fmt_out()) {
                    Ok(new_decoder) => *decoder = new_decoder,
                    Err(e) => {
                        error!("{} ❌ 解码器重建失败: {}", log_ctx(), e);
                        shared.lock.lock().unwrap().error = true;
                        return;
                    }
                }
            }
            if packetizer.has_cc() {
                extract_cc(shared, packetizer.as_mut());
            }
            let cc_from_decoder = decoder.has_cc() && !packetizer.has_cc();
            decode_video_loop(shared, decoder, Some(packetized), cc_from_decoder);
        }
        if drain {
            decode_video_loop(shared, decoder, None, false);
        }
        if b_flush {
            // 打包器不会产出促使解码器清理的块，这里补一个哨兵
            decode_video_loop(shared, decoder, Some(Block::flush_sentinel()), false);
        }
    } else {
        let cc_from_decoder = decoder.has_cc();
        decode_video_loop(shared, decoder, block, cc_from_decoder);
    }

    if b_flush {
        let vout = shared.lock.lock().unwrap().vout.clone();
        if let Some(vout) = vout {
            vout.flush(0);
        }
    }
}

// 提取隐藏字幕块并复制分发给已开启的 CC 子解码器
fn extract_cc(shared: &OwnerShared, module: &mut dyn DecoderModule) {
    if !shared.cc_supported {
        return;
    }
    let mut present = [false; 4];
    let Some(cc_block) = module.get_cc(&mut present) else {
        return;
    };

    let mut state = shared.lock.lock().unwrap();
    for channel in 0..4 {
        state.cc_present[channel] |= present[channel];
    }
    // 多个通道消费同一个块时逐一复制
    for channel in 0..4 {
        if let Some(sub_decoder) = &state.cc_decoders[channel] {
            sub_decoder.input_decode(cc_block.clone(), false);
        }
    }
}

// ============= 音频路径 =============

fn update_aout(
    shared: &OwnerShared,
    state: &mut OwnerState,
    buffer: &AudioBuffer,
) -> Option<Arc<dyn AudioSink>> {
    let fmt = AudioEsFormat {
        sample_rate: buffer.sample_rate,
        channels: buffer.channels,
    };
    let unchanged = state.aout.is_some() && state.audio_fmt == Some(fmt);
    if !unchanged {
        let old = state.aout.take();
        match shared.resource.request_aout(old, &fmt) {
            Some(aout) => {
                if state.paused {
                    // 属主已暂停：新输出端同步进入暂停
                    aout.change_pause(true, mdate());
                }
                state.aout = Some(aout);
                state.audio_fmt = Some(fmt);
                state.fmt_description = true;
            }
            None => {
                error!("{} ❌ 创建音频输出失败", log_ctx());
                state.error = true;
            }
        }
    }
    state.aout.clone()
}

fn play_audio(shared: &OwnerShared, audio: AudioBuffer) {
    if audio.pts.is_none() {
        warn!("{} 收到无时间戳的音频缓冲", log_ctx());
        shared.lock.lock().unwrap().stats.lost_abuffers += 1;
        return;
    }

    let mut state = shared.lock.lock().unwrap();
    loop {
        if state.waiting {
            state.has_data = true;
            shared.acknowledge.notify_all();
        }

        let (guard, mut reject) = wait_unblock(shared, state);
        state = guard;
        let paused = state.paused;

        let mut pts = audio.pts;
        let mut length = audio.length;
        let rate = fix_ts(
            shared,
            &state,
            &mut pts,
            None,
            Some(&mut length),
            AOUT_MAX_ADVANCE_TIME,
        );

        if pts.is_none()
            || rate < INPUT_RATE_DEFAULT / AOUT_MAX_INPUT_RATE
            || rate > INPUT_RATE_DEFAULT * AOUT_MAX_INPUT_RATE
        {
            reject = true;
        }

        let deadline = pts.map(|p| p - AOUT_MAX_PREPARE_TIME);
        let (guard, rejected) = wait_date(shared, state, reject, deadline);
        state = guard;
        reject = rejected;

        if state.paused != paused {
            // 与控制线程的暂停操作竞态，重试
            continue;
        }

        let aout = if !reject {
            update_aout(shared, &mut state, &audio)
        } else {
            state.aout.clone()
        };

        if let (Some(aout), false) = (aout, reject) {
            let mut out = audio.clone();
            out.pts = pts;
            out.length = length;
            if aout.play(out, rate).is_ok() {
                state.stats.played_abuffers += 1;
            }
            state.stats.lost_abuffers += aout.get_reset_lost();
        } else {
            debug!("{} 丢弃音频缓冲", log_ctx());
            state.stats.lost_abuffers += 1;
        }
        break;
    }
}

fn decode_audio_loop(shared: &OwnerShared, decoder: &mut Box<dyn DecoderModule>, block: Option<Block>) {
    let mut input = block;
    while let Some(buffer) = decoder.decode_audio(&mut input) {
        if is_flushing(shared) {
            break;
        }

        let mut dropped = false;
        {
            let mut state = shared.lock.lock().unwrap();
            state.stats.decoded += 1;

            if let Some(end) = state.preroll_end {
                if buffer.pts.map_or(true, |p| p < end) {
                    dropped = true;
                } else {
                    debug!("{} 音频预滚结束", log_ctx());
                    state.preroll_end = None;
                    let aout = state.aout.clone();
                    drop(state);
                    if let Some(aout) = aout {
                        aout.flush(false);
                    }
                }
            }
        }
        if dropped {
            continue;
        }

        play_audio(shared, buffer);
    }
}

fn process_audio(
    shared: &OwnerShared,
    decoder: &mut Box<dyn DecoderModule>,
    packetizer: Option<&mut Box<dyn DecoderModule>>,
    block: Option<Block>,
    b_flush: bool,
) {
    if let Some(packetizer) = packetizer {
        let drain = block.is_none();
        let mut input = block;
        while let Some(packetized) = packetizer.packetize(&mut input) {
            if !decoder.fmt_in().is_similar(packetizer.fmt_out()) {
                info!("{} 输入格式变化，重建解码器模块", log_ctx());
                decode_audio_loop(shared, decoder, None);
                match shared.factory.open_decoder(packetizer.fmt_out()) {
                    Ok(new_decoder) => *decoder = new_decoder,
                    Err(e) => {
                        error!("{} ❌ 解码器重建失败: {}", log_ctx(), e);
                        shared.lock.lock().unwrap().error = true;
                        return;
                    }
                }
            }
            decode_audio_loop(shared, decoder, Some(packetized));
        }
        if drain {
            decode_audio_loop(shared, decoder, None);
        }
        if b_flush {
            decode_audio_loop(shared, decoder, Some(Block::flush_sentinel()));
        }
    } else {
        decode_audio_loop(shared, decoder, block);
    }

    if b_flush {
        let aout = shared.lock.lock().unwrap().aout.clone();
        if let Some(aout) = aout {
            aout.flush(false);
        }
    }
}

// ============= 字幕路径 =============

// 字幕渲染目标变化时重新登记通道
fn ensure_spu_channel(shared: &OwnerShared, vout: &Arc<VideoOutput>) {
    let mut state = shared.lock.lock().unwrap();
    let same = state
        .spu_vout
        .as_ref()
        .map_or(false, |old| Arc::ptr_eq(old, vout));
    if !same {
        state.spu_channel = vout.register_spu_channel();
        state.spu_order = 0;
        state.spu_vout = Some(vout.clone());
    }
}

fn play_spu(shared: &OwnerShared, vout: &Arc<VideoOutput>, spu: DecodedSubpicture) {
    if spu.start.is_none() {
        warn!("{} 收到无时间戳的字幕单元", log_ctx());
        return;
    }

    let mut state = shared.lock.lock().unwrap();
    if state.waiting {
        state.has_data = true;
        shared.acknowledge.notify_all();
    }

    let (guard, mut reject) = wait_unblock(shared, state);
    state = guard;

    let mut start = spu.start;
    let mut stop = spu.stop;
    fix_ts(shared, &state, &mut start, Some(&mut stop), None, Mtime::MAX);
    if start.is_none() {
        reject = true;
    }

    let deadline = start.map(|s| s - SPU_MAX_PREPARE_TIME);
    let (guard, rejected) = wait_date(shared, state, reject, deadline);
    state = guard;
    reject = rejected;

    if reject {
        drop(state);
        debug!("{} 丢弃字幕单元", log_ctx());
        return;
    }

    let channel = state.spu_channel;
    let order = state.spu_order;
    state.spu_order += 1;
    drop(state);

    match vout.create_spu(spu.kind, spu.payload.len()) {
        Ok(id) => {
            vout.write_spu(id, &spu.payload);
            vout.date_spu(id, start.unwrap_or(0), stop.unwrap_or(Mtime::MAX));
            vout.set_spu_channel(id, channel, order);
            vout.display_spu(id);
        }
        Err(e) => {
            warn!("{} 无法获取字幕单元: {}", log_ctx(), e);
        }
    }
}

fn process_spu(
    shared: &OwnerShared,
    decoder: &mut Box<dyn DecoderModule>,
    block: Option<Block>,
    b_flush: bool,
) {
    let mut input = block;
    while let Some(spu) = decoder.decode_sub(&mut input) {
        {
            let mut state = shared.lock.lock().unwrap();
            state.stats.decoded += 1;
        }

        let Some(vout) = shared.resource.hold_vout() else {
            warn!("{} 没有视频输出，丢弃字幕", log_ctx());
            continue;
        };
        ensure_spu_channel(shared, &vout);

        // 预滚对字幕的语义：起止时间都在水位线之前才丢弃
        let preroll = shared.lock.lock().unwrap().preroll_end;
        if let (Some(end), Some(start)) = (preroll, spu.start) {
            if start < end && spu.stop.map_or(true, |stop| stop < end) {
                continue;
            }
        }

        play_spu(shared, &vout, spu);
    }

    if b_flush {
        if let Some(vout) = shared.resource.hold_vout() {
            let channel = {
                let state = shared.lock.lock().unwrap();
                let same = state
                    .spu_vout
                    .as_ref()
                    .map_or(false, |old| Arc::ptr_eq(old, &vout));
                same.then_some(state.spu_channel)
            };
            if let Some(channel) = channel {
                vout.flush_spu_channel(channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AspectRatio, PixelFormat, SystemClock};
    use crate::output::{DisplaySink, Font, PictureView, SurfaceConfig, YuvConverter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ========== 输出端替身 ==========

    struct NullSink;

    impl DisplaySink for NullSink {
        fn init(&mut self, _config: &mut SurfaceConfig) -> Result<()> {
            Ok(())
        }
        fn manage(&mut self, _changes: &mut u32) -> Result<()> {
            Ok(())
        }
        fn display(&mut self, _data: &[u8], _config: &SurfaceConfig) -> Result<()> {
            Ok(())
        }
        fn destroy(&mut self) {}
    }

    struct NullConverter;

    impl YuvConverter for NullConverter {
        fn rebuild_tables(&mut self, _gamma: f32, _grayscale: bool) -> Result<()> {
            Ok(())
        }
        fn convert(
            &mut self,
            _dst: &mut [u8],
            _bytes_per_line: usize,
            _bytes_per_pixel: usize,
            _view: &PictureView<'_>,
            _dst_width: usize,
            _dst_height: usize,
        ) {
        }
    }

    struct StubFont;

    impl Font for StubFont {
        fn text_size(&self, text: &str, _style: u32) -> (usize, usize) {
            (text.chars().count() * 8, 16)
        }
        fn print(
            &self,
            _dst: &mut [u8],
            _bytes_per_line: usize,
            _bytes_per_pixel: usize,
            _text: &str,
            _style: u32,
        ) {
        }
    }

    fn new_test_vout() -> Arc<VideoOutput> {
        Arc::new(
            VideoOutput::new(
                Box::new(NullSink),
                Box::new(NullConverter),
                Box::new(StubFont),
                320,
                240,
            )
            .unwrap(),
        )
    }

    #[derive(Default)]
    struct AoutLog {
        played: AtomicUsize,
        flush_wait: AtomicUsize,
        flush_nowait: AtomicUsize,
    }

    struct TestAout {
        log: Arc<AoutLog>,
    }

    impl AudioSink for TestAout {
        fn play(&self, _buffer: AudioBuffer, _rate: i32) -> Result<()> {
            self.log.played.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn flush(&self, wait: bool) {
            if wait {
                self.log.flush_wait.fetch_add(1, Ordering::SeqCst);
            } else {
                self.log.flush_nowait.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn change_pause(&self, _paused: bool, _date: Mtime) {}
        fn get_reset_lost(&self) -> u64 {
            0
        }
    }

    #[derive(Default)]
    struct TestResource {
        vout: Mutex<Option<Arc<VideoOutput>>>,
        aout_log: Option<Arc<AoutLog>>,
    }

    impl Resource for TestResource {
        fn request_vout(
            &self,
            _old: Option<Arc<VideoOutput>>,
            _fmt: &VideoEsFormat,
        ) -> Option<Arc<VideoOutput>> {
            self.vout.lock().unwrap().clone()
        }
        fn hold_vout(&self) -> Option<Arc<VideoOutput>> {
            self.vout.lock().unwrap().clone()
        }
        fn request_aout(
            &self,
            _old: Option<Arc<dyn AudioSink>>,
            _fmt: &AudioEsFormat,
        ) -> Option<Arc<dyn AudioSink>> {
            self.aout_log
                .as_ref()
                .map(|log| Arc::new(TestAout { log: log.clone() }) as Arc<dyn AudioSink>)
        }
        fn put_vout(&self, _vout: Arc<VideoOutput>) {}
        fn put_aout(&self, _aout: Arc<dyn AudioSink>) {}
    }

    // ========== 解码器替身 ==========

    #[derive(Default)]
    struct DecoderLog {
        blocks: Mutex<Vec<u32>>,
        drains: AtomicUsize,
    }

    // 每块产出一张 64x64 图像（时间戳取块 pts）
    struct EmittingVideoDecoder {
        fmt: EsFormat,
        log: Arc<DecoderLog>,
        emit: bool,
        cc: bool,
        fed: bool,
    }

    impl DecoderModule for EmittingVideoDecoder {
        fn fmt_in(&self) -> &EsFormat {
            &self.fmt
        }
        fn fmt_out(&self) -> &EsFormat {
            &self.fmt
        }
        fn decode_video(&mut self, block: &mut Option<Block>) -> Option<DecodedPicture> {
            let Some(b) = block.take() else {
                // 空输入：要么是上一块的输出已取完，要么是真正的排空
                if self.fed {
                    self.fed = false;
                } else {
                    self.log.drains.fetch_add(1, Ordering::SeqCst);
                }
                return None;
            };
            self.fed = true;
            self.log.blocks.lock().unwrap().push(b.flags);
            if !self.emit || b.has_flag(BLOCK_FLAG_CORE_FLUSH) {
                return None;
            }
            Some(DecodedPicture {
                format: PixelFormat::Yuv420,
                width: 64,
                height: 64,
                aspect: AspectRatio::Square,
                matrix_coefficients: 1,
                date: b.pts,
                force: false,
                data: vec![0u8; PixelFormat::Yuv420.frame_bytes(64, 64)],
            })
        }
        fn has_cc(&self) -> bool {
            self.cc
        }
        fn get_cc(&mut self, present: &mut [bool; 4]) -> Option<Block> {
            if !self.cc {
                return None;
            }
            present[0] = true;
            Some(Block::new(vec![0xcc]))
        }
    }

    struct EmittingAudioDecoder {
        fmt: EsFormat,
        log: Arc<DecoderLog>,
        fed: bool,
    }

    impl DecoderModule for EmittingAudioDecoder {
        fn fmt_in(&self) -> &EsFormat {
            &self.fmt
        }
        fn fmt_out(&self) -> &EsFormat {
            &self.fmt
        }
        fn decode_audio(&mut self, block: &mut Option<Block>) -> Option<AudioBuffer> {
            let Some(b) = block.take() else {
                if self.fed {
                    self.fed = false;
                } else {
                    self.log.drains.fetch_add(1, Ordering::SeqCst);
                }
                return None;
            };
            self.fed = true;
            self.log.blocks.lock().unwrap().push(b.flags);
            if b.has_flag(BLOCK_FLAG_CORE_FLUSH) {
                return None;
            }
            Some(AudioBuffer {
                pts: b.pts,
                length: 20_000,
                sample_rate: 48_000,
                channels: 2,
                data: vec![0.0; 16],
            })
        }
    }

    // 只消费不产出（CC 子解码器等）
    struct NullDecoder {
        fmt: EsFormat,
        log: Arc<DecoderLog>,
    }

    impl DecoderModule for NullDecoder {
        fn fmt_in(&self) -> &EsFormat {
            &self.fmt
        }
        fn fmt_out(&self) -> &EsFormat {
            &self.fmt
        }
        fn decode_sub(&mut self, block: &mut Option<Block>) -> Option<DecodedSubpicture> {
            if let Some(b) = block.take() {
                self.log.blocks.lock().unwrap().push(b.flags);
            }
            None
        }
    }

    struct StubFactory {
        log: Arc<DecoderLog>,
        emit: bool,
        cc: bool,
    }

    impl DecoderFactory for StubFactory {
        fn open_decoder(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>> {
            Ok(match fmt.category {
                EsCategory::Video => Box::new(EmittingVideoDecoder {
                    fmt: fmt.clone(),
                    log: self.log.clone(),
                    emit: self.emit,
                    cc: self.cc,
                    fed: false,
                }),
                EsCategory::Audio => Box::new(EmittingAudioDecoder {
                    fmt: fmt.clone(),
                    log: self.log.clone(),
                    fed: false,
                }),
                EsCategory::Subpicture => Box::new(NullDecoder {
                    fmt: fmt.clone(),
                    log: self.log.clone(),
                }),
            })
        }
        fn open_packetizer(&self, _fmt: &EsFormat) -> Result<Box<dyn DecoderModule>> {
            Err(CoreError::Other("没有可用的打包器".to_string()))
        }
    }

    // ========== 格式切换替身（解码器重建场景） ==========

    #[derive(Default)]
    struct FactoryState {
        loads: Vec<FourCc>,
        sequence: Vec<(FourCc, u8)>,
        drains: Vec<FourCc>,
    }

    struct RecordingDecoder {
        fmt: EsFormat,
        state: Arc<Mutex<FactoryState>>,
    }

    impl DecoderModule for RecordingDecoder {
        fn fmt_in(&self) -> &EsFormat {
            &self.fmt
        }
        fn fmt_out(&self) -> &EsFormat {
            &self.fmt
        }
        fn decode_video(&mut self, block: &mut Option<Block>) -> Option<DecodedPicture> {
            match block.take() {
                None => {
                    self.state.lock().unwrap().drains.push(self.fmt.codec);
                    None
                }
                Some(b) => {
                    if !b.has_flag(BLOCK_FLAG_CORE_FLUSH) {
                        self.state
                            .lock()
                            .unwrap()
                            .sequence
                            .push((self.fmt.codec, b.data[0]));
                    }
                    None
                }
            }
        }
    }

    // 第 switch_after+1 个包起宣告新编码
    struct SwitchingPacketizer {
        fmt_in: EsFormat,
        fmt_out: EsFormat,
        seen: usize,
        switch_after: usize,
        codec_b: FourCc,
    }

    impl DecoderModule for SwitchingPacketizer {
        fn fmt_in(&self) -> &EsFormat {
            &self.fmt_in
        }
        fn fmt_out(&self) -> &EsFormat {
            &self.fmt_out
        }
        fn packetize(&mut self, block: &mut Option<Block>) -> Option<Block> {
            let b = block.take()?;
            if b.has_flag(BLOCK_FLAG_CORE_FLUSH) {
                return None;
            }
            self.seen += 1;
            if self.seen == self.switch_after + 1 {
                self.fmt_out.codec = self.codec_b;
            }
            Some(b)
        }
    }

    struct SwitchingFactory {
        state: Arc<Mutex<FactoryState>>,
        switch_after: usize,
        codec_b: FourCc,
    }

    impl DecoderFactory for SwitchingFactory {
        fn open_decoder(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>> {
            self.state.lock().unwrap().loads.push(fmt.codec);
            Ok(Box::new(RecordingDecoder {
                fmt: fmt.clone(),
                state: self.state.clone(),
            }))
        }
        fn open_packetizer(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>> {
            let mut fmt_out = fmt.clone();
            fmt_out.packetized = true;
            Ok(Box::new(SwitchingPacketizer {
                fmt_in: fmt.clone(),
                fmt_out,
                seen: 0,
                switch_after: self.switch_after,
                codec_b: self.codec_b,
            }))
        }
    }

    // ========== 工具 ==========

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn wait_until(timeout: Mtime, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = mdate() + timeout;
        while mdate() < deadline {
            if cond() {
                return true;
            }
            msleep(10_000);
        }
        cond()
    }

    fn video_fmt_packetized() -> EsFormat {
        let mut fmt = EsFormat::video(FourCc::new(b"mpgv"), 320, 240);
        fmt.packetized = true;
        fmt
    }

    // ========== 用例 ==========

    #[test]
    fn test_flush_during_pause() {
        init_logs();
        let log = Arc::new(DecoderLog::default());
        let factory = Arc::new(StubFactory {
            log: log.clone(),
            emit: true,
            cc: false,
        });
        let resource = Arc::new(TestResource::default());
        let dec =
            InputDecoder::new(&video_fmt_packetized(), None, factory, resource).unwrap();

        dec.change_pause(true, mdate());
        for i in 0..5u8 {
            let mut b = Block::new(vec![i; 8]);
            b.pts = Some(i as Mtime * 40_000);
            dec.input_decode(b, false);
        }
        // 工作线程最迟会卡在首个输出单元的暂停屏障上
        msleep(50_000);

        dec.flush();
        assert_eq!(dec.fifo_size(), 0);
        {
            let blocks = log.blocks.lock().unwrap();
            let sentinels = blocks
                .iter()
                .filter(|f| *f & BLOCK_FLAG_CORE_FLUSH != 0)
                .count();
            assert_eq!(sentinels, 1, "解码器应当恰好收到一个哨兵块");
            assert!(
                blocks.last().unwrap() & BLOCK_FLAG_CORE_FLUSH != 0,
                "哨兵之后不应再有普通块"
            );
        }
        // 暂停 + flush：没有任何图像被提交显示
        assert_eq!(dec.stats().displayed_pictures, 0);

        // flush 幂等：再次调用后状态不变
        dec.flush();
        assert_eq!(dec.fifo_size(), 0);
        dec.delete();
    }

    #[test]
    fn test_format_change_restarts_decoder() {
        init_logs();
        let state = Arc::new(Mutex::new(FactoryState::default()));
        let factory = Arc::new(SwitchingFactory {
            state: state.clone(),
            switch_after: 2,
            codec_b: FourCc::new(b"hevc"),
        });
        let resource = Arc::new(TestResource::default());
        // 未打包的输入：装上打包器前置级
        let fmt = EsFormat::video(FourCc::new(b"h264"), 320, 240);
        let dec = InputDecoder::new(&fmt, None, factory, resource).unwrap();

        for i in 0..4u8 {
            let mut b = Block::new(vec![i; 4]);
            b.pts = Some(i as Mtime * 40_000);
            dec.input_decode(b, false);
        }
        dec.drain();

        let h264 = FourCc::new(b"h264");
        let hevc = FourCc::new(b"hevc");
        assert!(wait_until(2 * CLOCK_FREQ, || {
            let st = state.lock().unwrap();
            st.drains.contains(&h264) && st.drains.contains(&hevc)
        }));

        let st = state.lock().unwrap();
        // 先用旧编码加载，格式变化后重建
        assert_eq!(st.loads, vec![h264, hevc]);
        // 块流从未乱序：前两块走旧解码器，后两块走新解码器
        assert_eq!(
            st.sequence,
            vec![(h264, 0), (h264, 1), (hevc, 2), (hevc, 3)]
        );
        drop(st);
        dec.delete();
    }

    #[test]
    fn test_preroll_discards_until_watermark() {
        let log = Arc::new(DecoderLog::default());
        let factory = Arc::new(StubFactory {
            log: log.clone(),
            emit: true,
            cc: false,
        });
        let vout = new_test_vout();
        let resource = Arc::new(TestResource {
            vout: Mutex::new(Some(vout.clone())),
            aout_log: None,
        });
        let sys = Arc::new(SystemClock::new());
        sys.set_origin(0, mdate() + 500_000);
        let clock: Arc<dyn InputClock> = sys;

        let dec =
            InputDecoder::new(&video_fmt_packetized(), Some(clock), factory, resource).unwrap();

        let mut b1 = Block::new(vec![1; 8]);
        b1.pts = Some(0);
        b1.flags = BLOCK_FLAG_PREROLL;
        dec.input_decode(b1, false);

        let mut b2 = Block::new(vec![2; 8]);
        b2.pts = Some(100_000);
        dec.input_decode(b2, false);

        assert!(wait_until(2 * CLOCK_FREQ, || dec.stats().decoded == 2));
        msleep(30_000);

        // 水位线之前的帧被静默丢弃（不计丢失），之后的帧在堆中等待显示
        assert!(!vout.is_empty(), "水位线之后的帧应当提交到输出");
        assert_eq!(dec.stats().lost_pictures, 0);
        dec.delete();
    }

    #[test]
    fn test_drain_flushes_audio_sink() {
        let log = Arc::new(DecoderLog::default());
        let factory = Arc::new(StubFactory {
            log: log.clone(),
            emit: true,
            cc: false,
        });
        let aout_log = Arc::new(AoutLog::default());
        let resource = Arc::new(TestResource {
            vout: Mutex::new(None),
            aout_log: Some(aout_log.clone()),
        });
        let sys = Arc::new(SystemClock::new());
        sys.set_origin(0, mdate());
        let clock: Arc<dyn InputClock> = sys;

        let mut fmt = EsFormat::audio(FourCc::new(b"mpga"), 48_000, 2);
        fmt.packetized = true;
        let dec = InputDecoder::new(&fmt, Some(clock), factory, resource).unwrap();

        let mut b = Block::new(vec![0; 8]);
        b.pts = Some(0);
        dec.input_decode(b, false);
        assert!(wait_until(2 * CLOCK_FREQ, || {
            dec.stats().played_abuffers == 1
        }));

        dec.drain();
        assert!(wait_until(2 * CLOCK_FREQ, || dec.is_empty()));
        // 排空：解码器收到一次空输入，音频输出以等待方式清空
        assert_eq!(log.drains.load(Ordering::SeqCst), 1);
        assert!(aout_log.flush_wait.load(Ordering::SeqCst) >= 1);

        dec.delete();
        assert!(aout_log.flush_nowait.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_wait_first_frame_handshake() {
        let log = Arc::new(DecoderLog::default());
        let factory = Arc::new(StubFactory {
            log: log.clone(),
            emit: true,
            cc: false,
        });
        let vout = new_test_vout();
        let resource = Arc::new(TestResource {
            vout: Mutex::new(Some(vout.clone())),
            aout_log: None,
        });
        let sys = Arc::new(SystemClock::new());
        sys.set_origin(0, mdate());
        let clock: Arc<dyn InputClock> = sys;

        let dec =
            InputDecoder::new(&video_fmt_packetized(), Some(clock), factory, resource).unwrap();

        dec.start_wait();
        let mut b1 = Block::new(vec![1; 8]);
        b1.pts = Some(0);
        dec.input_decode(b1, false);
        let mut b2 = Block::new(vec![2; 8]);
        b2.pts = Some(40_000);
        dec.input_decode(b2, false);

        // 首帧强制放行后第二帧置起 has_data，wait 返回
        dec.wait();
        assert!(dec.stats().decoded >= 1);

        dec.stop_wait();
        assert!(wait_until(2 * CLOCK_FREQ, || dec.stats().decoded == 2));
        dec.delete();
    }

    #[test]
    fn test_cc_channel_lifecycle() {
        let log = Arc::new(DecoderLog::default());
        let factory = Arc::new(StubFactory {
            log: log.clone(),
            emit: true,
            cc: true,
        });
        let resource = Arc::new(TestResource::default());
        let dec =
            InputDecoder::new(&video_fmt_packetized(), None, factory, resource).unwrap();

        // 通道存在性在首个 CC 块被提取后可见
        let mut b = Block::new(vec![1; 8]);
        b.pts = Some(0);
        dec.input_decode(b, false);
        assert!(wait_until(2 * CLOCK_FREQ, || dec.is_cc_present()[0]));

        assert!(!dec.get_cc_state(0));
        dec.set_cc_state(true, 0).unwrap();
        assert!(dec.get_cc_state(0));
        // 未通告的通道不可开启
        assert!(dec.set_cc_state(true, 2).is_err());

        let mut b = Block::new(vec![2; 8]);
        b.pts = Some(40_000);
        dec.input_decode(b, false);

        dec.set_cc_state(false, 0).unwrap();
        assert!(!dec.get_cc_state(0));
        dec.delete();
    }

    #[test]
    fn test_decoder_load_failure_keeps_draining_fifo() {
        struct FailingFactory;
        impl DecoderFactory for FailingFactory {
            fn open_decoder(&self, fmt: &EsFormat) -> Result<Box<dyn DecoderModule>> {
                Err(CoreError::DecoderLoadError(format!("{}", fmt.codec)))
            }
            fn open_packetizer(&self, _fmt: &EsFormat) -> Result<Box<dyn DecoderModule>> {
                Err(CoreError::Other("没有可用的打包器".to_string()))
            }
        }

        let resource = Arc::new(TestResource::default());
        let dec = InputDecoder::new(
            &video_fmt_packetized(),
            None,
            Arc::new(FailingFactory),
            resource,
        )
        .unwrap();
        assert!(dec.has_error());

        // 错误状态下仍然消费 FIFO
        for i in 0..3u8 {
            dec.input_decode(Block::new(vec![i; 8]), false);
        }
        assert!(wait_until(2 * CLOCK_FREQ, || dec.fifo_size() == 0));
        assert_eq!(dec.stats().decoded, 0);
        dec.delete();
    }
}
