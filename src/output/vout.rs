use crate::core::{mdate, msleep, mwait, AspectRatio, Mtime, PixelFormat, Result, SubpictureKind};
use crate::output::heap::{PictureDesc, PictureHeap, PictureId, PictureStatus, SpuDesc, SpuHeap, SpuId};
use crate::output::sink::{DisplaySink, Font, PictureView, ThreadStatus, YuvConverter, TEXT_OUTLINED, TEXT_TRANSPARENT};
use crate::output::surface::{PicArea, RenderSurface, SurfaceConfig};
use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}

/// 渲染提前窗口：显示时间超前当前时间超过该值时本轮不渲染（约 100ms）
pub const VOUT_DISPLAY_DELAY: Mtime = 100_000;
/// 无图像可显示时的空转睡眠（约 20ms）
pub const VOUT_IDLE_SLEEP: Mtime = 20_000;
/// FPS 统计窗口：最近 N 次显示时间
pub const VOUT_FPS_SAMPLES: usize = 20;

// ============= 变更位图 =============

/// 伽马值变化，需要重建转换表
pub const VOUT_GAMMA_CHANGE: u32 = 1 << 0;
/// 灰度/彩色切换，需要重建转换表
pub const VOUT_GRAYSCALE_CHANGE: u32 = 1 << 1;
/// 信息叠加层开关
pub const VOUT_INFO_CHANGE: u32 = 1 << 2;
/// 界面条开关
pub const VOUT_INTF_CHANGE: u32 = 1 << 3;
/// 缩放开关
pub const VOUT_SCALE_CHANGE: u32 = 1 << 4;
/// 禁止送显（持续性状态位，不会被确认清除）
pub const VOUT_NODISPLAY_CHANGE: u32 = 1 << 5;

// 输出线程与后端共同认识的全部变更位
const VOUT_KNOWN_CHANGES: u32 = VOUT_GAMMA_CHANGE
    | VOUT_GRAYSCALE_CHANGE
    | VOUT_INFO_CHANGE
    | VOUT_INTF_CHANGE
    | VOUT_SCALE_CHANGE
    | VOUT_NODISPLAY_CHANGE;

// 变更锁保护的运行参数
struct VoutState {
    die: bool,
    active: bool,
    changes: u32,
    gamma: f32,
    grayscale: bool,
    info: bool,
    interface: bool,
    scale: bool,
    pause_date: Option<Mtime>,
}

struct VoutShared {
    pictures: PictureHeap,
    spus: SpuHeap,
    change: Mutex<VoutState>,
    status: AtomicU8,
    error: AtomicBool,
    displayed: AtomicU64,
    lost: AtomicU64,
}

/// 视频输出 - 拥有图像/字幕缓冲堆与显示线程
///
/// 生产者（解码器属主线程）通过本结构在堆中预留图像、填充数据、
/// 提交显示请求与显示时间；输出线程独立地按时间戳顺序消费 Ready
/// 图像，渲染并送显。
pub struct VideoOutput {
    shared: Arc<VoutShared>,
    thread: Option<JoinHandle<()>>,
}

impl VideoOutput {
    /// 创建视频输出线程并阻塞等待其就绪
    pub fn new(
        sink: Box<dyn DisplaySink>,
        converter: Box<dyn YuvConverter>,
        font: Box<dyn Font>,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        info!("{} 🖥️ 创建视频输出线程: {}x{}", log_ctx(), width, height);

        let shared = Arc::new(VoutShared {
            pictures: PictureHeap::new(),
            spus: SpuHeap::new(),
            change: Mutex::new(VoutState {
                die: false,
                active: false,
                changes: 0,
                gamma: 1.0,
                grayscale: false,
                info: false,
                interface: false,
                scale: false,
                pause_date: None,
            }),
            status: AtomicU8::new(ThreadStatus::Create as u8),
            error: AtomicBool::new(false),
            displayed: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        });

        let config = SurfaceConfig::new(width, height);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);

        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("video output".to_string())
            .spawn(move || run_thread(worker_shared, sink, converter, font, config, ready_tx))
            .map_err(|e| crate::core::CoreError::Other(format!("创建视频输出线程失败: {}", e)))?;

        // 等待线程完成初始化（显示后端、转换表、渲染表面）
        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("{} ✅ 视频输出线程就绪", log_ctx());
                Ok(Self {
                    shared,
                    thread: Some(thread),
                })
            }
            Ok(Err(reason)) => {
                let _ = thread.join();
                error!("{} ❌ 视频输出初始化失败: {}", log_ctx(), reason);
                Err(crate::core::CoreError::DisplayError(reason))
            }
            Err(_) => {
                let _ = thread.join();
                Err(crate::core::CoreError::DisplayError(
                    "视频输出线程异常退出".to_string(),
                ))
            }
        }
    }

    /// 线程生命周期状态（异步观测）
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.shared.status.load(Ordering::SeqCst))
    }

    /// 输出线程是否已进入错误状态
    pub fn has_error(&self) -> bool {
        self.shared.error.load(Ordering::SeqCst)
    }

    // ========== 图像堆操作（生产者侧） ==========

    /// 在堆中预留一张图像
    pub fn create_picture(
        &self,
        format: PixelFormat,
        width: usize,
        height: usize,
    ) -> Result<PictureId> {
        self.shared.pictures.create(format, width, height)
    }

    /// 放弃一张构建中的图像
    pub fn destroy_picture(&self, id: PictureId) {
        self.shared.pictures.destroy(id);
    }

    /// 提交显示请求（两步提交之一）
    pub fn display_picture(&self, id: PictureId) {
        self.shared.pictures.display(id);
    }

    /// 设置显示时间（两步提交之一）
    pub fn date_picture(&self, id: PictureId, date: Mtime) {
        self.shared.pictures.date(id, date);
    }

    pub fn link_picture(&self, id: PictureId) {
        self.shared.pictures.link(id);
    }

    pub fn unlink_picture(&self, id: PictureId) {
        self.shared.pictures.unlink(id);
    }

    /// 设置画幅与矩阵系数
    pub fn configure_picture(&self, id: PictureId, aspect: AspectRatio, matrix: u32) {
        self.shared.pictures.configure(id, aspect, matrix);
    }

    /// 拷入平面数据
    pub fn write_picture(&self, id: PictureId, data: &[u8]) {
        self.shared.pictures.write(id, data);
    }

    /// 查询图像状态（诊断用）
    pub fn picture_status(&self, id: PictureId) -> PictureStatus {
        self.shared.pictures.status(id)
    }

    // ========== 字幕堆操作 ==========

    pub fn register_spu_channel(&self) -> usize {
        self.shared.spus.register_channel()
    }

    pub fn create_spu(&self, kind: SubpictureKind, size: usize) -> Result<SpuId> {
        self.shared.spus.create(kind, size)
    }

    pub fn write_spu(&self, id: SpuId, payload: &[u8]) {
        self.shared.spus.write(id, payload);
    }

    pub fn date_spu(&self, id: SpuId, begin: Mtime, end: Mtime) {
        self.shared.spus.set_dates(id, begin, end);
    }

    pub fn set_spu_channel(&self, id: SpuId, channel: usize, order: u64) {
        self.shared.spus.set_channel(id, channel, order);
    }

    pub fn display_spu(&self, id: SpuId) {
        self.shared.spus.display(id);
    }

    pub fn destroy_spu(&self, id: SpuId) {
        self.shared.spus.destroy(id);
    }

    /// 丢弃某通道的全部待显示字幕
    pub fn flush_spu_channel(&self, channel: usize) {
        let dropped = self.shared.spus.flush_channel(channel);
        if dropped > 0 {
            debug!("🗑️ 清空字幕通道 {}: {} 个单元", channel, dropped);
        }
    }

    // ========== 调度操作（属主线程侧） ==========

    /// 丢弃显示时间不早于 date 的 Ready 图像（速率变化等场景）
    pub fn flush(&self, date: Mtime) {
        let dropped = self.shared.pictures.flush(date);
        if dropped > 0 {
            debug!("🗑️ 视频输出丢弃 {} 张过期帧（date >= {}）", dropped, date);
        }
    }

    /// 暂停/恢复。恢复时把 Ready 图像的显示时间平移暂停时长，
    /// 保证暂停期间的帧在恢复后仍按原相对节奏显示。
    pub fn change_pause(&self, paused: bool, date: Mtime) {
        let mut state = self.shared.change.lock().unwrap();
        if paused {
            state.pause_date = Some(date);
        } else if let Some(pause_date) = state.pause_date.take() {
            self.shared.pictures.shift_dates(date - pause_date);
        }
    }

    /// 逐帧步进：让最早的 Ready 图像立即到期，返回步进时长
    pub fn next_picture(&self) -> Option<Mtime> {
        self.shared.pictures.force_earliest(mdate())
    }

    /// 是否没有待显示的图像
    pub fn is_empty(&self) -> bool {
        self.shared.pictures.is_empty()
    }

    /// 读取并清零 (已显示, 已丢失) 统计
    pub fn get_reset_statistics(&self) -> (u64, u64) {
        (
            self.shared.displayed.swap(0, Ordering::SeqCst),
            self.shared.lost.swap(0, Ordering::SeqCst),
        )
    }

    // ========== 运行参数变更 ==========

    pub fn set_gamma(&self, gamma: f32) {
        let mut state = self.shared.change.lock().unwrap();
        state.gamma = gamma;
        state.changes |= VOUT_GAMMA_CHANGE;
    }

    pub fn set_grayscale(&self, grayscale: bool) {
        let mut state = self.shared.change.lock().unwrap();
        state.grayscale = grayscale;
        state.changes |= VOUT_GRAYSCALE_CHANGE;
    }

    pub fn set_info(&self, info: bool) {
        let mut state = self.shared.change.lock().unwrap();
        state.info = info;
        state.changes |= VOUT_INFO_CHANGE;
    }

    pub fn set_interface(&self, interface: bool) {
        let mut state = self.shared.change.lock().unwrap();
        state.interface = interface;
        state.changes |= VOUT_INTF_CHANGE;
    }

    pub fn set_scale(&self, scale: bool) {
        let mut state = self.shared.change.lock().unwrap();
        state.scale = scale;
        state.changes |= VOUT_SCALE_CHANGE;
    }

    /// 开关送显（置位 VOUT_NODISPLAY_CHANGE 持续性状态位）
    pub fn set_display_enabled(&self, enabled: bool) {
        let mut state = self.shared.change.lock().unwrap();
        if enabled {
            state.changes &= !VOUT_NODISPLAY_CHANGE;
        } else {
            state.changes |= VOUT_NODISPLAY_CHANGE;
        }
    }

    /// 直接置位变更位。任何不被输出线程或显示后端认领的位
    /// 都会使输出线程以致命错误终止。
    pub fn request_change(&self, bits: u32) {
        let mut state = self.shared.change.lock().unwrap();
        state.changes |= bits;
    }

    /// 请求输出线程退出并等待其结束
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.thread.is_none() {
            return;
        }
        info!("{} ⏹️ 停止视频输出线程", log_ctx());
        {
            let mut state = self.shared.change.lock().unwrap();
            state.die = true;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!("{} ✅ 视频输出线程已结束", log_ctx());
    }
}

impl Drop for VideoOutput {
    fn drop(&mut self) {
        if self.thread.is_some() {
            warn!("{} ⚠ VideoOutput 被 drop 但未调用 destroy()，尝试优雅停止", log_ctx());
            self.shutdown();
        }
    }
}

// ============= 输出线程主体 =============

fn run_thread(
    shared: Arc<VoutShared>,
    mut sink: Box<dyn DisplaySink>,
    mut converter: Box<dyn YuvConverter>,
    font: Box<dyn Font>,
    mut config: SurfaceConfig,
    ready_tx: crossbeam_channel::Sender<std::result::Result<(), String>>,
) {
    // ========== 初始化 ==========
    shared.status.store(ThreadStatus::Start as u8, Ordering::SeqCst);

    if let Err(e) = sink.init(&mut config) {
        shared.status.store(ThreadStatus::Error as u8, Ordering::SeqCst);
        shared.error.store(true, Ordering::SeqCst);
        let _ = ready_tx.send(Err(format!("显示后端初始化失败: {}", e)));
        return;
    }
    debug!(
        "{} 实际表面配置: {}x{},{} ({} 字节/像素, {} 字节/行)",
        log_ctx(),
        config.width,
        config.height,
        config.screen_depth,
        config.bytes_per_pixel,
        config.bytes_per_line
    );

    {
        let state = shared.change.lock().unwrap();
        if let Err(e) = converter.rebuild_tables(state.gamma, state.grayscale) {
            shared.status.store(ThreadStatus::Error as u8, Ordering::SeqCst);
            shared.error.store(true, Ordering::SeqCst);
            sink.destroy();
            let _ = ready_tx.send(Err(format!("转换表初始化失败: {}", e)));
            return;
        }
    }

    let mut surface = RenderSurface::new(config);
    {
        let mut state = shared.change.lock().unwrap();
        state.active = true;
    }
    shared.status.store(ThreadStatus::Ready as u8, Ordering::SeqCst);
    let _ = ready_tx.send(Ok(()));
    info!("{} 🎬 视频输出线程启动", log_ctx());

    // FPS 统计环
    let mut fps_samples = [0 as Mtime; VOUT_FPS_SAMPLES];
    let mut fps_count: usize = 0;

    // ========== 主循环 ==========
    let mut fatal = false;
    let mut state = shared.change.lock().unwrap();
    loop {
        if state.die || fatal {
            break;
        }

        let current_date = mdate();
        let mut pic: Option<(PictureId, PictureDesc)> = None;
        let mut display_date: Option<Mtime> = None;

        // 选出显示时间最小的就绪帧（只涉及 Ready 槽位，扫描开销很小）
        if let Some((id, date, desc)) = shared.pictures.select_ready() {
            if date < current_date {
                // 迟到帧：按引用计数移出堆，立即重试，不睡眠
                let status = shared.pictures.mark_done(id);
                shared.lost.fetch_add(1, Ordering::SeqCst);
                warn!(
                    "{} ⏱️ 迟到帧被跳过: 落后 {} µs，槽位转入 {:?}",
                    log_ctx(),
                    current_date - date,
                    status
                );
                continue;
            } else if date > current_date + VOUT_DISPLAY_DELAY {
                // 显示时间太远：本轮当作没有可渲染的帧，状态保持 Ready
            } else {
                fps_samples[fps_count % VOUT_FPS_SAMPLES] = date;
                fps_count += 1;
                pic = Some((id, desc));
                display_date = Some(date);
            }
        }

        // 字幕：显示窗口覆盖本帧显示时间（无帧时取当前时间）的就绪单元
        let spu = shared
            .spus
            .select_ready(display_date.unwrap_or(current_date));

        // ========== 渲染 ==========
        let mut b_display = false;
        if let Some((id, desc)) = &pic {
            b_display = state.active;
            if b_display {
                let area = surface.set_picture(
                    Some((desc.width, desc.height, desc.aspect)),
                    state.scale,
                );
                render_picture(&mut surface, converter.as_mut(), desc, area);
                if state.info {
                    render_picture_info(&mut surface, font.as_ref(), desc, area, &fps_samples, fps_count);
                    render_info(&mut surface, font.as_ref(), &shared.pictures);
                }
            }

            // 从堆中移出图像
            shared.pictures.mark_done(*id);
            shared.displayed.fetch_add(1, Ordering::SeqCst);

            if b_display && state.interface {
                render_interface(&mut surface, font.as_ref());
            }
            if let Some((sid, sdesc)) = &spu {
                if b_display {
                    render_spu(&mut surface, font.as_ref(), sdesc);
                }
                shared.spus.expire(*sid, display_date.unwrap_or(current_date));
            }
        } else if let Some((sid, sdesc)) = &spu {
            // 只有字幕
            b_display = state.active;
            if b_display {
                surface.set_picture(None, state.scale);
                if state.info {
                    render_info(&mut surface, font.as_ref(), &shared.pictures);
                }
                if state.interface {
                    render_interface(&mut surface, font.as_ref());
                }
                render_spu(&mut surface, font.as_ref(), sdesc);
            }
            shared.spus.expire(*sid, current_date);
        } else if state.active && state.interface {
            // 空闲画面：只在界面可见时绘制
            b_display = true;
            surface.set_picture(None, state.scale);
            render_idle(&mut surface, font.as_ref());
            render_interface(&mut surface, font.as_ref());
        }

        // ========== 睡眠与送显 ==========
        // 睡眠期间释放变更锁，允许运行参数被修改
        drop(state);
        match display_date {
            Some(date) => mwait(date),
            None => msleep(VOUT_IDLE_SLEEP),
        }
        state = shared.change.lock().unwrap();

        // 醒来后立即送显并交换缓冲
        if b_display && state.changes & VOUT_NODISPLAY_CHANGE == 0 {
            if let Err(e) = sink.display(surface.back_data(), surface.config()) {
                error!("{} ❌ 送显失败: {}", log_ctx(), e);
                fatal = true;
                continue;
            }
            surface.swap();
        }

        // ========== 事件泵与变更管理 ==========
        let mut changes = state.changes;
        let sink_fatal = sink.manage(&mut changes).is_err();
        state.changes = changes;
        if sink_fatal || manage(&mut state, converter.as_mut()).is_err() {
            // 未被认领的变更位或后端致命错误：立即终止线程
            fatal = true;
        }
    }
    let died = state.die;
    drop(state);

    // ========== 错误循环：等待销毁请求 ==========
    if fatal && !died {
        shared.error.store(true, Ordering::SeqCst);
        shared.status.store(ThreadStatus::Error as u8, Ordering::SeqCst);
        error!("{} ❌ 视频输出线程进入错误状态，等待销毁", log_ctx());
        loop {
            {
                let state = shared.change.lock().unwrap();
                if state.die {
                    break;
                }
            }
            msleep(VOUT_IDLE_SLEEP);
        }
    }

    // ========== 线程结束 ==========
    shared.status.store(ThreadStatus::End as u8, Ordering::SeqCst);
    shared.pictures.release_all();
    shared.spus.release_all();
    sink.destroy();
    shared.status.store(ThreadStatus::Over as u8, Ordering::SeqCst);
    info!("{} 🛑 视频输出线程退出", log_ctx());
}

// 处理变更位：伽马/灰度重建转换表，其余确认后清除；
// 残留的未知位视为未授权变更，返回错误使线程终止
fn manage(state: &mut VoutState, converter: &mut dyn YuvConverter) -> Result<()> {
    if state.changes & (VOUT_GAMMA_CHANGE | VOUT_GRAYSCALE_CHANGE) != 0 {
        converter.rebuild_tables(state.gamma, state.grayscale)?;
    }
    state.changes &= !(VOUT_GAMMA_CHANGE
        | VOUT_GRAYSCALE_CHANGE
        | VOUT_INFO_CHANGE
        | VOUT_INTF_CHANGE
        | VOUT_SCALE_CHANGE);

    let leftover = state.changes & !VOUT_NODISPLAY_CHANGE;
    if leftover != 0 {
        error!("视频输出线程收到未授权的变更位: {:#x}", leftover);
        return Err(crate::core::CoreError::UnauthorizedChange(leftover));
    }
    debug_assert_eq!(state.changes & !VOUT_KNOWN_CHANGES, 0);
    Ok(())
}

// ============= 渲染函数 =============

// 把选中的图像经转换器写入表面子矩形
fn render_picture(
    surface: &mut RenderSurface,
    converter: &mut dyn YuvConverter,
    desc: &PictureDesc,
    area: PicArea,
) {
    let config = *surface.config();
    let offset = area.y * config.bytes_per_line + area.x * config.bytes_per_pixel;

    let data = desc.data.lock().unwrap();
    let (y_off, u_off, v_off) = desc.format.plane_offsets(desc.width, desc.height);
    let view = PictureView {
        format: desc.format,
        width: desc.width,
        height: desc.height,
        chroma_width: desc.chroma_width,
        matrix_coefficients: desc.matrix_coefficients,
        y: &data[y_off..u_off],
        u: &data[u_off..v_off],
        v: &data[v_off..],
    };
    converter.convert(
        &mut surface.back_data_mut()[offset..],
        config.bytes_per_line,
        config.bytes_per_pixel,
        &view,
        area.width,
        area.height,
    );
}

// 对齐方式：-1 左/上，0 居中，1 右/下
fn print_text(
    surface: &mut RenderSurface,
    font: &dyn Font,
    mut x: usize,
    mut y: usize,
    halign: i32,
    valign: i32,
    text: &str,
    style: u32,
) {
    let (text_width, text_height) = font.text_size(text, style);
    let config = *surface.config();

    match halign {
        0 => x = x.saturating_sub(text_width / 2),
        1 => x = x.saturating_sub(text_width),
        _ => {}
    }
    match valign {
        0 => y = y.saturating_sub(text_height / 2),
        1 => y = y.saturating_sub(text_height),
        _ => {}
    }

    // 越界裁剪：完全放不下就不画
    if x + text_width > config.width || y + text_height > config.height {
        debug!("文本 '{}' 超出表面范围，跳过", text);
        return;
    }

    surface.set_area(x, y, text_width, text_height);
    let offset = y * config.bytes_per_line + x * config.bytes_per_pixel;
    font.print(
        &mut surface.back_data_mut()[offset..],
        config.bytes_per_line,
        config.bytes_per_pixel,
        text,
        style,
    );
}

// 右上角 FPS、右下角图像信息
fn render_picture_info(
    surface: &mut RenderSurface,
    font: &dyn Font,
    desc: &PictureDesc,
    area: PicArea,
    fps_samples: &[Mtime; VOUT_FPS_SAMPLES],
    fps_count: usize,
) {
    let config = *surface.config();

    if fps_count > VOUT_FPS_SAMPLES {
        let newest = fps_samples[(fps_count - 1) % VOUT_FPS_SAMPLES];
        let oldest = fps_samples[fps_count % VOUT_FPS_SAMPLES];
        if newest > oldest {
            let fps = VOUT_FPS_SAMPLES as f64 * 1_000_000.0 / (newest - oldest) as f64;
            let text = format!("{:.2} fps", fps);
            print_text(surface, font, config.width, 0, 1, -1, &text, TEXT_TRANSPARENT);
        }
    }

    let format = match desc.format {
        PixelFormat::Yuv420 => "4:2:0",
        PixelFormat::Yuv422 => "4:2:2",
        PixelFormat::Yuv444 => "4:4:4",
    };
    let text = format!(
        "{} {}x{} ({}) -> {}x{}+{}+{}",
        format,
        desc.width,
        desc.height,
        desc.aspect.as_str(),
        area.width,
        area.height,
        area.x,
        area.y
    );
    print_text(
        surface,
        font,
        config.width,
        config.height,
        1,
        1,
        &text,
        TEXT_TRANSPARENT,
    );
}

// 左下角堆占用信息
fn render_info(surface: &mut RenderSurface, font: &dyn Font, pictures: &PictureHeap) {
    let (reserved, ready) = pictures.occupancy();
    let config = *surface.config();
    let text = format!(
        "pic: {}/{}/{}",
        reserved,
        ready,
        crate::output::heap::VOUT_MAX_PICTURES
    );
    print_text(surface, font, 0, config.height, -1, 1, &text, TEXT_TRANSPARENT);
}

// 底部界面条：填充背景后绘制两行帮助文本
fn render_interface(surface: &mut RenderSurface, font: &dyn Font) {
    let line1 = "[空格] 暂停   [i] 信息   [s] 缩放   [g/G] 伽马";
    let line2 = "[+/-] 音量    [m] 静音   [q] 退出";
    let style = TEXT_OUTLINED | TEXT_TRANSPARENT;

    let (width1, height1) = font.text_size(line1, style);
    let (width2, height2) = font.text_size(line2, style);
    let total_height = height1 + height2;
    let config = *surface.config();
    if total_height >= config.height {
        return;
    }
    let top = config.height - total_height;

    // 背景
    let from = top * config.bytes_per_line;
    for byte in surface.back_data_mut()[from..].iter_mut() {
        *byte = 0x33;
    }

    if width1 < config.width {
        let offset = top * config.bytes_per_line;
        font.print(
            &mut surface.back_data_mut()[offset..],
            config.bytes_per_line,
            config.bytes_per_pixel,
            line1,
            style,
        );
    }
    if width2 < config.width {
        let offset = (top + height1) * config.bytes_per_line;
        font.print(
            &mut surface.back_data_mut()[offset..],
            config.bytes_per_line,
            config.bytes_per_pixel,
            line2,
            style,
        );
    }

    surface.set_area(0, top, config.width, total_height);
}

// 空闲画面
fn render_idle(surface: &mut RenderSurface, font: &dyn Font) {
    let config = *surface.config();
    print_text(
        surface,
        font,
        config.width / 2,
        config.height / 2,
        0,
        0,
        "无信号",
        TEXT_TRANSPARENT,
    );
}

// 字幕：文本单元画在底部居中，位图单元暂不支持
fn render_spu(surface: &mut RenderSurface, font: &dyn Font, desc: &SpuDesc) {
    match desc.kind {
        SubpictureKind::Text => {
            let text = String::from_utf8_lossy(&desc.payload).into_owned();
            let text = text.trim_end_matches('\0');
            if text.is_empty() {
                return;
            }
            let config = *surface.config();
            print_text(
                surface,
                font,
                config.width / 2,
                config.height - 10,
                0,
                1,
                text,
                TEXT_OUTLINED | TEXT_TRANSPARENT,
            );
        }
        SubpictureKind::Bitmap => {
            debug!("跳过位图字幕（当前仅支持文本字幕）");
        }
    }
}
