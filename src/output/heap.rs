use crate::core::{AspectRatio, CoreError, Mtime, PixelFormat, Result, SubpictureKind};
use log::{debug, warn};
use std::sync::{Arc, Mutex};

/// 缓冲堆容量（每类单元的槽位数）
pub const VOUT_MAX_PICTURES: usize = 16;

// ============= 图像堆 =============

/// 图像槽位状态
///
/// 预留的图像经过 display + date 两步提交后才会变为 Ready：
/// 两步的先后顺序不限，各自把 Reserved 推进到对应的中间状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureStatus {
    /// 空槽位，不占用像素内存
    Free,
    /// 已被某个生产者预留，像素数据由该生产者填充
    Reserved,
    /// 已预留且已设置显示时间
    ReservedDated,
    /// 已预留且已请求显示
    ReservedDisp,
    /// 可供输出线程显示
    Ready,
    /// 已显示，等待引用归零
    Displayed,
    /// 已废弃，像素内存保留待复用
    Destroyed,
}

/// 图像句柄 - 堆内槽位索引
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureId(pub(crate) usize);

/// 图像几何与调度信息快照（输出线程渲染时使用）
#[derive(Debug, Clone)]
pub struct PictureDesc {
    pub format: PixelFormat,
    pub width: usize,
    pub height: usize,
    pub chroma_width: usize,
    pub display_x: usize,
    pub display_y: usize,
    pub display_width: usize,
    pub display_height: usize,
    pub aspect: AspectRatio,
    pub matrix_coefficients: u32,
    pub date: Mtime,
    pub data: Arc<Mutex<Vec<u8>>>,
}

struct PictureSlot {
    status: PictureStatus,
    format: Option<PixelFormat>,
    width: usize,
    height: usize,
    chroma_width: usize,
    display_x: usize,
    display_y: usize,
    display_width: usize,
    display_height: usize,
    aspect: AspectRatio,
    matrix_coefficients: u32,
    date: Mtime,
    refcount: u32,
    // 像素内存的叶子锁：状态协议保证同一时刻只有一方访问，锁本身无竞争
    data: Arc<Mutex<Vec<u8>>>,
}

impl PictureSlot {
    fn empty() -> Self {
        Self {
            status: PictureStatus::Free,
            format: None,
            width: 0,
            height: 0,
            chroma_width: 0,
            display_x: 0,
            display_y: 0,
            display_width: 0,
            display_height: 0,
            aspect: AspectRatio::Square,
            matrix_coefficients: 1,
            date: 0,
            refcount: 0,
            data: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn reset_properties(&mut self, format: PixelFormat, width: usize, height: usize) {
        self.format = Some(format);
        self.width = width;
        self.height = height;
        self.chroma_width = format.chroma_width(width);
        self.display_x = 0;
        self.display_y = 0;
        self.display_width = width;
        self.display_height = height;
        self.aspect = AspectRatio::Square;
        self.matrix_coefficients = 1;
        self.date = 0;
        self.refcount = 0;
        self.status = PictureStatus::Reserved;
    }
}

/// 图像缓冲堆 - 固定容量的槽位数组
///
/// 堆级互斥锁只保护槽位状态；像素数据由槽位内的叶子锁保护，
/// 生产者填充 Reserved 槽位、输出线程读取 Ready 槽位时互不竞争。
pub struct PictureHeap {
    slots: Mutex<Vec<PictureSlot>>,
}

impl Default for PictureHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl PictureHeap {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(VOUT_MAX_PICTURES);
        for _ in 0..VOUT_MAX_PICTURES {
            slots.push(PictureSlot::empty());
        }
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// 在堆中预留一张图像
    ///
    /// 分配策略（单次扫描）：
    /// 1. 找到几何参数完全一致的 Destroyed 槽位则直接复用其像素内存；
    /// 2. 否则优先使用第一个 Free 槽位；
    /// 3. 没有 Free 槽位时回收第一个 Destroyed 槽位并按新尺寸重新分配；
    /// 4. 两者都没有则返回 HeapFull。
    pub fn create(&self, format: PixelFormat, width: usize, height: usize) -> Result<PictureId> {
        let mut slots = self.slots.lock().unwrap();

        let mut free_index = None;
        let mut destroyed_index = None;
        let mut reuse_index = None;
        for (index, slot) in slots.iter().enumerate() {
            match slot.status {
                PictureStatus::Destroyed => {
                    if slot.format == Some(format) && slot.width == width && slot.height == height
                    {
                        // 最优情况：内存尺寸一致，原地复用，无需任何分配
                        reuse_index = Some(index);
                        break;
                    }
                    if destroyed_index.is_none() {
                        destroyed_index = Some(index);
                    }
                }
                PictureStatus::Free => {
                    if free_index.is_none() {
                        free_index = Some(index);
                    }
                }
                _ => {}
            }
        }
        if let Some(index) = reuse_index {
            slots[index].reset_properties(format, width, height);
            return Ok(PictureId(index));
        }

        let index = match (free_index, destroyed_index) {
            (Some(index), _) => index,
            (None, Some(index)) => index,
            (None, None) => {
                warn!("图像缓冲堆已满");
                return Err(CoreError::HeapFull);
            }
        };

        let slot = &mut slots[index];
        let bytes = format.frame_bytes(width, height);
        {
            let mut data = slot.data.lock().unwrap();
            data.clear();
            data.resize(bytes, 0);
        }
        slot.reset_properties(format, width, height);
        Ok(PictureId(index))
    }

    /// 请求显示：display/date 两步提交之一
    pub fn display(&self, id: PictureId) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        match slot.status {
            PictureStatus::Reserved => slot.status = PictureStatus::ReservedDisp,
            PictureStatus::ReservedDated => slot.status = PictureStatus::Ready,
            status => debug!("图像槽位 {} 状态异常: {:?}（display 被忽略）", id.0, status),
        }
    }

    /// 设置显示时间：display/date 两步提交之一。
    /// 已设置过时间的槽位允许更新时间而不改变状态。
    pub fn date(&self, id: PictureId, date: Mtime) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        slot.date = date;
        match slot.status {
            PictureStatus::Reserved => slot.status = PictureStatus::ReservedDated,
            PictureStatus::ReservedDisp => slot.status = PictureStatus::Ready,
            PictureStatus::ReservedDated => {}
            status => debug!("图像槽位 {} 状态异常: {:?}（date 被忽略）", id.0, status),
        }
    }

    /// 放弃一张预留中的图像（构建中止时使用），像素内存保留待复用
    pub fn destroy(&self, id: PictureId) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        if !matches!(
            slot.status,
            PictureStatus::Reserved | PictureStatus::ReservedDated | PictureStatus::ReservedDisp
        ) {
            debug!("图像槽位 {} 状态异常: {:?}（destroy）", id.0, slot.status);
        }
        slot.status = PictureStatus::Destroyed;
    }

    /// 增加引用计数
    pub fn link(&self, id: PictureId) {
        let mut slots = self.slots.lock().unwrap();
        slots[id.0].refcount += 1;
    }

    /// 减少引用计数；Displayed 状态下归零时转入 Destroyed
    pub fn unlink(&self, id: PictureId) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        if slot.refcount == 0 {
            debug!("图像槽位 {} 引用计数已为 0", id.0);
        } else {
            slot.refcount -= 1;
        }
        if slot.refcount == 0 && slot.status == PictureStatus::Displayed {
            slot.status = PictureStatus::Destroyed;
        }
    }

    /// 设置画幅与矩阵系数（生产者在 Reserved 阶段调用）
    pub fn configure(&self, id: PictureId, aspect: AspectRatio, matrix_coefficients: u32) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        slot.aspect = aspect;
        slot.matrix_coefficients = matrix_coefficients;
    }

    /// 设置显示裁剪区域（默认整帧）
    pub fn set_crop(&self, id: PictureId, x: usize, y: usize, width: usize, height: usize) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        slot.display_x = x;
        slot.display_y = y;
        slot.display_width = width;
        slot.display_height = height;
    }

    /// 把平面数据拷入槽位（生产者在 Reserved 阶段调用）
    pub fn write(&self, id: PictureId, data: &[u8]) {
        let arc = {
            let slots = self.slots.lock().unwrap();
            slots[id.0].data.clone()
        };
        let mut buffer = arc.lock().unwrap();
        let len = buffer.len().min(data.len());
        buffer[..len].copy_from_slice(&data[..len]);
    }

    /// 查询槽位状态
    pub fn status(&self, id: PictureId) -> PictureStatus {
        self.slots.lock().unwrap()[id.0].status
    }

    /// 查询引用计数
    pub fn refcount(&self, id: PictureId) -> u32 {
        self.slots.lock().unwrap()[id.0].refcount
    }

    /// 选出显示时间最小的 Ready 图像（时间相同时取索引较小者）
    pub fn select_ready(&self) -> Option<(PictureId, Mtime, PictureDesc)> {
        let slots = self.slots.lock().unwrap();
        let mut best: Option<usize> = None;
        for (index, slot) in slots.iter().enumerate() {
            if slot.status == PictureStatus::Ready
                && best.map_or(true, |b| slot.date < slots[b].date)
            {
                best = Some(index);
            }
        }
        best.map(|index| {
            let slot = &slots[index];
            (
                PictureId(index),
                slot.date,
                PictureDesc {
                    format: slot.format.unwrap_or(PixelFormat::Yuv420),
                    width: slot.width,
                    height: slot.height,
                    chroma_width: slot.chroma_width,
                    display_x: slot.display_x,
                    display_y: slot.display_y,
                    display_width: slot.display_width,
                    display_height: slot.display_height,
                    aspect: slot.aspect,
                    matrix_coefficients: slot.matrix_coefficients,
                    date: slot.date,
                    data: slot.data.clone(),
                },
            )
        })
    }

    /// 把图像移出堆：有引用时转 Displayed，否则直接 Destroyed
    pub fn mark_done(&self, id: PictureId) -> PictureStatus {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        slot.status = if slot.refcount > 0 {
            PictureStatus::Displayed
        } else {
            PictureStatus::Destroyed
        };
        slot.status
    }

    /// 丢弃显示时间不早于 date 的 Ready 图像（速率变化后清理过期帧）
    pub fn flush(&self, date: Mtime) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let mut dropped = 0;
        for slot in slots.iter_mut() {
            if slot.status == PictureStatus::Ready && slot.date >= date {
                slot.status = if slot.refcount > 0 {
                    PictureStatus::Displayed
                } else {
                    PictureStatus::Destroyed
                };
                dropped += 1;
            }
        }
        dropped
    }

    /// 平移所有 Ready 图像的显示时间（暂停恢复时使用）
    pub fn shift_dates(&self, offset: Mtime) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.status == PictureStatus::Ready {
                slot.date += offset;
            }
        }
    }

    /// 把最早的 Ready 图像改为立即到期（逐帧步进）。
    /// 返回到下一张 Ready 图像的步进时长（没有下一张时为 0）。
    pub fn force_earliest(&self, now: Mtime) -> Option<Mtime> {
        let mut slots = self.slots.lock().unwrap();
        let mut first: Option<usize> = None;
        let mut second: Option<Mtime> = None;
        for (index, slot) in slots.iter().enumerate() {
            if slot.status != PictureStatus::Ready {
                continue;
            }
            match first {
                None => first = Some(index),
                Some(f) if slot.date < slots[f].date => {
                    second = Some(slots[f].date);
                    first = Some(index);
                }
                Some(_) => {
                    second = Some(second.map_or(slot.date, |s: Mtime| s.min(slot.date)));
                }
            }
        }
        first.map(|index| {
            let date = slots[index].date;
            slots[index].date = now;
            second.map_or(0, |s| (s - date).max(0))
        })
    }

    /// 是否没有待显示的图像
    pub fn is_empty(&self) -> bool {
        let slots = self.slots.lock().unwrap();
        !slots
            .iter()
            .any(|slot| slot.status == PictureStatus::Ready)
    }

    /// 统计 (预留中, 就绪) 槽位数量，供信息叠加层显示
    pub fn occupancy(&self) -> (usize, usize) {
        let slots = self.slots.lock().unwrap();
        let mut reserved = 0;
        let mut ready = 0;
        for slot in slots.iter() {
            match slot.status {
                PictureStatus::Reserved
                | PictureStatus::ReservedDated
                | PictureStatus::ReservedDisp => reserved += 1,
                PictureStatus::Ready => ready += 1,
                _ => {}
            }
        }
        (reserved, ready)
    }

    /// 释放所有槽位（输出线程结束时调用）
    pub fn release_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.status != PictureStatus::Free {
                slot.data.lock().unwrap().clear();
                *slot = PictureSlot::empty();
            }
        }
    }
}

// ============= 字幕堆 =============

/// 字幕槽位状态。预留 → 就绪只需一步 display，没有两步提交
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpuStatus {
    Free,
    Reserved,
    Ready,
    Destroyed,
}

/// 字幕句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpuId(pub(crate) usize);

/// 字幕单元快照
#[derive(Debug, Clone)]
pub struct SpuDesc {
    pub kind: SubpictureKind,
    pub begin_date: Mtime,
    pub end_date: Mtime,
    pub channel: usize,
    pub order: u64,
    pub payload: Vec<u8>,
}

struct SpuSlot {
    status: SpuStatus,
    kind: SubpictureKind,
    begin_date: Mtime,
    end_date: Mtime,
    channel: usize,
    order: u64,
    payload: Vec<u8>,
}

impl SpuSlot {
    fn empty() -> Self {
        Self {
            status: SpuStatus::Free,
            kind: SubpictureKind::Text,
            begin_date: 0,
            end_date: 0,
            channel: 0,
            order: 0,
            payload: Vec::new(),
        }
    }
}

/// 字幕缓冲堆
pub struct SpuHeap {
    slots: Mutex<Vec<SpuSlot>>,
    next_channel: Mutex<usize>,
}

impl Default for SpuHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SpuHeap {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(VOUT_MAX_PICTURES);
        for _ in 0..VOUT_MAX_PICTURES {
            slots.push(SpuSlot::empty());
        }
        Self {
            slots: Mutex::new(slots),
            next_channel: Mutex::new(0),
        }
    }

    /// 注册一条字幕通道，返回通道号
    pub fn register_channel(&self) -> usize {
        let mut next = self.next_channel.lock().unwrap();
        let channel = *next;
        *next += 1;
        channel
    }

    /// 预留一个字幕单元，分配策略与图像堆一致
    pub fn create(&self, kind: SubpictureKind, size: usize) -> Result<SpuId> {
        let mut slots = self.slots.lock().unwrap();

        let mut free_index = None;
        let mut destroyed_index = None;
        let mut reuse_index = None;
        for (index, slot) in slots.iter().enumerate() {
            match slot.status {
                SpuStatus::Destroyed => {
                    if slot.kind == kind && slot.payload.len() == size {
                        reuse_index = Some(index);
                        break;
                    }
                    if destroyed_index.is_none() {
                        destroyed_index = Some(index);
                    }
                }
                SpuStatus::Free => {
                    if free_index.is_none() {
                        free_index = Some(index);
                    }
                }
                _ => {}
            }
        }
        if let Some(index) = reuse_index {
            let slot = &mut slots[index];
            slot.status = SpuStatus::Reserved;
            slot.begin_date = 0;
            slot.end_date = 0;
            slot.order = 0;
            return Ok(SpuId(index));
        }

        let index = match (free_index, destroyed_index) {
            (Some(index), _) => index,
            (None, Some(index)) => index,
            (None, None) => {
                warn!("字幕缓冲堆已满");
                return Err(CoreError::HeapFull);
            }
        };

        let slot = &mut slots[index];
        slot.kind = kind;
        slot.payload.clear();
        slot.payload.resize(size, 0);
        slot.begin_date = 0;
        slot.end_date = 0;
        slot.channel = 0;
        slot.order = 0;
        slot.status = SpuStatus::Reserved;
        Ok(SpuId(index))
    }

    /// 写入负载数据（Reserved 阶段）
    pub fn write(&self, id: SpuId, payload: &[u8]) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        let len = slot.payload.len().min(payload.len());
        slot.payload[..len].copy_from_slice(&payload[..len]);
    }

    /// 设置显示时间窗口
    pub fn set_dates(&self, id: SpuId, begin: Mtime, end: Mtime) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        slot.begin_date = begin;
        slot.end_date = end;
    }

    /// 设置归属通道与序号
    pub fn set_channel(&self, id: SpuId, channel: usize, order: u64) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        slot.channel = channel;
        slot.order = order;
    }

    /// 解除预留标记，使单元可供显示
    pub fn display(&self, id: SpuId) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        if slot.status != SpuStatus::Reserved {
            debug!("字幕槽位 {} 状态异常: {:?}（display 被忽略）", id.0, slot.status);
            return;
        }
        slot.status = SpuStatus::Ready;
    }

    /// 放弃一个字幕单元
    pub fn destroy(&self, id: SpuId) {
        let mut slots = self.slots.lock().unwrap();
        slots[id.0].status = SpuStatus::Destroyed;
    }

    /// 查询槽位状态
    pub fn status(&self, id: SpuId) -> SpuStatus {
        self.slots.lock().unwrap()[id.0].status
    }

    /// 选出显示窗口已开始的字幕单元；多个候选时取序号最大者，
    /// 以支持重叠字幕的覆盖
    pub fn select_ready(&self, date: Mtime) -> Option<(SpuId, SpuDesc)> {
        let slots = self.slots.lock().unwrap();
        let mut best: Option<usize> = None;
        for (index, slot) in slots.iter().enumerate() {
            if slot.status != SpuStatus::Ready || slot.begin_date > date {
                continue;
            }
            match best {
                None => best = Some(index),
                Some(b) => {
                    let other = &slots[b];
                    if slot.order > other.order {
                        best = Some(index);
                    }
                }
            }
        }
        best.map(|index| {
            let slot = &slots[index];
            (
                SpuId(index),
                SpuDesc {
                    kind: slot.kind,
                    begin_date: slot.begin_date,
                    end_date: slot.end_date,
                    channel: slot.channel,
                    order: slot.order,
                    payload: slot.payload.clone(),
                },
            )
        })
    }

    /// 显示时间窗口结束后移出堆
    pub fn expire(&self, id: SpuId, date: Mtime) {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[id.0];
        if slot.status == SpuStatus::Ready && date >= slot.end_date {
            slot.status = SpuStatus::Destroyed;
        }
    }

    /// 丢弃某通道的所有待显示字幕（流分离时使用）
    pub fn flush_channel(&self, channel: usize) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let mut dropped = 0;
        for slot in slots.iter_mut() {
            if slot.status == SpuStatus::Ready && slot.channel == channel {
                slot.status = SpuStatus::Destroyed;
                dropped += 1;
            }
        }
        dropped
    }

    /// 释放所有槽位
    pub fn release_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            *slot = SpuSlot::empty();
        }
    }
}
