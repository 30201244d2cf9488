use crate::core::AspectRatio;
use serde::{Deserialize, Serialize};

/// 脏区列表的最大长度，溢出时并入最后一段
pub const VOUT_MAX_AREAS: usize = 8;

/// 表面配置 - 创建时给出期望值，显示后端可在 init 中覆盖
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceConfig {
    pub width: usize,
    pub height: usize,
    pub screen_depth: usize,
    pub bytes_per_pixel: usize,
    pub bytes_per_line: usize,
}

impl SurfaceConfig {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            screen_depth: 15,
            bytes_per_pixel: 2,
            bytes_per_line: width * 2,
        }
    }
}

/// 表面上的图像子矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PicArea {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// 计算图像在表面内的显示子矩形
///
/// 先尝试水平适配：宽度取表面与图像宽度的较小者并向下取整到 16 的
/// 倍数，高度按画幅标签推算；高度超出表面时改用垂直适配重算。
/// 宽度必须是 16 的倍数（转换器的对齐约定）。
pub fn compute_picture_area(
    config: &SurfaceConfig,
    pic_width: usize,
    pic_height: usize,
    aspect: AspectRatio,
    scale: bool,
) -> PicArea {
    if pic_width == 0 || pic_height == 0 {
        return PicArea::default();
    }

    let mut width = if scale || pic_width > config.width {
        config.width
    } else {
        pic_width
    };
    width = width / 16 * 16;
    let mut height = match aspect {
        AspectRatio::FourThirds => width * 3 / 4,
        AspectRatio::SixteenNinths => width * 9 / 16,
        AspectRatio::TwoTwentyOne => width * 100 / 221,
        AspectRatio::Square => pic_height * width / pic_width,
    };

    // 水平适配超高时改用垂直适配
    if height > config.height {
        height = if scale || pic_height > config.height {
            config.height
        } else {
            pic_height
        };
        width = match aspect {
            AspectRatio::FourThirds => height * 4 / 3,
            AspectRatio::SixteenNinths => height * 16 / 9,
            AspectRatio::TwoTwentyOne => height * 221 / 100,
            AspectRatio::Square => pic_width * height / pic_height,
        };
        width = width / 16 * 16;
    }

    PicArea {
        x: (config.width.saturating_sub(width)) / 2,
        y: (config.height.saturating_sub(height)) / 2,
        width,
        height,
    }
}

struct SurfaceBuffer {
    data: Vec<u8>,
    pic: PicArea,
    // 脏区：闭区间 [y0, y1] 的纵向跨度列表，按 y0 有序且互不重叠
    areas: Vec<(usize, usize)>,
}

impl SurfaceBuffer {
    fn new(config: &SurfaceConfig) -> Self {
        Self {
            data: vec![0u8; config.height * config.bytes_per_line],
            pic: PicArea::default(),
            // 初始时整个缓冲都待清除
            areas: vec![(0, config.height.saturating_sub(1))],
        }
    }
}

/// 渲染表面 - 双缓冲像素目标
///
/// 渲染总是写入后缓冲；送显后交换索引。每个缓冲维护自己的
/// 图像子矩形与脏区列表，渲染开始前先清除脏区。
pub struct RenderSurface {
    config: SurfaceConfig,
    buffers: [SurfaceBuffer; 2],
    index: usize,
}

impl RenderSurface {
    pub fn new(config: SurfaceConfig) -> Self {
        Self {
            buffers: [SurfaceBuffer::new(&config), SurfaceBuffer::new(&config)],
            config,
            index: 0,
        }
    }

    pub fn config(&self) -> &SurfaceConfig {
        &self.config
    }

    /// 当前后缓冲的像素数据
    pub fn back_data(&self) -> &[u8] {
        &self.buffers[self.index].data
    }

    pub fn back_data_mut(&mut self) -> &mut [u8] {
        &mut self.buffers[self.index].data
    }

    /// 当前后缓冲的图像子矩形
    pub fn pic_area(&self) -> PicArea {
        self.buffers[self.index].pic
    }

    /// 当前后缓冲的脏区列表（测试与诊断用）
    pub fn dirty_areas(&self) -> &[(usize, usize)] {
        &self.buffers[self.index].areas
    }

    /// 交换前后缓冲
    pub fn swap(&mut self) {
        self.index ^= 1;
    }

    /// 登记一块被写过的区域，下一次渲染前需要清除。
    /// 与图像子矩形重叠的部分被剔除（图像每帧都会整体重绘）。
    pub fn set_area(&mut self, x: usize, y: usize, width: usize, height: usize) {
        if height == 0 || width == 0 {
            return;
        }
        let y1 = (y + height - 1).min(self.config.height.saturating_sub(1));
        let pic = self.buffers[self.index].pic;

        if pic.height > 0 && x >= pic.x && x + width <= pic.x + pic.width {
            let pic_y1 = pic.y + pic.height - 1;
            let overlaps = y <= pic_y1 && y1 >= pic.y;
            if overlaps {
                // 保留图像上方与下方的条带
                if y < pic.y {
                    self.set_area(x, y, width, pic.y - y);
                }
                if y1 > pic_y1 {
                    self.set_area(x, pic_y1 + 1, width, y1 - pic_y1);
                }
                return;
            }
        }

        Self::insert_span(&mut self.buffers[self.index].areas, y, y1);
    }

    // 插入并合并一个跨度，保持有序；超过上限时并入最后一段
    fn insert_span(areas: &mut Vec<(usize, usize)>, begin: usize, end: usize) {
        let mut merged = Vec::with_capacity(areas.len() + 1);
        let mut span = (begin, end);
        let mut placed = false;
        for &(a, b) in areas.iter() {
            if b + 1 < span.0 {
                merged.push((a, b));
            } else if span.1 + 1 < a {
                if !placed {
                    merged.push(span);
                    placed = true;
                }
                merged.push((a, b));
            } else {
                // 相邻或重叠，并入当前跨度
                span.0 = span.0.min(a);
                span.1 = span.1.max(b);
            }
        }
        if !placed {
            merged.push(span);
        }
        merged.sort_by_key(|&(a, _)| a);

        if merged.len() > VOUT_MAX_AREAS {
            // 溢出：尾部各段并入保留的最后一段
            let tail_end = merged[VOUT_MAX_AREAS - 1..]
                .iter()
                .map(|&(_, b)| b)
                .max()
                .unwrap_or(end);
            merged.truncate(VOUT_MAX_AREAS);
            merged[VOUT_MAX_AREAS - 1].1 = tail_end;
        }
        *areas = merged;
    }

    /// 渲染前的准备：清除脏区并设置新的图像子矩形。
    /// 返回计算出的子矩形；图像缩小时旧区域会被一并清除，
    /// 新子矩形两侧的黑边登记为下一帧的脏区。
    pub fn set_picture(
        &mut self,
        pic: Option<(usize, usize, AspectRatio)>,
        scale: bool,
    ) -> PicArea {
        let area = match pic {
            Some((w, h, aspect)) => compute_picture_area(&self.config, w, h, aspect, scale),
            None => PicArea::default(),
        };

        let old = self.buffers[self.index].pic;
        self.buffers[self.index].pic = area;
        if old.width > area.width || old.height > area.height {
            // 图像缩小：旧图像区域需要清除
            self.set_area(0, old.y, self.config.width, old.height);
        }

        self.clear_areas();

        // 黑边区域登记为下一帧的脏区
        if area.height > 0 {
            if area.y > 0 {
                self.set_area(0, 0, self.config.width, area.y);
            }
            let bottom = area.y + area.height;
            if bottom < self.config.height {
                self.set_area(0, bottom, self.config.width, self.config.height - bottom);
            }
        }
        area
    }

    // 清零所有脏区并重置列表。整行清除：先按 256 字节块，
    // 余量按 4 字节字（假定 bytes_per_line 为 4 的倍数）
    fn clear_areas(&mut self) {
        let bytes_per_line = self.config.bytes_per_line;
        let buffer = &mut self.buffers[self.index];
        for &(begin, end) in buffer.areas.iter() {
            let from = begin * bytes_per_line;
            let to = ((end + 1) * bytes_per_line).min(buffer.data.len());
            if from >= to {
                continue;
            }
            let span = &mut buffer.data[from..to];
            let blocks = span.len() / 256 * 256;
            span[..blocks].fill(0);
            for word in span[blocks..].chunks_exact_mut(4) {
                word.fill(0);
            }
        }
        buffer.areas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_640x480() -> SurfaceConfig {
        SurfaceConfig::new(640, 480)
    }

    #[test]
    fn test_layout_letterbox_16_9() {
        // 720x480 的 16:9 素材放进 640x480：宽 640（16 的倍数），
        // 高 360，垂直居中于 y=60
        let area = compute_picture_area(&config_640x480(), 720, 480, AspectRatio::SixteenNinths, false);
        assert_eq!(area, PicArea { x: 0, y: 60, width: 640, height: 360 });
    }

    #[test]
    fn test_layout_width_multiple_of_16() {
        let config = SurfaceConfig::new(500, 400);
        let area = compute_picture_area(&config, 500, 250, AspectRatio::Square, false);
        assert_eq!(area.width % 16, 0);
        assert_eq!(area.width, 496);
    }

    #[test]
    fn test_layout_vertical_fit() {
        // 4:3 素材太高时改用垂直适配
        let config = SurfaceConfig::new(1024, 300);
        let area = compute_picture_area(&config, 640, 480, AspectRatio::FourThirds, false);
        assert!(area.height <= 300);
        assert_eq!(area.width % 16, 0);
        assert_eq!(area.width, 400 / 16 * 16);
    }

    #[test]
    fn test_first_render_letterbox_areas() {
        let mut surface = RenderSurface::new(config_640x480());
        let area = surface.set_picture(Some((720, 480, AspectRatio::SixteenNinths)), false);
        assert_eq!(area.y, 60);
        // 首次渲染后黑边成为脏区：[0,59] 与 [420,479]
        assert_eq!(surface.dirty_areas(), &[(0, 59), (420, 479)]);
    }

    #[test]
    fn test_area_merge_and_sort() {
        let mut surface = RenderSurface::new(config_640x480());
        surface.set_picture(None, false); // 清空初始脏区
        surface.set_area(0, 100, 640, 20);
        surface.set_area(0, 10, 640, 5);
        surface.set_area(0, 110, 640, 30); // 与第一段重叠
        assert_eq!(surface.dirty_areas(), &[(10, 14), (100, 139)]);
    }

    #[test]
    fn test_area_overflow_merges_into_last() {
        let mut surface = RenderSurface::new(config_640x480());
        surface.set_picture(None, false);
        for i in 0..VOUT_MAX_AREAS + 3 {
            surface.set_area(0, i * 20, 640, 2);
        }
        let areas = surface.dirty_areas();
        assert_eq!(areas.len(), VOUT_MAX_AREAS);
        // 溢出段并入最后一段
        assert_eq!(areas[VOUT_MAX_AREAS - 1].1, (VOUT_MAX_AREAS + 2) * 20 + 1);
    }

    #[test]
    fn test_area_inside_picture_is_split() {
        let mut surface = RenderSurface::new(config_640x480());
        surface.set_picture(Some((720, 480, AspectRatio::SixteenNinths)), false);
        surface.set_picture(Some((720, 480, AspectRatio::SixteenNinths)), false); // 清掉黑边脏区
        assert_eq!(surface.dirty_areas(), &[(0, 59), (420, 479)]);

        // 横跨图像矩形的区域被拆成上下两段，图像内部不登记
        surface.set_area(0, 40, 640, 400);
        let areas = surface.dirty_areas().to_vec();
        assert!(areas.contains(&(0, 59)));
        assert!(areas.contains(&(420, 479)));
        assert!(!areas.iter().any(|&(a, b)| a >= 60 && b <= 419));
    }

    #[test]
    fn test_clear_areas_zeroes_spans() {
        let mut surface = RenderSurface::new(config_640x480());
        surface.set_picture(None, false);
        surface.back_data_mut()[0] = 0xff;
        let line = surface.config().bytes_per_line;
        surface.back_data_mut()[line * 30 + 7] = 0xff;
        surface.set_area(0, 0, 640, 40);
        surface.set_picture(None, false); // 触发清除
        assert_eq!(surface.back_data()[0], 0);
        assert_eq!(surface.back_data()[line * 30 + 7], 0);
    }
}
