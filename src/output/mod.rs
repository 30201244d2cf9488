// 视频输出模块：图像/字幕缓冲堆、渲染表面、视频输出线程

pub mod heap;
pub mod sink;
pub mod surface;
pub mod vout;

pub use heap::{PictureHeap, PictureId, PictureStatus, SpuHeap, SpuId, SpuStatus};
pub use sink::{DisplaySink, Font, PictureView, ThreadStatus, YuvConverter};
pub use surface::{PicArea, RenderSurface, SurfaceConfig};
pub use vout::VideoOutput;
