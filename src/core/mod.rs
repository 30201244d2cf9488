// 核心数据结构和类型定义

pub mod clock;
pub mod error;
pub mod mtime;
pub mod types;

// 重新导出常用类型
pub use clock::*;
pub use error::*;
pub use mtime::*;
pub use types::*;
