// 解码器模块：解码器接口、压缩块 FIFO、解码器属主线程

pub mod fifo;
pub mod module;
pub mod owner;

pub use fifo::BlockFifo;
pub use module::{AudioSink, DecoderFactory, DecoderModule, Resource};
pub use owner::InputDecoder;
