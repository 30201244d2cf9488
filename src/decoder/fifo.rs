use crate::core::Block;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// 工作线程从 FIFO 取块的结果
pub enum Dequeued {
    /// 正常取到一个块
    Block(Block),
    /// FIFO 已空且有未决的排空请求（一次性消费）
    Drain,
    /// 收到销毁请求
    Killed,
}

struct FifoInner {
    queue: VecDeque<Block>,
    bytes: usize,
    // 排空请求：FIFO 清空时被消费一次
    draining: bool,
    // 工作线程正阻塞在取块等待上
    idle: bool,
    killed: bool,
}

/// 压缩块 FIFO - 字节计量的队列，锁独立且短持
///
/// 取块条件变量（工作线程等待非空/排空/销毁）与限速条件变量
/// （生产者等待队列消化）都与本队列的锁配对。工作线程的销毁
/// 请求只在取块等待点被观测，其余位置销毁被推迟。
pub struct BlockFifo {
    inner: Mutex<FifoInner>,
    cond: Condvar,
    pacing: Condvar,
}

impl Default for BlockFifo {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockFifo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FifoInner {
                queue: VecDeque::new(),
                bytes: 0,
                draining: false,
                idle: false,
                killed: false,
            }),
            cond: Condvar::new(),
            pacing: Condvar::new(),
        }
    }

    /// 入队一个块
    pub fn push(&self, block: Block) {
        let mut inner = self.inner.lock().unwrap();
        inner.bytes += block.data.len();
        inner.queue.push_back(block);
        self.cond.notify_all();
    }

    /// 非限速入队：累计字节超过 max_bytes 时先丢弃整个队列，
    /// 返回被丢弃的块数
    pub fn push_unpaced(&self, block: Block, max_bytes: usize) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = 0;
        if inner.bytes > max_bytes {
            dropped = inner.queue.len();
            inner.queue.clear();
            inner.bytes = 0;
        }
        inner.bytes += block.data.len();
        inner.queue.push_back(block);
        self.cond.notify_all();
        dropped
    }

    /// 限速入队：队列长度达到 max_count 时阻塞，直到消费方取块
    pub fn push_paced(&self, block: Block, max_count: usize) {
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.len() >= max_count && !inner.killed {
            inner = self.pacing.wait(inner).unwrap();
        }
        inner.bytes += block.data.len();
        inner.queue.push_back(block);
        self.cond.notify_all();
    }

    /// 工作线程取块。队列为空时阻塞；排空请求在空队列时被
    /// 消费一次并返回 Drain；销毁请求优先于一切。
    pub fn dequeue_wait(&self) -> Dequeued {
        let mut inner = self.inner.lock().unwrap();
        // 每轮取块都唤醒限速中的生产者
        self.pacing.notify_all();
        loop {
            if inner.killed {
                return Dequeued::Killed;
            }
            if let Some(block) = inner.queue.pop_front() {
                inner.bytes -= block.data.len();
                self.pacing.notify_all();
                return Dequeued::Block(block);
            }
            if inner.draining {
                inner.draining = false;
                return Dequeued::Drain;
            }
            inner.idle = true;
            inner = self.cond.wait(inner).unwrap();
            inner.idle = false;
        }
    }

    /// 清空队列并取消未决的排空请求，返回丢弃的块数
    pub fn drain_all(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.queue.len();
        inner.queue.clear();
        inner.bytes = 0;
        inner.draining = false; // flush 优先于 drain
        self.pacing.notify_all();
        dropped
    }

    /// 登记排空请求并唤醒工作线程
    pub fn set_draining(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.draining = true;
        self.cond.notify_all();
    }

    /// 登记销毁请求并唤醒所有等待者
    pub fn kill(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.killed = true;
        self.cond.notify_all();
        self.pacing.notify_all();
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().unwrap().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    /// 工作线程是否正空转等待且队列为空（等待首帧时的逃生检查）
    pub fn is_idle_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.idle && inner.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn block(len: usize) -> Block {
        Block::new(vec![0u8; len])
    }

    #[test]
    fn test_fifo_order_and_bytes() {
        let fifo = BlockFifo::new();
        fifo.push(block(10));
        fifo.push(block(20));
        assert_eq!(fifo.count(), 2);
        assert_eq!(fifo.bytes(), 30);

        match fifo.dequeue_wait() {
            Dequeued::Block(b) => assert_eq!(b.data.len(), 10),
            _ => panic!("应当取到块"),
        }
        assert_eq!(fifo.bytes(), 20);
    }

    #[test]
    fn test_unpaced_overflow_drops_queue() {
        let fifo = BlockFifo::new();
        fifo.push_unpaced(block(100), 150);
        fifo.push_unpaced(block(100), 150);
        // 第三次入队时累计 200 > 150，先清空再入队
        let dropped = fifo.push_unpaced(block(10), 150);
        assert_eq!(dropped, 2);
        assert_eq!(fifo.count(), 1);
        assert_eq!(fifo.bytes(), 10);
    }

    #[test]
    fn test_paced_push_blocks_at_limit() {
        // 限速生产者在第 11 次入队时阻塞，消费一个块后返回
        let fifo = Arc::new(BlockFifo::new());
        let pushed = Arc::new(AtomicUsize::new(0));

        let producer_fifo = fifo.clone();
        let producer_pushed = pushed.clone();
        let producer = thread::spawn(move || {
            for _ in 0..11 {
                producer_fifo.push_paced(block(8), 10);
                producer_pushed.fetch_add(1, Ordering::SeqCst);
            }
        });

        // 等待生产者填满并卡住
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pushed.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pushed.load(Ordering::SeqCst), 10);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 10, "第 11 次入队应当阻塞");

        // 消费一个块，生产者被唤醒
        assert!(matches!(fifo.dequeue_wait(), Dequeued::Block(_)));
        producer.join().unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_drain_consumed_once_on_empty() {
        let fifo = BlockFifo::new();
        fifo.push(block(4));
        fifo.set_draining();

        assert!(matches!(fifo.dequeue_wait(), Dequeued::Block(_)));
        assert!(matches!(fifo.dequeue_wait(), Dequeued::Drain));
        // 排空请求只消费一次，之后继续等待
        fifo.push(block(4));
        assert!(matches!(fifo.dequeue_wait(), Dequeued::Block(_)));
    }

    #[test]
    fn test_flush_supersedes_drain() {
        let fifo = BlockFifo::new();
        fifo.push(block(4));
        fifo.set_draining();
        assert_eq!(fifo.drain_all(), 1);
        fifo.push(block(4));
        assert!(matches!(fifo.dequeue_wait(), Dequeued::Block(_)));
        // draining 已被 flush 取消：此时队列为空，kill 前不会返回 Drain
        fifo.kill();
        assert!(matches!(fifo.dequeue_wait(), Dequeued::Killed));
    }

    #[test]
    fn test_kill_wakes_waiter() {
        let fifo = Arc::new(BlockFifo::new());
        let waiter_fifo = fifo.clone();
        let waiter = thread::spawn(move || matches!(waiter_fifo.dequeue_wait(), Dequeued::Killed));
        thread::sleep(Duration::from_millis(20));
        fifo.kill();
        assert!(waiter.join().unwrap());
    }
}
