/// 固定大小缓冲区池
///
/// 所有中继会话共享同一个池，用于避免每次拷贝都分配内存，并限制高并发下的总内存占用。
/// 缓冲区以 [`PooledBuffer`] 守卫的形式借出，守卫被 drop 时归还，
/// 因此一个缓冲区不可能被重复归还，也不可能在归还后继续使用。
///
/// 每个方向的拷贝在读之前就借出缓冲区，空闲会话也会占住最多 2 个缓冲区。
/// Block 策略下容量为 C 的池最多容纳 C/2 个同时空闲的会话，容量至少为 2。
use crate::error::{Result, TunnelError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// 默认池容量（缓冲区个数）
pub const DEFAULT_POOL_CAPACITY: usize = 25_000;
/// Block 策略下的最小容量：一个会话的两个方向各占一个
pub const MIN_BLOCKING_CAPACITY: usize = 2;
/// 默认缓冲区大小（32 KiB）
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// 池耗尽时的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolPolicy {
    /// 阻塞等待其它会话归还缓冲区（背压）
    #[default]
    Block,
    /// 额外分配不受跟踪的缓冲区，归还时丢弃（内存不设上限）
    Overflow,
}

impl std::fmt::Display for PoolPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolPolicy::Block => write!(f, "block"),
            PoolPolicy::Overflow => write!(f, "overflow"),
        }
    }
}

impl std::str::FromStr for PoolPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "overflow" => Ok(Self::Overflow),
            _ => anyhow::bail!("Unknown buffer pool policy: {}", s),
        }
    }
}

/// 缓冲区池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 最多同时借出的缓冲区个数
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// 每个缓冲区的字节数
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 耗尽策略
    #[serde(default)]
    pub policy: PoolPolicy,
}

fn default_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            policy: PoolPolicy::Block,
        }
    }
}

/// 缓冲区池
///
/// 缓冲区按需分配，不会预先分配 `capacity * buffer_size` 字节；
/// 空闲列表最多保留 `capacity` 个缓冲区。
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    permits: Arc<Semaphore>,
    outstanding: AtomicUsize,
    overflow: AtomicUsize,
    config: PoolConfig,
}

impl BufferPool {
    /// 创建新的缓冲区池
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let capacity = config.capacity.min(Semaphore::MAX_PERMITS);
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(capacity)),
            outstanding: AtomicUsize::new(0),
            overflow: AtomicUsize::new(0),
            config,
        })
    }

    /// 使用默认配置创建缓冲区池
    pub fn with_defaults() -> Arc<Self> {
        Self::new(PoolConfig::default())
    }

    /// 借出一个缓冲区
    ///
    /// `Block` 策略下池耗尽时会等待；`Overflow` 策略下立即分配一个额外缓冲区。
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledBuffer> {
        match self.config.policy {
            PoolPolicy::Block => {
                let permit = Arc::clone(&self.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| TunnelError::ResourceExhausted("buffer pool closed".into()))?;
                Ok(self.checkout(Some(permit)))
            }
            PoolPolicy::Overflow => self
                .try_acquire()
                .ok_or_else(|| TunnelError::ResourceExhausted("buffer pool closed".into())),
        }
    }

    /// 非阻塞借出
    ///
    /// `Block` 策略下池耗尽返回 `None`；`Overflow` 策略下总是成功（池关闭除外）。
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Some(self.checkout(Some(permit))),
            Err(TryAcquireError::NoPermits) if self.config.policy == PoolPolicy::Overflow => {
                Some(self.checkout(None))
            }
            Err(_) => None,
        }
    }

    /// 归还缓冲区（等同于 drop 守卫）
    pub fn release(&self, buf: PooledBuffer) {
        drop(buf);
    }

    /// 关闭池，之后的 `acquire` 都会失败
    pub fn close(&self) {
        self.permits.close();
    }

    fn checkout(self: &Arc<Self>, permit: Option<OwnedSemaphorePermit>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.config.buffer_size].into_boxed_slice());

        if permit.is_some() {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
        } else {
            self.overflow.fetch_add(1, Ordering::AcqRel);
        }

        PooledBuffer {
            buf: Some(buf),
            permit,
            pool: Arc::clone(self),
        }
    }

    fn checkin(&self, buf: Box<[u8]>, tracked: bool) {
        {
            let mut free = self.free.lock();
            if free.len() < self.config.capacity {
                free.push(buf);
            }
        }

        if tracked {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        } else {
            self.overflow.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// 当前借出的受跟踪缓冲区数
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// 当前借出的溢出缓冲区数
    pub fn overflow_outstanding(&self) -> usize {
        self.overflow.load(Ordering::Acquire)
    }

    /// 空闲列表中的缓冲区数
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    pub fn policy(&self) -> PoolPolicy {
        self.config.policy
    }
}

/// 借出的缓冲区
///
/// 独占所有权；drop 时归还到池中。
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// 是否为溢出分配的缓冲区
    pub fn is_overflow(&self) -> bool {
        self.permit.is_none()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.checkin(buf, self.permit.is_some());
        }
        // 先放回空闲列表，再释放许可，保证被唤醒的等待者能拿到复用的缓冲区
        drop(self.permit.take());
    }
}
