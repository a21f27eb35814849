// 順不同で届くフレームを連番順に並べ直すバッファ
// 全操作が一つのロックを共有する（ホットパスではない）

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ReassemblyError;

/// フローが保持できるフレーム数の既定値
pub const DEFAULT_REASSEMBLY_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Inner {
    /// 次に取り出せる連番
    cursor: u64,
    last_released: Option<u64>,
    frames: BTreeMap<u64, Bytes>,
}

/// 上限付きの並べ替えキュー
#[derive(Debug)]
pub struct ReassemblyQueue {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ReassemblyQueue {
    pub fn new(start: u64, capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                cursor: start,
                last_released: None,
                frames: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// フレームを追加
    ///
    /// 取り出し済み・格納済みの連番は重複として拒否する。
    /// 上限を超える場合は格納せずにエラーを返す。
    pub fn enqueue(&self, seq: u64, payload: Bytes) -> Result<(), ReassemblyError> {
        let mut inner = self.lock();

        if seq < inner.cursor || inner.frames.contains_key(&seq) {
            return Err(ReassemblyError::DuplicateFrame(seq));
        }
        if inner.frames.len() >= self.capacity {
            return Err(ReassemblyError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        inner.frames.insert(seq, payload);
        Ok(())
    }

    /// カーソル位置のフレームが届いていれば取り出す（ブロックしない）
    pub fn try_dequeue(&self) -> Option<Bytes> {
        let mut inner = self.lock();
        let cursor = inner.cursor;
        let payload = inner.frames.remove(&cursor)?;
        inner.last_released = Some(cursor);
        inner.cursor = cursor + 1;
        Some(payload)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    /// `seq` が直前に取り出された連番か
    pub fn was_last_released(&self, seq: u64) -> bool {
        self.lock().last_released == Some(seq)
    }

    /// 一度でも取り出しが行われたか
    pub fn has_released(&self) -> bool {
        self.lock().last_released.is_some()
    }

    pub fn cursor(&self) -> u64 {
        self.lock().cursor
    }
}
