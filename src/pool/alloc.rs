//! pool/alloc - аллокаторы, на которые опирается Pool.
//!
//! Allocator - тройка alloc/realloc/release. Два варианта:
//! - SystemAllocator: обычная куча (Vec<u8>), никогда не отказывает.
//! - LimitAllocator: куча с жёстким лимитом байт; отказ => Resource error в пуле.

/// Тройка функций аллокатора.
pub trait Allocator: Send + Sync {
    /// Выделить блок из `size` нулевых байт. None - отказ.
    fn alloc(&mut self, size: usize) -> Option<Vec<u8>>;

    /// Изменить размер блока. При отказе блок возвращается вызывающему (Err).
    fn realloc(&mut self, block: Vec<u8>, new_size: usize) -> Result<Vec<u8>, Vec<u8>>;

    /// Вернуть блок аллокатору.
    fn release(&mut self, block: Vec<u8>);

    /// Сколько байт сейчас числится за аллокатором (если он это отслеживает).
    fn in_use(&self) -> usize {
        0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn alloc(&mut self, size: usize) -> Option<Vec<u8>> {
        Some(vec![0u8; size])
    }

    fn realloc(&mut self, mut block: Vec<u8>, new_size: usize) -> Result<Vec<u8>, Vec<u8>> {
        block.resize(new_size, 0);
        Ok(block)
    }

    fn release(&mut self, block: Vec<u8>) {
        drop(block);
    }
}

/// Куча с лимитом: alloc/realloc отказывают, если in_use превысил бы limit.
#[derive(Debug, Clone)]
pub struct LimitAllocator {
    limit: usize,
    used: usize,
}

impl LimitAllocator {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Allocator for LimitAllocator {
    fn alloc(&mut self, size: usize) -> Option<Vec<u8>> {
        let next = self.used.checked_add(size)?;
        if next > self.limit {
            return None;
        }
        self.used = next;
        Some(vec![0u8; size])
    }

    fn realloc(&mut self, mut block: Vec<u8>, new_size: usize) -> Result<Vec<u8>, Vec<u8>> {
        let old = block.len();
        let next = self.used - old + new_size;
        if new_size > old && next > self.limit {
            return Err(block);
        }
        self.used = next;
        block.resize(new_size, 0);
        Ok(block)
    }

    fn release(&mut self, block: Vec<u8>) {
        self.used = self.used.saturating_sub(block.len());
    }

    fn in_use(&self) -> usize {
        self.used
    }
}
