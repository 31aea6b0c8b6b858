//! Пул памяти (bump/free-list) поверх подключаемого Allocator.
//!
//! Design:
//! - Блоки адресуются BlockId (индекс слота); слоты освобождённых блоков идут в free-list и
//!   переиспользуются.
//! - Managed-режим: у каждого блока скрытый заголовок {size, prev, next}, блоки связаны в
//!   двусвязный список (голова - самый новый). free(pool) проходит список и возвращает каждый
//!   блок аллокатору. Поблочного release в managed-режиме нет.
//! - Non-managed: блоки не связаны; release(block) отдаёт блок аллокатору сразу, а free(pool)
//!   ничего аллокатору не возвращает (время жизни блоков - время жизни аллокатора).
//! - total() - текущая сумма размеров живых блоков.
//!
//! realloc в managed-режиме:
//! - new_size <= size: no-op, тот же блок;
//! - рост: новый блок, копия данных, новый блок встаёт в список, старый отцепляется и
//!   возвращается аллокатору.
//!
//! Пользователи: ConfigTable (байты ключей/значений), FileLog (буфер строки), dup/concat.

pub mod alloc;

pub use alloc::{Allocator, LimitAllocator, SystemAllocator};

use crate::error::{FcgiError, FcgiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BlockHeader {
    size: usize,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    header: BlockHeader,
    data: Option<Vec<u8>>,
}

pub struct Pool {
    allocator: Box<dyn Allocator>,
    managed: bool,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    head: Option<u32>,
    total: usize,
}

impl Pool {
    pub fn new(managed: bool, allocator: Box<dyn Allocator>) -> Self {
        Self {
            allocator,
            managed,
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            total: 0,
        }
    }

    /// Managed-пул на системной куче.
    pub fn managed() -> Self {
        Self::new(true, Box::new(SystemAllocator))
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    /// Сумма размеров живых блоков.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn block_count(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    pub fn allocator_in_use(&self) -> usize {
        self.allocator.in_use()
    }

    pub fn alloc(&mut self, size: usize) -> FcgiResult<BlockId> {
        let data = self
            .allocator
            .alloc(size)
            .ok_or_else(|| FcgiError::resource(format!("pool: alloc of {} bytes failed", size)))?;
        Ok(self.install(data))
    }

    pub fn realloc(&mut self, id: BlockId, new_size: usize) -> FcgiResult<BlockId> {
        let size = self.header(id)?.size;

        if self.managed {
            if new_size <= size {
                return Ok(id);
            }
            let mut grown = self.allocator.alloc(new_size).ok_or_else(|| {
                FcgiError::resource(format!("pool: realloc to {} bytes failed", new_size))
            })?;
            let old = self.take(id)?;
            grown[..old.len()].copy_from_slice(&old);
            self.allocator.release(old);
            return Ok(self.install(grown));
        }

        let slot = &mut self.slots[id.index()];
        let Some(block) = slot.data.take() else {
            return Err(FcgiError::resource(format!("pool: stale block {}", id.0)));
        };
        match self.allocator.realloc(block, new_size) {
            Ok(block) => {
                slot.data = Some(block);
                slot.header.size = new_size;
                self.total = self.total - size + new_size;
                Ok(id)
            }
            Err(block) => {
                slot.data = Some(block);
                Err(FcgiError::resource(format!(
                    "pool: realloc to {} bytes failed",
                    new_size
                )))
            }
        }
    }

    /// Вернуть один блок аллокатору (только non-managed).
    pub fn release(&mut self, id: BlockId) -> FcgiResult<()> {
        if self.managed {
            return Err(FcgiError::resource(
                "pool: per-block release is not supported in managed mode",
            ));
        }
        let block = self.take(id)?;
        self.allocator.release(block);
        Ok(())
    }

    /// Освободить пул целиком. Возвращает число блоков, отданных аллокатору.
    pub fn free(mut self) -> usize {
        if !self.managed {
            return 0;
        }
        let mut released = 0usize;
        let mut cur = self.head;
        while let Some(idx) = cur {
            let slot = &mut self.slots[idx as usize];
            cur = slot.header.next;
            if let Some(block) = slot.data.take() {
                self.allocator.release(block);
                released += 1;
            }
        }
        self.head = None;
        self.total = 0;
        released
    }

    pub fn bytes(&self, id: BlockId) -> Option<&[u8]> {
        self.slots.get(id.index())?.data.as_deref()
    }

    pub fn bytes_mut(&mut self, id: BlockId) -> Option<&mut [u8]> {
        self.slots.get_mut(id.index())?.data.as_deref_mut()
    }

    /// Размер блока из заголовка.
    pub fn size_of(&self, id: BlockId) -> Option<usize> {
        self.header(id).ok().map(|h| h.size)
    }

    /// Копия байтов в новый блок.
    pub fn dup(&mut self, src: &[u8]) -> FcgiResult<BlockId> {
        let id = self.alloc(src.len())?;
        if let Some(dst) = self.bytes_mut(id) {
            dst.copy_from_slice(src);
        }
        Ok(id)
    }

    /// Склейка частей в один блок.
    pub fn concat(&mut self, parts: &[&[u8]]) -> FcgiResult<BlockId> {
        let len = parts.iter().map(|p| p.len()).sum();
        let id = self.alloc(len)?;
        if let Some(dst) = self.bytes_mut(id) {
            let mut off = 0usize;
            for p in parts {
                dst[off..off + p.len()].copy_from_slice(p);
                off += p.len();
            }
        }
        Ok(id)
    }

    /// Блоки managed-списка от новых к старым (для диагностики и тестов).
    pub fn managed_blocks(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            out.push(BlockId(idx));
            cur = self.slots[idx as usize].header.next;
        }
        out
    }

    // ---------------- internals ----------------

    fn header(&self, id: BlockId) -> FcgiResult<&BlockHeader> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.data.is_some() => Ok(&slot.header),
            _ => Err(FcgiError::resource(format!("pool: stale block {}", id.0))),
        }
    }

    fn install(&mut self, data: Vec<u8>) -> BlockId {
        let size = data.len();
        let header = BlockHeader {
            size,
            prev: None,
            next: if self.managed { self.head } else { None },
        };
        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Slot {
                    header,
                    data: Some(data),
                };
                idx
            }
            None => {
                self.slots.push(Slot {
                    header,
                    data: Some(data),
                });
                (self.slots.len() - 1) as u32
            }
        };
        if self.managed {
            if let Some(old_head) = self.head {
                self.slots[old_head as usize].header.prev = Some(idx);
            }
            self.head = Some(idx);
        }
        self.total += size;
        BlockId(idx)
    }

    /// Вынуть блок из слота (с отцеплением от списка в managed-режиме).
    fn take(&mut self, id: BlockId) -> FcgiResult<Vec<u8>> {
        let header = *self.header(id)?;
        if self.managed {
            match header.prev {
                Some(p) => self.slots[p as usize].header.next = header.next,
                None => self.head = header.next,
            }
            if let Some(n) = header.next {
                self.slots[n as usize].header.prev = header.prev;
            }
        }
        let slot = &mut self.slots[id.index()];
        slot.header = BlockHeader::default();
        let data = slot.data.take().unwrap_or_default();
        self.free_slots.push(id.0);
        self.total -= header.size;
        Ok(data)
    }
}
