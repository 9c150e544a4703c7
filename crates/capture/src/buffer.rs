// Copyright 2024 Soft KVM Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Buffer pool shared between the driver and the session

use crate::BufferMapping;
use std::fmt;

/// One driver buffer slot.
///
/// A slot is either queued (owned by the driver) or available (owned by the
/// session). Its mapping is present only while the slot belongs to the
/// active pool.
pub struct CaptureBuffer<M> {
    mapping: Option<M>,
    size: usize,
    pub(crate) payload: usize,
    pub(crate) queued: bool,
}

impl<M: BufferMapping> CaptureBuffer<M> {
    pub(crate) fn empty() -> Self {
        CaptureBuffer {
            mapping: None,
            size: 0,
            payload: 0,
            queued: false,
        }
    }

    /// Mapped bytes, if the slot is part of the active pool
    pub(crate) fn data(&self) -> Option<&[u8]> {
        self.mapping.as_ref().map(|m| m.as_slice())
    }

    /// Length of the mapped region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes written by the last completed capture into this slot
    pub fn payload(&self) -> usize {
        self.payload
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub(crate) fn attach(&mut self, mapping: M) {
        self.size = mapping.len();
        self.payload = 0;
        self.queued = false;
        self.mapping = Some(mapping);
    }

    pub(crate) fn release(&mut self) {
        self.mapping = None;
        self.queued = false;
    }
}

impl<M> fmt::Debug for CaptureBuffer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("mapped", &self.mapping.is_some())
            .field("size", &self.size)
            .field("payload", &self.payload)
            .field("queued", &self.queued)
            .finish()
    }
}

/// Ordered set of capture buffers, indexed like the driver indexes them
pub struct BufferPool<M> {
    buffers: Vec<CaptureBuffer<M>>,
}

impl<M: BufferMapping> BufferPool<M> {
    pub fn new() -> Self {
        BufferPool {
            buffers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CaptureBuffer<M>> {
        self.buffers.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut CaptureBuffer<M>> {
        self.buffers.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CaptureBuffer<M>> {
        self.buffers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut CaptureBuffer<M>> {
        self.buffers.iter_mut()
    }

    /// True once the pool has been sized and mapped at least partially
    pub fn any_mapped(&self) -> bool {
        self.buffers.iter().any(|b| b.is_mapped())
    }

    pub fn queued_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.queued).count()
    }

    /// Unmap every slot, keeping the slots themselves
    pub(crate) fn unmap_all(&mut self) {
        for buffer in self.buffers.iter_mut().filter(|b| b.is_mapped()) {
            buffer.release();
        }
    }

    /// Drop every slot
    pub(crate) fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Grow with empty slots or shrink (unmapping the removed ones)
    pub(crate) fn resize(&mut self, count: usize) {
        self.buffers.resize_with(count, CaptureBuffer::empty);
    }
}

impl<M: BufferMapping> Default for BufferPool<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for BufferPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.buffers.iter()).finish()
    }
}
