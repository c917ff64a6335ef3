use std::collections::VecDeque;

use crate::error::{PushError, Result};
use crate::request::FetchRequest;

use super::{DownstreamQueue, QueueOrder};

/// Holds live requests; nothing is serialized and `len()` is exact.
pub struct MemoryQueue {
    order: QueueOrder,
    items: VecDeque<FetchRequest>,
}

impl MemoryQueue {
    pub fn new(order: QueueOrder) -> Self {
        Self {
            order,
            items: VecDeque::new(),
        }
    }
}

impl DownstreamQueue for MemoryQueue {
    fn push(&mut self, request: FetchRequest) -> std::result::Result<(), PushError> {
        self.items.push_back(request);
        Ok(())
    }

    fn pop(&mut self) -> Option<FetchRequest> {
        match self.order {
            QueueOrder::Fifo => self.items.pop_front(),
            QueueOrder::Lifo => self.items.pop_back(),
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
