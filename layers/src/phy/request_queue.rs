//! Slot-ordered request queue shared by the PDxCH and PUxCH processors
//!
//! The upper layers push grids from their own threads; the processor pops
//! the grid of each slot when the slot begins. Requests for slots that have
//! already begun, and requests beyond the capacity, are refused.

use super::notifiers::ResourceGridContext;
use super::resource_grid::PooledGrid;
use common::types::SlotPoint;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestRejection {
    /// The slot has already begun
    Late,
    /// The queue is full
    Overflow,
}

struct QueueState {
    entries: VecDeque<(ResourceGridContext, PooledGrid)>,
    /// Most recent slot the processor started
    last_started: Option<SlotPoint>,
}

pub(crate) struct SlotRequestQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

/// Outcome of starting a slot
pub(crate) struct SlotStart {
    /// Grid requested for the slot
    pub grid: Option<PooledGrid>,
    /// Requests for earlier slots that were never processed
    pub late: Vec<ResourceGridContext>,
}

impl SlotRequestQueue {
    /// Queue sized for `max_processing_delay_slots`
    pub fn new(max_processing_delay_slots: usize) -> Self {
        let capacity = (2 * max_processing_delay_slots).max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity),
                last_started: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue a grid. On rejection the grid is dropped, back to its pool.
    pub fn push(&self, context: ResourceGridContext, grid: PooledGrid) -> Result<(), RequestRejection> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(last) = state.last_started {
            if context.slot.diff(&last) <= 0 {
                return Err(RequestRejection::Late);
            }
        }
        if state.entries.len() >= self.capacity {
            return Err(RequestRejection::Overflow);
        }
        // Slot order; requests for the same slot keep their arrival order
        let position = state
            .entries
            .iter()
            .position(|(queued, _)| queued.slot.diff(&context.slot) > 0)
            .unwrap_or(state.entries.len());
        state.entries.insert(position, (context, grid));
        Ok(())
    }

    /// Begin `slot`: take its grid and drop every request for older slots
    pub fn start_slot(&self, slot: SlotPoint) -> SlotStart {
        let mut late = Vec::new();
        let mut grid = None;
        let mut stale = Vec::new();
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.last_started = Some(slot);
            while let Some((context, _)) = state.entries.front() {
                let diff = context.slot.diff(&slot);
                if diff > 0 {
                    break;
                }
                if let Some((context, queued)) = state.entries.pop_front() {
                    if diff == 0 && grid.is_none() {
                        grid = Some(queued);
                    } else {
                        late.push(context);
                        stale.push(queued);
                    }
                }
            }
        }
        // Stale grids go back to their pools outside the queue lock
        drop(stale);
        SlotStart { grid, late }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().map_or(0, |state| state.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::resource_grid::ResourceGrid;
    use common::types::SubcarrierSpacing;

    fn request(slot: u32) -> (ResourceGridContext, PooledGrid) {
        let context = ResourceGridContext {
            slot: SlotPoint::new(SubcarrierSpacing::Scs30, 0, slot),
            sector: 0,
        };
        (context, PooledGrid::detached(ResourceGrid::new(1, 14, 12)))
    }

    #[test]
    fn test_capacity_follows_delay() {
        assert_eq!(SlotRequestQueue::new(0).capacity(), 1);
        assert_eq!(SlotRequestQueue::new(2).capacity(), 4);
    }

    #[test]
    fn test_overflow() {
        let queue = SlotRequestQueue::new(1);
        for slot in 1..3 {
            let (context, grid) = request(slot);
            queue.push(context, grid).unwrap();
        }
        let (context, grid) = request(3);
        assert_eq!(queue.push(context, grid), Err(RequestRejection::Overflow));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_late_request() {
        let queue = SlotRequestQueue::new(2);
        queue.start_slot(SlotPoint::new(SubcarrierSpacing::Scs30, 0, 5));
        let (context, grid) = request(5);
        assert_eq!(queue.push(context, grid), Err(RequestRejection::Late));
        let (context, grid) = request(4);
        assert_eq!(queue.push(context, grid), Err(RequestRejection::Late));
        let (context, grid) = request(6);
        assert!(queue.push(context, grid).is_ok());
    }

    #[test]
    fn test_start_slot_discards_older_requests() {
        let queue = SlotRequestQueue::new(4);
        for slot in [3, 1, 2, 6] {
            let (context, grid) = request(slot);
            queue.push(context, grid).unwrap();
        }
        let start = queue.start_slot(SlotPoint::new(SubcarrierSpacing::Scs30, 0, 2));
        assert!(start.grid.is_some());
        assert_eq!(start.late.len(), 1);
        assert_eq!(start.late[0].slot.slot_index(), 1);

        // Nothing queued for slot 4
        let start = queue.start_slot(SlotPoint::new(SubcarrierSpacing::Scs30, 0, 4));
        assert!(start.grid.is_none());
        assert_eq!(start.late.len(), 1);
        assert_eq!(queue.len(), 1);
    }
}
